// exFAT on-disk structures
// Boot sector and the 32-byte directory entry records, all little-endian.
// Entry records are kept as raw bytes so that fields we do not interpret
// (timezone offsets, reserved bytes) survive a read-modify-write cycle.

use byteorder::{ByteOrder, LittleEndian};
use static_assertions::{assert_eq_size, const_assert};

pub const EXFAT_SIGNATURE: &[u8; 8] = b"EXFAT   ";
pub const BOOT_SIGNATURE: u16 = 0xAA55;
pub const SUPER_BLOCK_SIZE: usize = 512;

// Cluster numbers
pub const EXFAT_FIRST_DATA_CLUSTER: u32 = 2;
pub const EXFAT_LAST_DATA_CLUSTER: u32 = 0xFFFF_FFF6;
pub const EXFAT_CLUSTER_FREE: u32 = 0;
pub const EXFAT_CLUSTER_BAD: u32 = 0xFFFF_FFF7;
pub const EXFAT_CLUSTER_END: u32 = 0xFFFF_FFFF;

// Volume state bits
pub const EXFAT_STATE_MOUNTED: u16 = 0x0002;

// Directory entry types
pub const EXFAT_ENTRY_VALID: u8 = 0x80;
pub const EXFAT_ENTRY_CONTINUED: u8 = 0x40;
pub const EXFAT_ENTRY_BITMAP: u8 = 0x01 | EXFAT_ENTRY_VALID;
pub const EXFAT_ENTRY_UPCASE: u8 = 0x02 | EXFAT_ENTRY_VALID;
pub const EXFAT_ENTRY_LABEL: u8 = 0x03 | EXFAT_ENTRY_VALID;
pub const EXFAT_ENTRY_FILE: u8 = 0x05 | EXFAT_ENTRY_VALID;
pub const EXFAT_ENTRY_FILE_INFO: u8 = 0x00 | EXFAT_ENTRY_VALID | EXFAT_ENTRY_CONTINUED;
pub const EXFAT_ENTRY_FILE_NAME: u8 = 0x01 | EXFAT_ENTRY_VALID | EXFAT_ENTRY_CONTINUED;

// FILE_INFO flags
pub const EXFAT_FLAG_ALWAYS1: u8 = 1 << 0;
pub const EXFAT_FLAG_CONTIGUOUS: u8 = 1 << 1;

// File attributes as stored in the FILE record
pub const EXFAT_ATTRIB_RO: u16 = 0x01;
pub const EXFAT_ATTRIB_HIDDEN: u16 = 0x02;
pub const EXFAT_ATTRIB_SYSTEM: u16 = 0x04;
pub const EXFAT_ATTRIB_VOLUME: u16 = 0x08;
pub const EXFAT_ATTRIB_DIR: u16 = 0x10;
pub const EXFAT_ATTRIB_ARCH: u16 = 0x20;

pub const ENTRY_SIZE: usize = 32;
/// UTF-16 units carried by one FILE_NAME record.
pub const EXFAT_ENAME_MAX: usize = 15;
/// Longest file name in UTF-16 units.
pub const EXFAT_NAME_MAX: usize = 255;
/// Longest volume label in UTF-16 units.
pub const EXFAT_LABEL_MAX: usize = 11;

const_assert!(EXFAT_ENAME_MAX * 2 + 2 == ENTRY_SIZE);

pub type RawEntry = [u8; ENTRY_SIZE];

pub fn cluster_invalid(cluster: u32) -> bool {
    cluster < EXFAT_FIRST_DATA_CLUSTER || cluster > EXFAT_LAST_DATA_CLUSTER
}

/// Number of FILE_NAME records needed for a name of `length` units.
pub fn name_entries(length: usize) -> usize {
    (length + EXFAT_ENAME_MAX - 1) / EXFAT_ENAME_MAX
}

/// Parsed exFAT boot sector (the "super block").
///
/// The original sector bytes are retained; only `volume_state` and
/// `allocated_percent` are patched back when the sector is rewritten.
#[derive(Debug, Clone)]
pub struct SuperBlock {
    pub oem_name: [u8; 8],
    pub sector_start: u64,
    pub sector_count: u64,
    pub fat_sector_start: u32,
    pub fat_sector_count: u32,
    pub cluster_sector_start: u32,
    pub cluster_count: u32,
    pub rootdir_cluster: u32,
    pub volume_serial: u32,
    pub version_minor: u8,
    pub version_major: u8,
    pub volume_state: u16,
    pub sector_bits: u8,
    pub spc_bits: u8,
    pub fat_count: u8,
    pub drive_no: u8,
    pub allocated_percent: u8,
    pub boot_signature: u16,
    raw: Vec<u8>,
}

impl SuperBlock {
    pub fn parse(sector: &[u8; SUPER_BLOCK_SIZE]) -> Self {
        let mut oem_name = [0u8; 8];
        oem_name.copy_from_slice(&sector[3..11]);

        Self {
            oem_name,
            sector_start: LittleEndian::read_u64(&sector[64..72]),
            sector_count: LittleEndian::read_u64(&sector[72..80]),
            fat_sector_start: LittleEndian::read_u32(&sector[80..84]),
            fat_sector_count: LittleEndian::read_u32(&sector[84..88]),
            cluster_sector_start: LittleEndian::read_u32(&sector[88..92]),
            cluster_count: LittleEndian::read_u32(&sector[92..96]),
            rootdir_cluster: LittleEndian::read_u32(&sector[96..100]),
            volume_serial: LittleEndian::read_u32(&sector[100..104]),
            version_minor: sector[104],
            version_major: sector[105],
            volume_state: LittleEndian::read_u16(&sector[106..108]),
            sector_bits: sector[108],
            spc_bits: sector[109],
            fat_count: sector[110],
            drive_no: sector[111],
            allocated_percent: sector[112],
            boot_signature: LittleEndian::read_u16(&sector[510..512]),
            raw: sector.to_vec(),
        }
    }

    /// Sector bytes with the mutable fields written back.
    pub fn to_bytes(&self) -> [u8; SUPER_BLOCK_SIZE] {
        let mut sector = [0u8; SUPER_BLOCK_SIZE];
        sector.copy_from_slice(&self.raw);
        LittleEndian::write_u16(&mut sector[106..108], self.volume_state);
        sector[112] = self.allocated_percent;
        sector
    }

    pub fn sector_size(&self) -> u64 {
        1u64 << self.sector_bits
    }

    pub fn cluster_size(&self) -> u64 {
        self.sector_size() << self.spc_bits
    }

    pub fn volume_size(&self) -> u64 {
        self.sector_count * self.sector_size()
    }

    pub fn is_mounted(&self) -> bool {
        self.volume_state & EXFAT_STATE_MOUNTED != 0
    }
}

macro_rules! raw_entry {
    ($name:ident, $entry_type:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub struct $name(RawEntry);

        assert_eq_size!($name, RawEntry);

        impl $name {
            pub fn new() -> Self {
                let mut raw = [0u8; ENTRY_SIZE];
                raw[0] = $entry_type;
                Self(raw)
            }

            pub fn from_raw(raw: RawEntry) -> Self {
                Self(raw)
            }

            pub fn as_bytes(&self) -> &RawEntry {
                &self.0
            }

            pub fn entry_type(&self) -> u8 {
                self.0[0]
            }

            pub fn set_entry_type(&mut self, entry_type: u8) {
                self.0[0] = entry_type;
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({:02x?})", stringify!($name), &self.0[..])
            }
        }
    };
}

raw_entry!(FileEntry, EXFAT_ENTRY_FILE);
raw_entry!(FileInfoEntry, EXFAT_ENTRY_FILE_INFO);
raw_entry!(FileNameEntry, EXFAT_ENTRY_FILE_NAME);
raw_entry!(BitmapEntry, EXFAT_ENTRY_BITMAP);
raw_entry!(UpcaseEntry, EXFAT_ENTRY_UPCASE);
raw_entry!(LabelEntry, EXFAT_ENTRY_LABEL);

macro_rules! field {
    ($get:ident, $set:ident, u8, $offset:expr) => {
        pub fn $get(&self) -> u8 {
            self.0[$offset]
        }
        pub fn $set(&mut self, value: u8) {
            self.0[$offset] = value;
        }
    };
    ($get:ident, $set:ident, u16, $offset:expr) => {
        pub fn $get(&self) -> u16 {
            LittleEndian::read_u16(&self.0[$offset..$offset + 2])
        }
        pub fn $set(&mut self, value: u16) {
            LittleEndian::write_u16(&mut self.0[$offset..$offset + 2], value);
        }
    };
    ($get:ident, $set:ident, u32, $offset:expr) => {
        pub fn $get(&self) -> u32 {
            LittleEndian::read_u32(&self.0[$offset..$offset + 4])
        }
        pub fn $set(&mut self, value: u32) {
            LittleEndian::write_u32(&mut self.0[$offset..$offset + 4], value);
        }
    };
    ($get:ident, $set:ident, u64, $offset:expr) => {
        pub fn $get(&self) -> u64 {
            LittleEndian::read_u64(&self.0[$offset..$offset + 8])
        }
        pub fn $set(&mut self, value: u64) {
            LittleEndian::write_u64(&mut self.0[$offset..$offset + 8], value);
        }
    };
}

/// Primary FILE record ("meta1").
impl FileEntry {
    field!(continuations, set_continuations, u8, 1);
    field!(checksum, set_checksum, u16, 2);
    field!(attrib, set_attrib, u16, 4);
    field!(crtime, set_crtime, u16, 8);
    field!(crdate, set_crdate, u16, 10);
    field!(mtime, set_mtime, u16, 12);
    field!(mdate, set_mdate, u16, 14);
    field!(atime, set_atime, u16, 16);
    field!(adate, set_adate, u16, 18);
    field!(crtime_cs, set_crtime_cs, u8, 20);
    field!(mtime_cs, set_mtime_cs, u8, 21);
}

/// FILE_INFO (stream extension) record ("meta2").
impl FileInfoEntry {
    field!(flags, set_flags, u8, 1);
    field!(name_length, set_name_length, u8, 3);
    field!(name_hash, set_name_hash, u16, 4);
    field!(real_size, set_real_size, u64, 8);
    field!(start_cluster, set_start_cluster, u32, 20);
    field!(size, set_size, u64, 24);
}

impl FileNameEntry {
    /// Name record holding `chunk` (at most 15 units), zero padded.
    pub fn with_name(chunk: &[u16]) -> Self {
        let mut entry = Self::new();
        for (i, &unit) in chunk.iter().take(EXFAT_ENAME_MAX).enumerate() {
            LittleEndian::write_u16(&mut entry.0[2 + i * 2..4 + i * 2], unit);
        }
        entry
    }

    pub fn name(&self) -> [u16; EXFAT_ENAME_MAX] {
        let mut name = [0u16; EXFAT_ENAME_MAX];
        LittleEndian::read_u16_into(&self.0[2..ENTRY_SIZE], &mut name);
        name
    }
}

/// Allocation bitmap record.
impl BitmapEntry {
    field!(start_cluster, set_start_cluster, u32, 20);
    field!(size, set_size, u64, 24);
}

/// Upcase table record.
impl UpcaseEntry {
    field!(table_checksum, set_table_checksum, u32, 4);
    field!(start_cluster, set_start_cluster, u32, 20);
    field!(size, set_size, u64, 24);
}

/// Volume label record.
impl LabelEntry {
    field!(length, set_length, u8, 1);

    pub fn with_label(label: &[u16]) -> Self {
        let mut entry = Self::new();
        let length = label.len().min(EXFAT_ENAME_MAX);
        entry.set_length(length as u8);
        for (i, &unit) in label[..length].iter().enumerate() {
            LittleEndian::write_u16(&mut entry.0[2 + i * 2..4 + i * 2], unit);
        }
        entry
    }

    pub fn name(&self) -> Vec<u16> {
        let length = (self.length() as usize).min(EXFAT_ENAME_MAX);
        let mut name = vec![0u16; length];
        LittleEndian::read_u16_into(&self.0[2..2 + length * 2], &mut name);
        name
    }
}
