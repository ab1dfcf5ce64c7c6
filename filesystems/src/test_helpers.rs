// Test helpers for filesystem testing
// Builds small but complete exFAT images in temporary files: boot region with
// checksum sector, FAT, allocation bitmap, upcase table and root directory.

use crate::exfat::checksum::{upcase_checksum, vbr_add_checksum, vbr_start_checksum};
use crate::exfat::structures::*;
use crate::exfat::upcase::generate_upcase_table;
use crate::exfat::ExFat;
use exfat_core::MountOptions;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tempfile::NamedTempFile;

const SECTOR_BITS: u8 = 9;
const SECTOR_SIZE: u64 = 1 << SECTOR_BITS;
/// Sectors 0-11 main boot region, 12-23 backup.
const FAT_SECTOR_START: u32 = 24;
const BITMAP_CLUSTER: u32 = EXFAT_FIRST_DATA_CLUSTER;
const UPCASE_CLUSTER: u32 = BITMAP_CLUSTER + 1;

/// Where everything landed in a built image.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub cluster_size: u64,
    pub cluster_count: u32,
    pub fat_sector_start: u32,
    pub fat_sector_count: u32,
    pub cluster_sector_start: u32,
    pub bitmap_cluster: u32,
    pub upcase_cluster: u32,
    pub upcase_clusters: u32,
    pub rootdir_cluster: u32,
    pub sector_count: u64,
}

/// Builder for test images
pub struct ImageBuilder {
    spc_bits: u8,
    cluster_count: u32,
    label: Option<String>,
    volume_state: u16,
    oem_name: [u8; 8],
    version: (u8, u8),
    fat_count: u8,
    bits_override: Option<(u8, u8)>,
    corrupt_checksum: bool,
    allocated_percent: u8,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    /// 4 KiB clusters, 512 of them.
    pub fn new() -> Self {
        Self {
            spc_bits: 3,
            cluster_count: 512,
            label: None,
            volume_state: 0,
            oem_name: *EXFAT_SIGNATURE,
            version: (1, 0),
            fat_count: 1,
            bits_override: None,
            corrupt_checksum: false,
            allocated_percent: 0,
        }
    }

    pub fn cluster_count(mut self, count: u32) -> Self {
        self.cluster_count = count;
        self
    }

    /// Cluster size as a power of two number of 512-byte sectors.
    pub fn sectors_per_cluster_bits(mut self, bits: u8) -> Self {
        self.spc_bits = bits;
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn volume_state(mut self, state: u16) -> Self {
        self.volume_state = state;
        self
    }

    pub fn oem_name(mut self, name: [u8; 8]) -> Self {
        self.oem_name = name;
        self
    }

    pub fn version(mut self, major: u8, minor: u8) -> Self {
        self.version = (major, minor);
        self
    }

    pub fn fat_count(mut self, count: u8) -> Self {
        self.fat_count = count;
        self
    }

    /// Store these sector/cluster shifts in the boot sector only; the image
    /// itself keeps the real geometry.
    pub fn cluster_bits_override(mut self, sector_bits: u8, spc_bits: u8) -> Self {
        self.bits_override = Some((sector_bits, spc_bits));
        self
    }

    pub fn corrupt_vbr_checksum(mut self) -> Self {
        self.corrupt_checksum = true;
        self
    }

    pub fn allocated_percent(mut self, percent: u8) -> Self {
        self.allocated_percent = percent;
        self
    }

    fn layout(&self) -> Layout {
        let cluster_size = SECTOR_SIZE << self.spc_bits;
        let sectors_per_cluster = 1u32 << self.spc_bits;
        let fat_bytes = (self.cluster_count as u64 + 2) * 4;
        let fat_sector_count = fat_bytes.div_ceil(SECTOR_SIZE) as u32;
        // Cluster heap starts cluster aligned.
        let cluster_sector_start = (FAT_SECTOR_START + fat_sector_count)
            .div_ceil(sectors_per_cluster)
            * sectors_per_cluster;
        let upcase_clusters = (generate_upcase_table().len() as u64).div_ceil(cluster_size) as u32;
        let rootdir_cluster = UPCASE_CLUSTER + upcase_clusters;
        Layout {
            cluster_size,
            cluster_count: self.cluster_count,
            fat_sector_start: FAT_SECTOR_START,
            fat_sector_count,
            cluster_sector_start,
            bitmap_cluster: BITMAP_CLUSTER,
            upcase_cluster: UPCASE_CLUSTER,
            upcase_clusters,
            rootdir_cluster,
            sector_count: cluster_sector_start as u64
                + self.cluster_count as u64 * sectors_per_cluster as u64,
        }
    }

    fn boot_sector(&self, layout: &Layout) -> [u8; SUPER_BLOCK_SIZE] {
        let mut boot = [0u8; SUPER_BLOCK_SIZE];
        boot[0..3].copy_from_slice(&[0xEB, 0x76, 0x90]);
        boot[3..11].copy_from_slice(&self.oem_name);
        boot[72..80].copy_from_slice(&layout.sector_count.to_le_bytes());
        boot[80..84].copy_from_slice(&layout.fat_sector_start.to_le_bytes());
        boot[84..88].copy_from_slice(&layout.fat_sector_count.to_le_bytes());
        boot[88..92].copy_from_slice(&layout.cluster_sector_start.to_le_bytes());
        boot[92..96].copy_from_slice(&layout.cluster_count.to_le_bytes());
        boot[96..100].copy_from_slice(&layout.rootdir_cluster.to_le_bytes());
        boot[100..104].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        boot[104] = self.version.1;
        boot[105] = self.version.0;
        boot[106..108].copy_from_slice(&self.volume_state.to_le_bytes());
        let (sector_bits, spc_bits) = self.bits_override.unwrap_or((SECTOR_BITS, self.spc_bits));
        boot[108] = sector_bits;
        boot[109] = spc_bits;
        boot[110] = self.fat_count;
        boot[111] = 0x80;
        boot[112] = self.allocated_percent;
        boot[510..512].copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
        boot
    }

    fn root_directory(&self, layout: &Layout, upcase: &[u8]) -> Vec<u8> {
        let mut root = vec![0u8; layout.cluster_size as usize];

        let bits = layout.cluster_count - EXFAT_FIRST_DATA_CLUSTER;
        let mut bitmap = BitmapEntry::new();
        bitmap.set_start_cluster(layout.bitmap_cluster);
        bitmap.set_size((bits as u64).div_ceil(8));

        let mut table = UpcaseEntry::new();
        table.set_table_checksum(upcase_checksum(upcase));
        table.set_start_cluster(layout.upcase_cluster);
        table.set_size(upcase.len() as u64);

        let mut entries = vec![*bitmap.as_bytes(), *table.as_bytes()];
        if let Some(label) = &self.label {
            let units: Vec<u16> = label.encode_utf16().collect();
            entries.push(*LabelEntry::with_label(&units).as_bytes());
        }
        for (i, entry) in entries.iter().enumerate() {
            root[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE].copy_from_slice(entry);
        }
        root
    }

    fn fat(&self, layout: &Layout) -> Vec<u8> {
        let mut fat = vec![0u32; layout.cluster_count as usize + 2];
        fat[0] = 0xFFFF_FFF8;
        fat[1] = EXFAT_CLUSTER_END;
        fat[layout.bitmap_cluster as usize] = EXFAT_CLUSTER_END;
        let last_upcase = layout.upcase_cluster + layout.upcase_clusters - 1;
        for cluster in layout.upcase_cluster..last_upcase {
            fat[cluster as usize] = cluster + 1;
        }
        fat[last_upcase as usize] = EXFAT_CLUSTER_END;
        fat[layout.rootdir_cluster as usize] = EXFAT_CLUSTER_END;
        fat.iter().flat_map(|entry| entry.to_le_bytes()).collect()
    }

    pub fn build(self) -> TestImage {
        let layout = self.layout();
        let mut file = NamedTempFile::new().expect("create temporary image");
        file.as_file()
            .set_len(layout.sector_count * SECTOR_SIZE)
            .expect("size temporary image");

        // Boot region, main and backup
        let boot = self.boot_sector(&layout);
        let zero = [0u8; SECTOR_SIZE as usize];
        let mut checksum = vbr_start_checksum(&boot);
        for _ in 1..11 {
            checksum = vbr_add_checksum(&zero, checksum);
        }
        if self.corrupt_checksum {
            checksum ^= 1;
        }
        let checksum_sector: Vec<u8> = std::iter::repeat(checksum.to_le_bytes())
            .take(SECTOR_SIZE as usize / 4)
            .flatten()
            .collect();
        for base in [0u64, 12] {
            write_at(&file, &boot, base * SECTOR_SIZE);
            write_at(&file, &checksum_sector, (base + 11) * SECTOR_SIZE);
        }

        write_at(&file, &self.fat(&layout), layout.fat_sector_start as u64 * SECTOR_SIZE);

        let cluster_offset = |cluster: u32| {
            layout.cluster_sector_start as u64 * SECTOR_SIZE
                + (cluster - EXFAT_FIRST_DATA_CLUSTER) as u64 * layout.cluster_size
        };

        let mut bitmap = vec![0u8; layout.cluster_size as usize];
        for cluster in EXFAT_FIRST_DATA_CLUSTER..=layout.rootdir_cluster {
            let index = (cluster - EXFAT_FIRST_DATA_CLUSTER) as usize;
            bitmap[index / 8] |= 1 << (index % 8);
        }
        write_at(&file, &bitmap, cluster_offset(layout.bitmap_cluster));

        let upcase = generate_upcase_table();
        write_at(&file, &upcase, cluster_offset(layout.upcase_cluster));
        write_at(
            &file,
            &self.root_directory(&layout, &upcase),
            cluster_offset(layout.rootdir_cluster),
        );
        file.flush().expect("flush temporary image");

        TestImage { file, layout }
    }
}

fn write_at(file: &NamedTempFile, data: &[u8], offset: u64) {
    file.as_file()
        .write_all_at(data, offset)
        .expect("write temporary image");
}

/// A built image, deleted on drop.
pub struct TestImage {
    file: NamedTempFile,
    layout: Layout,
}

impl TestImage {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn mount(&self) -> ExFat {
        self.mount_options(MountOptions::default())
    }

    pub fn mount_options(&self, options: MountOptions) -> ExFat {
        ExFat::mount(self.path(), options).expect("mount test image")
    }

    pub fn read_super_block(&self) -> SuperBlock {
        let mut sector = [0u8; SUPER_BLOCK_SIZE];
        sector.copy_from_slice(&self.read(0, SUPER_BLOCK_SIZE));
        SuperBlock::parse(&sector)
    }

    pub fn read(&self, offset: u64, length: usize) -> Vec<u8> {
        let mut buffer = vec![0u8; length];
        self.file
            .as_file()
            .read_exact_at(&mut buffer, offset)
            .expect("read test image");
        buffer
    }

    /// Overwrite raw bytes of the image.
    pub fn patch(&self, offset: u64, bytes: &[u8]) {
        write_at(&self.file, bytes, offset);
    }
}

/// Raw FAT entry of `cluster` as stored in the image.
pub fn read_fat_entry(image: &TestImage, cluster: u32) -> u32 {
    let offset = image.layout.fat_sector_start as u64 * SECTOR_SIZE + cluster as u64 * 4;
    let raw = image.read(offset, 4);
    u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
}
