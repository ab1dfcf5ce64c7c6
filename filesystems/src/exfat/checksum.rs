// Entry set checksum, name hash and boot region checksum
// All three are the same rotate-right-by-one running sum at different widths.

use super::structures::{
    name_entries, FileEntry, FileInfoEntry, FileNameEntry, EXFAT_ENAME_MAX,
};
use super::upcase::UpcaseTable;

/// Offsets in sector 0 excluded from the boot region checksum:
/// volume_state (2 bytes) and allocated_percent.
const VBR_SKIPPED: [usize; 3] = [0x6a, 0x6b, 0x70];

fn add16(sum: u16, byte: u8) -> u16 {
    sum.rotate_right(1).wrapping_add(byte as u16)
}

fn add32(sum: u32, byte: u8) -> u32 {
    sum.rotate_right(1).wrapping_add(byte as u32)
}

/// Start an entry set checksum from the FILE record, skipping its own
/// checksum field.
pub fn start_checksum(meta1: &FileEntry) -> u16 {
    meta1
        .as_bytes()
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != 2 && *i != 3)
        .fold(0, |sum, (_, &byte)| add16(sum, byte))
}

/// Continue an entry set checksum over one secondary record.
pub fn add_checksum(entry: &[u8], sum: u16) -> u16 {
    entry.iter().fold(sum, |sum, &byte| add16(sum, byte))
}

/// Checksum of a complete FILE + FILE_INFO + FILE_NAME run for `name`.
pub fn calc_checksum(meta1: &FileEntry, meta2: &FileInfoEntry, name: &[u16]) -> u16 {
    let mut checksum = start_checksum(meta1);
    checksum = add_checksum(meta2.as_bytes(), checksum);
    for i in 0..name_entries(name.len()) {
        let end = ((i + 1) * EXFAT_ENAME_MAX).min(name.len());
        let entry = FileNameEntry::with_name(&name[i * EXFAT_ENAME_MAX..end]);
        checksum = add_checksum(entry.as_bytes(), checksum);
    }
    checksum
}

/// Hash over the upper-cased name, low byte first.
pub fn calc_name_hash(upcase: &UpcaseTable, name: &[u16]) -> u16 {
    name.iter().fold(0u16, |hash, &unit| {
        let c = upcase.upcase(unit);
        add16(add16(hash, (c & 0xff) as u8), (c >> 8) as u8)
    })
}

pub fn vbr_start_checksum(sector: &[u8]) -> u32 {
    sector
        .iter()
        .enumerate()
        .filter(|(i, _)| !VBR_SKIPPED.contains(i))
        .fold(0, |sum, (_, &byte)| add32(sum, byte))
}

pub fn vbr_add_checksum(sector: &[u8], sum: u32) -> u32 {
    sector.iter().fold(sum, |sum, &byte| add32(sum, byte))
}

/// Checksum of a whole upcase table as stored on disk.
pub fn upcase_checksum(table: &[u8]) -> u32 {
    vbr_add_checksum(table, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exfat::structures::{EXFAT_ATTRIB_ARCH, EXFAT_FLAG_ALWAYS1};

    fn utf16(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    fn sample_set(name: &[u16]) -> (FileEntry, FileInfoEntry) {
        let mut meta1 = FileEntry::new();
        meta1.set_continuations(1 + name_entries(name.len()) as u8);
        meta1.set_attrib(EXFAT_ATTRIB_ARCH);
        meta1.set_mdate(0x5A2F);
        meta1.set_mtime(0x7C20);
        let mut meta2 = FileInfoEntry::new();
        meta2.set_flags(EXFAT_FLAG_ALWAYS1);
        meta2.set_name_length(name.len() as u8);
        (meta1, meta2)
    }

    #[test]
    fn test_checksum_ignores_stored_checksum() {
        let name = utf16("report.pdf");
        let (mut meta1, meta2) = sample_set(&name);
        let before = calc_checksum(&meta1, &meta2, &name);
        meta1.set_checksum(0xBEEF);
        assert_eq!(calc_checksum(&meta1, &meta2, &name), before);
    }

    #[test]
    fn test_checksum_covers_every_record() {
        let name = utf16("a_name_that_spans_two_records");
        let (meta1, mut meta2) = sample_set(&name);
        let base = calc_checksum(&meta1, &meta2, &name);

        let mut renamed = name.clone();
        renamed[20] = 'X' as u16;
        assert_ne!(calc_checksum(&meta1, &meta2, &renamed), base);

        meta2.set_size(4096);
        assert_ne!(calc_checksum(&meta1, &meta2, &name), base);
    }

    #[test]
    fn test_checksum_matches_manual_fold() {
        let name = utf16("x");
        let (meta1, meta2) = sample_set(&name);

        let mut expected: u16 = 0;
        let mut bytes: Vec<u8> = Vec::new();
        bytes.extend_from_slice(meta1.as_bytes());
        bytes.extend_from_slice(meta2.as_bytes());
        bytes.extend_from_slice(FileNameEntry::with_name(&name).as_bytes());
        for (i, byte) in bytes.iter().enumerate() {
            if i == 2 || i == 3 {
                continue;
            }
            expected = ((expected << 15) | (expected >> 1)).wrapping_add(*byte as u16);
        }
        assert_eq!(calc_checksum(&meta1, &meta2, &name), expected);
    }

    #[test]
    fn test_name_hash_is_case_insensitive() {
        let upcase = UpcaseTable::generate();
        assert_eq!(
            calc_name_hash(&upcase, &utf16("Readme.TXT")),
            calc_name_hash(&upcase, &utf16("README.txt"))
        );
        assert_ne!(
            calc_name_hash(&upcase, &utf16("readme.txt")),
            calc_name_hash(&upcase, &utf16("readme.txd"))
        );
    }

    #[test]
    fn test_vbr_checksum_skips_state_bytes() {
        let mut sector = [0x11u8; 512];
        let sum = vbr_start_checksum(&sector);
        sector[0x6a] = 0x02;
        sector[0x70] = 57;
        assert_eq!(vbr_start_checksum(&sector), sum);
        sector[0x6c] = 0x0a;
        assert_ne!(vbr_start_checksum(&sector), sum);
    }
}
