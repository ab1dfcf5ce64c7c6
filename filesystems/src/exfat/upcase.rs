// exFAT upcase table
// Case folding for name hashes and case-insensitive name comparison.

use byteorder::{ByteOrder, LittleEndian};

/// Maximum number of entries a table may map (one per UTF-16 code unit).
pub const UPCASE_MAX_CHARS: usize = 0x10000;

/// Compression marker: the following unit is the length of an identity run.
const IDENTITY_RUN: u16 = 0xFFFF;

/// In-memory upcase table.
///
/// Characters beyond the end of the table map to themselves, so an empty
/// table is a valid (identity) mapping.
#[derive(Debug, Clone, Default)]
pub struct UpcaseTable {
    table: Vec<u16>,
}

impl UpcaseTable {
    /// Decode a table as stored on disk, expanding identity runs.
    pub fn from_bytes(raw: &[u8]) -> Self {
        let mut units = vec![0u16; raw.len() / 2];
        LittleEndian::read_u16_into(&raw[..units.len() * 2], &mut units);

        let mut table = Vec::with_capacity(UPCASE_MAX_CHARS);
        let mut i = 0;
        while i < units.len() && table.len() < UPCASE_MAX_CHARS {
            if units[i] == IDENTITY_RUN && i + 1 < units.len() {
                let run = units[i + 1] as usize;
                let start = table.len();
                let end = (start + run).min(UPCASE_MAX_CHARS);
                table.extend((start..end).map(|c| c as u16));
                i += 2;
            } else {
                table.push(units[i]);
                i += 1;
            }
        }
        Self { table }
    }

    /// Table built from [`generate_upcase_table`].
    pub fn generate() -> Self {
        Self::from_bytes(&generate_upcase_table())
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn chars(&self) -> usize {
        self.table.len()
    }

    pub fn upcase(&self, ch: u16) -> u16 {
        self.table.get(ch as usize).copied().unwrap_or(ch)
    }

    /// Case-insensitive comparison of two UTF-16 names.
    pub fn names_equal(&self, a: &[u16], b: &[u16]) -> bool {
        a.len() == b.len()
            && a.iter()
                .zip(b.iter())
                .all(|(&x, &y)| self.upcase(x) == self.upcase(y))
    }
}

/// Generate an uncompressed upcase table covering the whole BMP.
pub fn generate_upcase_table() -> Vec<u8> {
    let mut table = Vec::with_capacity(UPCASE_MAX_CHARS * 2);
    for i in 0u32..UPCASE_MAX_CHARS as u32 {
        let upper = to_upper_case(i as u16);
        table.extend_from_slice(&upper.to_le_bytes());
    }
    table
}

fn to_upper_case(ch: u16) -> u16 {
    match ch {
        0x0061..=0x007A => ch - 0x20,
        0x00E0..=0x00F6 | 0x00F8..=0x00FE => ch - 0x20,
        0x00FF => 0x0178,

        // Latin Extended-A pairs
        0x0100..=0x012F | 0x0132..=0x0137 | 0x014A..=0x0177 => {
            if ch % 2 == 1 { ch - 1 } else { ch }
        }
        0x0139..=0x0148 | 0x0179..=0x017E => {
            if ch % 2 == 0 { ch - 1 } else { ch }
        }

        // Greek
        0x03AC => 0x0386,
        0x03AD..=0x03AF => ch - 0x25,
        0x03B1..=0x03C1 | 0x03C3..=0x03CB => ch - 0x20,
        0x03C2 => 0x03A3,
        0x03CC => 0x038C,
        0x03CD..=0x03CE => ch - 0x3F,

        // Cyrillic
        0x0430..=0x044F => ch - 0x20,
        0x0450..=0x045F => ch - 0x50,
        0x0460..=0x0481 | 0x048A..=0x04BF => {
            if ch % 2 == 1 { ch - 1 } else { ch }
        }

        // Armenian
        0x0561..=0x0586 => ch - 0x30,

        // Fullwidth Latin
        0xFF41..=0xFF5A => ch - 0x20,

        _ => ch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    #[test]
    fn test_generated_table() {
        let raw = generate_upcase_table();
        assert_eq!(raw.len(), 128 * 1024);

        let table = UpcaseTable::from_bytes(&raw);
        assert_eq!(table.chars(), UPCASE_MAX_CHARS);
        assert_eq!(table.upcase('a' as u16), 'A' as u16);
        assert_eq!(table.upcase('Z' as u16), 'Z' as u16);
        assert_eq!(table.upcase(0x00E9), 0x00C9); // é
        assert_eq!(table.upcase(0x0430), 0x0410); // а
        assert_eq!(table.upcase('0' as u16), '0' as u16);
    }

    #[test]
    fn test_compressed_table() {
        // 'a'..'z' upcased, everything else identity
        let mut units: Vec<u16> = vec![IDENTITY_RUN, 0x61];
        units.extend(('A' as u16)..=('Z' as u16));
        units.extend_from_slice(&[IDENTITY_RUN, 0x100]);
        let raw: Vec<u8> = units.iter().flat_map(|u| u.to_le_bytes()).collect();

        let table = UpcaseTable::from_bytes(&raw);
        assert_eq!(table.chars(), 0x61 + 26 + 0x100);
        assert_eq!(table.upcase('q' as u16), 'Q' as u16);
        assert_eq!(table.upcase('Q' as u16), 'Q' as u16);
        assert_eq!(table.upcase(0x00E9), 0x00E9);
    }

    #[test]
    fn test_empty_table_is_identity() {
        let table = UpcaseTable::default();
        assert!(table.is_empty());
        assert_eq!(table.upcase('a' as u16), 'a' as u16);
        assert!(!table.names_equal(&utf16("a"), &utf16("A")));
    }

    #[test]
    fn test_names_equal() {
        let table = UpcaseTable::generate();
        assert!(table.names_equal(&utf16("test.txt"), &utf16("TEST.TXT")));
        assert!(table.names_equal(&utf16("файл.dat"), &utf16("ФАЙЛ.DAT")));
        assert!(!table.names_equal(&utf16("test.txt"), &utf16("test.txt2")));
        assert!(!table.names_equal(&utf16("test1"), &utf16("test2")));
    }
}
