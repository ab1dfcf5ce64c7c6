// exFAT directory entry set creation
// Each file/directory requires a set of entries: FILE + FILE_INFO + FILE_NAME(s)

use super::checksum::{calc_checksum, calc_name_hash};
use super::structures::*;
use super::upcase::UpcaseTable;
use crate::fat_common::timestamps::{now, unix_to_exfat};

/// One complete dirent run, ready to be written or just read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySet {
    pub meta1: FileEntry,
    pub meta2: FileInfoEntry,
    pub names: Vec<FileNameEntry>,
}

/// FILE_NAME records for `name`, 15 units each, zero padded.
pub fn name_records(name: &[u16]) -> Vec<FileNameEntry> {
    name.chunks(EXFAT_ENAME_MAX)
        .map(FileNameEntry::with_name)
        .collect()
}

impl EntrySet {
    /// Reassemble a run from raw records. Returns `None` unless the records
    /// are typed FILE, FILE_INFO, FILE_NAME... and their count matches the
    /// continuation count.
    pub fn from_records(records: &[RawEntry]) -> Option<Self> {
        let (first, rest) = records.split_first()?;
        let meta1 = FileEntry::from_raw(*first);
        if meta1.entry_type() != EXFAT_ENTRY_FILE
            || meta1.continuations() as usize != rest.len()
        {
            return None;
        }
        let (second, rest) = rest.split_first()?;
        let meta2 = FileInfoEntry::from_raw(*second);
        if meta2.entry_type() != EXFAT_ENTRY_FILE_INFO {
            return None;
        }
        let names: Vec<FileNameEntry> = rest.iter().map(|raw| FileNameEntry::from_raw(*raw)).collect();
        if names.is_empty() || names.iter().any(|n| n.entry_type() != EXFAT_ENTRY_FILE_NAME) {
            return None;
        }
        Some(Self { meta1, meta2, names })
    }

    /// Name units up to the first zero.
    pub fn name(&self) -> Vec<u16> {
        let mut name: Vec<u16> = self.names.iter().flat_map(|n| n.name()).collect();
        if let Some(end) = name.iter().position(|&c| c == 0) {
            name.truncate(end);
        }
        name
    }

    /// Replace the name records and the fields derived from the name.
    pub fn rename(&mut self, upcase: &UpcaseTable, name: &[u16]) {
        self.names = name_records(name);
        self.meta1.set_continuations(1 + self.names.len() as u8);
        self.meta2.set_name_length(name.len() as u8);
        self.meta2.set_name_hash(calc_name_hash(upcase, name));
        self.update_checksum();
    }

    pub fn checksum(&self) -> u16 {
        calc_checksum(&self.meta1, &self.meta2, &self.name())
    }

    pub fn update_checksum(&mut self) {
        let checksum = self.checksum();
        self.meta1.set_checksum(checksum);
    }

    pub fn is_valid(&self) -> bool {
        self.meta1.checksum() == self.checksum()
    }

    /// Number of 32-byte records in the run.
    pub fn record_count(&self) -> usize {
        2 + self.names.len()
    }

    /// Records in on-disk order.
    pub fn records(&self) -> Vec<RawEntry> {
        let mut records = Vec::with_capacity(self.record_count());
        records.push(*self.meta1.as_bytes());
        records.push(*self.meta2.as_bytes());
        records.extend(self.names.iter().map(|n| *n.as_bytes()));
        records
    }
}

/// Builder for creating exFAT directory entry sets
pub struct EntrySetBuilder {
    name: Vec<u16>,
    attributes: u16,
    size: u64,
    start_cluster: u32,
    contiguous: bool,
    created: i64,
    modified: i64,
    accessed: i64,
}

impl EntrySetBuilder {
    /// Create a new file entry set builder
    pub fn new_file(name: &[u16]) -> Self {
        let now = now();
        Self {
            name: name.to_vec(),
            attributes: EXFAT_ATTRIB_ARCH,
            size: 0,
            start_cluster: EXFAT_CLUSTER_FREE,
            contiguous: false,
            created: now,
            modified: now,
            accessed: now,
        }
    }

    /// Create a new directory entry set builder
    pub fn new_directory(name: &[u16]) -> Self {
        Self::new_file(name).attributes(EXFAT_ATTRIB_ARCH | EXFAT_ATTRIB_DIR)
    }

    pub fn attributes(mut self, attributes: u16) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn start_cluster(mut self, cluster: u32) -> Self {
        self.start_cluster = cluster;
        self
    }

    pub fn contiguous(mut self, contiguous: bool) -> Self {
        self.contiguous = contiguous;
        self
    }

    /// Sets all three timestamps.
    pub fn time(mut self, unix_time: i64) -> Self {
        self.created = unix_time;
        self.modified = unix_time;
        self.accessed = unix_time;
        self
    }

    pub fn modified(mut self, unix_time: i64) -> Self {
        self.modified = unix_time;
        self
    }

    pub fn accessed(mut self, unix_time: i64) -> Self {
        self.accessed = unix_time;
        self
    }

    /// Build the complete directory entry set
    pub fn build(self, upcase: &UpcaseTable) -> EntrySet {
        let names = name_records(&self.name);

        let mut meta1 = FileEntry::new();
        meta1.set_continuations(1 + names.len() as u8);
        meta1.set_attrib(self.attributes);
        let created = unix_to_exfat(self.created);
        meta1.set_crdate(created.date);
        meta1.set_crtime(created.time);
        meta1.set_crtime_cs(created.centiseconds);
        let modified = unix_to_exfat(self.modified);
        meta1.set_mdate(modified.date);
        meta1.set_mtime(modified.time);
        meta1.set_mtime_cs(modified.centiseconds);
        // There is no atime_cs.
        let accessed = unix_to_exfat(self.accessed);
        meta1.set_adate(accessed.date);
        meta1.set_atime(accessed.time);

        let mut meta2 = FileInfoEntry::new();
        let mut flags = EXFAT_FLAG_ALWAYS1;
        // Empty files must not be marked as contiguous.
        if self.contiguous && self.size != 0 {
            flags |= EXFAT_FLAG_CONTIGUOUS;
        }
        meta2.set_flags(flags);
        meta2.set_name_length(self.name.len() as u8);
        meta2.set_name_hash(calc_name_hash(upcase, &self.name));
        meta2.set_size(self.size);
        meta2.set_real_size(self.size);
        meta2.set_start_cluster(self.start_cluster);

        let mut set = EntrySet { meta1, meta2, names };
        set.update_checksum();
        set
    }
}

/// Validate a directory entry set
pub fn validate_entry_set(records: &[RawEntry]) -> Result<EntrySet, String> {
    let set = EntrySet::from_records(records).ok_or_else(|| {
        format!(
            "malformed entry set of {} records starting with type {:#04x}",
            records.len(),
            records.first().map_or(0, |r| r[0])
        )
    })?;
    if !set.is_valid() {
        return Err(format!(
            "checksum mismatch: stored {:#06x}, calculated {:#06x}",
            set.meta1.checksum(),
            set.checksum()
        ));
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    #[test]
    fn test_short_filename_entry_set() {
        let upcase = UpcaseTable::generate();
        let set = EntrySetBuilder::new_file(&utf16("test.txt"))
            .size(1024)
            .start_cluster(10)
            .contiguous(true)
            .build(&upcase);

        let records = set.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0][0], EXFAT_ENTRY_FILE);
        assert_eq!(records[1][0], EXFAT_ENTRY_FILE_INFO);
        assert_eq!(records[2][0], EXFAT_ENTRY_FILE_NAME);
        assert_eq!(set.meta1.continuations(), 2);
        assert_eq!(set.meta2.flags(), EXFAT_FLAG_ALWAYS1 | EXFAT_FLAG_CONTIGUOUS);

        let decoded = validate_entry_set(&records).unwrap();
        assert_eq!(decoded.name(), utf16("test.txt"));
        assert_eq!(decoded.checksum(), set.checksum());
    }

    #[test]
    fn test_long_filename_entry_set() {
        let upcase = UpcaseTable::generate();
        let long_name = utf16("this_is_a_very_long_filename_that_needs_multiple_entries.txt");
        let set = EntrySetBuilder::new_file(&long_name).build(&upcase);

        let expected_names = (long_name.len() + 14) / 15;
        assert_eq!(set.record_count(), 2 + expected_names);
        assert_eq!(set.meta2.name_length() as usize, long_name.len());
        assert!(validate_entry_set(&set.records()).is_ok());
    }

    #[test]
    fn test_empty_file_is_not_contiguous() {
        let upcase = UpcaseTable::generate();
        let set = EntrySetBuilder::new_directory(&utf16("folder"))
            .contiguous(true)
            .build(&upcase);
        assert_eq!(set.meta2.flags(), EXFAT_FLAG_ALWAYS1);
        assert_ne!(set.meta1.attrib() & EXFAT_ATTRIB_DIR, 0);
    }

    #[test]
    fn test_rename_recomputes_derived_fields() {
        let upcase = UpcaseTable::generate();
        let mut set = EntrySetBuilder::new_file(&utf16("a")).build(&upcase);
        let name = utf16("a much longer replacement name");
        set.rename(&upcase, &name);

        assert_eq!(set.meta1.continuations(), 3);
        assert_eq!(set.meta2.name_hash(), calc_name_hash(&upcase, &name));
        assert_eq!(set.name(), name);
        assert!(set.is_valid());
    }

    #[test]
    fn test_corrupted_set_is_rejected() {
        let upcase = UpcaseTable::generate();
        let mut records = EntrySetBuilder::new_file(&utf16("data.bin"))
            .size(4096)
            .start_cluster(7)
            .build(&upcase)
            .records();

        records[1][24] ^= 0x01;
        assert!(validate_entry_set(&records).unwrap_err().contains("checksum"));

        records.pop();
        assert!(validate_entry_set(&records).is_err());
    }
}
