// exFAT engine: mount, directory cache, cluster allocation and file I/O
pub mod exfat;
pub mod fat_common;
pub mod ops;

#[doc(hidden)]
pub mod test_helpers;

// Re-export the engine entry points
pub use exfat::{ExFat, ExFatDetector, ExFatOps, Node, NodeStat, VolumeInfo};

// Re-export filesystem operations
pub use ops::{DirectoryEntry, FileAttributes, FilesystemDetector, FilesystemInfo, FilesystemOps};

pub use exfat_core::{ExFatError, ExFatResult, MountOptions, OpenMode};
