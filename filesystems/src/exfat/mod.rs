// exFAT module - mountable read/write engine

pub mod bitmap;
mod cache;
pub mod checksum;
mod cluster;
pub mod directory_entries;
pub mod file_operations;
pub mod lookup;
pub mod mount;
pub mod node;
pub mod ops;
mod reader;
pub mod structures;
pub mod upcase;
mod writer;

pub use file_operations::NodeStat;
pub use lookup::{validate_name, DirIter, SplitPath};
pub use mount::{humanize_bytes, ExFat, ReadOnlyState, VolumeInfo};
pub use node::{Node, NodeFlags, NodeId};
pub use ops::ExFatOps;

use crate::ops::FilesystemDetector;
use structures::EXFAT_SIGNATURE;

pub struct ExFatDetector;

impl FilesystemDetector for ExFatDetector {
    fn detect(&self, boot_sector: &[u8]) -> Option<String> {
        // exFAT signature is at offset 3: "EXFAT   "
        if boot_sector.len() >= 11 && &boot_sector[3..11] == EXFAT_SIGNATURE {
            Some("exfat".to_string())
        } else {
            None
        }
    }

    fn priority(&self) -> i32 {
        10
    }
}
