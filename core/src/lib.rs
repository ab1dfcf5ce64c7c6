pub mod config;
pub mod device;
pub mod error;

pub use config::MountOptions;
pub use device::{Device, OpenMode};
pub use error::{ErrorCounter, ExFatError, ExFatResult};
