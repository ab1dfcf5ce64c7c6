use crate::device::OpenMode;
use log::debug;
use serde::{Deserialize, Serialize};

const DEFAULT_UMASK: u32 = 0o022;

/// Options controlling how a volume is mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    pub mode: OpenMode,
    /// Do not update access times on read.
    pub noatime: bool,
    pub uid: u32,
    pub gid: u32,
    /// Permission bits removed from directories.
    pub dmask: u32,
    /// Permission bits removed from regular files.
    pub fmask: u32,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            mode: OpenMode::ReadWrite,
            noatime: false,
            uid: nix::unistd::geteuid().as_raw(),
            gid: nix::unistd::getegid().as_raw(),
            dmask: DEFAULT_UMASK,
            fmask: DEFAULT_UMASK,
        }
    }
}

impl MountOptions {
    pub fn read_only() -> Self {
        Self { mode: OpenMode::ReadOnly, ..Self::default() }
    }

    /// Parse a comma-separated mount option string such as
    /// `"ro,noatime,umask=027,uid=1000"`.
    ///
    /// `umask` seeds both `dmask` and `fmask`; an explicit `dmask`/`fmask`
    /// wins regardless of order. Unknown options are skipped.
    pub fn parse(options: &str) -> Self {
        let mut result = Self::default();
        let mut umask = None;
        let mut dmask = None;
        let mut fmask = None;

        for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (option, None),
            };
            match (key, value) {
                ("ro", None) => result.mode = OpenMode::ReadOnly,
                ("rw", None) => result.mode = OpenMode::ReadWrite,
                ("ro_fallback", None) => result.mode = OpenMode::Any,
                ("noatime", None) => result.noatime = true,
                ("umask", Some(v)) => umask = parse_mask(v),
                ("dmask", Some(v)) => dmask = parse_mask(v),
                ("fmask", Some(v)) => fmask = parse_mask(v),
                ("uid", Some(v)) => {
                    if let Ok(uid) = v.parse() {
                        result.uid = uid;
                    }
                }
                ("gid", Some(v)) => {
                    if let Ok(gid) = v.parse() {
                        result.gid = gid;
                    }
                }
                _ => debug!("ignoring mount option `{}'", option),
            }
        }

        let umask = umask.unwrap_or(DEFAULT_UMASK);
        result.dmask = dmask.unwrap_or(umask);
        result.fmask = fmask.unwrap_or(umask);
        result
    }

    pub fn is_read_only(&self) -> bool {
        self.mode == OpenMode::ReadOnly
    }
}

fn parse_mask(value: &str) -> Option<u32> {
    u32::from_str_radix(value, 8).ok().map(|mask| mask & 0o777)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = MountOptions::default();
        assert_eq!(options.mode, OpenMode::ReadWrite);
        assert_eq!(options.dmask, 0o022);
        assert_eq!(options.fmask, 0o022);
        assert!(!options.noatime);
    }

    #[test]
    fn test_parse_options() {
        let options = MountOptions::parse("ro,noatime,umask=077,fmask=0133,uid=1000,gid=100");
        assert!(options.is_read_only());
        assert!(options.noatime);
        assert_eq!(options.dmask, 0o077);
        assert_eq!(options.fmask, 0o133);
        assert_eq!(options.uid, 1000);
        assert_eq!(options.gid, 100);
    }

    #[test]
    fn test_parse_fallback_and_unknown() {
        let options = MountOptions::parse("ro_fallback,big_writes,,umask=7777");
        assert_eq!(options.mode, OpenMode::Any);
        assert_eq!(options.dmask, 0o777);
    }

    #[test]
    fn test_serde_roundtrip() {
        let options = MountOptions::parse("noatime,dmask=022,fmask=133");
        let json = serde_json::to_string(&options).unwrap();
        let parsed: MountOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, options);
    }
}
