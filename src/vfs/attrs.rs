//! Sparse attribute records and the overlay string format.

use std::fmt;
use std::str::FromStr;

use super::host::Stat;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

pub const S_ISVTX: u32 = 0o001000;
pub const S_IRUSR: u32 = 0o000400;
pub const S_IWUSR: u32 = 0o000200;

/// Permission bits including setuid/setgid/sticky.
pub const PERM_MASK: u32 = 0o7777;

/// Format bits of a mode.
pub fn file_format(mode: u32) -> u32 {
    mode & S_IFMT
}

/// Block, character, fifo and socket formats: types a host file cannot
/// portably be but an empty placeholder can stand in for.
pub fn is_special_format(mode: u32) -> bool {
    matches!(file_format(mode), S_IFBLK | S_IFCHR | S_IFIFO | S_IFSOCK)
}

/// Seconds and microseconds, the guest's time resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeVal {
    pub sec: u32,
    pub usec: u32,
}

impl TimeVal {
    pub fn new(sec: u32, usec: u32) -> Self {
        Self { sec, usec }
    }

    pub fn now() -> Self {
        let d = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: d.as_secs() as u32,
            usec: d.subsec_micros(),
        }
    }
}

/// Metadata where every field may be absent.
///
/// Only mode, uid, gid and rdev are persisted in the overlay; size and
/// times always come from the host file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileAttrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u32>,
    pub atime: Option<TimeVal>,
    pub mtime: Option<TimeVal>,
    pub rdev: Option<u32>,
}

impl FileAttrs {
    /// All fields unset.
    pub fn unset() -> Self {
        Self::default()
    }

    /// Every field taken from a host stat.
    pub fn from_stat(st: &Stat) -> Self {
        Self {
            mode: Some(st.mode),
            uid: Some(st.uid),
            gid: Some(st.gid),
            size: Some(st.size.min(u32::MAX as u64) as u32),
            atime: Some(st.atime()),
            mtime: Some(st.mtime()),
            rdev: matches!(file_format(st.mode), S_IFBLK | S_IFCHR).then_some(st.rdev as u32),
        }
    }

    /// Overwrite each field that is set in `other`; unset fields never clobber.
    pub fn update(&mut self, other: &FileAttrs) {
        fn take<T: Copy>(dst: &mut Option<T>, src: Option<T>) {
            if src.is_some() {
                *dst = src;
            }
        }
        take(&mut self.mode, other.mode);
        take(&mut self.uid, other.uid);
        take(&mut self.gid, other.gid);
        take(&mut self.size, other.size);
        take(&mut self.atime, other.atime);
        take(&mut self.mtime, other.mtime);
        take(&mut self.rdev, other.rdev);
    }

    /// The persisted subset.
    pub fn overlay_fields(&self) -> FileAttrs {
        FileAttrs {
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            ..FileAttrs::unset()
        }
    }
}

/// `"0<octal mode>:<uid>:<gid>:<rdev>"`, with `-1` for any unset field.
/// Every `u32` is a real value, all-ones included.
impl fmt::Display for FileAttrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            Some(mode) => write!(f, "0{:o}", mode)?,
            None => f.write_str("-1")?,
        }
        for id in [self.uid, self.gid, self.rdev] {
            match id {
                Some(v) => write!(f, ":{}", v)?,
                None => f.write_str(":-1")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAttrsError(String);

impl fmt::Display for ParseAttrsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid attribute overlay {:?}", self.0)
    }
}

impl std::error::Error for ParseAttrsError {}

impl FromStr for FileAttrs {
    type Err = ParseAttrsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseAttrsError(s.to_owned());
        let s = s.trim_end_matches('\0').trim();
        let mut fields = s.split(':');

        // Older overlays wrote an unset mode as all-ones octal. No valid
        // mode has every format bit set, so that spelling stays unambiguous.
        let mode = match fields.next().ok_or_else(err)? {
            "-1" => None,
            raw => match u32::from_str_radix(raw, 8).map_err(|_| err())? {
                u32::MAX => None,
                mode => Some(mode),
            },
        };

        let mut id = || -> Result<Option<u32>, ParseAttrsError> {
            let raw: i64 = fields.next().ok_or_else(err)?.parse().map_err(|_| err())?;
            match raw {
                -1 => Ok(None),
                v => u32::try_from(v).map(Some).map_err(|_| err()),
            }
        };
        let uid = id()?;
        let gid = id()?;
        let rdev = id()?;

        Ok(FileAttrs {
            mode,
            uid,
            gid,
            rdev,
            ..FileAttrs::unset()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_with_unset_is_noop() {
        let mut attrs = FileAttrs {
            mode: Some(S_IFREG | 0o644),
            uid: Some(20),
            gid: Some(5),
            size: Some(100),
            atime: Some(TimeVal::new(1, 2)),
            mtime: Some(TimeVal::new(3, 4)),
            rdev: Some(0x0301),
        };
        let before = attrs;
        attrs.update(&FileAttrs::unset());
        assert_eq!(attrs, before);
    }

    #[test]
    fn test_update_overwrites_set_fields_only() {
        let mut attrs = FileAttrs {
            uid: Some(1),
            gid: Some(1),
            ..FileAttrs::unset()
        };
        attrs.update(&FileAttrs {
            gid: Some(7),
            rdev: Some(9),
            ..FileAttrs::unset()
        });
        assert_eq!(attrs.uid, Some(1));
        assert_eq!(attrs.gid, Some(7));
        assert_eq!(attrs.rdev, Some(9));
    }

    #[test]
    fn test_from_stat_rdev_only_for_devices() {
        let file = Stat {
            mode: S_IFREG | 0o644,
            rdev: 77,
            ..Stat::default()
        };
        assert_eq!(FileAttrs::from_stat(&file).rdev, None);
        let dev = Stat {
            mode: S_IFCHR | 0o666,
            rdev: 0x0302,
            ..Stat::default()
        };
        assert_eq!(FileAttrs::from_stat(&dev).rdev, Some(0x0302));
    }

    #[test]
    fn test_serialize_format() {
        let attrs = FileAttrs {
            mode: Some(S_IFCHR | 0o666),
            uid: Some(0),
            gid: Some(3),
            rdev: Some(0x0302),
            ..FileAttrs::unset()
        };
        assert_eq!(attrs.to_string(), "020666:0:3:770");
        assert_eq!(FileAttrs::unset().to_string(), "-1:-1:-1:-1");
    }

    #[test]
    fn test_parse_round_trip() {
        let samples = [
            FileAttrs {
                mode: Some(S_IFDIR | 0o755),
                uid: Some(501),
                gid: Some(20),
                rdev: None,
                ..FileAttrs::unset()
            },
            FileAttrs {
                mode: None,
                uid: None,
                gid: Some(0),
                rdev: Some(0x0600),
                ..FileAttrs::unset()
            },
            FileAttrs {
                mode: Some(S_IFREG | 0o644),
                uid: Some(u32::MAX),
                gid: Some(5),
                rdev: Some(u32::MAX),
                ..FileAttrs::unset()
            },
            FileAttrs::unset(),
        ];
        for attrs in samples {
            let parsed: FileAttrs = attrs.to_string().parse().unwrap();
            assert_eq!(parsed, attrs.overlay_fields());
        }
    }

    #[test]
    fn test_all_ones_id_is_a_real_value() {
        let attrs = FileAttrs {
            mode: Some(S_IFREG | 0o644),
            uid: Some(u32::MAX),
            gid: Some(5),
            ..FileAttrs::unset()
        };
        assert_eq!(attrs.to_string(), "0100644:4294967295:5:-1");
        let parsed: FileAttrs = "0100644:4294967295:5:-1\0".parse().unwrap();
        assert_eq!(parsed.uid, Some(u32::MAX));
        assert_eq!(parsed.rdev, None);
    }

    #[test]
    fn test_parse_legacy_all_ones_mode() {
        let parsed: FileAttrs = "037777777777:20:-1:-1".parse().unwrap();
        assert_eq!(parsed.mode, None);
        assert_eq!(parsed.uid, Some(20));
        assert_eq!(parsed.gid, None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<FileAttrs>().is_err());
        assert!("0644:1:2".parse::<FileAttrs>().is_err());
        assert!("0999:1:2:3".parse::<FileAttrs>().is_err());
    }

    #[test]
    fn test_special_format() {
        assert!(is_special_format(S_IFCHR | 0o600));
        assert!(is_special_format(S_IFIFO));
        assert!(!is_special_format(S_IFREG | 0o644));
        assert!(!is_special_format(S_IFDIR));
    }
}
