//! Server-wide state handed to every RPC program.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use super::file_table::FileTable;
use super::mount::MountList;
use super::portmap::PortRegistry;
use super::shadow::ShadowStore;
use crate::config::{BootConfig, NfsdConfig};
use crate::vfs::{host, OpenMode, VfsPath, VirtualFs};
use crate::{Error, Result};

/// Largest `/etc/passwd` read when resolving the default user.
const MAX_PASSWD_SIZE: u64 = 1 << 20;

/// Everything tied to one export root. Replaced as a whole when the root
/// changes so handles from different roots never mix.
#[derive(Debug)]
pub struct Export {
    pub table: FileTable,
    pub shadow: ShadowStore,
    /// Owner given to new files whose uid/gid the client leaves unset.
    pub default_owner: Option<(u32, u32)>,
}

impl Export {
    /// Open `root` for export under `alias`. The root must exist and be
    /// readable and writable.
    pub fn open(root: &Path, alias: &str) -> Result<Self> {
        let unavailable = |code: i32| Error::ExportUnavailable {
            path: root.to_path_buf(),
            source: std::io::Error::from_raw_os_error(code),
        };
        host::access(root, libc::F_OK | libc::R_OK | libc::W_OK)
            .map_err(|e| unavailable(e.code()))?;
        if !root.is_dir() {
            return Err(unavailable(libc::ENOTDIR));
        }
        Ok(Self {
            table: FileTable::new(VirtualFs::new(root, alias)),
            shadow: ShadowStore::new(),
            default_owner: None,
        })
    }

    pub fn vfs(&self) -> &VirtualFs {
        self.table.vfs()
    }
}

/// Look `name` up in the export's `/etc/passwd`.
pub fn lookup_user(vfs: &VirtualFs, name: &str) -> Option<(u32, u32)> {
    let path = vfs.alias() / &VfsPath::new("etc/passwd");
    let file = vfs.open(&path, OpenMode::Read).ok()?;
    let len = file.len().ok()?.min(MAX_PASSWD_SIZE) as usize;
    let mut buf = vec![0u8; len];
    let n = file.read_at(0, &mut buf).ok()?;
    parse_passwd(&String::from_utf8_lossy(&buf[..n]), name)
}

/// `name:password:uid:gid:...`; the password field may be empty.
fn parse_passwd(text: &str, name: &str) -> Option<(u32, u32)> {
    text.lines()
        .filter(|line| !line.starts_with('#'))
        .map(|line| line.split(':').collect::<Vec<_>>())
        .find(|fields| fields.len() >= 4 && fields[0] == name)
        .and_then(|fields| Some((fields[2].parse().ok()?, fields[3].parse().ok()?)))
}

#[derive(Debug)]
pub struct ServerContext {
    config: NfsdConfig,
    export: RwLock<Arc<Export>>,
    mounts: MountList,
    ports: PortRegistry,
}

impl ServerContext {
    /// Open the configured export. Fails if the export root is unusable.
    pub fn new(config: &NfsdConfig) -> Result<Self> {
        let export = Self::open_export(config, &config.export_root)?;
        Ok(Self {
            config: config.clone(),
            export: RwLock::new(Arc::new(export)),
            mounts: MountList::new(),
            ports: PortRegistry::new(),
        })
    }

    fn open_export(config: &NfsdConfig, root: &Path) -> Result<Export> {
        let mut export = Export::open(root, &config.export_alias)?;
        let looked_up = match (config.default_uid, config.default_gid) {
            (Some(_), Some(_)) => None,
            _ => lookup_user(export.vfs(), &config.default_user),
        };
        export.default_owner = match (config.default_uid, config.default_gid, looked_up) {
            (Some(uid), Some(gid), _) => Some((uid, gid)),
            (uid, gid, Some((pw_uid, pw_gid))) => {
                Some((uid.unwrap_or(pw_uid), gid.unwrap_or(pw_gid)))
            }
            _ => None,
        };
        debug!(
            "nfsd: export {} default owner {:?}",
            root.display(),
            export.default_owner
        );
        Ok(export)
    }

    /// Snapshot of the current export. Requests keep the snapshot they
    /// started with even if the export is replaced meanwhile.
    pub fn export(&self) -> Arc<Export> {
        Arc::clone(&self.export.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the export with a fresh one rooted at `root`. The alias is
    /// kept; all handles and shadowed writes of the old export are dropped.
    pub fn reexport(&self, root: &Path) -> Result<()> {
        let export = Self::open_export(&self.config, root)?;
        *self.export.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(export);
        info!("nfsd: now exporting {} as {}", root.display(), self.alias());
        Ok(())
    }

    /// Host directory currently exported.
    pub fn export_root(&self) -> PathBuf {
        self.export().vfs().host_root().to_path_buf()
    }

    /// Guest path of the export root.
    pub fn alias(&self) -> String {
        self.export().vfs().alias().to_string()
    }

    pub fn write_protect(&self) -> bool {
        self.config.write_protect
    }

    pub fn boot(&self) -> &BootConfig {
        &self.config.boot
    }

    pub fn mounts(&self) -> &MountList {
        &self.mounts
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_passwd() {
        let text = "# comment\nroot:*:0:1:System:/:/bin/csh\nme::20:10:Me:/me:/bin/sh\n";
        assert_eq!(parse_passwd(text, "me"), Some((20, 10)));
        assert_eq!(parse_passwd(text, "root"), Some((0, 1)));
        assert_eq!(parse_passwd(text, "nobody"), None);
        assert_eq!(parse_passwd("me:x:abc:1\n", "me"), None);
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = NfsdConfig::new().export_root(dir.path().join("missing"));
        assert!(matches!(
            ServerContext::new(&config),
            Err(Error::ExportUnavailable { .. })
        ));
    }

    #[test]
    fn test_file_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("file"), b"").unwrap();
        let config = NfsdConfig::new().export_root(dir.path().join("file"));
        assert!(ServerContext::new(&config).is_err());
    }

    #[test]
    fn test_default_owner_from_exported_passwd() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/passwd"), "me:x:20:10::/me:/bin/sh\n").unwrap();

        let ctx = ServerContext::new(&NfsdConfig::new().export_root(dir.path())).unwrap();
        assert_eq!(ctx.export().default_owner, Some((20, 10)));

        let ctx = ServerContext::new(
            &NfsdConfig::new()
                .export_root(dir.path())
                .default_owner(0, 0),
        )
        .unwrap();
        assert_eq!(ctx.export().default_owner, Some((0, 0)));
    }

    #[test]
    fn test_reexport_replaces_table() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        fs::write(a.path().join("f"), b"").unwrap();

        let ctx = ServerContext::new(&NfsdConfig::new().export_root(a.path())).unwrap();
        let old = ctx.export();
        let h = old.table.get_file_handle(&VfsPath::new("/f"));
        assert_ne!(h, 0);

        ctx.reexport(b.path()).unwrap();
        assert_eq!(ctx.export().table.get_canonical_path(h), None);
        assert_eq!(ctx.export_root(), b.path());
        // The old snapshot still works for requests already in flight.
        assert!(old.table.get_canonical_path(h).is_some());
    }
}
