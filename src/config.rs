//! Server configuration

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::nfsd::{bootparam, mount, nfs2, portmap};
use crate::{Error, Result};

/// Gateway address of the user-mode network the guest sits on.
pub const SLIRP_GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);
/// Address the guest uses for the file server.
pub const SLIRP_NFSD_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 254);

/// Identity handed out by the boot-parameter service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// Host name returned to the guest by WHOAMI
    pub client_name: String,
    /// Domain name, without a leading dot
    pub domain: String,
    /// Router address returned by WHOAMI
    pub gateway: Ipv4Addr,
    /// Name of the file server returned by GETFILE
    pub server_name: String,
    /// Address of the file server returned by GETFILE
    pub server_addr: Ipv4Addr,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            client_name: "guest".into(),
            domain: "local".into(),
            gateway: SLIRP_GATEWAY_IP,
            server_name: "shared".into(),
            server_addr: SLIRP_NFSD_IP,
        }
    }
}

fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Configuration for the NFS server and its companion services
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NfsdConfig {
    /// Host directory to export
    pub export_root: PathBuf,
    /// Guest path under which the export root appears (default: "/")
    pub export_alias: String,
    /// Address all services bind to (default: 127.0.0.1)
    pub bind_addr: IpAddr,
    /// NFS port, 0 for ephemeral (default: 2049)
    pub nfs_port: u16,
    /// Port mapper port, 0 for ephemeral (default: 111)
    pub portmap_port: u16,
    /// Mount service port (default: ephemeral)
    pub mount_port: u16,
    /// Boot-parameter service port (default: ephemeral)
    pub bootparam_port: u16,
    /// Owner for new files whose uid the client leaves unset
    pub default_uid: Option<u32>,
    /// Group for new files whose gid the client leaves unset
    pub default_gid: Option<u32>,
    /// User looked up in the export's /etc/passwd when no uid/gid is given
    pub default_user: String,
    /// Keep writes in memory instead of modifying the export
    pub write_protect: bool,
    /// Close TCP connections idle for this long (default: 60s)
    #[serde(deserialize_with = "de_duration")]
    pub tcp_idle_timeout: Duration,
    /// Datagram receive buffer size
    pub udp_buffer_size: usize,
    /// Boot-parameter identity
    pub boot: BootConfig,
    /// Write logs here instead of stderr
    pub log_file: Option<PathBuf>,
}

impl Default for NfsdConfig {
    fn default() -> Self {
        Self {
            export_root: PathBuf::new(),
            export_alias: "/".into(),
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            nfs_port: 2049,
            portmap_port: 111,
            mount_port: 0,
            bootparam_port: 0,
            default_uid: None,
            default_gid: None,
            default_user: "me".into(),
            write_protect: false,
            tcp_idle_timeout: Duration::from_secs(60),
            udp_buffer_size: 65536,
            boot: BootConfig::default(),
            log_file: None,
        }
    }
}

impl NfsdConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the exported host directory
    pub fn export_root<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.export_root = path.into();
        self
    }

    /// Set the guest path of the export root
    pub fn export_alias<S: Into<String>>(mut self, alias: S) -> Self {
        self.export_alias = alias.into();
        self
    }

    /// Set the bind address
    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the NFS port
    pub fn nfs_port(mut self, port: u16) -> Self {
        self.nfs_port = port;
        self
    }

    /// Set the port mapper port
    pub fn portmap_port(mut self, port: u16) -> Self {
        self.portmap_port = port;
        self
    }

    /// Set the mount service port
    pub fn mount_port(mut self, port: u16) -> Self {
        self.mount_port = port;
        self
    }

    /// Set the boot-parameter service port
    pub fn bootparam_port(mut self, port: u16) -> Self {
        self.bootparam_port = port;
        self
    }

    /// Bind every service to an ephemeral port
    pub fn ephemeral_ports(self) -> Self {
        self.nfs_port(0).portmap_port(0).mount_port(0).bootparam_port(0)
    }

    /// Set the owner of newly created files
    pub fn default_owner(mut self, uid: u32, gid: u32) -> Self {
        self.default_uid = Some(uid);
        self.default_gid = Some(gid);
        self
    }

    /// Set the user looked up in the export's /etc/passwd
    pub fn default_user<S: Into<String>>(mut self, name: S) -> Self {
        self.default_user = name.into();
        self
    }

    /// Enable or disable write protection
    pub fn write_protect(mut self, enable: bool) -> Self {
        self.write_protect = enable;
        self
    }

    /// Set the TCP idle timeout
    pub fn tcp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.tcp_idle_timeout = timeout;
        self
    }

    /// Set the boot-parameter identity
    pub fn boot(mut self, boot: BootConfig) -> Self {
        self.boot = boot;
        self
    }

    /// Set the log file
    pub fn log_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Configured port for an RPC program number.
    pub fn port_for(&self, program: u32) -> u16 {
        match program {
            nfs2::NFS_PROGRAM => self.nfs_port,
            mount::MOUNT_PROGRAM => self.mount_port,
            bootparam::BOOTPARAM_PROGRAM => self.bootparam_port,
            portmap::PMAP_PROGRAM => self.portmap_port,
            _ => 0,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_config(self)
    }
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<NfsdConfig> {
    let config = read_config(path)?;
    validate_config(&config)?;
    Ok(config)
}

/// Parse a configuration file without validating it, for callers that
/// layer further settings on top. `.yaml`/`.yml` are read as YAML,
/// anything else as JSON.
pub fn read_config(path: &Path) -> Result<NfsdConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);

    let config: NfsdConfig = if is_yaml {
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid YAML config {}: {}", path.display(), e)))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid JSON config {}: {}", path.display(), e)))?
    };
    Ok(config)
}

pub fn validate_config(config: &NfsdConfig) -> Result<()> {
    if config.export_root.as_os_str().is_empty() {
        return Err(Error::Config("export_root is required".into()));
    }
    if !config.export_alias.starts_with('/') {
        return Err(Error::Config(format!(
            "export_alias '{}' must be an absolute path",
            config.export_alias
        )));
    }
    if config.udp_buffer_size < 1024 {
        return Err(Error::Config(format!(
            "udp_buffer_size {} is too small",
            config.udp_buffer_size
        )));
    }
    if config.tcp_idle_timeout.is_zero() {
        return Err(Error::Config("tcp_idle_timeout cannot be zero".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NfsdConfig::default();
        assert_eq!(config.export_alias, "/");
        assert_eq!(config.nfs_port, 2049);
        assert_eq!(config.portmap_port, 111);
        assert_eq!(config.default_user, "me");
        assert_eq!(config.boot.gateway, SLIRP_GATEWAY_IP);
        assert!(!config.write_protect);
    }

    #[test]
    fn test_builder() {
        let config = NfsdConfig::new()
            .export_root("/srv/guest")
            .export_alias("/netboot")
            .ephemeral_ports()
            .default_owner(501, 20)
            .write_protect(true);
        assert_eq!(config.export_root, PathBuf::from("/srv/guest"));
        assert_eq!(config.port_for(nfs2::NFS_PROGRAM), 0);
        assert_eq!(config.default_uid, Some(501));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nfsd.yaml");
        fs::write(
            &path,
            "export_root: /srv/guest\nexport_alias: /netboot\ntcp_idle_timeout: 5m\nboot:\n  client_name: cube\n",
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.export_alias, "/netboot");
        assert_eq!(config.tcp_idle_timeout, Duration::from_secs(300));
        assert_eq!(config.boot.client_name, "cube");
        assert_eq!(config.boot.domain, "local");
        assert_eq!(config.nfs_port, 2049);
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nfsd.json");
        fs::write(
            &path,
            r#"{"export_root": "/srv/guest", "write_protect": true, "nfs_port": 0}"#,
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert!(config.write_protect);
        assert_eq!(config.nfs_port, 0);
    }

    #[test]
    fn test_validation_errors() {
        assert!(NfsdConfig::default().validate().is_err());
        let relative = NfsdConfig::new().export_root("/x").export_alias("netboot");
        assert!(matches!(relative.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_read_config_leaves_validation_to_caller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nfsd.yaml");
        fs::write(&path, "write_protect: true\nexport_alias: /netboot\n").unwrap();

        assert!(matches!(load_config(&path), Err(Error::Config(_))));
        let config = read_config(&path).unwrap().export_root("/srv/guest");
        assert!(config.write_protect);
        assert_eq!(config.export_alias, "/netboot");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_duration_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nfsd.yaml");
        fs::write(&path, "export_root: /x\ntcp_idle_timeout: soon\n").unwrap();
        assert!(matches!(load_config(&path), Err(Error::Config(_))));
    }
}
