//! guest-nfsd: Host Directory Export for Emulated Guests
//!
//! An embedded NFS version 2 server that lets an emulated machine mount a
//! directory of the host as its disk. The guest expects BSD semantics the
//! host filesystem cannot store: device files, foreign owners, permission
//! bits the server itself must not lose. Those live in an attribute overlay
//! kept in an extended attribute on each host file.
//!
//! # Key Features
//!
//! - **Path Virtualization**: Guest paths are canonicalized and confined to the export
//! - **Attribute Overlay**: Device numbers, owners and mode bits survive on any host filesystem
//! - **Stable Handles**: A handle keeps resolving after its file is renamed
//! - **Write Protection**: Optional in-memory shadow writes that never reach the host
//! - **Boot Services**: Port mapper, mount and boot-parameter programs for diskless boot
//!
//! # Example
//!
//! ```no_run
//! use guest_nfsd::{NfsdConfig, NfsServer, Protocol};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NfsdConfig::new()
//!         .export_root("/srv/guest-root")
//!         .export_alias("/")
//!         .ephemeral_ports();
//!
//!     let mut server = NfsServer::start(config).await?;
//!     println!("nfs on udp/{:?}", server.nfs_port(Protocol::Udp));
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod nfsd;
pub mod vfs;

// Re-exports for convenience
pub use config::{load_config, read_config, BootConfig, NfsdConfig};
pub use error::{Error, Result};
pub use nfsd::{NfsServer, Protocol, ServerContext};
pub use vfs::{FileAttrs, VfsPath, VirtualFs};
