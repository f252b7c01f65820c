use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use guest_nfsd::{read_config, NfsServer, NfsdConfig};

/// Export a host directory to an emulated guest over NFS version 2.
#[derive(Parser, Debug)]
#[command(name = "guest-nfsd", version)]
#[command(about = "NFSv2 server for emulated guests")]
struct Args {
    /// Host directory to export
    #[arg(short, long)]
    export: Option<PathBuf>,

    /// Guest-visible path of the export
    #[arg(short, long)]
    alias: Option<String>,

    /// YAML or JSON configuration file; command-line values override it
    #[arg(short, long, env = "GUEST_NFSD_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind the services to
    #[arg(long)]
    bind: Option<IpAddr>,

    /// NFS port (0 for any)
    #[arg(long)]
    nfs_port: Option<u16>,

    /// Port mapper port (0 for any)
    #[arg(long)]
    portmap_port: Option<u16>,

    /// Keep guest writes in memory instead of writing to the host
    #[arg(long)]
    write_protect: bool,

    /// Owner uid for new files
    #[arg(long, requires = "gid")]
    uid: Option<u32>,

    /// Owner gid for new files
    #[arg(long, requires = "uid")]
    gid: Option<u32>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> guest_nfsd::Result<NfsdConfig> {
        let mut config = match &self.config {
            Some(path) => read_config(path)?,
            None => NfsdConfig::new(),
        };
        if let Some(root) = self.export {
            config = config.export_root(root);
        }
        if let Some(alias) = self.alias {
            config = config.export_alias(alias);
        }
        if let Some(addr) = self.bind {
            config = config.bind_addr(addr);
        }
        if let Some(port) = self.nfs_port {
            config = config.nfs_port(port);
        }
        if let Some(port) = self.portmap_port {
            config = config.portmap_port(port);
        }
        if self.write_protect {
            config = config.write_protect(true);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            config = config.default_owner(uid, gid);
        }
        if let Some(path) = self.log_file {
            config = config.log_file(path);
        }
        config.validate()?;
        Ok(config)
    }
}

/// Install the global subscriber. The returned guard flushes the log file
/// and must live as long as logging is wanted.
fn init_tracing(log_file: Option<&PathBuf>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("guest-nfsd.log"));
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Args::parse().into_config()?;
    let _guard = init_tracing(config.log_file.as_ref());

    let mut server = NfsServer::start(config).await?;
    tokio::signal::ctrl_c().await?;
    tracing::info!("nfsd: interrupted, shutting down");
    server.shutdown();
    Ok(())
}
