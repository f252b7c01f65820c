//! UDP and TCP transport for the RPC programs.
//!
//! Each program gets one UDP socket and one TCP listener. Requests are
//! decoded and answered on the blocking pool; the async tasks only move
//! bytes.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nfsd_xdr::rpc::{decode_fragment_header, encode_record, RecordAssembler};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use super::bootparam::{BootparamProgram, BOOTPARAM_PROGRAM};
use super::context::ServerContext;
use super::mount::{MountProgram, MOUNT_PROGRAM};
use super::nfs2::{NfsProgram, NFS_PROGRAM};
use super::portmap::{Mapping, PortmapProgram, IPPROTO_TCP, IPPROTO_UDP, PMAP_PROGRAM};
use super::rpc::{RpcDispatcher, RpcProgram};
use crate::config::NfsdConfig;
use crate::error::{Error, Result};

/// Largest TCP record accepted from a client.
const MAX_RECORD_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    /// Port mapper protocol number.
    pub fn ipproto(self) -> u32 {
        match self {
            Protocol::Udp => IPPROTO_UDP,
            Protocol::Tcp => IPPROTO_TCP,
        }
    }
}

/// A bound socket pair for one program.
#[derive(Debug, Clone, Copy)]
struct Binding {
    program: u32,
    udp_port: u16,
    tcp_port: u16,
}

/// Running server. Dropping it stops all I/O tasks.
pub struct NfsServer {
    ctx: Arc<ServerContext>,
    bindings: Vec<Binding>,
    tasks: Vec<JoinHandle<()>>,
}

impl NfsServer {
    /// Open the export, bind every program and start serving.
    pub async fn start(config: NfsdConfig) -> Result<Self> {
        config.validate()?;
        let ctx = Arc::new(ServerContext::new(&config)?);

        let programs: Vec<Arc<dyn RpcProgram>> = vec![
            Arc::new(PortmapProgram::new(Arc::clone(&ctx))),
            Arc::new(NfsProgram::new(Arc::clone(&ctx))),
            Arc::new(MountProgram::new(Arc::clone(&ctx))),
            Arc::new(BootparamProgram::new(Arc::clone(&ctx))),
        ];
        let dispatcher = Arc::new(RpcDispatcher::new(programs.iter().cloned()));

        let mut server = Self {
            ctx: Arc::clone(&ctx),
            bindings: Vec::new(),
            tasks: Vec::new(),
        };

        for program in &programs {
            let (udp, tcp) = bind_pair(
                config.bind_addr,
                config.port_for(program.program()),
                program.name(),
            )
            .await?;
            let binding = Binding {
                program: program.program(),
                udp_port: udp.local_addr()?.port(),
                tcp_port: tcp.local_addr()?.port(),
            };
            for version in program.versions() {
                for (protocol, port) in [
                    (Protocol::Udp, binding.udp_port),
                    (Protocol::Tcp, binding.tcp_port),
                ] {
                    ctx.ports().set(Mapping {
                        program: binding.program,
                        version,
                        protocol: protocol.ipproto(),
                        port: port as u32,
                    });
                }
            }
            info!(
                "{}: listening on {} udp/{} tcp/{}",
                program.name(),
                config.bind_addr,
                binding.udp_port,
                binding.tcp_port
            );

            server.tasks.push(tokio::spawn(serve_udp(
                udp,
                Arc::clone(&dispatcher),
                config.udp_buffer_size,
            )));
            server.tasks.push(tokio::spawn(serve_tcp(
                tcp,
                Arc::clone(&dispatcher),
                config.tcp_idle_timeout,
            )));
            server.bindings.push(binding);
        }

        info!(
            "nfsd: exporting {} as {}{}",
            config.export_root.display(),
            ctx.alias(),
            if config.write_protect {
                " (write protected)"
            } else {
                ""
            }
        );
        Ok(server)
    }

    /// Port a program is served on, if it is served.
    pub fn local_port(&self, program: u32, protocol: Protocol) -> Option<u16> {
        self.bindings
            .iter()
            .find(|b| b.program == program)
            .map(|b| match protocol {
                Protocol::Udp => b.udp_port,
                Protocol::Tcp => b.tcp_port,
            })
    }

    pub fn nfs_port(&self, protocol: Protocol) -> Option<u16> {
        self.local_port(NFS_PROGRAM, protocol)
    }

    pub fn mount_port(&self, protocol: Protocol) -> Option<u16> {
        self.local_port(MOUNT_PROGRAM, protocol)
    }

    pub fn bootparam_port(&self, protocol: Protocol) -> Option<u16> {
        self.local_port(BOOTPARAM_PROGRAM, protocol)
    }

    pub fn portmap_port(&self, protocol: Protocol) -> Option<u16> {
        self.local_port(PMAP_PROGRAM, protocol)
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Export a different host directory under the same alias.
    pub fn reexport(&self, root: &Path) -> Result<()> {
        self.ctx.reexport(root)
    }

    /// Stop serving: listeners, open TCP connections and pending UDP
    /// replies are all cancelled. Requests already on the blocking pool run
    /// to completion but their replies are not sent.
    pub fn shutdown(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("nfsd: stopped");
    }
}

impl Drop for NfsServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bind UDP on `port` (0 for any), then TCP on the port UDP got.
async fn bind_pair(
    addr: IpAddr,
    port: u16,
    service: &'static str,
) -> Result<(UdpSocket, TcpListener)> {
    let bind_err = |source: io::Error| Error::Bind { service, source };
    let udp = UdpSocket::bind(SocketAddr::new(addr, port))
        .await
        .map_err(bind_err)?;
    let port = udp.local_addr().map_err(bind_err)?.port();
    let tcp = TcpListener::bind(SocketAddr::new(addr, port))
        .await
        .map_err(bind_err)?;
    Ok((udp, tcp))
}

/// Receive loop. Per-datagram tasks live in a [`JoinSet`] owned by this
/// future, so aborting the loop cancels replies still in flight.
async fn serve_udp(socket: UdpSocket, dispatcher: Arc<RpcDispatcher>, buffer_size: usize) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; buffer_size];
    let mut requests = JoinSet::new();
    loop {
        let (n, peer) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!("rpc: udp receive failed: {}", e);
                    continue;
                }
            },
            Some(_) = requests.join_next(), if !requests.is_empty() => continue,
        };
        let request = buf[..n].to_vec();
        let dispatcher = Arc::clone(&dispatcher);
        let socket = Arc::clone(&socket);
        requests.spawn(async move {
            let reply =
                match tokio::task::spawn_blocking(move || dispatcher.handle(&request, peer)).await
                {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!("rpc: handler for {} failed: {}", peer, e);
                        return;
                    }
                };
            if let Some(reply) = reply {
                if let Err(e) = socket.send_to(&reply, peer).await {
                    warn!("rpc: udp send to {} failed: {}", peer, e);
                }
            }
        });
    }
}

/// Accept loop. Connections live in a [`JoinSet`] owned by this future, so
/// aborting the loop closes every open connection.
async fn serve_tcp(listener: TcpListener, dispatcher: Arc<RpcDispatcher>, idle: Duration) {
    let mut connections = JoinSet::new();
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("rpc: tcp accept failed: {}", e);
                    continue;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
        };
        debug!("rpc: tcp connection from {}", peer);
        let dispatcher = Arc::clone(&dispatcher);
        connections.spawn(async move {
            match handle_connection(stream, peer, dispatcher, idle).await {
                Ok(()) => debug!("rpc: tcp connection from {} closed", peer),
                Err(e) => debug!("rpc: tcp connection from {} dropped: {}", peer, e),
            }
        });
    }
}

/// Read one record-marked request at a time and answer it before reading
/// the next, so replies leave in request order.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<RpcDispatcher>,
    idle: Duration,
) -> io::Result<()> {
    let mut assembler = RecordAssembler::new(MAX_RECORD_SIZE);
    loop {
        let mut header = [0u8; 4];
        match tokio::time::timeout(idle, stream.read_exact(&mut header)).await {
            Err(_) => {
                debug!("rpc: tcp connection from {} idle, closing", peer);
                return Ok(());
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(_)) => {}
        }
        let (last, len) = decode_fragment_header(header);
        assembler
            .check_fragment(len)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut fragment = vec![0u8; len];
        stream.read_exact(&mut fragment).await?;
        let Some(request) = assembler
            .push(last, &fragment)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        else {
            continue;
        };

        trace!("rpc: tcp record of {} bytes from {}", request.len(), peer);
        let dispatcher = Arc::clone(&dispatcher);
        let reply = tokio::task::spawn_blocking(move || dispatcher.handle(&request, peer))
            .await
            .map_err(io::Error::other)?;
        if let Some(reply) = reply {
            stream.write_all(&encode_record(&reply)).await?;
        }
    }
}
