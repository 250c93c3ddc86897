//! Server process: the publicly reachable end of the tunnel.
//!
//! Two listeners share one registry:
//!
//! 1. The **framed listener** accepts connections from proxy clients —
//!    control channels (after AUTH) and data channels (after a CONNECT
//!    ack).
//! 2. The **SOCKS5 listener** accepts external users, drives the SOCKS5
//!    state machine, and pairs each flow with a data channel.

mod config;
mod control;
pub mod registry;
mod user;

pub use config::ServerConfig;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket};

use crate::error::{Error, Result};
use crate::server::registry::Registry;
use crate::SOCKET_BUFFER_SIZE;

/// Listen backlog for both listeners.
const LISTEN_BACKLOG: u32 = 1024;

/// Main server instance with both listeners bound.
pub struct Server {
    config: Arc<ServerConfig>,
    registry: Arc<Registry>,
    framed_listener: TcpListener,
    socks_listener: TcpListener,
}

impl Server {
    /// Validate the configuration and bind both listeners.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let framed_listener = listen(&config.server_bind, config.server_port)?;
        let socks_listener = listen(&config.socks_bind, config.socks_port)?;
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(Registry::new()),
            framed_listener,
            socks_listener,
        })
    }

    /// Address the framed listener actually bound.
    pub fn framed_addr(&self) -> Result<SocketAddr> {
        Ok(self.framed_listener.local_addr()?)
    }

    /// Address the SOCKS5 listener actually bound.
    pub fn socks_addr(&self) -> Result<SocketAddr> {
        Ok(self.socks_listener.local_addr()?)
    }

    /// Run both accept loops. Never returns under normal operation; the
    /// binaries race this against the shutdown signal.
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            registry,
            framed_listener,
            socks_listener,
        } = self;

        tracing::info!(
            "proxy server listening on {}",
            framed_listener.local_addr()?
        );
        tracing::info!("socks5 listening on {}", socks_listener.local_addr()?);

        let framed_loop = {
            let registry = Arc::clone(&registry);
            async move {
                loop {
                    match framed_listener.accept().await {
                        Ok((stream, peer)) => {
                            tracing::debug!("client connection from {}", peer);
                            tokio::spawn(control::run_framed_conn(
                                stream,
                                Arc::clone(&registry),
                            ));
                        }
                        Err(e) => {
                            tracing::warn!("accept error on framed listener: {}", e);
                        }
                    }
                }
            }
        };

        let socks_loop = async move {
            loop {
                match socks_listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!("socks5 connection from {}", peer);
                        tokio::spawn(user::run_user_conn(
                            stream,
                            Arc::clone(&registry),
                            Arc::clone(&config),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!("accept error on socks5 listener: {}", e);
                    }
                }
            }
        };

        tokio::join!(framed_loop, socks_loop);
        Ok(())
    }
}

/// Bind a listener with the socket options both listeners share.
fn listen(bind: &str, port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .map_err(|e| Error::config(format!("invalid bind address {bind}:{port}: {e}")))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
    socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_BACKLOG)?)
}
