//! Client process: the private-network end of the tunnel.
//!
//! Maintains one persistent control channel to the server (AUTH on open,
//! exponential-backoff reconnect), spawns a flow task per CONNECT request,
//! and keeps the data-channel pool warm. While the control channel is
//! down every flow and pooled channel is torn down — the server observes
//! the loss and does the same on its side.

mod config;
pub mod pool;
mod relay;

pub use config::ClientConfig;
pub use pool::{ChannelPool, DataChannel, MAX_POOL_SIZE};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::id;
use crate::idle::{IdleEvent, IdleTimer, READ_IDLE_TIME, WRITE_IDLE_TIME};
use crate::protocol::{Frame, FrameReader, FrameType, FrameWriter};
use crate::MAX_DATA_FRAME;

/// Depth of the control channel's outbound frame queue.
const FRAME_QUEUE: usize = 256;

/// Routing table `userId → flow`. Holding the sender end of a flow's close
/// signal, so removing an entry *is* the close signal.
#[derive(Debug, Default)]
pub(crate) struct FlowTable {
    flows: Mutex<HashMap<String, mpsc::Sender<()>>>,
}

impl FlowTable {
    /// Register a flow; the returned receiver fires when the entry goes.
    fn insert(&self, user_id: &str) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.flows.lock().insert(user_id.to_owned(), tx);
        rx
    }

    /// Remove a flow's entry. Dropping the sender wakes the flow task.
    fn remove(&self, user_id: &str) {
        self.flows.lock().remove(user_id);
    }

    /// Close one flow (DISCONNECT from the server).
    fn close(&self, user_id: &str) -> bool {
        self.flows.lock().remove(user_id).is_some()
    }

    /// Close every flow (control channel lost).
    fn close_all(&self) {
        let mut flows = self.flows.lock();
        if !flows.is_empty() {
            tracing::warn!("control channel lost, closing {} flows", flows.len());
        }
        flows.clear();
    }
}

/// Exponential reconnect backoff: doubles from 2 s, clamps at 60 s, and
/// the attempt after hitting the cap starts over at 1 s. A successful
/// connect resets it outright.
#[derive(Debug)]
struct Backoff {
    delay: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(60);

    fn new() -> Self {
        Self {
            delay: Self::INITIAL,
        }
    }

    fn reset(&mut self) {
        self.delay = Self::INITIAL;
    }

    fn next_delay(&mut self) -> Duration {
        if self.delay >= Self::MAX {
            self.delay = Self::INITIAL;
        }
        self.delay = (self.delay * 2).min(Self::MAX);
        self.delay
    }
}

/// Main client instance.
pub struct Client {
    config: ClientConfig,
    client_key: String,
    pool: Arc<ChannelPool>,
    flows: Arc<FlowTable>,
}

impl Client {
    /// Create a client. A missing `client_key` in the configuration gets a
    /// generated `ZC-…` key for this process lifetime.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let client_key = config
            .client_key
            .clone()
            .unwrap_or_else(id::client_key);
        let pool = Arc::new(ChannelPool::new(
            config.server_host.clone(),
            config.server_port,
        ));
        Ok(Self {
            config,
            client_key,
            pool,
            flows: Arc::new(FlowTable::default()),
        })
    }

    /// The key this client registers under.
    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    /// Run the client: dial the control channel, serve it until it fails,
    /// tear down, back off, repeat. Never returns under normal operation.
    pub async fn run(&self) -> Result<()> {
        tokio::spawn(ChannelPool::run_keepalive(Arc::clone(&self.pool)));

        let mut backoff = Backoff::new();
        loop {
            match TcpStream::connect((self.config.server_host.as_str(), self.config.server_port))
                .await
            {
                Ok(stream) => {
                    backoff.reset();
                    tracing::info!(
                        "connected to {}:{} as {}",
                        self.config.server_host,
                        self.config.server_port,
                        self.client_key
                    );
                    if let Err(e) = self.serve_control(stream).await {
                        tracing::warn!("control channel failed: {}", e);
                    } else {
                        tracing::info!("control channel closed");
                    }
                    self.flows.close_all();
                    self.pool.clear();
                }
                Err(e) => {
                    tracing::warn!(
                        "connect to {}:{} failed: {}",
                        self.config.server_host,
                        self.config.server_port,
                        e
                    );
                }
            }

            let delay = backoff.next_delay();
            tracing::info!("reconnecting in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Serve one control-channel connection until it ends.
    async fn serve_control(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, MAX_DATA_FRAME);
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let writer = tokio::spawn(write_frames(write_half, frame_rx));

        let mut idle = IdleTimer::new(READ_IDLE_TIME, Some(WRITE_IDLE_TIME));

        // Announce ourselves before anything else moves.
        if frame_tx.send(Frame::auth(&self.client_key)).await.is_err() {
            return Ok(());
        }
        idle.touch_write();

        let result = loop {
            tokio::select! {
                res = reader.read_frame() => match res {
                    Ok(Some(frame)) => {
                        idle.touch_read();
                        self.dispatch(frame, &frame_tx);
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
                event = idle.idle() => match event {
                    IdleEvent::WriteIdle => {
                        if frame_tx.send(Frame::heartbeat(0)).await.is_err() {
                            break Ok(());
                        }
                        idle.touch_write();
                    }
                    IdleEvent::ReadIdle => {
                        tracing::warn!("control channel read timeout");
                        break Ok(());
                    }
                },
            }
        };

        drop(frame_tx);
        // Flow tasks may still hold queue senders; don't wait on them to
        // notice the teardown.
        writer.abort();
        result
    }

    /// Handle one frame from the server.
    fn dispatch(&self, frame: Frame, frame_tx: &mpsc::Sender<Frame>) {
        match frame.frame_type {
            FrameType::Connect => {
                let Some((user_id, host, port)) = parse_connect_uri(&frame.uri) else {
                    tracing::warn!("connect with malformed uri {:?}", frame.uri);
                    return;
                };
                tokio::spawn(relay::run_flow(
                    user_id,
                    host,
                    port,
                    self.client_key.clone(),
                    frame_tx.clone(),
                    Arc::clone(&self.pool),
                    Arc::clone(&self.flows),
                ));
            }
            FrameType::Disconnect => {
                if !self.flows.close(&frame.uri) {
                    tracing::debug!("disconnect for unknown flow {:?}", frame.uri);
                }
            }
            FrameType::Heartbeat => {
                tracing::trace!("heartbeat echo, serial {}", frame.serial);
            }
            other => {
                tracing::debug!("unexpected {:?} on control channel", other);
            }
        }
    }
}

/// Split a CONNECT uri `userId:host:port`. The userId ends at the first
/// colon and the port starts at the last, so bare IPv6 hosts survive.
fn parse_connect_uri(uri: &str) -> Option<(String, String, u16)> {
    let (user_id, rest) = uri.split_once(':')?;
    let (host, port) = rest.rsplit_once(':')?;
    if user_id.is_empty() || host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((user_id.to_owned(), host.to_owned(), port))
}

async fn write_frames(write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    let mut writer = FrameWriter::new(write_half);
    while let Some(frame) = rx.recv().await {
        match writer.write_frame(&frame).await {
            Ok(()) => {}
            // A single unroutable frame must not take the channel down.
            Err(Error::UriTooLong(len)) => {
                tracing::warn!("dropping frame with oversized uri ({} bytes)", len);
            }
            Err(e) => {
                tracing::debug!("frame write failed: {}", e);
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::new();
        let secs: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(secs, [2, 4, 8, 16, 32, 60, 2]);
    }

    #[test]
    fn test_backoff_reset_on_success() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_connect_uri() {
        assert_eq!(
            parse_connect_uri("u1:127.0.0.1:80"),
            Some(("u1".into(), "127.0.0.1".into(), 80))
        );
        assert_eq!(
            parse_connect_uri("u1:example.com:443"),
            Some(("u1".into(), "example.com".into(), 443))
        );
        // IPv6 hosts keep their inner colons.
        assert_eq!(
            parse_connect_uri("u1:2001:db8::1:443"),
            Some(("u1".into(), "2001:db8::1".into(), 443))
        );
        assert_eq!(parse_connect_uri("u1:80"), None);
        assert_eq!(parse_connect_uri("u1:host:notaport"), None);
        assert_eq!(parse_connect_uri(""), None);
    }

    #[test]
    fn test_generated_client_key() {
        let config = ClientConfig {
            server_host: "127.0.0.1".into(),
            server_port: 4900,
            client_key: None,
        };
        let client = Client::new(config).unwrap();
        assert!(client.client_key().starts_with(id::CLIENT_KEY_PREFIX));
    }
}
