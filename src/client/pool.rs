//! Data-channel pool.
//!
//! Every active user flow needs its own framed connection to the server;
//! the pool keeps finished ones around so the next flow skips the dial.
//! Bounded at 100 idle channels — a return beyond that closes the channel
//! instead. A keepalive sweep feeds the server's 60 s read timer so idle
//! pool members survive, and discards members whose socket already died
//! (the server closes a data channel after handling its DISCONNECT, so a
//! channel recycled after real-server EOF never comes back alive).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::Result;
use crate::idle::WRITE_IDLE_TIME;
use crate::protocol::{Frame, FrameReader, FrameWriter};
use crate::MAX_DATA_FRAME;

/// Maximum number of idle data channels kept for reuse.
pub const MAX_POOL_SIZE: usize = 100;

/// One framed connection to the server. Exclusively owned by a flow while
/// borrowed; both halves travel together so returning a channel to the
/// pool is just moving the struct back.
#[derive(Debug)]
pub struct DataChannel {
    pub(crate) reader: FrameReader<OwnedReadHalf>,
    pub(crate) writer: FrameWriter<OwnedWriteHalf>,
    local_addr: SocketAddr,
}

impl DataChannel {
    /// Dial a fresh framed connection to the server.
    pub async fn dial(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let (rd, wr) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(rd, MAX_DATA_FRAME),
            writer: FrameWriter::new(wr),
            local_addr,
        })
    }

    /// Local address of the underlying socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Discard whatever the server sent while this channel sat idle
    /// (heartbeat echoes, stray frames for flows already gone) and report
    /// whether the connection is still usable.
    fn drain_idle(&mut self) -> bool {
        self.reader.drain_idle()
    }
}

/// FIFO pool of idle data channels, safe under concurrent borrow/return.
#[derive(Debug)]
pub struct ChannelPool {
    server_host: String,
    server_port: u16,
    idle: Mutex<VecDeque<DataChannel>>,
}

impl ChannelPool {
    /// Create an empty pool dialing `host:port` on demand.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            server_host: host.into(),
            server_port: port,
            idle: Mutex::new(VecDeque::new()),
        }
    }

    /// Borrow a channel: the pool head if one is alive, a fresh dial
    /// otherwise.
    pub async fn borrow(&self) -> Result<DataChannel> {
        loop {
            let popped = self.idle.lock().pop_front();
            match popped {
                Some(mut channel) => {
                    if channel.drain_idle() {
                        tracing::debug!("borrowed pooled channel {}", channel.local_addr());
                        return Ok(channel);
                    }
                    tracing::debug!("discarding dead pooled channel {}", channel.local_addr());
                }
                None => break,
            }
        }
        DataChannel::dial(&self.server_host, self.server_port).await
    }

    /// Return a channel for reuse. At capacity the channel is closed
    /// instead, keeping the pool at or below 100.
    pub fn put_back(&self, channel: DataChannel) {
        let mut idle = self.idle.lock();
        if idle.len() >= MAX_POOL_SIZE {
            tracing::debug!("pool full, closing channel {}", channel.local_addr());
            return;
        }
        idle.push_back(channel);
        tracing::debug!("returned channel to pool, size {}", idle.len());
    }

    /// Drop every idle channel. Called when the control channel is lost —
    /// the server will observe the loss, so nothing pooled stays valid.
    pub fn clear(&self) {
        self.idle.lock().clear();
    }

    /// Number of idle channels.
    pub fn len(&self) -> usize {
        self.idle.lock().len()
    }

    /// True when no idle channel is pooled.
    pub fn is_empty(&self) -> bool {
        self.idle.lock().is_empty()
    }

    /// Keepalive loop: every write-idle interval, drain and heartbeat every
    /// idle channel, dropping the dead ones.
    pub async fn run_keepalive(self: Arc<Self>) {
        let mut interval = tokio::time::interval(WRITE_IDLE_TIME);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // first tick completes immediately
        loop {
            interval.tick().await;
            self.sweep().await;
        }
    }

    async fn sweep(&self) {
        let swept: Vec<DataChannel> = {
            let mut idle = self.idle.lock();
            idle.drain(..).collect()
        };
        if swept.is_empty() {
            return;
        }

        let mut kept = Vec::with_capacity(swept.len());
        for mut channel in swept {
            if !channel.drain_idle() {
                tracing::debug!("sweep dropping dead channel {}", channel.local_addr());
                continue;
            }
            if channel.writer.write_frame(&Frame::heartbeat(0)).await.is_err() {
                tracing::debug!("sweep heartbeat failed for {}", channel.local_addr());
                continue;
            }
            kept.push(channel);
        }

        let mut idle = self.idle.lock();
        // Swept channels are the oldest; they go back to the front so the
        // FIFO order survives returns that raced the sweep.
        for channel in kept.into_iter().rev() {
            if idle.len() >= MAX_POOL_SIZE {
                break;
            }
            idle.push_front(channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Accept loop that parks accepted sockets with the test.
    async fn accepting_listener() -> (SocketAddr, mpsc::UnboundedReceiver<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if tx.send(stream).is_err() {
                    break;
                }
            }
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn test_borrow_dials_when_empty() {
        let (addr, mut accepted) = accepting_listener().await;
        let pool = ChannelPool::new(addr.ip().to_string(), addr.port());

        let channel = pool.borrow().await.unwrap();
        assert!(accepted.recv().await.is_some());
        assert!(pool.is_empty());
        drop(channel);
    }

    #[tokio::test]
    async fn test_fifo_reuse() {
        let (addr, _accepted) = accepting_listener().await;
        let pool = ChannelPool::new(addr.ip().to_string(), addr.port());

        let first = pool.borrow().await.unwrap();
        let second = pool.borrow().await.unwrap();
        let first_addr = first.local_addr();
        let second_addr = second.local_addr();

        pool.put_back(first);
        pool.put_back(second);
        assert_eq!(pool.len(), 2);

        assert_eq!(pool.borrow().await.unwrap().local_addr(), first_addr);
        assert_eq!(pool.borrow().await.unwrap().local_addr(), second_addr);
    }

    #[tokio::test]
    async fn test_return_beyond_capacity_closes_channel() {
        let (addr, mut accepted) = accepting_listener().await;
        let pool = ChannelPool::new(addr.ip().to_string(), addr.port());

        let mut channels = Vec::new();
        for _ in 0..=MAX_POOL_SIZE {
            channels.push(pool.borrow().await.unwrap());
        }
        let mut server_sides = Vec::new();
        for _ in 0..=MAX_POOL_SIZE {
            server_sides.push(accepted.recv().await.unwrap());
        }

        for channel in channels.drain(..) {
            pool.put_back(channel);
        }
        assert_eq!(pool.len(), MAX_POOL_SIZE);

        // The last return was refused and its socket closed: exactly one
        // server side sees EOF.
        let mut reads = tokio::task::JoinSet::new();
        for mut stream in server_sides {
            reads.spawn(async move {
                let mut byte = [0u8; 1];
                matches!(
                    tokio::time::timeout(
                        std::time::Duration::from_millis(500),
                        stream.read(&mut byte),
                    )
                    .await,
                    Ok(Ok(0))
                )
            });
        }
        let mut eof = 0;
        while let Some(saw_eof) = reads.join_next().await {
            if saw_eof.unwrap() {
                eof += 1;
            }
        }
        assert_eq!(eof, 1);
    }

    #[tokio::test]
    async fn test_borrow_discards_dead_channel() {
        let (addr, mut accepted) = accepting_listener().await;
        let pool = ChannelPool::new(addr.ip().to_string(), addr.port());

        let channel = pool.borrow().await.unwrap();
        let stale_addr = channel.local_addr();
        let server_side = accepted.recv().await.unwrap();
        pool.put_back(channel);

        // Server closes the pooled channel (e.g. after a DISCONNECT).
        drop(server_side);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let fresh = pool.borrow().await.unwrap();
        assert_ne!(fresh.local_addr(), stale_addr);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let (addr, _accepted) = accepting_listener().await;
        let pool = ChannelPool::new(addr.ip().to_string(), addr.port());

        let channel = pool.borrow().await.unwrap();
        pool.put_back(channel);
        assert_eq!(pool.len(), 1);

        pool.clear();
        assert!(pool.is_empty());
    }
}
