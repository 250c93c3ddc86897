//! Per-channel idle detection.
//!
//! Framed channels are watched on both directions: 60 s without inbound
//! bytes means the peer is gone and the channel is closed; 40 s without
//! outbound bytes means the client side owes the server a heartbeat. The
//! 20 s gap guarantees at least one heartbeat attempt lands before the
//! server's read timer gives up. The server never initiates heartbeats, so
//! its channels run with the read timer only.

use std::time::Duration;

use tokio::time::Instant;

/// Close a channel after this long without inbound bytes.
pub const READ_IDLE_TIME: Duration = Duration::from_secs(60);

/// Client side sends a heartbeat after this long without outbound bytes.
pub const WRITE_IDLE_TIME: Duration = Duration::from_secs(40);

/// Which direction of a channel went idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// Nothing read within the read-idle window.
    ReadIdle,
    /// Nothing written within the write-idle window.
    WriteIdle,
}

/// Tracks the last read/write instants of one channel and resolves the
/// next idle event. Intended as a `select!` branch alongside the channel's
/// I/O futures.
#[derive(Debug)]
pub struct IdleTimer {
    read_idle: Duration,
    write_idle: Option<Duration>,
    last_read: Instant,
    last_write: Instant,
}

impl IdleTimer {
    /// Create a timer. `write_idle` is `None` for channels that never
    /// initiate heartbeats (the server side).
    pub fn new(read_idle: Duration, write_idle: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            read_idle,
            write_idle,
            last_read: now,
            last_write: now,
        }
    }

    /// Record inbound activity.
    pub fn touch_read(&mut self) {
        self.last_read = Instant::now();
    }

    /// Record outbound activity.
    pub fn touch_write(&mut self) {
        self.last_write = Instant::now();
    }

    /// Sleep until the next idle deadline and report which one fired.
    /// Write-idle wins ties so a heartbeat still gets its chance.
    pub async fn idle(&self) -> IdleEvent {
        let read_at = self.last_read + self.read_idle;
        let (deadline, event) = match self.write_idle {
            Some(write_idle) => {
                let write_at = self.last_write + write_idle;
                if write_at <= read_at {
                    (write_at, IdleEvent::WriteIdle)
                } else {
                    (read_at, IdleEvent::ReadIdle)
                }
            }
            None => (read_at, IdleEvent::ReadIdle),
        };
        tokio::time::sleep_until(deadline).await;
        event
    }
}
