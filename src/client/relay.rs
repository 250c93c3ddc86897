//! Per-flow relay on the client side.
//!
//! One task per CONNECT from the server: dial the requested target inside
//! the private network, borrow a data channel, announce the binding with a
//! CONNECT ack, then shuttle bytes until either leg ends. Teardown
//! converges without loops — each exit path either *sends* one DISCONNECT
//! or *reacts* to one, never both.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::client::pool::{ChannelPool, DataChannel};
use crate::client::FlowTable;
use crate::idle::{IdleEvent, IdleTimer, READ_IDLE_TIME, WRITE_IDLE_TIME};
use crate::protocol::{Frame, FrameType};
use crate::TRANSFER_CHUNK;

/// How the relay loop ended, deciding the data channel's fate.
enum Outcome {
    /// Orderly teardown: the channel is reusable.
    Recycle,
    /// The channel itself failed or went idle: close it.
    Discard,
}

/// Bring up and run one user flow.
pub(crate) async fn run_flow(
    user_id: String,
    host: String,
    port: u16,
    client_key: String,
    control: mpsc::Sender<Frame>,
    pool: Arc<ChannelPool>,
    flows: Arc<FlowTable>,
) {
    let real = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("dial {}:{} for user {} failed: {}", host, port, user_id, e);
            let _ = control.send(Frame::disconnect(&user_id)).await;
            return;
        }
    };
    let _ = real.set_nodelay(true);

    let mut channel = match pool.borrow().await {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!("no data channel for user {}: {}", user_id, e);
            let _ = control.send(Frame::disconnect(&user_id)).await;
            return;
        }
    };

    if channel
        .writer
        .write_frame(&Frame::connect(format!("{user_id}@{client_key}")))
        .await
        .is_err()
    {
        tracing::warn!("connect ack for user {} failed", user_id);
        let _ = control.send(Frame::disconnect(&user_id)).await;
        return;
    }

    tracing::debug!("flow {} up: {}:{} via {}", user_id, host, port, channel.local_addr());

    let mut close_rx = flows.insert(&user_id);
    let outcome = relay(&user_id, real, &mut channel, &mut close_rx).await;
    flows.remove(&user_id);

    match outcome {
        Outcome::Recycle => pool.put_back(channel),
        Outcome::Discard => drop(channel),
    }
}

async fn relay(
    user_id: &str,
    real: TcpStream,
    channel: &mut DataChannel,
    close_rx: &mut mpsc::Receiver<()>,
) -> Outcome {
    let (mut real_rd, mut real_wr) = real.into_split();
    let mut buf = BytesMut::with_capacity(TRANSFER_CHUNK);
    let mut idle = IdleTimer::new(READ_IDLE_TIME, Some(WRITE_IDLE_TIME));

    loop {
        buf.reserve(TRANSFER_CHUNK);
        tokio::select! {
            res = real_rd.read_buf(&mut buf) => match res {
                Ok(0) | Err(_) => {
                    // Real server done: one DISCONNECT, then recycle. The
                    // server tears the user channel down from there.
                    let _ = channel.writer.write_frame(&Frame::disconnect(user_id)).await;
                    return Outcome::Recycle;
                }
                Ok(_) => {
                    let data = buf.split().freeze();
                    if channel
                        .writer
                        .write_frame(&Frame::transfer(user_id, data))
                        .await
                        .is_err()
                    {
                        return Outcome::Discard;
                    }
                    idle.touch_write();
                }
            },
            res = channel.reader.read_frame() => {
                idle.touch_read();
                match res {
                    Ok(Some(frame)) => match frame.frame_type {
                        FrameType::Transfer => {
                            if real_wr.write_all(&frame.data).await.is_err() {
                                let _ = channel
                                    .writer
                                    .write_frame(&Frame::disconnect(user_id))
                                    .await;
                                return Outcome::Recycle;
                            }
                        }
                        FrameType::Disconnect => {
                            // User side hung up; close our leg quietly.
                            let _ = real_wr.shutdown().await;
                            return Outcome::Recycle;
                        }
                        // Stale keepalive echoes from the pooled phase.
                        FrameType::Heartbeat => {}
                        other => {
                            tracing::debug!("unexpected {:?} on data channel", other);
                        }
                    },
                    Ok(None) | Err(_) => {
                        tracing::debug!("data channel for user {} lost", user_id);
                        return Outcome::Discard;
                    }
                }
            },
            _ = close_rx.recv() => {
                // Control-side teardown: DISCONNECT arrived on the control
                // channel, or the control channel itself is gone.
                let _ = real_wr.shutdown().await;
                return Outcome::Recycle;
            }
            event = idle.idle() => match event {
                IdleEvent::WriteIdle => {
                    if channel.writer.write_frame(&Frame::heartbeat(0)).await.is_err() {
                        return Outcome::Discard;
                    }
                    idle.touch_write();
                }
                IdleEvent::ReadIdle => {
                    tracing::warn!("data channel for user {} read timeout", user_id);
                    return Outcome::Discard;
                }
            }
        }
    }
}
