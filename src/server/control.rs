//! Framed-connection handling on the server.
//!
//! Every connection accepted on the framed listener starts out unbound.
//! An AUTH frame turns it into the control channel for a client key; a
//! CONNECT ack from the client turns it into the data channel for one user
//! flow. The same demux loop serves both roles, mirroring the single wire
//! protocol.

use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::idle::{IdleTimer, READ_IDLE_TIME};
use crate::protocol::{Frame, FrameReader, FrameType, FrameWriter};
use crate::server::registry::{ControlHandle, Registry, UserEvent, UserHandle};
use crate::id::CLIENT_KEY_PREFIX;
use crate::MAX_CONTROL_FRAME;

/// Depth of the per-connection outbound frame queue. Bounded so a stalled
/// socket propagates backpressure to whoever is producing frames.
pub(crate) const FRAME_QUEUE: usize = 256;

/// What this framed connection currently is.
enum Role {
    /// Fresh connection, nothing negotiated yet.
    Unbound,
    /// Control channel for one authenticated client.
    Control(ControlHandle),
    /// Data channel bound to one user flow.
    Data {
        control: ControlHandle,
        user_id: String,
        user: UserHandle,
    },
}

/// Run one framed connection to completion.
pub(crate) async fn run_framed_conn(stream: TcpStream, registry: Arc<Registry>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into());
    let _ = stream.set_nodelay(true);

    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, MAX_CONTROL_FRAME);
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
    let writer = tokio::spawn(write_frames(write_half, frame_rx));

    let mut role = Role::Unbound;
    let mut idle = IdleTimer::new(READ_IDLE_TIME, None);

    loop {
        tokio::select! {
            res = reader.read_frame() => match res {
                Ok(Some(frame)) => {
                    idle.touch_read();
                    if handle_frame(frame, &mut role, &frame_tx, &registry).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!("framed connection {} closed by peer", peer);
                    break;
                }
                Err(e) => {
                    tracing::warn!("framed connection {} failed: {}", peer, e);
                    break;
                }
            },
            _ = idle.idle() => {
                tracing::warn!("framed connection {} read timeout", peer);
                break;
            }
        }
    }

    match role {
        Role::Unbound => {}
        Role::Control(control) => {
            tracing::info!(
                "control channel for {} closed, clearing {} user channels",
                control.client_key(),
                control.user_count()
            );
            registry.unregister(&control);
            for user in control.drain_users() {
                close_user(user);
            }
        }
        Role::Data {
            control, user_id, ..
        } => {
            // A dead data channel is indistinguishable from a DISCONNECT
            // for its flow.
            if let Some(user) = control.remove_user(&user_id) {
                close_user(user);
            }
        }
    }

    drop(frame_tx);
    // Whatever is still queued was addressed to a dying socket.
    writer.abort();
}

/// Close a user channel without blocking on its event queue. A full queue
/// means the user is wedged in backpressure; dropping the handle still
/// ends its event stream (buffered payload first, then channel closure),
/// so the close converges either way.
fn close_user(user: UserHandle) {
    let _ = user.events.try_send(UserEvent::Close);
}

/// Dispatch one inbound frame. `Err` closes the connection.
async fn handle_frame(
    frame: Frame,
    role: &mut Role,
    frame_tx: &mpsc::Sender<Frame>,
    registry: &Registry,
) -> Result<(), ()> {
    match frame.frame_type {
        FrameType::Heartbeat => {
            tracing::trace!("heartbeat, serial {}", frame.serial);
            let _ = frame_tx.send(Frame::heartbeat(frame.serial)).await;
            Ok(())
        }
        FrameType::Auth => handle_auth(frame, role, frame_tx, registry),
        FrameType::Connect => handle_connect(frame, role, frame_tx, registry).await,
        FrameType::Disconnect => handle_disconnect(frame, role),
        FrameType::Transfer => handle_transfer(frame, role).await,
    }
}

fn handle_auth(
    frame: Frame,
    role: &mut Role,
    frame_tx: &mpsc::Sender<Frame>,
    registry: &Registry,
) -> Result<(), ()> {
    if !matches!(role, Role::Unbound) {
        tracing::warn!("auth frame on an already-bound channel");
        return Err(());
    }
    let client_key = frame.uri;
    if !client_key.starts_with(CLIENT_KEY_PREFIX) {
        tracing::warn!("auth rejected, malformed client key {:?}", client_key);
        return Err(());
    }
    match registry.register(&client_key, frame_tx.clone()) {
        Some(handle) => {
            tracing::info!("control channel registered for {}", client_key);
            *role = Role::Control(handle);
            Ok(())
        }
        None => {
            tracing::warn!("auth rejected, control channel for {} already exists", client_key);
            Err(())
        }
    }
}

/// CONNECT ack from the client: `uri = "userId@clientKey"`. Binds this
/// connection as the data channel of that user flow and resumes the user
/// channel's reads. A pooled channel whose previous flow ended user-side
/// arrives here again with a fresh userId; the binding is simply replaced.
async fn handle_connect(
    frame: Frame,
    role: &mut Role,
    frame_tx: &mpsc::Sender<Frame>,
    registry: &Registry,
) -> Result<(), ()> {
    if matches!(role, Role::Control(_)) {
        tracing::warn!("connect ack on a control channel");
        return Err(());
    }
    let Some((user_id, client_key)) = frame.uri.split_once('@') else {
        tracing::warn!("connect ack with malformed uri {:?}", frame.uri);
        return Err(());
    };
    let Some(control) = registry.get(client_key) else {
        tracing::warn!("connect ack for unknown client key {}", client_key);
        return Err(());
    };
    let Some(user) = control.user(user_id) else {
        tracing::warn!("connect ack for unknown user {}", user_id);
        return Err(());
    };

    if user
        .events
        .send(UserEvent::Bind {
            frames: frame_tx.clone(),
        })
        .await
        .is_err()
    {
        tracing::warn!("connect ack for vanished user {}", user_id);
        return Err(());
    }

    tracing::debug!("data channel bound for user {} of {}", user_id, client_key);
    *role = Role::Data {
        control,
        user_id: user_id.to_owned(),
        user,
    };
    Ok(())
}

fn handle_disconnect(frame: Frame, role: &mut Role) -> Result<(), ()> {
    match role {
        Role::Control(control) => {
            // The client could not bring the flow up; drop the user.
            if let Some(user) = control.remove_user(&frame.uri) {
                close_user(user);
            }
            Ok(())
        }
        Role::Data {
            control, user_id, ..
        } => {
            tracing::debug!("disconnect for user {}", user_id);
            if let Some(user) = control.remove_user(user_id) {
                close_user(user);
            }
            // Bindings are cleared and the data channel goes down with the
            // flow it served.
            *role = Role::Unbound;
            Err(())
        }
        Role::Unbound => Ok(()),
    }
}

async fn handle_transfer(frame: Frame, role: &mut Role) -> Result<(), ()> {
    match role {
        Role::Data { user, .. } => {
            // The user may be mid-teardown; frames for it are dropped the
            // same way a write to a closing socket would be.
            if user.events.send(UserEvent::Data(frame.data)).await.is_err() {
                tracing::debug!("transfer for closed user channel dropped");
            }
            Ok(())
        }
        _ => {
            tracing::debug!("transfer on unbound channel dropped");
            Ok(())
        }
    }
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
