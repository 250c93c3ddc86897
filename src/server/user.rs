//! SOCKS5 user-channel handling.
//!
//! Each external user connection runs a three-stage state machine —
//! HANDSHAKE (method negotiation), AUTH (username/password, where the
//! username names the target client key), READY (CONNECT, then opaque
//! relay). Incomplete input is buffered at every stage; a user trickling
//! bytes is never an error.
//!
//! Ordering matters twice here: the `(userId → channel)` registration is
//! inserted *before* the auth-success reply is written, so no TRANSFER can
//! reach a user that has not seen its reply; and socket reads stay paused
//! from the CONNECT request until the client's data channel binds, so no
//! payload races ahead of the tunnel.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::id;
use crate::protocol::frame::MAX_URI_LEN;
use crate::protocol::socks5::{self, ConnectRequest};
use crate::protocol::Frame;
use crate::server::config::ServerConfig;
use crate::server::registry::{ControlHandle, Registry, UserEvent, UserHandle};
use crate::TRANSFER_CHUNK;

/// Depth of the event queue feeding each user channel.
const USER_EVENT_QUEUE: usize = 64;

/// Run one SOCKS5 user connection to completion.
pub(crate) async fn run_user_conn(
    stream: TcpStream,
    registry: Arc<Registry>,
    config: Arc<ServerConfig>,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into());
    let _ = stream.set_nodelay(true);

    let (mut rd, mut wr) = stream.into_split();
    let mut buf = BytesMut::with_capacity(1024);

    // HANDSHAKE: method negotiation.
    let has_userpass = loop {
        match socks5::parse_method_selection(&mut buf) {
            Ok(Some(v)) => break v,
            Ok(None) => {
                if !read_more(&mut rd, &mut buf).await {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!("socks5 handshake from {} failed: {}", peer, e);
                return;
            }
        }
    };
    if !has_userpass {
        let _ = wr
            .write_all(&[socks5::VERSION, socks5::METHOD_NO_ACCEPTABLE])
            .await;
        return;
    }
    if wr
        .write_all(&[socks5::VERSION, socks5::METHOD_USERNAME_PASSWORD])
        .await
        .is_err()
    {
        return;
    }

    // AUTH: the username is the target client key.
    let auth = loop {
        match socks5::parse_auth_request(&mut buf) {
            Ok(Some(req)) => break req,
            Ok(None) => {
                if !read_more(&mut rd, &mut buf).await {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!("socks5 auth from {} failed: {}", peer, e);
                return;
            }
        }
    };

    let control = registry.get(&auth.username);
    let authenticated = control.is_some() && auth.password == config.socks_password;
    let Some(control) = control.filter(|_| authenticated) else {
        tracing::debug!("socks5 auth failed for {} (key {:?})", peer, auth.username);
        let _ = wr
            .write_all(&[socks5::AUTH_VERSION, socks5::AUTH_FAILURE])
            .await;
        return;
    };

    // Register before replying: the reply cannot overtake the socket, so
    // the rest of the system never routes to a user that has not seen its
    // auth success.
    let (event_tx, mut events) = mpsc::channel(USER_EVENT_QUEUE);
    let mut user_id = id::user_id();
    while !control.add_user(&user_id, UserHandle { events: event_tx.clone() }) {
        user_id = id::user_id();
    }
    drop(event_tx);

    tracing::debug!("user {} authenticated from {} via {}", user_id, peer, control.client_key());

    if wr
        .write_all(&[socks5::AUTH_VERSION, socks5::AUTH_SUCCESS])
        .await
        .is_err()
    {
        control.remove_user(&user_id);
        return;
    }

    // READY: the first message must be the CONNECT request. The control
    // channel can die while we wait, so watch our event queue too.
    let request = loop {
        match socks5::parse_connect_request(&mut buf) {
            Ok(Some(req)) => break req,
            Ok(None) => {
                tokio::select! {
                    ok = read_more(&mut rd, &mut buf) => {
                        if !ok {
                            control.remove_user(&user_id);
                            return;
                        }
                    }
                    ev = events.recv() => {
                        if !matches!(ev, Some(UserEvent::Data(_))) {
                            let _ = wr.shutdown().await;
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!("socks5 request from {} failed: {}", peer, e);
                control.remove_user(&user_id);
                return;
            }
        }
    };

    let (host, port) = match request {
        ConnectRequest::Target { host, port } => (host, port),
        ConnectRequest::Refused(rep) => {
            tracing::debug!("socks5 request from {} refused with 0x{:02x}", peer, rep);
            let _ = wr.write_all(&socks5::connect_reply(rep)).await;
            control.remove_user(&user_id);
            return;
        }
    };

    tracing::debug!("user {} connect request for {}:{}", user_id, host, port);

    // The flow-setup uri has to fit the frame's 1-byte length field; a
    // maximal SOCKS5 domain plus the routing prefix cannot.
    let connect_uri = format!("{user_id}:{host}:{port}");
    if connect_uri.len() > MAX_URI_LEN {
        tracing::warn!("target of user {} too long for flow setup", user_id);
        let _ = wr
            .write_all(&socks5::connect_reply(socks5::REP_GENERAL_FAILURE))
            .await;
        control.remove_user(&user_id);
        return;
    }

    // Ask the client to bring the flow up, then answer the user. Reads stay
    // paused until the data channel binds.
    if control
        .frames()
        .send(Frame::connect(connect_uri))
        .await
        .is_err()
    {
        let _ = wr
            .write_all(&socks5::connect_reply(socks5::REP_GENERAL_FAILURE))
            .await;
        control.remove_user(&user_id);
        return;
    }
    if wr
        .write_all(&socks5::connect_reply(socks5::REP_SUCCEEDED))
        .await
        .is_err()
    {
        send_disconnect(&control, &user_id).await;
        return;
    }

    let frames = loop {
        match events.recv().await {
            Some(UserEvent::Bind { frames }) => break frames,
            Some(UserEvent::Data(_)) => {
                tracing::warn!("payload for user {} before its data channel bound", user_id);
            }
            Some(UserEvent::Close) | None => {
                let _ = wr.shutdown().await;
                return;
            }
        }
    };

    relay(rd, wr, buf, user_id, control, frames, events).await;
}

/// Relay phase: user bytes become TRANSFER frames on the data channel,
/// TRANSFER payloads from the client are written back to the user.
async fn relay(
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
    mut buf: BytesMut,
    user_id: String,
    control: ControlHandle,
    frames: mpsc::Sender<Frame>,
    mut events: mpsc::Receiver<UserEvent>,
) {
    // A user may pipeline payload behind its CONNECT request; forward
    // whatever is already buffered once the tunnel is up.
    if !buf.is_empty() {
        let data = buf.split().freeze();
        if frames.send(Frame::transfer(&user_id, data)).await.is_err() {
            control.remove_user(&user_id);
            return;
        }
    }

    loop {
        buf.reserve(TRANSFER_CHUNK);
        tokio::select! {
            res = rd.read_buf(&mut buf) => match res {
                Ok(0) | Err(_) => {
                    // User hung up: tell the client exactly once, then
                    // drop out of the map so nothing routes here again.
                    control.remove_user(&user_id);
                    let _ = frames.send(Frame::disconnect(&user_id)).await;
                    break;
                }
                Ok(_) => {
                    let data = buf.split().freeze();
                    if frames.send(Frame::transfer(&user_id, data)).await.is_err() {
                        control.remove_user(&user_id);
                        break;
                    }
                }
            },
            ev = events.recv() => match ev {
                Some(UserEvent::Data(data)) => {
                    if wr.write_all(&data).await.is_err() {
                        control.remove_user(&user_id);
                        let _ = frames.send(Frame::disconnect(&user_id)).await;
                        break;
                    }
                }
                Some(UserEvent::Bind { .. }) => {
                    tracing::warn!("duplicate bind for user {}", user_id);
                }
                Some(UserEvent::Close) | None => {
                    // Teardown came from the framed side, which already
                    // cleared the registration; flush and close without
                    // echoing a DISCONNECT.
                    let _ = wr.shutdown().await;
                    break;
                }
            },
        }
    }

    tracing::debug!("user {} closed", user_id);
}

/// Route a DISCONNECT for a flow whose data channel may not exist yet.
async fn send_disconnect(control: &ControlHandle, user_id: &str) {
    control.remove_user(user_id);
    let _ = control.frames().send(Frame::disconnect(user_id)).await;
}

/// Pull more bytes into `buf`; false on EOF or error.
async fn read_more(rd: &mut OwnedReadHalf, buf: &mut BytesMut) -> bool {
    matches!(rd.read_buf(buf).await, Ok(n) if n > 0)
}
