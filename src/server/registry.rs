//! Channel registries.
//!
//! The global map ties each authenticated `clientKey` to its control
//! channel; each control channel owns a second map from `userId` to the
//! user channel it is serving. Handles carry bounded senders into the
//! owning task rather than the sockets themselves, so teardown is a map
//! removal — anything still holding a stale handle just sees closed
//! channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::protocol::Frame;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Events delivered to a user-channel task by the framed side.
#[derive(Debug)]
pub enum UserEvent {
    /// A data channel completed its CONNECT-ack: resume reading the user
    /// socket and send TRANSFER frames through `frames`.
    Bind {
        /// Writer queue of the bound data channel.
        frames: mpsc::Sender<Frame>,
    },
    /// Payload from the client for this user.
    Data(Bytes),
    /// Tear the user channel down without echoing a DISCONNECT.
    Close,
}

/// Handle to one user-channel task.
#[derive(Debug, Clone)]
pub struct UserHandle {
    /// Event queue of the user-channel task.
    pub events: mpsc::Sender<UserEvent>,
}

/// Handle to one authenticated control channel.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    id: u64,
    client_key: String,
    frames: mpsc::Sender<Frame>,
    users: Arc<Mutex<HashMap<String, UserHandle>>>,
}

impl ControlHandle {
    fn new(client_key: String, frames: mpsc::Sender<Frame>) -> Self {
        Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            client_key,
            frames,
            users: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The client key this control channel authenticated with.
    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    /// Writer queue of the control channel.
    pub fn frames(&self) -> mpsc::Sender<Frame> {
        self.frames.clone()
    }

    /// Insert a user channel. Fails on a userId collision.
    pub fn add_user(&self, user_id: &str, handle: UserHandle) -> bool {
        let mut users = self.users.lock();
        if users.contains_key(user_id) {
            return false;
        }
        users.insert(user_id.to_owned(), handle);
        true
    }

    /// Look up a user channel.
    pub fn user(&self, user_id: &str) -> Option<UserHandle> {
        self.users.lock().get(user_id).cloned()
    }

    /// Remove a user channel, returning the prior handle. The returned
    /// value makes remove-then-close atomic against a concurrent TRANSFER:
    /// once removal wins, no other path can route to the channel again.
    pub fn remove_user(&self, user_id: &str) -> Option<UserHandle> {
        self.users.lock().remove(user_id)
    }

    /// Drain every user channel, for control-channel teardown.
    pub fn drain_users(&self) -> Vec<UserHandle> {
        self.users.lock().drain().map(|(_, h)| h).collect()
    }

    /// Number of registered user channels.
    pub fn user_count(&self) -> usize {
        self.users.lock().len()
    }
}

/// Global `clientKey → control channel` map.
#[derive(Debug, Default)]
pub struct Registry {
    controls: Mutex<HashMap<String, ControlHandle>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a control channel for `client_key`.
    ///
    /// Check and insert happen under one lock acquisition, so of two
    /// channels racing to authenticate the same key exactly one wins;
    /// `None` tells the caller its channel must be closed.
    pub fn register(&self, client_key: &str, frames: mpsc::Sender<Frame>) -> Option<ControlHandle> {
        let mut controls = self.controls.lock();
        if controls.contains_key(client_key) {
            return None;
        }
        let handle = ControlHandle::new(client_key.to_owned(), frames);
        controls.insert(client_key.to_owned(), handle.clone());
        Some(handle)
    }

    /// Remove `handle`'s registration.
    ///
    /// Identity-guarded: a channel that lost the duplicate-key race cannot
    /// evict the winner during its own cleanup.
    pub fn unregister(&self, handle: &ControlHandle) {
        let mut controls = self.controls.lock();
        if let Some(current) = controls.get(&handle.client_key) {
            if current.id == handle.id {
                controls.remove(&handle.client_key);
            }
        }
    }

    /// Look up the control channel for `client_key`.
    pub fn get(&self, client_key: &str) -> Option<ControlHandle> {
        self.controls.lock().get(client_key).cloned()
    }

    /// Number of authenticated control channels.
    pub fn len(&self) -> usize {
        self.controls.lock().len()
    }

    /// True when no control channel is registered.
    pub fn is_empty(&self) -> bool {
        self.controls.lock().is_empty()
    }
}
