//! Peer transition hooks and membership subscriptions.
//!
//! `on_up`/`on_down` callbacks are edge-triggered: the registry fires them at
//! most once per connected/disconnected transition. Membership subscribers
//! receive the full active view after every change; a subscriber that has
//! gone away is dropped on the next notify.

use std::collections::HashMap;
use std::sync::Mutex;

use crossbeam::channel::{unbounded, Receiver, Sender, TrySendError};

use crate::core::{NodeName, NodeSpec};

pub type PeerCallback = Box<dyn FnMut(&NodeName) + Send>;

#[derive(Default)]
struct Hooks {
    on_up: HashMap<NodeName, Vec<PeerCallback>>,
    on_down: HashMap<NodeName, Vec<PeerCallback>>,
}

pub struct PeerEvents {
    hooks: Mutex<Hooks>,
    subscribers: Mutex<Vec<Sender<Vec<NodeSpec>>>>,
}

impl PeerEvents {
    pub fn new() -> Self {
        Self {
            hooks: Mutex::new(Hooks::default()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn on_up(&self, peer: NodeName, callback: PeerCallback) {
        self.lock_hooks().on_up.entry(peer).or_default().push(callback);
    }

    pub fn on_down(&self, peer: NodeName, callback: PeerCallback) {
        self.lock_hooks()
            .on_down
            .entry(peer)
            .or_default()
            .push(callback);
    }

    /// Subscribe to membership changes; each message is the active view at
    /// the time of the change.
    pub fn subscribe(&self) -> Receiver<Vec<NodeSpec>> {
        let (tx, rx) = unbounded();
        self.lock_subscribers().push(tx);
        rx
    }

    pub(crate) fn fire_up(&self, peer: &NodeName) {
        let mut hooks = self.lock_hooks();
        if let Some(callbacks) = hooks.on_up.get_mut(peer) {
            for callback in callbacks.iter_mut() {
                callback(peer);
            }
        }
    }

    pub(crate) fn fire_down(&self, peer: &NodeName) {
        let mut hooks = self.lock_hooks();
        if let Some(callbacks) = hooks.on_down.get_mut(peer) {
            for callback in callbacks.iter_mut() {
                callback(peer);
            }
        }
    }

    pub(crate) fn notify_membership(&self, active: Vec<NodeSpec>) {
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|tx| match tx.try_send(active.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    fn lock_hooks(&self) -> std::sync::MutexGuard<'_, Hooks> {
        self.hooks.lock().expect("peer events lock poisoned")
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Sender<Vec<NodeSpec>>>> {
        self.subscribers.lock().expect("peer events lock poisoned")
    }
}

impl Default for PeerEvents {
    fn default() -> Self {
        Self::new()
    }
}
