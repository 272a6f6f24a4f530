//! Session registry.
//!
//! A `session/new` that referenced `acp:` tool servers is tagged with a
//! session key; its bridge listeners park here until the agent's
//! response publishes the real session id (or the error path cancels
//! them). Published listeners stay live for the rest of the process and
//! are torn down on shutdown.

use std::collections::HashMap;

use crate::bridge::BridgeListenerHandle;

pub(crate) struct SessionEntry {
    pub listeners: Vec<BridgeListenerHandle>,
    /// acp: URL → rewritten local HTTP URL.
    pub url_map: HashMap<String, String>,
}

#[derive(Default)]
pub(crate) struct SessionRegistry {
    pending: HashMap<String, SessionEntry>,
    live: Vec<BridgeListenerHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, entry: SessionEntry) {
        self.pending.insert(key, entry);
    }

    /// Publishes the agent-assigned session id to every listener parked
    /// under `key`. Returns false if the key is unknown.
    pub fn publish(&mut self, key: &str, session_id: &str) -> bool {
        let Some(entry) = self.pending.remove(key) else {
            return false;
        };
        tracing::debug!(session_id, mappings = ?entry.url_map, "unparking bridge listeners");
        for listener in entry.listeners {
            listener.publish(session_id);
            self.live.push(listener);
        }
        true
    }

    /// Error path: tears down every listener parked under `key`.
    pub fn cancel(&mut self, key: &str) -> bool {
        let Some(entry) = self.pending.remove(key) else {
            return false;
        };
        for listener in &entry.listeners {
            listener.cancel();
        }
        true
    }

    pub fn shutdown(&mut self) {
        for (_, entry) in self.pending.drain() {
            for listener in &entry.listeners {
                listener.cancel();
            }
        }
        for listener in self.live.drain(..) {
            listener.cancel();
        }
    }
}
