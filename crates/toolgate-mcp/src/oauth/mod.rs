//! OAuth support for protected MCP servers.
//!
//! Two flows are supported:
//!
//! - [`traditional`]: a pre-registered provider (Google, GitHub, Notion) with
//!   static client credentials taken from the environment.
//! - [`dynamic`]: the MCP authorization flow, i.e. metadata discovery, dynamic
//!   client registration and PKCE, started when a server answers 401.
//!
//! Both park an authorization under a random CSRF `state` until the callback
//! arrives. A state is consumable once and expires after a bounded time.

pub mod dynamic;
pub mod pkce;
pub mod tokens;
pub mod traditional;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Generate an unguessable OAuth state parameter (32 random bytes).
pub fn generate_state() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// First few characters of a state, safe to log.
pub(crate) fn state_prefix(state: &str) -> &str {
    let end = state
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(state.len());
    &state[..end]
}

/// Single-use, expiring map from CSRF state to whatever the flow needs to
/// resume.
#[derive(Debug)]
pub struct PendingAuthorizations<T> {
    ttl: Duration,
    entries: HashMap<String, (Instant, T)>,
}

impl<T> PendingAuthorizations<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, state: String, value: T) {
        self.purge_expired();
        self.entries.insert(state, (Instant::now(), value));
    }

    /// Whether a live entry exists, without consuming it.
    pub fn contains(&self, state: &str) -> bool {
        self.entries
            .get(state)
            .is_some_and(|(created, _)| created.elapsed() < self.ttl)
    }

    /// Borrow a live entry without consuming it.
    pub fn get(&self, state: &str) -> Option<&T> {
        self.entries
            .get(state)
            .filter(|(created, _)| created.elapsed() < self.ttl)
            .map(|(_, value)| value)
    }

    /// Remove and return the entry. Expired entries are dropped and reported
    /// as absent.
    pub fn take(&mut self, state: &str) -> Option<T> {
        let (created, value) = self.entries.remove(state)?;
        (created.elapsed() < self.ttl).then_some(value)
    }

    /// Drop every entry matching `predicate`.
    pub fn retain(&mut self, mut predicate: impl FnMut(&T) -> bool) {
        self.entries.retain(|_, (_, value)| predicate(value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge_expired(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, (created, _)| created.elapsed() < ttl);
    }
}
