//! Connection gater (component C): the decision point consulted on every
//! inbound connection.
//!
//! Grounded on the same `parking_lot::RwLock`-guarded snapshot pattern used
//! for per-IP connection limiting elsewhere in this codebase: the
//! authorized set is replaced wholesale under a write lock so that readers
//! never observe a partially updated set.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::allowlist::AllowListStore;
use crate::error::Result;
use crate::identity::PeerId;

/// Holds the in-memory authorized-peer set and answers admission decisions.
pub struct ConnectionGater {
    authorized: RwLock<HashSet<PeerId>>,
}

impl ConnectionGater {
    pub fn new(initial: HashSet<PeerId>) -> Arc<Self> {
        Arc::new(Self {
            authorized: RwLock::new(initial),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(HashSet::new())
    }

    /// "accept" iff the remote id is in the current set. Gating applies only
    /// to peers originating a new inbound connection; outbound dials are
    /// never gated here.
    pub fn should_accept(&self, peer: &PeerId) -> bool {
        self.authorized.read().contains(peer)
    }

    /// Atomically replace the authorized set. A connection already in flight
    /// when the swap happens is decided against whichever set it observed;
    /// every connection afterward sees the new set.
    pub fn update_authorized_peers(&self, set: HashSet<PeerId>) {
        *self.authorized.write() = set;
    }

    /// Re-read the allow-list store and swap in the freshly computed set.
    pub fn reload_from_file(&self, store: &AllowListStore) -> Result<()> {
        let set = store.authorized_set()?;
        self.update_authorized_peers(set);
        Ok(())
    }

    pub fn current_size(&self) -> usize {
        self.authorized.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allowlist::Role;
    use tempfile::tempdir;

    fn peer(seed: u8) -> PeerId {
        PeerId(hex::encode([seed; 32]))
    }

    #[test]
    fn rejects_unknown_peers_and_accepts_known_ones() {
        let mut set = HashSet::new();
        set.insert(peer(1));
        let gater = ConnectionGater::new(set);

        assert!(gater.should_accept(&peer(1)));
        assert!(!gater.should_accept(&peer(2)));
    }

    #[test]
    fn update_is_fully_observable_immediately_after_it_returns() {
        let gater = ConnectionGater::empty();
        assert!(!gater.should_accept(&peer(1)));

        let mut set = HashSet::new();
        set.insert(peer(1));
        gater.update_authorized_peers(set);

        assert!(gater.should_accept(&peer(1)));
        assert!(!gater.should_accept(&peer(2)));
    }

    #[test]
    fn hot_reload_picks_up_allow_list_changes() {
        let dir = tempdir().unwrap();
        let store = AllowListStore::new(dir.path().join("authorized_keys"));
        let gater = ConnectionGater::empty();

        store.add_peer(peer(1), None, Role::Member, None).unwrap();
        gater.reload_from_file(&store).unwrap();

        assert!(gater.should_accept(&peer(1)));
        assert!(!gater.should_accept(&peer(2)));
    }
}
