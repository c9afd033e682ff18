//! Pairing group registry (component F): issues batches of single-use
//! invite tokens tied to a shared TTL, with consume-once semantics and
//! explicit revocation.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::RngCore;

use crate::error::{OverlayError, Result};
use crate::invite::InviteToken;

#[derive(Debug, Clone)]
pub struct PairingGroup {
    pub group_id: String,
    pub total_codes: u32,
    pub used_codes: u32,
    pub created_at: u64,
    pub expires_at: u64,
    pub joiner_expiry: Option<Duration>,
    pub network_tag: Option<String>,
    unused: Vec<InviteToken>,
    revoked: bool,
}

impl PairingGroup {
    pub fn is_active(&self, now: u64) -> bool {
        !self.revoked && now < self.expires_at && self.used_codes < self.total_codes
    }

    pub fn remaining(&self, now: u64) -> Duration {
        Duration::from_secs(self.expires_at.saturating_sub(now))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// In-memory registry of active pairing groups, keyed by the token each of
/// their unused codes carries, for O(1) consumption on handshake success.
pub struct PairingGroupRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    groups: HashMap<String, PairingGroup>,
    token_to_group: HashMap<InviteToken, String>,
}

impl Default for PairingGroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingGroupRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                groups: HashMap::new(),
                token_to_group: HashMap::new(),
            }),
        }
    }

    /// Issue `count` fresh single-use tokens bound to a new group.
    pub fn create_group(
        &self,
        count: u32,
        ttl: Duration,
        joiner_expiry: Option<Duration>,
        network_tag: Option<String>,
    ) -> Result<(String, Vec<InviteToken>)> {
        if count == 0 {
            return Err(OverlayError::protocol("pairing group must contain at least one code"));
        }

        let mut rng = rand::thread_rng();
        let group_id = {
            let mut id_bytes = [0u8; 8];
            rng.fill_bytes(&mut id_bytes);
            hex::encode(id_bytes)
        };

        let mut codes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut token = [0u8; 8];
            rng.fill_bytes(&mut token);
            codes.push(token);
        }

        let now = now_secs();
        let group = PairingGroup {
            group_id: group_id.clone(),
            total_codes: count,
            used_codes: 0,
            created_at: now,
            expires_at: now + ttl.as_secs(),
            joiner_expiry,
            network_tag,
            unused: codes.clone(),
            revoked: false,
        };

        let mut inner = self.inner.lock();
        for token in &codes {
            inner.token_to_group.insert(*token, group_id.clone());
        }
        inner.groups.insert(group_id.clone(), group);

        Ok((group_id, codes))
    }

    /// Look up and consume a token, returning its group's joiner expiry
    /// policy on success. Fails uniformly (no distinction between "unknown
    /// token", "expired group", and "revoked group") to match the pairing
    /// handshake's collapsed error contract.
    pub fn consume(&self, token: &InviteToken) -> Result<Option<Duration>> {
        let mut inner = self.inner.lock();
        let group_id = inner
            .token_to_group
            .get(token)
            .cloned()
            .ok_or_else(OverlayError::pairing_invalid_code)?;

        let now = now_secs();
        let joiner_expiry = {
            let group = inner
                .groups
                .get_mut(&group_id)
                .ok_or_else(OverlayError::pairing_invalid_code)?;
            if !group.is_active(now) {
                return Err(OverlayError::pairing_invalid_code());
            }
            group.unused.retain(|t| t != token);
            group.used_codes += 1;
            group.joiner_expiry
        };

        inner.token_to_group.remove(token);
        let retire = inner
            .groups
            .get(&group_id)
            .map(|g| g.used_codes >= g.total_codes)
            .unwrap_or(false);
        if retire {
            inner.groups.remove(&group_id);
        }

        Ok(joiner_expiry)
    }

    /// Retire a group immediately. In-flight handshakes using one of its
    /// codes fail the next time `consume` is called for that token.
    pub fn revoke_group(&self, group_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let tokens_to_drop: Vec<InviteToken> = {
            let group = inner
                .groups
                .get_mut(group_id)
                .ok_or_else(|| OverlayError::protocol(format!("unknown pairing group {group_id}")))?;
            group.revoked = true;
            std::mem::take(&mut group.unused)
        };
        for token in tokens_to_drop {
            inner.token_to_group.remove(&token);
        }
        Ok(())
    }

    pub fn list_groups(&self) -> Vec<PairingGroup> {
        let now = now_secs();
        let mut inner = self.inner.lock();
        inner.groups.retain(|_, g| g.is_active(now));
        inner.groups.values().cloned().collect()
    }
}
