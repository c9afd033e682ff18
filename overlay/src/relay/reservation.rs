//! Reservation engine (half of component G): decides which peers may hold a
//! relay slot and tracks slots to their expiry.
//!
//! Grounded on the token-bucket/per-IP-limiter pair already used to shield
//! this codebase's relay path from abuse; reservations reuse the same
//! counting idioms but gate admission of a *slot* rather than a rate.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::{OverlayError, Result};
use crate::identity::PeerId;

/// Assigns a classification (e.g. autonomous system number) to a source IP.
/// Supplied by the relay binary's network integration; `None` disables the
/// ASN cap entirely.
pub trait AsnClassifier: Send + Sync {
    fn classify(&self, ip: IpAddr) -> Option<u32>;
}

#[derive(Debug, Clone)]
pub struct ReservationLimits {
    pub max_per_peer: u32,
    pub max_per_ip: u32,
    pub max_per_asn: u32,
    pub max_reservations: u32,
    pub reservation_ttl: Duration,
}

impl Default for ReservationLimits {
    fn default() -> Self {
        Self {
            max_per_peer: 1,
            max_per_ip: 4,
            max_per_asn: 16,
            max_reservations: 128,
            reservation_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub peer_id: PeerId,
    pub source_ip: IpAddr,
    pub asn: Option<u32>,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl Reservation {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Single owner of the reservation table. All admission decisions and
/// mutations go through this engine; there is no separate read path that
/// bypasses its internal lock.
pub struct ReservationEngine {
    limits: ReservationLimits,
    asn_classifier: Option<Box<dyn AsnClassifier>>,
    reservations: RwLock<HashMap<PeerId, Reservation>>,
}

impl ReservationEngine {
    pub fn new(limits: ReservationLimits, asn_classifier: Option<Box<dyn AsnClassifier>>) -> Self {
        Self {
            limits,
            asn_classifier,
            reservations: RwLock::new(HashMap::new()),
        }
    }

    /// Apply the ordered accept policy and, on success, install the
    /// reservation. The allow-list check (step 1) happens before this is
    /// called, against the connection gater; callers must have already
    /// rejected non-authorized peers.
    pub fn try_reserve(&self, peer_id: PeerId, source_ip: IpAddr) -> Result<()> {
        let mut table = self.reservations.write();
        self.evict_expired_locked(&mut table);

        let per_peer = table.values().filter(|r| r.peer_id == peer_id).count() as u32;
        if per_peer >= self.limits.max_per_peer {
            return Err(OverlayError::resource(
                "peer already holds a reservation",
            ));
        }

        let per_ip = table.values().filter(|r| r.source_ip == source_ip).count() as u32;
        if per_ip >= self.limits.max_per_ip {
            return Err(OverlayError::resource(
                "source IP has reached its reservation limit",
            ));
        }

        let asn = self
            .asn_classifier
            .as_ref()
            .and_then(|c| c.classify(source_ip));
        if let Some(asn) = asn {
            let per_asn = table.values().filter(|r| r.asn == Some(asn)).count() as u32;
            if per_asn >= self.limits.max_per_asn {
                return Err(OverlayError::resource(
                    "source ASN has reached its reservation limit",
                ));
            }
        }

        if table.len() as u32 >= self.limits.max_reservations {
            if !self.evict_lru_locked(&mut table) {
                return Err(OverlayError::resource("reservation table is full"));
            }
        }

        let now = Instant::now();
        table.insert(
            peer_id.clone(),
            Reservation {
                peer_id,
                source_ip,
                asn,
                created_at: now,
                expires_at: now + self.limits.reservation_ttl,
            },
        );
        Ok(())
    }

    /// Evict the reservation with the earliest `expires_at`. Returns `false`
    /// if the table is empty (should not happen when called from
    /// `try_reserve`, since that path only runs when the table is full).
    fn evict_lru_locked(&self, table: &mut HashMap<PeerId, Reservation>) -> bool {
        let victim = table
            .values()
            .min_by_key(|r| r.expires_at)
            .map(|r| r.peer_id.clone());
        match victim {
            Some(peer_id) => {
                table.remove(&peer_id);
                true
            }
            None => false,
        }
    }

    fn evict_expired_locked(&self, table: &mut HashMap<PeerId, Reservation>) -> Vec<PeerId> {
        let now = Instant::now();
        let expired: Vec<PeerId> = table
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.peer_id.clone())
            .collect();
        for peer_id in &expired {
            table.remove(peer_id);
        }
        expired
    }

    /// Sweep expired reservations. Returns the peers evicted so the caller
    /// (the circuit engine) can close their dependent circuits.
    pub fn evict_expired(&self) -> Vec<PeerId> {
        let mut table = self.reservations.write();
        self.evict_expired_locked(&mut table)
    }

    pub fn has_live_reservation(&self, peer_id: &PeerId) -> bool {
        let table = self.reservations.read();
        table
            .get(peer_id)
            .map(|r| !r.is_expired(Instant::now()))
            .unwrap_or(false)
    }

    pub fn release(&self, peer_id: &PeerId) {
        self.reservations.write().remove(peer_id);
    }

    pub fn count(&self) -> usize {
        self.reservations.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer(seed: u8) -> PeerId {
        PeerId(hex::encode([seed; 32]))
    }

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    #[test]
    fn second_reservation_for_the_same_peer_is_rejected() {
        let engine = ReservationEngine::new(ReservationLimits::default(), None);
        engine.try_reserve(peer(1), ip(1)).unwrap();
        let err = engine.try_reserve(peer(1), ip(2)).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Resource);
    }

    #[test]
    fn per_ip_cap_is_enforced_independently_of_peer_id() {
        let limits = ReservationLimits {
            max_per_ip: 1,
            ..ReservationLimits::default()
        };
        let engine = ReservationEngine::new(limits, None);
        engine.try_reserve(peer(1), ip(1)).unwrap();
        let err = engine.try_reserve(peer(2), ip(1)).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Resource);
    }

    #[test]
    fn total_cap_evicts_the_soonest_to_expire_reservation() {
        let limits = ReservationLimits {
            max_per_ip: 100,
            max_reservations: 2,
            ..ReservationLimits::default()
        };
        let engine = ReservationEngine::new(limits, None);
        engine.try_reserve(peer(1), ip(1)).unwrap();
        engine.try_reserve(peer(2), ip(2)).unwrap();
        engine.try_reserve(peer(3), ip(3)).unwrap();

        assert_eq!(engine.count(), 2);
        assert!(engine.has_live_reservation(&peer(3)));
    }

    #[test]
    fn asn_cap_is_skipped_when_no_classifier_is_configured() {
        let limits = ReservationLimits {
            max_per_ip: 100,
            max_per_asn: 1,
            ..ReservationLimits::default()
        };
        let engine = ReservationEngine::new(limits, None);
        engine.try_reserve(peer(1), ip(1)).unwrap();
        assert!(engine.try_reserve(peer(2), ip(2)).is_ok());
    }

    struct FixedAsn(u32);
    impl AsnClassifier for FixedAsn {
        fn classify(&self, _ip: IpAddr) -> Option<u32> {
            Some(self.0)
        }
    }

    #[test]
    fn asn_cap_is_enforced_when_a_classifier_is_configured() {
        let limits = ReservationLimits {
            max_per_ip: 100,
            max_per_asn: 1,
            ..ReservationLimits::default()
        };
        let engine = ReservationEngine::new(limits, Some(Box::new(FixedAsn(64500))));
        engine.try_reserve(peer(1), ip(1)).unwrap();
        assert!(engine.try_reserve(peer(2), ip(2)).is_err());
    }
}
