//! Overlay address (§3 data model): an ordered, typed sequence of path
//! components describing how to reach a peer -- network protocol, address
//! value, transport, port, and optionally a relay-hop marker and terminal
//! peer id.
//!
//! The wire/textual representation is the same multiaddr format the
//! underlying transport and DHT already speak, so this module is a thin,
//! overlay-specific wrapper around `libp2p::Multiaddr` rather than a parser
//! of its own: round-tripping through `to_string()`/`parse()` is bit-exact
//! because it is multiaddr's own round-trip, not one this crate reimplements.

use std::fmt;
use std::str::FromStr;

use libp2p::multiaddr::Protocol;
use libp2p::multihash::Multihash;
use libp2p::Multiaddr;

use crate::error::{OverlayError, Result};
use crate::identity::PeerId;

/// Multihash code for "identity" (the digest is the raw input, unhashed).
/// Used to embed this crate's own hex peer identifiers inside a `/p2p/...`
/// multiaddr component without pretending they are libp2p's own
/// protobuf-encoded public-key peer ids.
const IDENTITY_MULTIHASH_CODE: u64 = 0x00;

/// A parsed overlay address. Wraps a `Multiaddr` so call sites outside this
/// module never need to depend on `libp2p`'s address types directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayAddress(Multiaddr);

impl OverlayAddress {
    pub fn from_multiaddr(addr: Multiaddr) -> Self {
        Self(addr)
    }

    pub fn as_multiaddr(&self) -> &Multiaddr {
        &self.0
    }

    /// `/p2p-circuit` marks a relay hop in the path; its presence is what
    /// distinguishes a relayed address from a direct one.
    pub fn is_relay_circuit(&self) -> bool {
        self.0.iter().any(|p| matches!(p, Protocol::P2pCircuit))
    }

    /// The terminal peer id carried in a `/p2p/<id>` component, if any.
    /// Only identity-coded multihashes (the ones this crate itself writes
    /// via [`Self::circuit_to`]) decode back to a [`PeerId`]; multiaddrs
    /// carrying a "real" libp2p public-key peer id are not ones this crate
    /// produced and are ignored here.
    pub fn terminal_peer_id(&self) -> Option<PeerId> {
        self.0.iter().find_map(|p| match p {
            Protocol::P2p(id) => {
                let mh = id.as_ref();
                if mh.code() != IDENTITY_MULTIHASH_CODE {
                    return None;
                }
                hex::encode(mh.digest()).parse::<PeerId>().ok()
            }
            _ => None,
        })
    }

    /// Build a relay circuit address: `<relay_address>/p2p-circuit/p2p/<target>`.
    pub fn circuit_to(relay_address: &OverlayAddress, target: &PeerId) -> Result<Self> {
        let mut addr = relay_address.0.clone();
        addr.push(Protocol::P2pCircuit);
        let digest = hex::decode(&target.0)
            .map_err(|e| OverlayError::protocol(format!("'{target}' is not a valid peer id: {e}")))?;
        let mh = Multihash::wrap(IDENTITY_MULTIHASH_CODE, &digest)
            .map_err(|e| OverlayError::protocol(format!("peer id too long to embed: {e}")))?;
        let peer_id = libp2p::PeerId::from_multihash(mh)
            .map_err(|_| OverlayError::protocol("peer id is not a valid multihash"))?;
        addr.push(Protocol::P2p(peer_id));
        Ok(Self(addr))
    }
}

impl fmt::Display for OverlayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OverlayAddress {
    type Err = OverlayError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<Multiaddr>()
            .map(Self)
            .map_err(|e| OverlayError::protocol(format!("malformed overlay address '{s}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerId {
        PeerId(hex::encode([seed; 32]))
    }

    #[test]
    fn textual_form_round_trips() {
        let addr: OverlayAddress = "/ip4/203.0.113.4/tcp/4242".parse().unwrap();
        assert_eq!(addr.to_string(), "/ip4/203.0.113.4/tcp/4242");
    }

    #[test]
    fn direct_address_is_not_a_relay_circuit() {
        let addr: OverlayAddress = "/ip4/203.0.113.4/tcp/4242".parse().unwrap();
        assert!(!addr.is_relay_circuit());
    }

    #[test]
    fn circuit_address_carries_the_relay_marker_and_terminal_peer() {
        let relay: OverlayAddress = "/ip4/203.0.113.4/tcp/4242".parse().unwrap();
        let target = peer(1);
        let circuit = OverlayAddress::circuit_to(&relay, &target).unwrap();

        assert!(circuit.is_relay_circuit());
        assert_eq!(circuit.terminal_peer_id().as_ref(), Some(&target));
        assert_eq!(circuit, circuit.to_string().parse().unwrap());
    }

    #[test]
    fn malformed_address_is_rejected() {
        assert!("not-an-address".parse::<OverlayAddress>().is_err());
    }
}
