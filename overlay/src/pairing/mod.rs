//! Pairing: turns a short-lived invite code into a mutually authorized peer
//! relationship (components E and F).

pub mod group;
pub mod handshake;

pub use group::{PairingGroup, PairingGroupRegistry};
pub use handshake::{inviter_handshake, joiner_handshake, PairingOutcome};
