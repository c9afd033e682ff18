//! Relay: reservation and circuit admission (component G), the core of the
//! relay binary's resource policy.

pub mod circuit;
pub mod reservation;

pub use circuit::{CircuitEngine, CircuitLimits, CircuitStats};
pub use reservation::{AsnClassifier, Reservation, ReservationEngine, ReservationLimits};
