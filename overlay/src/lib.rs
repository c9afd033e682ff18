//! Overlay: a private peer-to-peer overlay network library.
//!
//! Two binaries build on this library: `relay-server` (a gatekeeping
//! circuit relay) and `peer-agent` (the peer daemon). This crate owns
//! identity, authorization, pairing, relay resource management, path
//! establishment, and the local control/admin protocols; the DHT, the
//! noise-encrypted transport, and the command-line front-end are external
//! collaborators this crate only talks to through narrow traits.

#![deny(clippy::print_stdout)]

pub mod address;
pub mod admin;
pub mod allowlist;
pub mod config;
pub mod control_api;
pub mod dialer;
pub mod error;
pub mod gater;
pub mod identity;
pub mod invite;
pub mod metrics;
pub mod pairing;
pub mod relay;
pub mod retry;
pub mod service;
pub mod telemetry;
pub mod vault;
