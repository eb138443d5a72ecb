//! The `persistence` module keeps outbound QoS 1/2 messages on disk until the
//! broker acknowledges them, so a restarted client can re-send what was still
//! in flight.
//!
//! It uses `sled` as an embedded key-value store, one tree per client
//! identifier.

pub mod sled_store;

pub use sled_store::{Spool, SpoolKey, SpooledMessage};

#[cfg(test)]
mod tests;
