//! The `utils` module collects the pieces shared by every other module of
//! `mqttlink`: the error types and logging setup.

pub mod error;
pub mod logging;

pub use error::{ConnectionError, SpoolError, TransportError};
