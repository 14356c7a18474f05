//! Core settle library (stream decoding, sessions, settlement tracking, config).

pub mod client;
pub mod config;
pub mod log;
pub mod logging;
pub mod registry;
pub mod session;
pub mod settlement;
pub mod stream;
