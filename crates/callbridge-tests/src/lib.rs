//! Integration test helpers: an in-process server over the loopback daemon
//! and browser-like clients speaking the relay protocol.

pub mod harness;
