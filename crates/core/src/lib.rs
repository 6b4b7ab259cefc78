//! Small utilities shared by the egress proxy crates.
//!
//! Kept deliberately tiny: generic atomic-swap aliases, an acknowledged
//! mpsc/oneshot channel pair used for background-task shutdown handshakes,
//! and a one-line `tracing` initializer for the embedding binary.

pub mod arc;
pub mod responsechannel;
pub mod telemetry;

pub use arc::{Atomic, AtomicOption};
