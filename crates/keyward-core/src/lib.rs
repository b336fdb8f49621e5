//! Core contracts for Keyward: certificate lookup, decrypted credentials,
//! convergence-engine run state and the operator event channel.
//! Holds no file or process I/O; storage and sync both build on it.

pub mod certificate;
pub mod credential;
pub mod events;
pub mod run_state;
