//! Subsystems layered on the core as ordinary scopes.

pub mod proposals;
