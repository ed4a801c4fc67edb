//! Core of the persistent memory store.
//!
//! Leaf-first: `store`, `index`, `integrity`, `lock` and `transaction` are the
//! storage primitives; `document` composes them into load/save/rollback;
//! `permission` and `audit` back the `enforcer` façade agents call.

pub mod audit;
pub mod config;
pub mod document;
pub mod enforcer;
pub mod error;
pub mod index;
pub mod integrity;
pub mod lock;
pub mod logging;
pub mod permission;
pub mod scaffold;
pub mod store;
pub mod time;
pub mod transaction;
