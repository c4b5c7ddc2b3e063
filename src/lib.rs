//! Resilient remote operations and two-tier cache synchronization.
//!
//! Views bind to operation controllers ([`operation`]) that run remote calls,
//! classify their failures ([`classify`]) and retry or roll back as needed.
//! Entities flow through [`cache::CacheSync`], which keeps the reactive
//! in-process tier and the durable SQLite tier consistent.

pub mod cache;
pub mod classify;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod operation;
pub mod remote;
