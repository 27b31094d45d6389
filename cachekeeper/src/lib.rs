//! cachekeeper: operation orchestration and live log monitoring for a
//! caching proxy's management backend.
//!
//! Long-running maintenance jobs (cache clearing, log ingestion) run in
//! external worker processes. This crate tracks them as [`operation::Operation`]s,
//! survives worker crashes and its own restarts, and keeps the live log
//! monitor out of the way of sibling jobs.

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod notification;
pub mod operation;
pub mod services;

pub use error::{Error, Result};
