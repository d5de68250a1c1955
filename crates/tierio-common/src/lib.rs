//! tierio Common - Shared types and utilities
//!
//! This crate provides the identifiers, error type, configuration, target
//! registry, RPC messages and blob locking shared by every tierio component.

pub mod config;
pub mod error;
pub mod registry;
pub mod rpc;
pub mod sync;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use registry::TargetRegistry;
pub use rpc::{BlobRecord, NoTransport, Request, Response, Transport};
pub use sync::{TicketGuard, TicketLock};
pub use types::*;
