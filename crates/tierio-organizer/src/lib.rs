//! tierio Organizer - moving blob bytes between buffers
//!
//! - Data path: scatter a blob over buffers and gather it back, locally or
//!   through a node's transport
//! - Scores for blobs and targets
//! - Buffer organizer: tier demotion, promotion and swap relocation
//! - Background worker driving organize passes

pub mod data_path;
pub mod organizer;
pub mod score;
pub mod worker;

pub use data_path::DataPath;
pub use organizer::{BorgStats, BufferOrganizer, OrganizeReport};
pub use score::{MOVE_THRESHOLD, blob_score, target_scores};
pub use worker::BorgWorker;
