//! Core types shared by the Strata project-state crates.
//!
//! This crate provides identifiers, the quality ladder, state requests,
//! error handling, configuration and logging setup used by the reload
//! engine in `strata-reload`.

pub mod config;
pub mod error;
pub mod id;
pub mod logging;
pub mod quality;
pub mod request;

pub use config::{GeneralConfig, ReloadConfig, StrataConfig, WatcherConfig};
pub use error::{Result, StrataError};
pub use id::{DataToken, ProjectId, SnapshotId};
pub use quality::Quality;
pub use request::{RequestContext, StateRequest};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::StrataConfig;
    pub use crate::error::{Result, StrataError};
    pub use crate::id::{DataToken, ProjectId, SnapshotId};
    pub use crate::quality::Quality;
    pub use crate::request::{RequestContext, StateRequest};
}
