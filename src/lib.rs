//! Stowage - content-addressed bundle unpack cache
//!
//! Resolves declared bundle sources (OCI images or remote `.tar.gz`
//! archives) into immutable directory trees keyed by content digest, with
//! rollback on failure and garbage collection of superseded generations.

pub mod audit;
pub mod bundle_fs;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod source;
pub mod ui;
pub mod unpack;

pub use bundle_fs::BundleFs;
pub use error::{StowageError, StowageResult};
pub use source::{BundleSource, Digest, SourceType};
pub use unpack::{BundleUnpacker, UnpackResult, UnpackStatus, Unpacker};
