//! Core domain types for the media lifecycle service.
//!
//! This crate defines the data model shared by the other crates:
//! - Media keys and CDN URL resolution
//! - Content extraction of managed media references
//! - Version snapshot references and kinds
//! - Application configuration

pub mod config;
pub mod error;
pub mod extract;
pub mod media;
pub mod version;

pub use error::{Error, Result};
pub use extract::MediaExtractor;
pub use media::MediaKey;
pub use version::{VersionKind, VersionRef};
