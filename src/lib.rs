//! facekit: face detection, embedding and identity clustering.
//!
//! Detected faces are stored as markers, grouped into persistent face
//! clusters, matched against those clusters and periodically consolidated
//! (merged, renormalized, audited).

pub mod config;
pub mod db;
pub mod error;
pub mod faces;
pub mod labels;
pub mod logging;
pub mod tasks;

pub use error::FacesError;
