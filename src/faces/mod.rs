//! Face detection, embedding and identity clustering.

pub mod area;
pub mod audit;
pub mod cluster;
pub mod clustering;
pub mod crop;
pub mod embedding;
pub mod engine;
pub mod events;
pub mod index;
pub mod matching;
pub mod net;
pub mod optimize;
pub mod processor;
pub mod reset;
pub mod thresholds;

pub use audit::{audit, AuditResult};
pub use clustering::{cluster, ClusterOptions, ClusterResult};
pub use engine::{DetectionEngine, EngineRegistry};
pub use index::{select_best_face, CandidateIndex, FaceIndex};
pub use matching::{match_markers, MatchOptions, MatchResult};
pub use optimize::{optimize, OptimizeResult};
pub use processor::FaceProcessor;
pub use reset::{reset, ResetResult};
