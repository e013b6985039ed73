//! Recognition constants.

/// Embedding dimensions produced by the recognition network.
pub const DIM: usize = 512;

/// Maximum deviation of a normalized embedding's norm from 1.
pub const NORM_TOLERANCE: f64 = 5e-7;

/// Margin added to the largest member distance when computing a sample radius.
pub const RADIUS_MARGIN: f64 = 0.01;

/// Minimum cascade score every detection must reach.
pub const SCORE_THRESHOLD: f32 = 9.0;

/// Fallback candidates must still reach this score.
pub const FALLBACK_SCORE_FLOOR: f32 = SCORE_THRESHOLD;

/// Largest shortfall below the scale-adjusted threshold a fallback may have.
pub const FALLBACK_SLACK: f32 = 2.0;

/// Scale window `[min, max)` eligible for the fallback path.
pub const FALLBACK_MIN_SCALE: i32 = 50;
pub const FALLBACK_MAX_SCALE: i32 = 110;

/// Overlap (percent of the smaller area) above which a face is a duplicate.
pub const OVERLAP_THRESHOLD: f64 = 42.0;

/// Faces at or below this scale are not searched for eyes.
pub const EYE_SCALE_MIN: i32 = 50;

/// Smallest detection size accepted by any engine (pixels).
pub const MIN_FACE_SIZE: u32 = 20;

/// Faces smaller than this are detected but not embedded (pixels).
pub const SIZE_THRESHOLD: u32 = 50;

/// Tolerance added to a cluster's sample radius when matching.
pub const MATCH_DIST: f64 = 0.46;

/// Maximum distance between members when building new clusters.
pub const CLUSTER_DIST: f64 = 0.64;

/// Minimum number of samples a new cluster needs.
pub const CLUSTER_CORE: usize = 4;

/// A collision radius at or below this value is not enforced.
pub const COLLISION_RADIUS_MIN: f64 = 0.1;

/// Collisions closer than this mean the identities can't be told apart.
pub const COLLISION_INDISTINCT: f64 = 0.02;

/// Merge attempts a manual cluster gets before the optimizer skips it.
pub const MERGE_MAX_RETRY: u32 = 1;

/// Optimizer iteration cap.
pub const OPTIMIZE_MAX_ITERATIONS: usize = 11;

/// Markers per matcher page.
pub const PAGE_SIZE: usize = 500;

/// Leading dimensions hashed into the index bucket key.
pub const SIGN_HASH_DIMS: usize = 6;

/// Scale-adjusted cascade quality threshold. Small faces need a higher score.
pub fn quality_threshold(scale: i32) -> f32 {
    let step = if scale < 26 {
        12.0
    } else if scale < 32 {
        8.0
    } else if scale < 40 {
        6.0
    } else if scale < 50 {
        4.0
    } else if scale < 80 {
        2.0
    } else if scale < 110 {
        1.0
    } else {
        0.0
    };

    SCORE_THRESHOLD + step
}
