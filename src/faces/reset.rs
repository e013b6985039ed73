use anyhow::Result;

use crate::db::FaceStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetResult {
    /// Automatically created faces deleted.
    pub removed: usize,
    /// Markers unlinked from them.
    pub unlinked: usize,
}

/// Remove automatically created clusters. Manually labeled clusters and
/// manual marker subjects survive.
pub fn reset(store: &dyn FaceStore) -> Result<ResetResult> {
    let (removed, unlinked) = store.delete_auto_faces()?;
    tracing::info!(removed, unlinked, "Reset automatic face clusters");
    Ok(ResetResult { removed, unlinked })
}
