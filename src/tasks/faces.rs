//! Face maintenance jobs.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use super::{TaskProgress, TaskUpdate};
use crate::config::FacesConfig;
use crate::db::FaceStore;
use crate::error::FacesError;
use crate::faces::cluster::KindFilter;
use crate::faces::events::{EventSink, LogSink};
use crate::faces::{
    audit, cluster, match_markers, optimize, AuditResult, ClusterOptions, ClusterResult, FaceIndex, MatchOptions,
    MatchResult, OptimizeResult,
};

const STEPS: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct MaintenanceOptions {
    pub faces: FacesConfig,
    pub filter: KindFilter,
    /// Re-match all markers instead of only stale ones.
    pub force: bool,
    /// Let the audit repair what it finds.
    pub fix: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceResult {
    pub clustered: ClusterResult,
    pub matched: MatchResult,
    pub optimized: OptimizeResult,
    pub audited: AuditResult,
}

impl MaintenanceResult {
    pub fn summary(&self) -> String {
        format!(
            "{} clusters created, {} markers updated ({} recognized, {} unknown), {} clusters merged, {} conflicts",
            self.clustered.created,
            self.matched.updated,
            self.matched.recognized,
            self.matched.unknown,
            self.optimized.merged,
            self.audited.conflicts,
        )
    }
}

fn step(cancel: &AtomicBool, progress: Option<&Sender<TaskUpdate>>, current: usize, name: &str) -> Result<()> {
    if cancel.load(Ordering::SeqCst) {
        return Err(FacesError::Canceled.into());
    }
    if let Some(tx) = progress {
        let _ = tx.send(TaskUpdate::Progress(TaskProgress::new(current, STEPS).with_item(name)));
    }
    Ok(())
}

/// Cluster new markers, match all stale ones, merge same-subject clusters
/// and audit the result.
pub fn run_maintenance(
    store: &dyn FaceStore,
    opts: &MaintenanceOptions,
    events: &dyn EventSink,
    cancel: &AtomicBool,
    progress: Option<&Sender<TaskUpdate>>,
) -> Result<MaintenanceResult> {
    if !opts.faces.enabled {
        return Err(FacesError::Disabled.into());
    }

    if let Some(tx) = progress {
        let _ = tx.send(TaskUpdate::Started { total: STEPS });
    }

    let mut result = MaintenanceResult::default();
    let match_dist = opts.faces.match_dist;

    step(cancel, progress, 1, "cluster")?;
    result.clustered = cluster(store, &ClusterOptions::from_config(&opts.faces, opts.filter.clone()), cancel)?;

    step(cancel, progress, 2, "match")?;
    let mut index = FaceIndex::build(store.all_faces()?);
    let mut match_opts = MatchOptions::from_config(&opts.faces, opts.force);
    match_opts.before = index.latest_update();
    result.matched = match_markers(store, &mut index, &match_opts, cancel)?;

    step(cancel, progress, 3, "optimize")?;
    result.optimized = optimize(store, None, match_dist)?;

    step(cancel, progress, 4, "audit")?;
    result.audited = audit(store, opts.fix, match_dist, events)?;

    Ok(result)
}

/// Run [`run_maintenance`] as a background task.
pub fn run_faces_background(
    store: Arc<dyn FaceStore>,
    opts: MaintenanceOptions,
    tx: Sender<TaskUpdate>,
    cancel: Arc<AtomicBool>,
) {
    match run_maintenance(store.as_ref(), &opts, &LogSink, &cancel, Some(&tx)) {
        Ok(result) => {
            let _ = tx.send(TaskUpdate::Completed {
                message: result.summary(),
            });
        }
        Err(e) if FacesError::is_canceled(&e) => {
            let _ = tx.send(TaskUpdate::Cancelled);
        }
        Err(e) => {
            tracing::error!(error = %e, "Face maintenance failed");
            let _ = tx.send(TaskUpdate::Failed { error: e.to_string() });
        }
    }
}
