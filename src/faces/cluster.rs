//! Reference clusters used to classify embeddings.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::embedding::Embedding;

/// A reference point with an acceptance radius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub embedding: Embedding,
    pub radius: f64,
    #[serde(default)]
    pub disabled: bool,
}

impl Cluster {
    pub fn new(embedding: Embedding, radius: f64) -> Self {
        Self {
            embedding,
            radius,
            disabled: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Clusters(Vec<Cluster>);

impl Clusters {
    pub fn new(items: Vec<Cluster>) -> Self {
        Self(items)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn enabled(&self) -> impl Iterator<Item = &Cluster> {
        self.0.iter().filter(|c| !c.disabled)
    }

    /// Raw distance from `e` to the closest enabled cluster, or -1 if no
    /// enabled cluster is comparable.
    pub fn dist(&self, e: &Embedding) -> f64 {
        self.enabled()
            .map(|c| c.embedding.dist(e))
            .filter(|d| *d >= 0.0)
            .fold(-1.0, |best, d| if best < 0.0 || d < best { d } else { best })
    }

    /// True if the normalized `e` falls within the radius of an enabled cluster.
    pub fn contains(&self, e: &Embedding) -> bool {
        let probe = e.normalized();
        self.enabled().any(|c| {
            let d = c.embedding.dist(&probe);
            d >= 0.0 && d <= c.radius
        })
    }
}

/// Reference clusters for faces that are excluded from matching.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KindFilter {
    #[serde(default)]
    pub kids: Clusters,
    #[serde(default)]
    pub ignored: Clusters,
}

impl KindFilter {
    /// Load from a JSON file `{ "kids": [...], "ignored": [...] }`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read kind filter {}", path.display()))?;
        let filter: KindFilter = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse kind filter {}", path.display()))?;
        tracing::debug!(
            kids = filter.kids.0.len(),
            ignored = filter.ignored.0.len(),
            "Loaded kind filter"
        );
        Ok(filter)
    }

    /// Load the configured filter, or an empty one when none is set.
    pub fn from_config(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
