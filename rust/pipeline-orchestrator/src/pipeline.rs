//! Registered pipelines.
//!
//! The orchestrator treats a pipeline as an id plus a list of prerequisite
//! pipelines. Everything else about it belongs to whatever runs it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Pipeline metadata known to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Unique pipeline identifier.
    pub id: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Pipelines that must have completed before this one is scheduled.
    #[serde(default)]
    pub prerequisites: Vec<String>,
}

impl PipelineSpec {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            prerequisites: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_prerequisites<I, S>(mut self, prerequisites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prerequisites = prerequisites.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Thread-safe pipeline registry.
#[derive(Debug, Clone, Default)]
pub struct PipelineRegistry {
    pipelines: Arc<RwLock<HashMap<String, PipelineSpec>>>,
}

impl PipelineRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a pipeline. Returns `true` if it was not known before.
    pub fn register(&self, spec: PipelineSpec) -> bool {
        self.pipelines.write().insert(spec.id.clone(), spec).is_none()
    }

    pub fn get(&self, id: &str) -> Option<PipelineSpec> {
        self.pipelines.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pipelines.read().contains_key(id)
    }

    /// All pipelines ordered by id.
    pub fn list(&self) -> Vec<PipelineSpec> {
        let mut pipelines: Vec<PipelineSpec> = self.pipelines.read().values().cloned().collect();
        pipelines.sort_by(|a, b| a.id.cmp(&b.id));
        pipelines
    }

    pub fn len(&self) -> usize {
        self.pipelines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_upsert() {
        let registry = PipelineRegistry::new();
        assert!(registry.register(PipelineSpec::new("load")));
        assert!(!registry.register(PipelineSpec::new("load").with_prerequisites(["extract"])));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("load").unwrap().prerequisites, vec!["extract"]);
    }

    #[test]
    fn test_list_is_sorted() {
        let registry = PipelineRegistry::new();
        registry.register(PipelineSpec::new("b"));
        registry.register(PipelineSpec::new("a").with_description("first"));

        let ids: Vec<String> = registry.list().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(registry.contains("a"));
        assert!(!registry.contains("c"));
    }
}
