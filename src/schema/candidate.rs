//! Candidate prompt representation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a candidate. Unique within a population.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(pub String);

impl CandidateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CandidateId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CandidateId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One prompt variant under optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Unique identifier.
    pub id: CandidateId,
    /// Prompt text.
    pub prompt: String,
    /// Generation this candidate was created in.
    #[serde(default)]
    pub generation: u64,
    /// Fitness for the current evaluation pass. `None` until evaluated.
    #[serde(default)]
    pub fitness: Option<f64>,
    /// Parent IDs (for genealogy).
    #[serde(default)]
    pub parents: Vec<CandidateId>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Candidate {
    /// Create an unevaluated candidate.
    pub fn new(id: impl Into<CandidateId>, prompt: impl Into<String>, generation: u64) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            generation,
            fitness: None,
            parents: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Set parent lineage.
    pub fn with_parents(mut self, parents: Vec<CandidateId>) -> Self {
        self.parents = parents;
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Whether a fitness value has been written for this pass.
    pub fn is_evaluated(&self) -> bool {
        self.fitness.is_some()
    }
}
