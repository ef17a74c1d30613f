//! Novelty archive: bounded history of candidates that were novel when seen.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::schema::{Candidate, CandidateId};

/// An archived candidate with the novelty it had on admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedCandidate {
    pub candidate: Candidate,
    pub novelty: f64,
    /// Generation the candidate was archived in.
    pub generation: u64,
}

/// Archive of novel candidates that later novelty scores are measured
/// against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoveltyArchive {
    entries: HashMap<CandidateId, ArchivedCandidate>,
    max_size: usize,
    threshold: f64,
}

impl NoveltyArchive {
    /// Create an archive holding at most `max_size` candidates with novelty at
    /// or above `threshold`.
    pub fn new(max_size: usize, threshold: f64) -> Self {
        Self {
            entries: HashMap::new(),
            max_size,
            threshold,
        }
    }

    /// Offer a candidate. Returns whether it was admitted.
    ///
    /// A full archive evicts its least novel entry, but only for a more novel
    /// newcomer.
    pub fn consider(&mut self, candidate: &Candidate, novelty: f64, generation: u64) -> bool {
        if self.max_size == 0
            || novelty < self.threshold
            || !novelty.is_finite()
            || self.entries.contains_key(&candidate.id)
        {
            return false;
        }

        if self.entries.len() >= self.max_size {
            let Some(weakest) = self
                .entries
                .values()
                .min_by(|a, b| a.novelty.total_cmp(&b.novelty))
                .map(|e| (e.candidate.id.clone(), e.novelty))
            else {
                return false;
            };
            if novelty <= weakest.1 {
                return false;
            }
            self.entries.remove(&weakest.0);
        }

        self.entries.insert(
            candidate.id.clone(),
            ArchivedCandidate {
                candidate: candidate.clone(),
                novelty,
                generation,
            },
        );
        true
    }

    pub fn get(&self, id: &CandidateId) -> Option<&ArchivedCandidate> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &CandidateId) -> bool {
        self.entries.contains_key(id)
    }

    /// Archived candidates, ordered by id.
    pub fn candidates(&self) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> =
            self.entries.values().map(|e| e.candidate.clone()).collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates
    }

    /// The `n` most novel entries.
    pub fn top_n(&self, n: usize) -> Vec<&ArchivedCandidate> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            b.novelty
                .total_cmp(&a.novelty)
                .then_with(|| a.candidate.id.cmp(&b.candidate.id))
        });
        entries.truncate(n);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the archive as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
    }

    /// Load an archive written by [`NoveltyArchive::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: &str) -> Candidate {
        Candidate::new(id, format!("prompt {id}"), 0)
    }

    #[test]
    fn test_threshold_and_duplicates() {
        let mut archive = NoveltyArchive::new(10, 0.5);
        assert!(!archive.consider(&cand("a"), 0.4, 0));
        assert!(archive.consider(&cand("a"), 0.6, 0));
        assert!(!archive.consider(&cand("a"), 0.9, 1));
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.get(&"a".into()).unwrap().novelty, 0.6);
    }

    #[test]
    fn test_full_archive_evicts_least_novel() {
        let mut archive = NoveltyArchive::new(2, 0.0);
        archive.consider(&cand("a"), 0.3, 0);
        archive.consider(&cand("b"), 0.8, 0);

        assert!(!archive.consider(&cand("c"), 0.2, 1));
        assert!(archive.consider(&cand("d"), 0.5, 1));
        assert_eq!(archive.len(), 2);
        assert!(!archive.contains(&"a".into()));

        let top: Vec<&str> = archive
            .top_n(2)
            .iter()
            .map(|e| e.candidate.id.as_str())
            .collect();
        assert_eq!(top, vec!["b", "d"]);
    }

    #[test]
    fn test_zero_capacity() {
        let mut archive = NoveltyArchive::new(0, 0.0);
        assert!(!archive.consider(&cand("a"), 1.0, 0));
        assert!(archive.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.json");

        let mut archive = NoveltyArchive::new(4, 0.1);
        archive.consider(&cand("x"), 0.7, 3);
        archive.save(&path).unwrap();

        let loaded = NoveltyArchive::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get(&"x".into()).unwrap().generation, 3);
        assert_eq!(loaded.candidates(), archive.candidates());

        fs::write(&path, "nope").unwrap();
        assert!(NoveltyArchive::load(&path).is_err());
    }
}
