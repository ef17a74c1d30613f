//! Population store: the authoritative set of candidates and their fitness.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::{Candidate, CandidateId};

/// Candidates of the current generation, keyed by id and kept in insertion
/// order.
#[derive(Debug, Default)]
pub struct PopulationStore {
    candidates: Vec<Candidate>,
    index: HashMap<CandidateId, usize>,
    generation: u64,
    next_id: AtomicU64,
}

/// Summary statistics over the evaluated candidates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopulationStats {
    pub size: usize,
    pub evaluated: usize,
    pub best_fitness: Option<f64>,
    pub mean_fitness: Option<f64>,
    pub fitness_std: Option<f64>,
}

/// Immutable view of the population at one point in time.
#[derive(Debug, Clone)]
pub struct PopulationSnapshot {
    pub generation: u64,
    pub candidates: Arc<[Candidate]>,
}

impl PopulationSnapshot {
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn get(&self, id: &CandidateId) -> Option<&Candidate> {
        self.candidates.iter().find(|c| &c.id == id)
    }
}

impl PopulationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh candidate id (`cand-N`) not present in the store.
    pub fn next_id(&self) -> CandidateId {
        loop {
            let n = self.next_id.fetch_add(1, Ordering::Relaxed);
            let id = CandidateId(format!("cand-{n}"));
            if !self.index.contains_key(&id) {
                return id;
            }
        }
    }

    fn validate_new(&self, candidate: &Candidate) -> Result<()> {
        if candidate.id.as_str().trim().is_empty() {
            return Err(Error::Validation("Candidate id must be non-empty".to_string()));
        }
        if candidate.prompt.trim().is_empty() {
            return Err(Error::Validation(format!(
                "Candidate {} has an empty prompt",
                candidate.id
            )));
        }
        if let Some(f) = candidate.fitness
            && !f.is_finite()
        {
            return Err(Error::Validation(format!(
                "Candidate {} has non-finite fitness",
                candidate.id
            )));
        }
        Ok(())
    }

    /// Insert a new candidate.
    pub fn insert(&mut self, candidate: Candidate) -> Result<()> {
        self.validate_new(&candidate)?;
        if self.index.contains_key(&candidate.id) {
            return Err(Error::Validation(format!(
                "Candidate {} already exists",
                candidate.id
            )));
        }
        self.index
            .insert(candidate.id.clone(), self.candidates.len());
        self.candidates.push(candidate);
        Ok(())
    }

    /// Insert a batch of candidates, or none of them if any is invalid.
    pub fn insert_all(&mut self, candidates: Vec<Candidate>) -> Result<()> {
        let mut seen = HashSet::new();
        for candidate in &candidates {
            self.validate_new(candidate)?;
            if self.index.contains_key(&candidate.id) || !seen.insert(&candidate.id) {
                return Err(Error::Validation(format!(
                    "Candidate {} already exists",
                    candidate.id
                )));
            }
        }
        for candidate in candidates {
            self.index
                .insert(candidate.id.clone(), self.candidates.len());
            self.candidates.push(candidate);
        }
        Ok(())
    }

    /// Overwrite fitness for the current evaluation pass.
    pub fn update_fitness(&mut self, id: &CandidateId, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(Error::Validation(format!(
                "Fitness for {id} must be finite, got {value}"
            )));
        }
        let idx = *self
            .index
            .get(id)
            .ok_or_else(|| Error::candidate_not_found(id.as_str()))?;
        self.candidates[idx].fitness = Some(value);
        Ok(())
    }

    /// Highest-fitness evaluated candidate. Ties go to the earliest.
    pub fn best_candidate(&self) -> Option<&Candidate> {
        self.candidates
            .iter()
            .filter_map(|c| c.fitness.map(|f| (c, f)))
            .fold(None, |best: Option<(&Candidate, f64)>, (c, f)| match best {
                Some((_, bf)) if bf >= f => best,
                _ => Some((c, f)),
            })
            .map(|(c, _)| c)
    }

    /// Evaluated candidates in insertion order.
    pub fn evaluated_candidates(&self) -> Vec<&Candidate> {
        self.candidates.iter().filter(|c| c.is_evaluated()).collect()
    }

    /// Ids of candidates not yet evaluated this pass.
    pub fn unevaluated_ids(&self) -> Vec<CandidateId> {
        self.candidates
            .iter()
            .filter(|c| !c.is_evaluated())
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn get(&self, id: &CandidateId) -> Result<&Candidate> {
        self.index
            .get(id)
            .map(|&idx| &self.candidates[idx])
            .ok_or_else(|| Error::candidate_not_found(id.as_str()))
    }

    pub fn contains(&self, id: &CandidateId) -> bool {
        self.index.contains_key(id)
    }

    /// Remove a candidate.
    pub fn remove(&mut self, id: &CandidateId) -> Result<Candidate> {
        let idx = self
            .index
            .remove(id)
            .ok_or_else(|| Error::candidate_not_found(id.as_str()))?;
        let removed = self.candidates.remove(idx);
        for slot in self.index.values_mut() {
            if *slot > idx {
                *slot -= 1;
            }
        }
        Ok(removed)
    }

    /// Replace a candidate in place, keeping its slot in insertion order.
    pub fn replace(&mut self, old: &CandidateId, candidate: Candidate) -> Result<Candidate> {
        self.validate_new(&candidate)?;
        let idx = *self
            .index
            .get(old)
            .ok_or_else(|| Error::candidate_not_found(old.as_str()))?;
        if &candidate.id != old && self.index.contains_key(&candidate.id) {
            return Err(Error::Validation(format!(
                "Candidate {} already exists",
                candidate.id
            )));
        }
        self.index.remove(old);
        self.index.insert(candidate.id.clone(), idx);
        Ok(std::mem::replace(&mut self.candidates[idx], candidate))
    }

    /// Clear every fitness value to start a new evaluation pass.
    pub fn reset_fitness(&mut self) {
        for candidate in &mut self.candidates {
            candidate.fitness = None;
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Move to the next generation.
    pub fn advance_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter()
    }

    /// Top `n` evaluated candidates by fitness.
    pub fn top_n(&self, n: usize) -> Vec<&Candidate> {
        let mut evaluated = self.evaluated_candidates();
        evaluated.sort_by(|a, b| {
            b.fitness
                .unwrap_or(f64::NEG_INFINITY)
                .total_cmp(&a.fitness.unwrap_or(f64::NEG_INFINITY))
        });
        evaluated.truncate(n);
        evaluated
    }

    pub fn stats(&self) -> PopulationStats {
        let fitness: Vec<f64> = self.candidates.iter().filter_map(|c| c.fitness).collect();
        if fitness.is_empty() {
            return PopulationStats {
                size: self.len(),
                ..Default::default()
            };
        }
        let n = fitness.len() as f64;
        let mean = fitness.iter().sum::<f64>() / n;
        let variance = fitness.iter().map(|f| (f - mean).powi(2)).sum::<f64>() / n;
        PopulationStats {
            size: self.len(),
            evaluated: fitness.len(),
            best_fitness: fitness.iter().copied().reduce(f64::max),
            mean_fitness: Some(mean),
            fitness_std: Some(variance.sqrt()),
        }
    }

    /// Immutable copy for analysis.
    pub fn snapshot(&self) -> PopulationSnapshot {
        PopulationSnapshot {
            generation: self.generation,
            candidates: self.candidates.clone().into(),
        }
    }
}

/// Shared handle that serializes every mutation of one store.
#[derive(Debug, Clone, Default)]
pub struct PopulationHandle {
    inner: Arc<Mutex<PopulationStore>>,
}

impl PopulationHandle {
    pub fn new(store: PopulationStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Lock the store. A poisoned lock is recovered; store operations keep
    /// their invariants even if a holder panicked.
    pub fn lock(&self) -> MutexGuard<'_, PopulationStore> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, candidate: Candidate) -> Result<()> {
        self.lock().insert(candidate)
    }

    pub fn update_fitness(&self, id: &CandidateId, value: f64) -> Result<()> {
        self.lock().update_fitness(id, value)
    }

    pub fn get(&self, id: &CandidateId) -> Result<Candidate> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &CandidateId) -> bool {
        self.lock().contains(id)
    }

    pub fn best_candidate(&self) -> Option<Candidate> {
        self.lock().best_candidate().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take an immutable snapshot for analysis.
    pub fn snapshot(&self) -> PopulationSnapshot {
        self.lock().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store_with(prompts: &[&str]) -> PopulationStore {
        let mut store = PopulationStore::new();
        for (i, p) in prompts.iter().enumerate() {
            store
                .insert(Candidate::new(format!("c{i}"), *p, 0))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_insert_validates() {
        let mut store = store_with(&["a"]);
        assert!(store.insert(Candidate::new("c0", "dup", 0)).is_err());
        assert!(store.insert(Candidate::new("c9", "   ", 0)).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_update_fitness_unknown_leaves_store_unchanged() {
        let mut store = store_with(&["a", "b", "c"]);
        store.update_fitness(&"c0".into(), 0.4).unwrap();
        store.update_fitness(&"c2".into(), 0.9).unwrap();
        let before: Vec<Option<f64>> = store.iter().map(|c| c.fitness).collect();

        let err = store.update_fitness(&"ghost".into(), 1.0).unwrap_err();
        assert!(err.is_not_found());

        let after: Vec<Option<f64>> = store.iter().map(|c| c.fitness).collect();
        assert_eq!(store.len(), 3);
        assert_eq!(before, after);
    }

    #[test]
    fn test_update_fitness_rejects_non_finite() {
        let mut store = store_with(&["a"]);
        assert!(store.update_fitness(&"c0".into(), f64::NAN).is_err());
        assert!(store.get(&"c0".into()).unwrap().fitness.is_none());
    }

    #[test]
    fn test_best_candidate() {
        let mut store = PopulationStore::new();
        assert!(store.best_candidate().is_none());

        store.insert(Candidate::new("a", "one", 0)).unwrap();
        store.insert(Candidate::new("b", "two", 0)).unwrap();
        assert!(store.best_candidate().is_none());

        store.update_fitness(&"a".into(), 0.3).unwrap();
        store.update_fitness(&"b".into(), 0.8).unwrap();
        assert_eq!(store.best_candidate().unwrap().id.as_str(), "b");
    }

    #[test]
    fn test_evaluated_candidates_in_insertion_order() {
        let mut store = store_with(&["a", "b", "c", "d"]);
        store.update_fitness(&"c3".into(), 0.1).unwrap();
        store.update_fitness(&"c1".into(), 0.9).unwrap();

        let ids: Vec<&str> = store
            .evaluated_candidates()
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, vec!["c1", "c3"]);
        assert_eq!(
            store.unevaluated_ids(),
            vec![CandidateId::from("c0"), CandidateId::from("c2")]
        );
    }

    #[test]
    fn test_replace_keeps_position_and_remove_reindexes() {
        let mut store = store_with(&["a", "b", "c"]);
        let old = store
            .replace(&"c1".into(), Candidate::new("n1", "fresh", 1))
            .unwrap();
        assert_eq!(old.prompt, "b");
        let ids: Vec<&str> = store.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c0", "n1", "c2"]);
        assert!(store.get(&"c1".into()).is_err());

        store.remove(&"c0".into()).unwrap();
        assert_eq!(store.get(&"c2".into()).unwrap().prompt, "c");
        assert!(store.remove(&"c0".into()).is_err());
    }

    #[test]
    fn test_stats_and_top_n() {
        let mut store = store_with(&["a", "b", "c"]);
        assert_eq!(store.stats().evaluated, 0);

        store.update_fitness(&"c0".into(), 0.2).unwrap();
        store.update_fitness(&"c1".into(), 0.6).unwrap();
        let stats = store.stats();
        assert_eq!(stats.evaluated, 2);
        assert_eq!(stats.best_fitness, Some(0.6));
        assert!((stats.mean_fitness.unwrap() - 0.4).abs() < 1e-12);

        let top = store.top_n(1);
        assert_eq!(top[0].id.as_str(), "c1");
    }

    #[test]
    fn test_snapshot_is_isolated() {
        let handle = PopulationHandle::new(store_with(&["a", "b"]));
        let snapshot = handle.snapshot();
        handle.update_fitness(&"c0".into(), 1.0).unwrap();

        assert!(snapshot.get(&"c0".into()).unwrap().fitness.is_none());
        assert_eq!(handle.get(&"c0".into()).unwrap().fitness, Some(1.0));
    }

    #[test]
    fn test_next_id_skips_existing() {
        let mut store = PopulationStore::new();
        store.insert(Candidate::new("cand-0", "taken", 0)).unwrap();
        assert_eq!(store.next_id().as_str(), "cand-1");
    }

    #[test]
    fn test_insert_all_is_atomic() {
        let mut store = store_with(&["a"]);
        let batch = vec![
            Candidate::new("n0", "fine", 0),
            Candidate::new("n1", "also fine", 0),
            Candidate::new("n2", "  ", 0),
        ];
        assert!(store.insert_all(batch).is_err());
        assert_eq!(store.len(), 1);

        let dup = vec![Candidate::new("n0", "x", 0), Candidate::new("n0", "y", 0)];
        assert!(store.insert_all(dup).is_err());
        assert_eq!(store.len(), 1);

        store
            .insert_all(vec![Candidate::new("n0", "x", 0), Candidate::new("n1", "y", 0)])
            .unwrap();
        let ids: Vec<&str> = store.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["c0", "n0", "n1"]);
    }

    proptest! {
        #[test]
        fn prop_best_is_max_of_evaluated(
            fitness in prop::collection::vec(prop::option::of(-10.0f64..10.0), 0..32)
        ) {
            let mut store = PopulationStore::new();
            for (i, f) in fitness.iter().enumerate() {
                let id = CandidateId::from(format!("c{i}"));
                store.insert(Candidate::new(id.clone(), format!("prompt {i}"), 0)).unwrap();
                if let Some(f) = f {
                    store.update_fitness(&id, *f).unwrap();
                }
            }

            let evaluated: Vec<f64> = store.evaluated_candidates().iter().filter_map(|c| c.fitness).collect();
            prop_assert_eq!(evaluated.len(), fitness.iter().flatten().count());
            prop_assert_eq!(store.len(), fitness.len());

            match store.best_candidate() {
                None => prop_assert!(evaluated.is_empty()),
                Some(best) => {
                    let max = evaluated.iter().copied().fold(f64::MIN, f64::max);
                    prop_assert_eq!(best.fitness, Some(max));
                }
            }
        }
    }
}
