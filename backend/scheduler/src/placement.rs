//! Runner placement: which cluster member should run a job.
//!
//! Only members sharing the highest runner priority are eligible. Among them,
//! the chance of being picked is proportional to the runner weight.

use uuid::Uuid;

/// A cluster member able to run jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerCandidate {
    pub instance_id: String,
    pub runner_priority: i32,
    pub runner_weight: i32,
}

/// Placement policy.
pub trait RunnerSelector: Send + Sync {
    /// Choose a runner for a job. `affinity` is the job's runner hash; 0 means none.
    fn select(&self, candidates: &[RunnerCandidate], affinity: i64) -> Option<String>;
}

/// Weighted set of the top-priority runners.
#[derive(Debug, Clone, Default)]
pub struct RunnerSet {
    /// (cumulative weight upper bound, instance id)
    slots: Vec<(u64, String)>,
    total: u64,
}

impl RunnerSet {
    pub fn from_candidates(candidates: &[RunnerCandidate]) -> Self {
        let mut set = Self::default();
        let Some(top) = candidates.iter().map(|c| c.runner_priority).max() else {
            return set;
        };
        let mut eligible: Vec<&RunnerCandidate> = candidates
            .iter()
            .filter(|c| c.runner_priority == top && c.runner_weight > 0)
            .collect();
        // stable order so every member maps the same hash to the same runner
        eligible.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        for candidate in eligible {
            set.total += candidate.runner_weight as u64;
            set.slots.push((set.total, candidate.instance_id.clone()));
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.slots.iter().any(|(_, id)| id == instance_id)
    }

    pub fn runner_ids(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|(_, id)| id.as_str())
    }

    /// Weighted random pick.
    pub fn pick_random(&self) -> Option<String> {
        if self.total == 0 {
            return None;
        }
        let value = (Uuid::new_v4().as_u128() % u128::from(self.total)) as u64;
        self.slot_for(value)
    }

    /// Deterministic weighted pick for a non-zero affinity hash; random otherwise.
    pub fn pick_by_hash(&self, hash: i64) -> Option<String> {
        if hash == 0 {
            return self.pick_random();
        }
        if self.total == 0 {
            return None;
        }
        let value = (hash.unsigned_abs() % self.total) as u64;
        self.slot_for(value)
    }

    fn slot_for(&self, value: u64) -> Option<String> {
        self.slots
            .iter()
            .find(|(upper, _)| value < *upper)
            .map(|(_, id)| id.clone())
    }
}

/// Default policy: [`RunnerSet`] over the candidates, honoring job affinity.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedRunnerSelector;

impl RunnerSelector for WeightedRunnerSelector {
    fn select(&self, candidates: &[RunnerCandidate], affinity: i64) -> Option<String> {
        RunnerSet::from_candidates(candidates).pick_by_hash(affinity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn runner(id: &str, priority: i32, weight: i32) -> RunnerCandidate {
        RunnerCandidate {
            instance_id: id.to_string(),
            runner_priority: priority,
            runner_weight: weight,
        }
    }

    #[test]
    fn only_top_priority_runners_are_eligible() {
        let set = RunnerSet::from_candidates(&[
            runner("a", 100, 100),
            runner("b", 200, 100),
            runner("c", 200, 50),
        ]);
        assert!(!set.contains("a"));
        assert!(set.contains("b"));
        assert!(set.contains("c"));
        for _ in 0..50 {
            assert_ne!(set.pick_random().as_deref(), Some("a"));
        }
    }

    #[test]
    fn hash_pick_is_deterministic() {
        let candidates = [runner("x", 1, 10), runner("y", 1, 30)];
        let first = WeightedRunnerSelector.select(&candidates, 1234);
        for _ in 0..10 {
            assert_eq!(WeightedRunnerSelector.select(&candidates, 1234), first);
        }
        // same answer whatever order the members were listed in
        let reversed = [runner("y", 1, 30), runner("x", 1, 10)];
        assert_eq!(WeightedRunnerSelector.select(&reversed, 1234), first);
    }

    #[test]
    fn hashes_spread_by_weight() {
        let set = RunnerSet::from_candidates(&[runner("x", 1, 10), runner("y", 1, 30)]);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for hash in 1..=400 {
            *counts.entry(set.pick_by_hash(hash).unwrap()).or_default() += 1;
        }
        assert_eq!(counts["x"], 100);
        assert_eq!(counts["y"], 300);
    }

    #[test]
    fn empty_set_selects_nobody() {
        assert!(RunnerSet::from_candidates(&[]).pick_random().is_none());
        assert!(WeightedRunnerSelector
            .select(&[runner("z", 1, 0)], 9)
            .is_none());
    }
}
