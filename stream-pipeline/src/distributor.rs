//! Distributor - Picks the handler instance each message is handed to
//!
//! `Shuffle` and `LocalOrShuffle` are intentionally non-deterministic: the
//! same message may go to a different instance on every run. `Fields` is
//! deterministic for a fixed number of handler instances.

use std::hash::Hasher;

use rand::Rng;
use siphasher::sip::SipHasher13;

use crate::config::GroupingPolicy;
use crate::types::Message;

/// Round-robin placement of readers and handler instances onto logical workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    workers: usize,
    instances: usize,
}

impl Placement {
    /// # Panics
    ///
    /// Panics if `workers` is zero. [`PipelineConfig::validate`] rejects such
    /// configurations before a pipeline starts.
    ///
    /// [`PipelineConfig::validate`]: crate::config::PipelineConfig::validate
    pub fn new(workers: usize, instances: usize) -> Self {
        assert!(workers > 0, "workers must be > 0");
        Self { workers, instances }
    }

    pub fn worker_of_instance(&self, instance: usize) -> usize {
        instance % self.workers
    }

    pub fn worker_of_reader(&self, reader: usize) -> usize {
        reader % self.workers
    }

    /// Handler instances living on a worker
    pub fn instances_on(&self, worker: usize) -> Vec<usize> {
        (0..self.instances)
            .filter(|instance| self.worker_of_instance(*instance) == worker)
            .collect()
    }
}

pub struct Distributor {
    policy: GroupingPolicy,
    instance_count: usize,
    /// Instances co-located with the reader owning this distributor
    local_instances: Vec<usize>,
}

impl Distributor {
    /// Create the distributor used by a reader running on `worker`
    ///
    /// # Panics
    ///
    /// Panics if `instance_count` is zero, which [`PipelineConfig::validate`]
    /// rejects before a pipeline starts.
    ///
    /// [`PipelineConfig::validate`]: crate::config::PipelineConfig::validate
    pub fn new(policy: GroupingPolicy, instance_count: usize, placement: &Placement, worker: usize) -> Self {
        assert!(instance_count > 0, "instance_count must be > 0");
        Self {
            policy,
            instance_count,
            local_instances: placement.instances_on(worker),
        }
    }

    pub fn policy(&self) -> GroupingPolicy {
        self.policy
    }

    /// Index of the handler instance `message` goes to
    pub fn route(&self, message: &Message) -> usize {
        match self.policy {
            GroupingPolicy::Shuffle => self.shuffle(),
            GroupingPolicy::LocalOrShuffle => match self.local_instances.len() {
                0 => self.shuffle(),
                1 => self.local_instances[0],
                n => self.local_instances[rand::thread_rng().gen_range(0..n)],
            },
            GroupingPolicy::Fields(index) => {
                let key = message.field(index).unwrap_or_default();
                self.hash_route(key)
            }
        }
    }

    fn shuffle(&self) -> usize {
        rand::thread_rng().gen_range(0..self.instance_count)
    }

    fn hash_route(&self, key: &[u8]) -> usize {
        let mut hasher = SipHasher13::new();
        hasher.write(key);
        let hash = hasher.finish();

        (hash % self.instance_count as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn make_message(payload: &str) -> Message {
        Message::new(0, 0, payload.to_string())
    }

    #[test]
    fn test_same_key_routes_to_same_instance() {
        let placement = Placement::new(1, 4);
        let distributor = Distributor::new(GroupingPolicy::Fields(0), 4, &placement, 0);

        let target1 = distributor.route(&make_message("user-1\tclick"));
        for _ in 0..100 {
            assert_eq!(distributor.route(&make_message("user-1\tview")), target1);
        }
    }

    #[test]
    fn test_fields_routing_is_stable_across_distributors() {
        let placement = Placement::new(3, 5);
        let first = Distributor::new(GroupingPolicy::Fields(1), 5, &placement, 0);
        let second = Distributor::new(GroupingPolicy::Fields(1), 5, &placement, 2);

        for i in 0..50 {
            let message = make_message(&format!("{i}\tkey-{i}"));
            assert_eq!(first.route(&message), second.route(&message));
        }
    }

    #[test]
    fn test_missing_field_routes_deterministically() {
        let placement = Placement::new(1, 4);
        let distributor = Distributor::new(GroupingPolicy::Fields(3), 4, &placement, 0);

        let target = distributor.route(&make_message("only-one-field"));
        assert_eq!(distributor.route(&make_message("another")), target);
    }

    #[test]
    fn test_fields_distribution_across_instances() {
        let placement = Placement::new(1, 4);
        let distributor = Distributor::new(GroupingPolicy::Fields(0), 4, &placement, 0);

        let mut counts: HashMap<usize, usize> = HashMap::new();
        for i in 0..1000 {
            *counts
                .entry(distributor.route(&make_message(&format!("user-{i}"))))
                .or_default() += 1;
        }

        for instance in 0..4 {
            assert!(
                counts.get(&instance).copied().unwrap_or(0) > 50,
                "instance {instance} received too few messages"
            );
        }
    }

    #[test]
    fn test_shuffle_reaches_every_instance() {
        let placement = Placement::new(1, 3);
        let distributor = Distributor::new(GroupingPolicy::Shuffle, 3, &placement, 0);

        let targets: HashSet<usize> = (0..500)
            .map(|_| distributor.route(&make_message("Hello World")))
            .collect();
        assert_eq!(targets, HashSet::from([0, 1, 2]));
    }

    #[test]
    fn test_local_or_shuffle_prefers_local_instances() {
        // instances 0 and 2 live on worker 0, instance 1 on worker 1
        let placement = Placement::new(2, 3);
        let distributor = Distributor::new(GroupingPolicy::LocalOrShuffle, 3, &placement, 0);

        let targets: HashSet<usize> = (0..500)
            .map(|_| distributor.route(&make_message("Hello World")))
            .collect();
        assert_eq!(targets, HashSet::from([0, 2]));
    }

    #[test]
    fn test_local_or_shuffle_falls_back_without_local_instance() {
        // three workers but only two instances: worker 2 hosts none
        let placement = Placement::new(3, 2);
        assert!(placement.instances_on(2).is_empty());
        let distributor = Distributor::new(GroupingPolicy::LocalOrShuffle, 2, &placement, 2);

        let targets: HashSet<usize> = (0..500)
            .map(|_| distributor.route(&make_message("Hello World")))
            .collect();
        assert_eq!(targets, HashSet::from([0, 1]));
    }

    #[test]
    fn test_placement_round_robin() {
        let placement = Placement::new(3, 5);
        assert_eq!(placement.instances_on(0), vec![0, 3]);
        assert_eq!(placement.instances_on(1), vec![1, 4]);
        assert_eq!(placement.instances_on(2), vec![2]);
        assert_eq!(placement.worker_of_reader(4), 1);
    }
}
