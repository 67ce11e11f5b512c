//! Load balancing strategies over a group's selectable channels.
//!
//! Balancers are shared across request tasks, so each keeps its state behind
//! a mutex. The channel list may change between calls; balancers with cached
//! per-name state treat unknown names as freshly snapshotted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::channel::{Channel, LbStrategy};
use crate::error::AppError;

pub trait LoadBalancer: Send + Sync {
    fn next(&self, channels: &[Channel]) -> Result<Channel, AppError>;
}

pub fn create(strategy: LbStrategy) -> Arc<dyn LoadBalancer> {
    match strategy {
        LbStrategy::Priority => Arc::new(PriorityBalancer),
        LbStrategy::RoundRobin => Arc::new(RoundRobinBalancer::default()),
        LbStrategy::WeightedRound => Arc::new(WeightedRoundBalancer::default()),
        LbStrategy::Random => Arc::new(RandomBalancer),
    }
}

fn ensure_non_empty(channels: &[Channel]) -> Result<(), AppError> {
    if channels.is_empty() {
        Err(AppError::NoChannelAvailable("channel list is empty".into()))
    } else {
        Ok(())
    }
}

/// Picks the channel with the numerically smallest priority; ties are broken
/// by iteration order.
pub struct PriorityBalancer;

impl LoadBalancer for PriorityBalancer {
    fn next(&self, channels: &[Channel]) -> Result<Channel, AppError> {
        ensure_non_empty(channels)?;
        let mut selected = &channels[0];
        for channel in &channels[1..] {
            if channel.priority < selected.priority {
                selected = channel;
            }
        }
        log::debug!(
            "priority balancer picked channel={} priority={}",
            selected.name,
            selected.priority
        );
        Ok(selected.clone())
    }
}

/// Monotonically increasing index over the filtered list.
#[derive(Default)]
pub struct RoundRobinBalancer {
    current: Mutex<usize>,
}

impl LoadBalancer for RoundRobinBalancer {
    fn next(&self, channels: &[Channel]) -> Result<Channel, AppError> {
        ensure_non_empty(channels)?;
        let mut current = self.current.lock().unwrap();
        let channel = channels[*current % channels.len()].clone();
        *current += 1;
        log::debug!("round robin picked channel={} index={}", channel.name, *current - 1);
        Ok(channel)
    }
}

struct WeightState {
    weights: HashMap<String, u32>,
    current: HashMap<String, u32>,
}

/// Snapshot weights from channel priorities on first use (0 counts as 1),
/// spend quota per call and replenish when exhausted.
#[derive(Default)]
pub struct WeightedRoundBalancer {
    state: Mutex<Option<WeightState>>,
}

impl WeightedRoundBalancer {
    fn snapshot_weight(channel: &Channel) -> u32 {
        (channel.priority as u32).max(1)
    }
}

impl LoadBalancer for WeightedRoundBalancer {
    fn next(&self, channels: &[Channel]) -> Result<Channel, AppError> {
        ensure_non_empty(channels)?;
        let mut guard = self.state.lock().unwrap();
        let state = guard.get_or_insert_with(|| {
            let mut weights = HashMap::new();
            let mut current = HashMap::new();
            for channel in channels {
                let weight = Self::snapshot_weight(channel);
                weights.insert(channel.name.clone(), weight);
                current.insert(channel.name.clone(), weight);
            }
            WeightState { weights, current }
        });

        // Names not seen at snapshot time get the snapshot value.
        for channel in channels {
            if !state.weights.contains_key(&channel.name) {
                let weight = Self::snapshot_weight(channel);
                state.weights.insert(channel.name.clone(), weight);
                state.current.insert(channel.name.clone(), weight);
            }
        }

        for channel in channels {
            let quota = state.current.get_mut(&channel.name).unwrap();
            if *quota > 0 {
                *quota -= 1;
                return Ok(channel.clone());
            }
        }

        // All quotas spent: replenish and take the first.
        for (name, weight) in &state.weights {
            state.current.insert(name.clone(), *weight);
        }
        let first = channels[0].clone();
        *state.current.get_mut(&first.name).unwrap() -= 1;
        log::debug!("weighted round robin replenished, picked channel={}", first.name);
        Ok(first)
    }
}

/// Uniform random selection.
pub struct RandomBalancer;

impl LoadBalancer for RandomBalancer {
    fn next(&self, channels: &[Channel]) -> Result<Channel, AppError> {
        ensure_non_empty(channels)?;
        let index = rand::rng().random_range(0..channels.len());
        Ok(channels[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::model_mapping::ModelMapper;
    use crate::channel::Status;

    fn channel(name: &str, priority: u8) -> Channel {
        Channel {
            name: name.into(),
            enabled: true,
            priority,
            url: format!("https://{}.example.com", name),
            api_key: String::new(),
            provider: "openai".into(),
            model_mapping: HashMap::new(),
            status: Status::Normal,
            test_model: String::new(),
            converter_name: String::new(),
            mapper: ModelMapper::new(),
            models: Vec::new(),
        }
    }

    #[test]
    fn every_balancer_fails_on_empty_list() {
        for strategy in [
            LbStrategy::Priority,
            LbStrategy::RoundRobin,
            LbStrategy::WeightedRound,
            LbStrategy::Random,
        ] {
            let err = create(strategy).next(&[]).unwrap_err();
            assert!(matches!(err, AppError::NoChannelAvailable(_)));
        }
    }

    #[test]
    fn every_balancer_returns_a_member() {
        let channels = vec![channel("a", 2), channel("b", 1), channel("c", 3)];
        for strategy in [
            LbStrategy::Priority,
            LbStrategy::RoundRobin,
            LbStrategy::WeightedRound,
            LbStrategy::Random,
        ] {
            let balancer = create(strategy);
            for _ in 0..10 {
                let picked = balancer.next(&channels).unwrap();
                assert!(channels.iter().any(|c| c.name == picked.name));
            }
        }
    }

    #[test]
    fn priority_picks_smallest_value() {
        let channels = vec![channel("a", 2), channel("b", 0), channel("c", 1)];
        let picked = PriorityBalancer.next(&channels).unwrap();
        assert_eq!(picked.name, "b");
    }

    #[test]
    fn priority_ties_break_by_iteration_order() {
        let channels = vec![channel("x", 1), channel("y", 1)];
        assert_eq!(PriorityBalancer.next(&channels).unwrap().name, "x");
    }

    #[test]
    fn round_robin_cycles() {
        let channels = vec![channel("a", 0), channel("b", 0), channel("c", 0)];
        let balancer = RoundRobinBalancer::default();
        let names: Vec<String> = (0..6)
            .map(|_| balancer.next(&channels).unwrap().name)
            .collect();
        assert_eq!(names, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn round_robin_survives_list_shrink() {
        let balancer = RoundRobinBalancer::default();
        let three = vec![channel("a", 0), channel("b", 0), channel("c", 0)];
        for _ in 0..5 {
            balancer.next(&three).unwrap();
        }
        let one = vec![channel("a", 0)];
        assert_eq!(balancer.next(&one).unwrap().name, "a");
    }

    #[test]
    fn weighted_round_spends_quota_then_replenishes() {
        let channels = vec![channel("a", 2), channel("b", 1)];
        let balancer = WeightedRoundBalancer::default();
        let names: Vec<String> = (0..6)
            .map(|_| balancer.next(&channels).unwrap().name)
            .collect();
        // a has weight 2, b weight 1; after the quotas drain the cycle
        // replenishes starting from the first channel again.
        assert_eq!(names, ["a", "a", "b", "a", "a", "b"]);
    }

    #[test]
    fn weighted_round_treats_zero_priority_as_one() {
        let channels = vec![channel("a", 0)];
        let balancer = WeightedRoundBalancer::default();
        for _ in 0..3 {
            assert_eq!(balancer.next(&channels).unwrap().name, "a");
        }
    }

    #[test]
    fn weighted_round_tolerates_unknown_names() {
        let balancer = WeightedRoundBalancer::default();
        let initial = vec![channel("a", 1)];
        balancer.next(&initial).unwrap();

        let grown = vec![channel("a", 1), channel("d", 2)];
        for _ in 0..5 {
            let picked = balancer.next(&grown).unwrap();
            assert!(grown.iter().any(|c| c.name == picked.name));
        }
    }

    #[test]
    fn balancers_are_safe_under_concurrency() {
        let channels = Arc::new(vec![channel("a", 1), channel("b", 2)]);
        let balancer: Arc<dyn LoadBalancer> = create(LbStrategy::RoundRobin);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let balancer = balancer.clone();
            let channels = channels.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    balancer.next(&channels).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
