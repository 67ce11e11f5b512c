//! Channel groups and upstream channels.
//!
//! A group is keyed by the endpoint hostname clients address; it owns the
//! upstream channels that can serve that endpoint, each speaking its own
//! provider dialect.

pub mod balancer;
pub mod manager;
pub mod model_mapping;
pub mod probe;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use balancer::LoadBalancer;
use model_mapping::ModelMapper;

pub use manager::ChannelManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LbStrategy {
    Priority,
    RoundRobin,
    WeightedRound,
    Random,
}

impl Default for LbStrategy {
    fn default() -> Self {
        LbStrategy::Priority
    }
}

impl TryFrom<u8> for LbStrategy {
    type Error = AppError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(LbStrategy::Priority),
            2 => Ok(LbStrategy::RoundRobin),
            3 => Ok(LbStrategy::WeightedRound),
            4 => Ok(LbStrategy::Random),
            other => Err(AppError::UnsupportedStrategy(other)),
        }
    }
}

impl From<LbStrategy> for u8 {
    fn from(value: LbStrategy) -> Self {
        match value {
            LbStrategy::Priority => 1,
            LbStrategy::RoundRobin => 2,
            LbStrategy::WeightedRound => 3,
            LbStrategy::Random => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Status {
    Normal,
    Error,
    Unavailable,
}

impl Default for Status {
    fn default() -> Self {
        Status::Normal
    }
}

impl TryFrom<u8> for Status {
    type Error = AppError;

    fn try_from(value: u8) -> Result<Self, AppError> {
        match value {
            // 0 tolerates configs written before the status was ever set.
            0 | 1 => Ok(Status::Normal),
            2 => Ok(Status::Error),
            3 => Ok(Status::Unavailable),
            other => Err(AppError::ConfigMalformed(format!(
                "unknown channel status: {}",
                other
            ))),
        }
    }
}

impl From<Status> for u8 {
    fn from(value: Status) -> Self {
        match value {
            Status::Normal => 1,
            Status::Error => 2,
            Status::Unavailable => 3,
        }
    }
}

/// One upstream realization of a group's service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub priority: u8,
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    pub provider: String,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub test_model: String,

    /// `"<group.provider>-><channel.provider>"`, rebuilt on load.
    #[serde(skip)]
    pub converter_name: String,
    #[serde(skip)]
    pub mapper: ModelMapper,
    #[serde(skip)]
    pub models: Vec<String>,
}

impl Channel {
    /// Rebuild the derived converter name and model mapper.
    pub fn init(&mut self, group_provider: &str) {
        self.converter_name = format!("{}->{}", group_provider, self.provider);
        let mut mapper = ModelMapper::new();
        for (pattern, target) in &self.model_mapping {
            mapper.add_rule(pattern, target);
        }
        self.mapper = mapper;
    }
}

/// A channel group, keyed by the endpoint hostname it intercepts.
#[derive(Clone, Serialize, Deserialize)]
pub struct Group {
    pub endpoint: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub lb_strategy: LbStrategy,
    pub provider: String,
    #[serde(default)]
    pub channels: HashMap<String, Channel>,

    #[serde(skip, default = "default_balancer")]
    pub balancer: Arc<dyn LoadBalancer>,
}

fn default_balancer() -> Arc<dyn LoadBalancer> {
    balancer::create(LbStrategy::Priority)
}

impl Group {
    /// Rebuild the balancer and every channel's derived state.
    pub fn init(&mut self) {
        self.balancer = balancer::create(self.lb_strategy);
        let provider = self.provider.clone();
        for channel in self.channels.values_mut() {
            channel.init(&provider);
        }
    }

    /// Channels eligible for selection: enabled and in Normal status.
    pub fn selectable_channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .channels
            .values()
            .filter(|c| c.enabled && c.status == Status::Normal)
            .cloned()
            .collect();
        // Stable iteration order for deterministic tie-breaking.
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        channels
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("endpoint", &self.endpoint)
            .field("enabled", &self.enabled)
            .field("priority", &self.priority)
            .field("lb_strategy", &self.lb_strategy)
            .field("provider", &self.provider)
            .field("channels", &self.channels.len())
            .finish()
    }
}
