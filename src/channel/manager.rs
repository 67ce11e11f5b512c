//! Registry of channel groups with file persistence and channel selection.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::channel::{probe, Channel, Group, Status};
use crate::error::AppError;
use crate::statistics::StatsManager;

const CHANNELS_FILENAME: &str = "channels.json";

pub struct ChannelManager {
    config_path: PathBuf,
    groups: RwLock<HashMap<String, Group>>,
}

impl ChannelManager {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            config_path: data_dir.join(CHANNELS_FILENAME),
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Load channels.json. A missing or empty file is not an error.
    pub fn load_from_file(&self) -> Result<(), AppError> {
        if !self.config_path.exists() {
            log::info!("channel config not found, skipping load path={}", self.config_path.display());
            return Ok(());
        }
        let data = fs::read(&self.config_path)?;
        if data.is_empty() {
            log::info!("channel config empty, skipping load path={}", self.config_path.display());
            return Ok(());
        }

        let mut loaded: HashMap<String, Group> = serde_json::from_slice(&data)
            .map_err(|e| AppError::ConfigMalformed(e.to_string()))?;
        for group in loaded.values_mut() {
            group.init();
        }

        let count = loaded.len();
        *self.groups.write().unwrap() = loaded;
        log::info!("loaded channel config groups={} path={}", count, self.config_path.display());
        Ok(())
    }

    pub fn save_to_file(&self) -> Result<(), AppError> {
        let data = {
            let groups = self.groups.read().unwrap();
            serde_json::to_vec_pretty(&*groups)?
        };
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.config_path, data)?;
        Ok(())
    }

    /// All groups, ordered by UI priority.
    pub fn list(&self) -> Vec<Group> {
        let groups = self.groups.read().unwrap();
        let mut list: Vec<Group> = groups.values().cloned().collect();
        list.sort_by_key(|g| g.priority);
        list
    }

    pub fn add_group(&self, mut group: Group) -> Result<(), AppError> {
        if group.endpoint.is_empty() {
            return Err(AppError::ConfigMalformed("group endpoint must not be empty".into()));
        }
        let mut groups = self.groups.write().unwrap();
        if groups.contains_key(&group.endpoint) {
            return Err(AppError::DuplicateEntity(group.endpoint));
        }
        group.init();
        log::info!("added group endpoint={} strategy={:?}", group.endpoint, group.lb_strategy);
        groups.insert(group.endpoint.clone(), group);
        Ok(())
    }

    pub fn get_group(&self, endpoint: &str) -> Result<Group, AppError> {
        let groups = self.groups.read().unwrap();
        groups
            .get(endpoint)
            .cloned()
            .ok_or_else(|| AppError::EntityNotFound(format!("group {}", endpoint)))
    }

    pub fn update_group(&self, mut group: Group) -> Result<(), AppError> {
        if group.endpoint.is_empty() {
            return Err(AppError::ConfigMalformed("group endpoint must not be empty".into()));
        }
        let mut groups = self.groups.write().unwrap();
        if !groups.contains_key(&group.endpoint) {
            return Err(AppError::EntityNotFound(format!("group {}", group.endpoint)));
        }
        group.init();
        log::info!("updated group endpoint={}", group.endpoint);
        groups.insert(group.endpoint.clone(), group);
        Ok(())
    }

    /// Removing a group cascades to its channels.
    pub fn delete_group(&self, endpoint: &str) -> Result<(), AppError> {
        let mut groups = self.groups.write().unwrap();
        if groups.remove(endpoint).is_none() {
            return Err(AppError::EntityNotFound(format!("group {}", endpoint)));
        }
        log::info!("deleted group endpoint={}", endpoint);
        Ok(())
    }

    pub fn update_group_priority(&self, endpoint: &str, priority: u8) -> Result<(), AppError> {
        let mut groups = self.groups.write().unwrap();
        let group = groups
            .get_mut(endpoint)
            .ok_or_else(|| AppError::EntityNotFound(format!("group {}", endpoint)))?;
        group.priority = priority;
        Ok(())
    }

    pub fn add_channel(&self, endpoint: &str, mut channel: Channel) -> Result<(), AppError> {
        if channel.name.is_empty() {
            return Err(AppError::ConfigMalformed("channel name must not be empty".into()));
        }
        if channel.url.is_empty() {
            return Err(AppError::ConfigMalformed("channel url must not be empty".into()));
        }
        let mut groups = self.groups.write().unwrap();
        let group = groups
            .get_mut(endpoint)
            .ok_or_else(|| AppError::EntityNotFound(format!("group {}", endpoint)))?;
        if group.channels.contains_key(&channel.name) {
            return Err(AppError::DuplicateEntity(channel.name));
        }
        channel.init(&group.provider);
        log::info!("added channel group={} channel={} url={}", endpoint, channel.name, channel.url);
        group.channels.insert(channel.name.clone(), channel);
        Ok(())
    }

    pub fn update_channel(&self, endpoint: &str, mut channel: Channel) -> Result<(), AppError> {
        let mut groups = self.groups.write().unwrap();
        let group = groups
            .get_mut(endpoint)
            .ok_or_else(|| AppError::EntityNotFound(format!("group {}", endpoint)))?;
        if !group.channels.contains_key(&channel.name) {
            return Err(AppError::EntityNotFound(format!("channel {}", channel.name)));
        }
        channel.init(&group.provider);
        log::info!("updated channel group={} channel={}", endpoint, channel.name);
        group.channels.insert(channel.name.clone(), channel);
        Ok(())
    }

    pub fn delete_channel(&self, endpoint: &str, name: &str) -> Result<(), AppError> {
        let mut groups = self.groups.write().unwrap();
        let group = groups
            .get_mut(endpoint)
            .ok_or_else(|| AppError::EntityNotFound(format!("group {}", endpoint)))?;
        if group.channels.remove(name).is_none() {
            return Err(AppError::EntityNotFound(format!("channel {}", name)));
        }
        log::info!("deleted channel group={} channel={}", endpoint, name);
        Ok(())
    }

    pub fn get_channel(&self, endpoint: &str, name: &str) -> Result<Channel, AppError> {
        let groups = self.groups.read().unwrap();
        let group = groups
            .get(endpoint)
            .ok_or_else(|| AppError::EntityNotFound(format!("group {}", endpoint)))?;
        group
            .channels
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::EntityNotFound(format!("channel {}", name)))
    }

    pub fn set_channel_status(&self, endpoint: &str, name: &str, status: Status) -> Result<(), AppError> {
        let mut groups = self.groups.write().unwrap();
        let group = groups
            .get_mut(endpoint)
            .ok_or_else(|| AppError::EntityNotFound(format!("group {}", endpoint)))?;
        let channel = group
            .channels
            .get_mut(name)
            .ok_or_else(|| AppError::EntityNotFound(format!("channel {}", name)))?;
        channel.status = status;
        Ok(())
    }

    pub fn update_channel_priority(&self, endpoint: &str, name: &str, priority: u8) -> Result<(), AppError> {
        let mut groups = self.groups.write().unwrap();
        let group = groups
            .get_mut(endpoint)
            .ok_or_else(|| AppError::EntityNotFound(format!("group {}", endpoint)))?;
        let channel = group
            .channels
            .get_mut(name)
            .ok_or_else(|| AppError::EntityNotFound(format!("channel {}", name)))?;
        channel.priority = priority;
        Ok(())
    }

    /// True when a CONNECT to this host should be intercepted.
    pub fn is_intercept_endpoint(&self, host: &str) -> bool {
        let groups = self.groups.read().unwrap();
        groups.get(host).map(|g| g.enabled).unwrap_or(false)
    }

    /// True when requests for this host run through the conversion pipeline.
    pub fn is_active_group(&self, host: &str) -> bool {
        let groups = self.groups.read().unwrap();
        groups
            .get(host)
            .map(|g| g.enabled && !g.channels.is_empty())
            .unwrap_or(false)
    }

    /// Endpoints of all enabled groups, for hosts-file rewriting.
    pub fn enabled_endpoints(&self) -> Vec<String> {
        self.list()
            .into_iter()
            .filter(|g| g.enabled)
            .map(|g| g.endpoint)
            .collect()
    }

    /// The hot path: pick an upstream channel for an intercepted endpoint.
    pub fn select_channel(&self, endpoint: &str) -> Result<Channel, AppError> {
        let (balancer, channels) = {
            let groups = self.groups.read().unwrap();
            let group = groups
                .get(endpoint)
                .ok_or_else(|| AppError::EntityNotFound(format!("group {}", endpoint)))?;
            if !group.enabled {
                return Err(AppError::NoChannelAvailable(endpoint.to_string()));
            }
            (group.balancer.clone(), group.selectable_channels())
        };

        if channels.is_empty() {
            return Err(AppError::NoChannelAvailable(endpoint.to_string()));
        }
        balancer.next(&channels)
    }

    /// Probe the channel with a minimal request in its native dialect.
    /// Updates the channel status from the outcome and persists.
    pub async fn test_channel(
        &self,
        client: &reqwest::Client,
        endpoint: &str,
        name: &str,
        stats: &StatsManager,
    ) -> Result<String, AppError> {
        let mut channel = self.get_channel(endpoint, name)?;

        if channel.test_model.is_empty() && channel.models.is_empty() {
            let models = probe::fetch_models(client, &channel).await?;
            channel.models = models;
            if let Some(first) = channel.models.first() {
                channel.test_model = first.clone();
            }
        }

        let outcome = probe::test_channel(client, &channel, stats).await;

        let status = if outcome.is_ok() { Status::Normal } else { Status::Error };
        {
            let mut groups = self.groups.write().unwrap();
            if let Some(group) = groups.get_mut(endpoint) {
                if let Some(stored) = group.channels.get_mut(name) {
                    stored.status = status;
                    stored.models = channel.models.clone();
                    if stored.test_model.is_empty() {
                        stored.test_model = channel.test_model.clone();
                    }
                }
            }
        }
        if let Err(e) = self.save_to_file() {
            log::warn!("failed to persist channels after test: {}", e);
        }

        match &outcome {
            Ok(_) => log::info!("channel test ok group={} channel={}", endpoint, name),
            Err(e) => log::warn!("channel test failed group={} channel={} err={}", endpoint, name, e),
        }
        outcome
    }

    /// Fetch the provider's model list and append the ids to the channel.
    pub async fn fetch_models(
        &self,
        client: &reqwest::Client,
        endpoint: &str,
        name: &str,
    ) -> Result<Vec<String>, AppError> {
        let channel = self.get_channel(endpoint, name)?;
        let fetched = probe::fetch_models(client, &channel).await?;

        let mut groups = self.groups.write().unwrap();
        let group = groups
            .get_mut(endpoint)
            .ok_or_else(|| AppError::EntityNotFound(format!("group {}", endpoint)))?;
        let stored = group
            .channels
            .get_mut(name)
            .ok_or_else(|| AppError::EntityNotFound(format!("channel {}", name)))?;
        stored.models.extend(fetched.iter().cloned());
        Ok(stored.models.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::model_mapping::ModelMapper;
    use crate::channel::LbStrategy;
    use tempfile::TempDir;

    fn group(endpoint: &str) -> Group {
        Group {
            endpoint: endpoint.into(),
            enabled: true,
            priority: 0,
            lb_strategy: LbStrategy::Priority,
            provider: "anthropic".into(),
            channels: HashMap::new(),
            balancer: crate::channel::balancer::create(LbStrategy::Priority),
        }
    }

    fn channel(name: &str, priority: u8, status: Status) -> Channel {
        Channel {
            name: name.into(),
            enabled: true,
            priority,
            url: "https://api.openai.com".into(),
            api_key: "sk-test".into(),
            provider: "openai".into(),
            model_mapping: HashMap::new(),
            status,
            test_model: String::new(),
            converter_name: String::new(),
            mapper: ModelMapper::new(),
            models: Vec::new(),
        }
    }

    fn manager() -> (TempDir, ChannelManager) {
        let dir = TempDir::new().unwrap();
        let manager = ChannelManager::new(dir.path());
        (dir, manager)
    }

    #[test]
    fn crud_invariants() {
        let (_dir, manager) = manager();
        manager.add_group(group("api.anthropic.com")).unwrap();
        assert!(matches!(
            manager.add_group(group("api.anthropic.com")),
            Err(AppError::DuplicateEntity(_))
        ));

        manager
            .add_channel("api.anthropic.com", channel("a", 0, Status::Normal))
            .unwrap();
        assert!(matches!(
            manager.add_channel("api.anthropic.com", channel("a", 0, Status::Normal)),
            Err(AppError::DuplicateEntity(_))
        ));

        let unnamed = channel("", 0, Status::Normal);
        assert!(manager.add_channel("api.anthropic.com", unnamed).is_err());

        assert!(matches!(
            manager.delete_group("missing.example.com"),
            Err(AppError::EntityNotFound(_))
        ));

        manager.delete_group("api.anthropic.com").unwrap();
        assert!(manager.get_group("api.anthropic.com").is_err());
    }

    #[test]
    fn derived_converter_name_set_on_add() {
        let (_dir, manager) = manager();
        manager.add_group(group("api.anthropic.com")).unwrap();
        manager
            .add_channel("api.anthropic.com", channel("a", 0, Status::Normal))
            .unwrap();
        let stored = manager.get_channel("api.anthropic.com", "a").unwrap();
        assert_eq!(stored.converter_name, "anthropic->openai");
    }

    #[test]
    fn selection_under_priority() {
        let (_dir, manager) = manager();
        manager.add_group(group("api.anthropic.com")).unwrap();
        manager
            .add_channel("api.anthropic.com", channel("a", 1, Status::Normal))
            .unwrap();
        manager
            .add_channel("api.anthropic.com", channel("b", 0, Status::Normal))
            .unwrap();
        manager
            .add_channel("api.anthropic.com", channel("c", 0, Status::Error))
            .unwrap();

        // c is filtered by status; b wins on priority.
        let picked = manager.select_channel("api.anthropic.com").unwrap();
        assert_eq!(picked.name, "b");

        manager
            .set_channel_status("api.anthropic.com", "b", Status::Error)
            .unwrap();
        let picked = manager.select_channel("api.anthropic.com").unwrap();
        assert_eq!(picked.name, "a");

        let mut disabled = channel("a", 1, Status::Normal);
        disabled.enabled = false;
        manager.update_channel("api.anthropic.com", disabled).unwrap();
        assert!(matches!(
            manager.select_channel("api.anthropic.com"),
            Err(AppError::NoChannelAvailable(_))
        ));
    }

    #[test]
    fn disabled_group_is_not_selectable() {
        let (_dir, manager) = manager();
        let mut g = group("api.anthropic.com");
        g.enabled = false;
        manager.add_group(g).unwrap();
        assert!(matches!(
            manager.select_channel("api.anthropic.com"),
            Err(AppError::NoChannelAvailable(_))
        ));
        assert!(!manager.is_intercept_endpoint("api.anthropic.com"));
    }

    #[test]
    fn persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = ChannelManager::new(dir.path());
        manager.add_group(group("api.anthropic.com")).unwrap();
        let mut ch = channel("a", 0, Status::Normal);
        ch.model_mapping
            .insert("claude-3-sonnet".into(), "gpt-4o".into());
        manager.add_channel("api.anthropic.com", ch).unwrap();
        manager.save_to_file().unwrap();

        let reloaded = ChannelManager::new(dir.path());
        reloaded.load_from_file().unwrap();
        let stored = reloaded.get_channel("api.anthropic.com", "a").unwrap();
        assert_eq!(stored.converter_name, "anthropic->openai");
        assert_eq!(stored.mapper.map_model("claude-3-sonnet"), "gpt-4o");
    }

    #[test]
    fn numeric_codes_in_file() {
        let dir = TempDir::new().unwrap();
        let manager = ChannelManager::new(dir.path());
        let mut g = group("api.anthropic.com");
        g.lb_strategy = LbStrategy::WeightedRound;
        manager.add_group(g).unwrap();
        manager
            .add_channel("api.anthropic.com", channel("a", 0, Status::Error))
            .unwrap();
        manager.save_to_file().unwrap();

        let raw = std::fs::read_to_string(dir.path().join("channels.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["api.anthropic.com"]["lb_strategy"], 3);
        assert_eq!(parsed["api.anthropic.com"]["channels"]["a"]["status"], 2);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let (_dir, manager) = manager();
        manager.load_from_file().unwrap();
        assert!(manager.list().is_empty());
    }
}
