//! Per-channel and per-day usage counters with eventual JSON persistence.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const STATS_FILENAME: &str = "stats.json";
const DAILY_FILENAME: &str = "daily.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStats {
    pub channel_name: String,
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub last_used: DateTime<Utc>,
}

impl ChannelStats {
    fn new(channel_name: &str) -> Self {
        Self {
            channel_name: channel_name.to_string(),
            request_count: 0,
            success_count: 0,
            failure_count: 0,
            input_tokens: 0,
            output_tokens: 0,
            last_used: DateTime::UNIX_EPOCH,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: String,
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl DailyStats {
    fn new(date: &str) -> Self {
        Self {
            date: date.to_string(),
            request_count: 0,
            success_count: 0,
            failure_count: 0,
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

struct Inner {
    channels: HashMap<String, ChannelStats>,
    daily: HashMap<String, DailyStats>,
    current_date: String,
}

/// Statistics sink shared by the proxy pipeline and the converters.
/// One mutex guards both maps; disk writes happen outside the lock.
pub struct StatsManager {
    stats_path: PathBuf,
    daily_path: PathBuf,
    inner: Mutex<Inner>,
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

impl StatsManager {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            stats_path: data_dir.join(STATS_FILENAME),
            daily_path: data_dir.join(DAILY_FILENAME),
            inner: Mutex::new(Inner {
                channels: HashMap::new(),
                daily: HashMap::new(),
                current_date: today(),
            }),
        }
    }

    /// Load both files; missing or empty files leave the maps untouched.
    pub fn load(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(channels) = read_map::<ChannelStats>(&self.stats_path) {
            inner.channels = channels;
        }
        if let Some(daily) = read_map::<DailyStats>(&self.daily_path) {
            inner.daily = daily;
        }
    }

    /// Record one request sample for a channel. Counters are monotonic;
    /// every update triggers an asynchronous persist of both files.
    pub fn update(&self, channel_name: &str, success: bool, input_tokens: u64, output_tokens: u64) {
        let (stats_json, daily_json) = {
            let mut inner = self.inner.lock().unwrap();

            let stats = inner
                .channels
                .entry(channel_name.to_string())
                .or_insert_with(|| ChannelStats::new(channel_name));
            stats.request_count += 1;
            stats.input_tokens += input_tokens;
            stats.output_tokens += output_tokens;
            stats.last_used = Utc::now();
            if success {
                stats.success_count += 1;
            } else {
                stats.failure_count += 1;
            }

            let date = today();
            if date != inner.current_date {
                inner.current_date = date.clone();
            }
            let daily = inner
                .daily
                .entry(date.clone())
                .or_insert_with(|| DailyStats::new(&date));
            daily.request_count += 1;
            daily.input_tokens += input_tokens;
            daily.output_tokens += output_tokens;
            if success {
                daily.success_count += 1;
            } else {
                daily.failure_count += 1;
            }

            (
                serde_json::to_vec_pretty(&inner.channels).unwrap_or_default(),
                serde_json::to_vec_pretty(&inner.daily).unwrap_or_default(),
            )
        };

        self.persist(stats_json, daily_json);
    }

    fn persist(&self, stats_json: Vec<u8>, daily_json: Vec<u8>) {
        let stats_path = self.stats_path.clone();
        let daily_path = self.daily_path.clone();
        let write = move || {
            if let Err(e) = fs::write(&stats_path, &stats_json) {
                log::warn!("failed to persist statistics: {}", e);
            }
            if let Err(e) = fs::write(&daily_path, &daily_json) {
                log::warn!("failed to persist daily statistics: {}", e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }

    pub fn snapshot(&self) -> HashMap<String, ChannelStats> {
        self.inner.lock().unwrap().channels.clone()
    }

    pub fn daily_snapshot(&self) -> HashMap<String, DailyStats> {
        self.inner.lock().unwrap().daily.clone()
    }

    /// Aggregate across channels; `last_used` is the max over channels.
    pub fn total(&self) -> ChannelStats {
        let inner = self.inner.lock().unwrap();
        let mut total = ChannelStats::new("total");
        for stats in inner.channels.values() {
            total.request_count += stats.request_count;
            total.success_count += stats.success_count;
            total.failure_count += stats.failure_count;
            total.input_tokens += stats.input_tokens;
            total.output_tokens += stats.output_tokens;
            if stats.last_used > total.last_used {
                total.last_used = stats.last_used;
            }
        }
        total
    }

    pub fn total_requests(&self) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .channels
            .values()
            .map(|s| s.request_count)
            .sum()
    }

    /// Explicitly clear all counters and both files.
    pub fn reset(&self) {
        let (stats_json, daily_json) = {
            let mut inner = self.inner.lock().unwrap();
            inner.channels.clear();
            inner.daily.clear();
            (
                serde_json::to_vec_pretty(&inner.channels).unwrap_or_default(),
                serde_json::to_vec_pretty(&inner.daily).unwrap_or_default(),
            )
        };
        self.persist(stats_json, daily_json);
    }
}

fn read_map<T: serde::de::DeserializeOwned>(path: &Path) -> Option<HashMap<String, T>> {
    if !path.exists() {
        return None;
    }
    let data = fs::read(path).ok()?;
    if data.is_empty() {
        return None;
    }
    match serde_json::from_slice(&data) {
        Ok(map) => Some(map),
        Err(e) => {
            log::warn!("failed to load statistics from {}: {}", path.display(), e);
            None
        }
    }
}
