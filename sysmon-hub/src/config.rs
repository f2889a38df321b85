use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: &'static str },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub engine: EngineConf,
    pub analyzer: AnalyzerConf,
    pub gpu: GpuConf,
    pub http: HttpConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConf {
    pub host: String,
    pub port: u16,
    pub reconnect_delay_ms: u64,
    /// Longest accepted record, newline included. Longer lines are discarded.
    pub max_record_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConf {
    pub history_size: usize,
    /// Samples needed before detection and forecasting switch on.
    pub train_threshold: u64,
    /// Detectors are refitted whenever the sample count is a multiple of this.
    pub retrain_every: u64,
    pub forecast_window: usize,
    pub contamination: f64,
    pub trees: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConf {
    pub interval_ms: u64,
    pub command_timeout_ms: u64,
    /// argv of the per-engine counter query, must print JSON
    pub primary_command: Vec<String>,
    /// argv of the single-adapter utility, must print one number
    pub fallback_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5000,
            reconnect_delay_ms: 5_000,
            max_record_bytes: 64 * 1024,
        }
    }
}

impl EngineConf {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for AnalyzerConf {
    fn default() -> Self {
        Self {
            history_size: 100,
            train_threshold: 50,
            retrain_every: 50,
            forecast_window: 20,
            contamination: 0.1,
            trees: 100,
            seed: 42,
        }
    }
}

impl Default for GpuConf {
    fn default() -> Self {
        let counters = "(Get-Counter '\\GPU Engine(*)\\Utilization Percentage' -ErrorAction SilentlyContinue).CounterSamples \
                        | Select-Object -Property InstanceName, CookedValue | ConvertTo-Json";
        Self {
            interval_ms: 1_000,
            command_timeout_ms: 5_000,
            primary_command: vec!["powershell".into(), "-NoProfile".into(), "-Command".into(), counters.into()],
            fallback_command: vec![
                "nvidia-smi".into(),
                "--query-gpu=utilization.gpu".into(),
                "--format=csv,noheader,nounits".into(),
            ],
        }
    }
}

impl GpuConf {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8000".into() }
    }
}

impl HubConfig {
    pub fn from_yaml(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: HubConfig = serde_yaml::from_str(txt)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let a = &self.analyzer;
        let checks: [(bool, &'static str, &'static str); 11] = [
            (self.engine.max_record_bytes >= 64, "engine.max_record_bytes", "must be at least 64"),
            (a.history_size >= 1, "analyzer.history_size", "must be at least 1"),
            (a.train_threshold >= 2, "analyzer.train_threshold", "must be at least 2"),
            (a.retrain_every >= 1, "analyzer.retrain_every", "must be at least 1"),
            (a.forecast_window >= 2, "analyzer.forecast_window", "must be at least 2"),
            (a.forecast_window <= a.history_size, "analyzer.forecast_window", "must not exceed analyzer.history_size"),
            (a.contamination > 0.0 && a.contamination <= 0.5, "analyzer.contamination", "must be in (0, 0.5]"),
            (a.trees >= 1, "analyzer.trees", "must be at least 1"),
            (self.gpu.interval_ms >= 1, "gpu.interval_ms", "must be at least 1"),
            (!self.gpu.primary_command.is_empty(), "gpu.primary_command", "must not be empty"),
            (!self.gpu.fallback_command.is_empty(), "gpu.fallback_command", "must not be empty"),
        ];
        match checks.into_iter().find(|(ok, _, _)| !ok) {
            Some((_, key, reason)) => Err(ConfigError::Invalid { key, reason }),
            None => Ok(()),
        }
    }

    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let txt = fs::read_to_string(path).await?;
        Self::from_yaml(&txt)
    }
}

/// Reads the file named by `SYSMON_HUB_CONFIG` (default `sysmon.yaml`).
/// A missing or broken file never stops the hub: it falls back to defaults.
pub async fn load_config() -> HubConfig {
    let path = std::env::var("SYSMON_HUB_CONFIG").unwrap_or_else(|_| "sysmon.yaml".into());
    let path = Path::new(&path);
    if !path.exists() {
        info!(path = %path.display(), "no config file, using defaults");
        return HubConfig::default();
    }
    match HubConfig::load_from(path).await {
        Ok(cfg) => {
            info!(path = %path.display(), "config loaded");
            cfg
        }
        Err(e) => {
            warn!(path = %path.display(), "invalid config ({e}), using defaults");
            HubConfig::default()
        }
    }
}
