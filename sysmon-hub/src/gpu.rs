//! Per-adapter GPU utilisation sampling.
//!
//! Every tick the sampler runs the per-engine counter query, folds the engine
//! samples into one figure per adapter and maps adapters onto two fixed slots.
//! When the counter query has nothing to say it falls back to a single-adapter
//! vendor utility. Every failure degrades to zero for that tick.

use crate::config::GpuConf;
use crate::models::GpuReading;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const SLOT_COUNT: usize = 2;

const LUID_MARKER: &str = "luid_";
const DEFAULT_IDENTITY: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("command is empty")]
    EmptyCommand,
    #[error("failed to run {0}: {1}")]
    Spawn(String, #[source] std::io::Error),
    #[error("{0} timed out")]
    Timeout(String),
    #[error("{0} exited with {1}")]
    Exit(String, std::process::ExitStatus),
    #[error("unparsable counter output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unparsable utilisation value: {0:?}")]
    Value(String),
}

/// One `{InstanceName, CookedValue}` row of the counter query.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSample {
    #[serde(rename = "InstanceName", default)]
    pub instance_name: String,
    #[serde(rename = "CookedValue", default)]
    pub value: f64,
}

// a single counter comes back as a bare object rather than an array
#[derive(Deserialize)]
#[serde(untagged)]
enum CounterOutput {
    Many(Vec<EngineSample>),
    One(EngineSample),
}

/// Adapter identity → slot, filled first come first served and never changed.
#[derive(Debug, Default)]
pub struct GpuIdentityMap {
    slots: BTreeMap<String, usize>,
}

impl GpuIdentityMap {
    /// Assigns free slots to identities not seen before. `identities` must be
    /// sorted; new ones take slots in that order until both are taken.
    pub fn observe<'a>(&mut self, identities: impl IntoIterator<Item = &'a str>) {
        for identity in identities {
            if self.slots.len() >= SLOT_COUNT {
                break;
            }
            if !self.slots.contains_key(identity) {
                let slot = self.slots.len();
                info!(identity, slot, "GPU adapter mapped");
                self.slots.insert(identity.to_string(), slot);
            }
        }
    }

    pub fn slot_of(&self, identity: &str) -> Option<usize> {
        self.slots.get(identity).copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Pulls the adapter identity out of an instance name such as
/// `pid_1234_luid_0x00000000_0x00009A4A_phys_0_eng_0_engtype_3D`.
pub fn adapter_identity(instance_name: &str) -> String {
    match instance_name.rsplit_once(LUID_MARKER) {
        Some((_, tail)) => {
            let mut parts = tail.split('_');
            match (parts.next(), parts.next()) {
                (Some(high), Some(low)) => format!("{high}_{low}"),
                _ => DEFAULT_IDENTITY.to_string(),
            }
        }
        None => DEFAULT_IDENTITY.to_string(),
    }
}

/// Sums engine samples per adapter, clamping each total to [0, 100].
pub fn aggregate(samples: &[EngineSample]) -> BTreeMap<String, f64> {
    let mut totals: BTreeMap<String, f64> = BTreeMap::new();
    for sample in samples {
        *totals.entry(adapter_identity(&sample.instance_name)).or_default() += sample.value;
    }
    for total in totals.values_mut() {
        *total = total.clamp(0.0, 100.0);
    }
    totals
}

pub fn parse_counter_output(stdout: &str) -> Result<Vec<EngineSample>, GpuError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    Ok(match serde_json::from_str::<CounterOutput>(trimmed)? {
        CounterOutput::Many(samples) => samples,
        CounterOutput::One(sample) => vec![sample],
    })
}

/// First non-empty line as a percentage. Multi-adapter hosts print one line
/// per adapter; only the first is used.
pub fn parse_fallback_output(stdout: &str) -> Result<f64, GpuError> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
    line.parse::<f64>()
        .map(|v| v.clamp(0.0, 100.0))
        .map_err(|_| GpuError::Value(line.to_string()))
}

pub struct GpuSampler {
    conf: GpuConf,
    identities: GpuIdentityMap,
    last: GpuReading,
    degraded: bool,
    tx: watch::Sender<GpuReading>,
}

impl GpuSampler {
    pub fn new(conf: GpuConf) -> (Self, watch::Receiver<GpuReading>) {
        let (tx, rx) = watch::channel(GpuReading::default());
        let sampler = Self {
            conf,
            identities: GpuIdentityMap::default(),
            last: GpuReading::default(),
            degraded: false,
            tx,
        };
        (sampler, rx)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut ticker = interval(self.conf.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reading = self.sample().await;
            self.tx.send_replace(reading);
        }
    }

    async fn sample(&mut self) -> GpuReading {
        let primary = run_command(&self.conf.primary_command, &self.conf).await.and_then(|out| parse_counter_output(&out));
        match primary {
            Ok(samples) if !samples.is_empty() => return self.apply_engine_samples(&samples),
            Ok(_) => debug!("GPU counter query returned no samples"),
            Err(e) => debug!("GPU counter query failed: {e}"),
        }

        match run_command(&self.conf.fallback_command, &self.conf).await.and_then(|out| parse_fallback_output(&out)) {
            Ok(value) => self.apply_fallback(value),
            Err(e) => self.apply_failure(&e),
        }
    }

    /// Folds one tick of counter samples into slot readings.
    pub fn apply_engine_samples(&mut self, samples: &[EngineSample]) -> GpuReading {
        let totals = aggregate(samples);
        self.identities.observe(totals.keys().map(String::as_str));

        let mut reading = GpuReading::default();
        for (identity, total) in &totals {
            match self.identities.slot_of(identity) {
                Some(0) => reading.gpu1 = *total,
                Some(1) => reading.gpu2 = *total,
                _ => {}
            }
        }
        self.recovered();
        self.last = reading;
        reading
    }

    /// Counter query had nothing: trust the vendor utility for the second slot,
    /// never reporting less than the previous tick did.
    ///
    /// The max feeds on its own output, so on hosts where only the vendor
    /// utility works `gpu2` holds the peak since the last failure. Existing
    /// dashboards rely on this reading; revisit together with the shadowed
    /// cpu-pattern advisory in `analyzer::recommend`.
    pub fn apply_fallback(&mut self, value: f64) -> GpuReading {
        let reading = GpuReading { gpu1: 0.0, gpu2: self.last.gpu2.max(value) };
        self.recovered();
        self.last = reading;
        reading
    }

    pub fn apply_failure(&mut self, error: &GpuError) -> GpuReading {
        if self.degraded {
            debug!("GPU sampling still unavailable: {error}");
        } else {
            warn!("GPU sampling unavailable, reporting zero: {error}");
            self.degraded = true;
        }
        self.last = GpuReading::default();
        self.last
    }

    pub fn identities(&self) -> &GpuIdentityMap {
        &self.identities
    }

    fn recovered(&mut self) {
        if self.degraded {
            info!("GPU sampling recovered");
            self.degraded = false;
        }
    }
}

async fn run_command(argv: &[String], conf: &GpuConf) -> Result<String, GpuError> {
    let (program, args) = argv.split_first().ok_or(GpuError::EmptyCommand)?;
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(conf.command_timeout(), child)
        .await
        .map_err(|_| GpuError::Timeout(program.clone()))?
        .map_err(|e| GpuError::Spawn(program.clone(), e))?;

    if !output.status.success() {
        return Err(GpuError::Exit(program.clone(), output.status));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
