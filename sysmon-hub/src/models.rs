use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use time::OffsetDateTime;

/// Keys owned by the hub in the push payload. Engine fields with these names
/// are dropped so the merged object never carries duplicates.
const RESERVED_KEYS: &[&str] = &[
    "cpu",
    "ram_percent",
    "disk_percent",
    "anomaly_cpu",
    "anomaly_ram",
    "predicted_cpu_next",
    "recommendation",
    "gpu",
    "gpu1",
    "gpu2",
    "timestamp",
];

/// One line of the engine protocol. `cpu` and `ram_percent` are mandatory,
/// anything else the engine reports rides along in `extra`.
#[derive(Debug, Deserialize)]
pub struct EngineRecord {
    #[serde(alias = "cpu_percent")]
    pub cpu: f64,
    pub ram_percent: f64,
    #[serde(default)]
    pub disk_percent: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub cpu: f64,
    pub ram_percent: f64,
    pub disk_percent: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MetricSample {
    pub fn new(cpu: f64, ram_percent: f64, disk_percent: f64) -> Self {
        Self { cpu, ram_percent, disk_percent, extra: Map::new() }
    }
}

impl From<EngineRecord> for MetricSample {
    fn from(record: EngineRecord) -> Self {
        let mut extra = record.extra;
        extra.retain(|key, _| !RESERVED_KEYS.contains(&key.as_str()));
        Self {
            cpu: record.cpu,
            ram_percent: record.ram_percent,
            disk_percent: record.disk_percent,
            extra,
        }
    }
}

/// Advisory attached to every analysed sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Recommendation {
    LowDiskSpace,
    HighCpuLoad,
    MemoryAnomaly,
    UnusualCpuPattern,
    #[default]
    Optimal,
}

impl Recommendation {
    pub fn message(self) -> &'static str {
        match self {
            Recommendation::LowDiskSpace => "Low disk space detected. Clean up files immediately.",
            Recommendation::HighCpuLoad => "High CPU load detected/predicted. Consider stopping background services or checking for runaway processes.",
            Recommendation::MemoryAnomaly => "Memory usage anomaly detected. Potential memory leak. Recommend clearing cache or restarting heavy applications.",
            Recommendation::UnusualCpuPattern => "Unusual CPU pattern detected. Run virus scan or check scheduled tasks.",
            Recommendation::Optimal => "System is running optimally.",
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl Serialize for Recommendation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.message())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AnalysisResult {
    pub anomaly_cpu: bool,
    pub anomaly_ram: bool,
    pub predicted_cpu_next: f64,
    pub recommendation: Recommendation,
}

/// Latest per-slot GPU utilisation, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GpuReading {
    pub gpu1: f64,
    pub gpu2: f64,
}

// `gpu` is kept for older dashboards and always mirrors `gpu1`.
impl Serialize for GpuReading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("GpuReading", 3)?;
        state.serialize_field("gpu", &self.gpu1)?;
        state.serialize_field("gpu1", &self.gpu1)?;
        state.serialize_field("gpu2", &self.gpu2)?;
        state.end()
    }
}

/// Unit stored in the state store and pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct MergedSnapshot {
    #[serde(flatten)]
    pub sample: MetricSample,
    #[serde(flatten)]
    pub analysis: AnalysisResult,
    #[serde(flatten)]
    pub gpu: GpuReading,
    pub timestamp: f64,
}

impl MergedSnapshot {
    pub fn merge(sample: MetricSample, analysis: AnalysisResult, gpu: GpuReading, timestamp: f64) -> Self {
        Self { sample, analysis, gpu, timestamp }
    }
}

/// Wall-clock time as fractional Unix seconds.
pub fn unix_now() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUSH_FIELDS: &[&str] = &[
        "cpu",
        "ram_percent",
        "disk_percent",
        "anomaly_cpu",
        "anomaly_ram",
        "predicted_cpu_next",
        "recommendation",
        "gpu",
        "gpu1",
        "gpu2",
        "timestamp",
    ];

    #[test]
    fn test_payload_carries_every_named_field() {
        let gpu = GpuReading { gpu1: 33.5, gpu2: 7.0 };
        let snapshot = MergedSnapshot::merge(
            MetricSample::new(12.0, 48.5, 71.0),
            AnalysisResult::default(),
            gpu,
            1_700_000_000.25,
        );
        let payload = serde_json::to_value(&snapshot).unwrap();
        for field in PUSH_FIELDS {
            assert!(payload.get(*field).is_some(), "missing field {field}");
        }
        assert_eq!(payload["gpu"], payload["gpu1"]);
        assert_eq!(payload["gpu1"], 33.5);
        assert_eq!(payload["recommendation"], "System is running optimally.");
    }

    #[test]
    fn test_engine_extras_pass_through_without_collisions() {
        let record: EngineRecord = serde_json::from_str(
            r#"{"cpu": 5.0, "ram_percent": 20.0, "ram_total": 16000, "cpu_name": "Ryzen", "gpu1": 99.0}"#,
        )
        .unwrap();
        let snapshot = MergedSnapshot::merge(
            record.into(),
            AnalysisResult::default(),
            GpuReading { gpu1: 1.0, gpu2: 2.0 },
            1.0,
        );
        let payload = serde_json::to_string(&snapshot).unwrap();
        let object: Map<String, Value> = serde_json::from_str(&payload).unwrap();
        assert_eq!(object["cpu_name"], "Ryzen");
        assert_eq!(object["ram_total"], 16000);
        // the hub's own gpu1 wins over the engine's
        assert_eq!(object["gpu1"], 1.0);
        assert_eq!(payload.matches("\"gpu1\"").count(), 1);
    }

    #[test]
    fn test_recommendation_serializes_as_message() {
        let json = serde_json::to_string(&Recommendation::LowDiskSpace).unwrap();
        assert_eq!(json, format!("\"{}\"", Recommendation::LowDiskSpace.message()));
    }
}
