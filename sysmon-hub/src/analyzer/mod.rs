//! Online analysis of the cpu/ram stream.
//!
//! Keeps a rolling window per metric, runs one isolation forest per metric once
//! enough history exists, extrapolates the cpu trend one step ahead and turns
//! all of that into a single advisory.

mod forecast;
mod forest;
mod window;

pub use forest::{ForestParams, IsolationForest};
pub use window::RollingWindow;

use crate::config::AnalyzerConf;
use crate::models::{AnalysisResult, Recommendation};
use serde::Serialize;
use tracing::debug;

/// One row of buffered history, as handed to exporters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub cpu_usage: f64,
    pub ram_percent: f64,
}

#[derive(Debug)]
pub struct AnomalyAnalyzer {
    conf: AnalyzerConf,
    cpu_history: RollingWindow,
    ram_history: RollingWindow,
    cpu_detector: IsolationForest,
    ram_detector: IsolationForest,
    samples_seen: u64,
    fit_count: u64,
}

impl AnomalyAnalyzer {
    pub fn new(conf: AnalyzerConf) -> Self {
        let params = ForestParams {
            trees: conf.trees,
            contamination: conf.contamination,
            seed: conf.seed,
        };
        Self {
            cpu_history: RollingWindow::new(conf.history_size),
            ram_history: RollingWindow::new(conf.history_size),
            cpu_detector: IsolationForest::new(params),
            ram_detector: IsolationForest::new(params),
            samples_seen: 0,
            fit_count: 0,
            conf,
        }
    }

    /// Feeds one sample and returns its analysis. Detection and forecasting
    /// stay at their defaults until `train_threshold` samples have been seen;
    /// the disk rule applies from the first sample.
    pub fn update(&mut self, cpu: f64, ram: f64, disk: f64) -> AnalysisResult {
        self.cpu_history.push(cpu);
        self.ram_history.push(ram);
        self.samples_seen += 1;

        let mut anomaly_cpu = false;
        let mut anomaly_ram = false;
        let mut predicted = 0.0;

        if self.samples_seen >= self.conf.train_threshold {
            let due = self.samples_seen % self.conf.retrain_every.max(1) == 0;
            if !self.cpu_detector.is_fitted() || due {
                self.cpu_detector.fit(&self.cpu_history.to_vec());
                self.ram_detector.fit(&self.ram_history.to_vec());
                self.fit_count += 1;
                debug!(samples = self.samples_seen, window = self.cpu_history.len(), "detectors refitted");
            }

            anomaly_cpu = self.cpu_detector.is_anomaly(cpu);
            anomaly_ram = self.ram_detector.is_anomaly(ram);

            if self.cpu_history.len() >= self.conf.forecast_window {
                let recent = self.cpu_history.tail(self.conf.forecast_window);
                predicted = forecast::linear_next(&recent).unwrap_or(0.0);
            }
        }

        AnalysisResult {
            anomaly_cpu,
            anomaly_ram,
            predicted_cpu_next: forecast::round2(predicted),
            recommendation: recommend(disk, anomaly_cpu, anomaly_ram, predicted),
        }
    }

    /// Buffered history paired by index. When the windows differ in length the
    /// newest readings of the longer one are kept.
    pub fn history(&self) -> Vec<HistoryPoint> {
        let len = self.cpu_history.len().min(self.ram_history.len());
        self.cpu_history
            .tail(len)
            .into_iter()
            .zip(self.ram_history.tail(len))
            .map(|(cpu_usage, ram_percent)| HistoryPoint { cpu_usage, ram_percent })
            .collect()
    }

    pub fn samples_seen(&self) -> u64 {
        self.samples_seen
    }

    pub fn fit_count(&self) -> u64 {
        self.fit_count
    }
}

/// First matching rule wins.
pub fn recommend(disk: f64, anomaly_cpu: bool, anomaly_ram: bool, predicted_cpu_next: f64) -> Recommendation {
    if disk > 90.0 {
        Recommendation::LowDiskSpace
    } else if anomaly_cpu || predicted_cpu_next > 80.0 {
        Recommendation::HighCpuLoad
    } else if anomaly_ram {
        Recommendation::MemoryAnomaly
    } else if predicted_cpu_next > 50.0 && anomaly_cpu {
        // never reached: the cpu rule above already matches; kept until the
        // intended ordering is settled. The GPU fallback peak-hold in
        // `GpuSampler::apply_fallback` is the other reading kept as-is.
        Recommendation::UnusualCpuPattern
    } else {
        Recommendation::Optimal
    }
}
