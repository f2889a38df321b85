use crate::analyzer::AnomalyAnalyzer;
use crate::config::EngineConf;
use crate::health::HealthTracker;
use crate::models::{unix_now, EngineRecord, GpuReading, MergedSnapshot, MetricSample};
use crate::state::{Shared, StateStore};
use serde::de::Error as _;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record is not UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("record longer than {0} bytes")]
    Oversized(u64),
    #[error("analysis task failed: {0}")]
    Analysis(#[from] task::JoinError),
}

/// Parses one protocol line. Blank lines yield `Ok(None)`. Percentages must
/// be finite and within [0, 100].
pub fn parse_record(raw: &[u8]) -> Result<Option<MetricSample>, IngestError> {
    let line = std::str::from_utf8(raw)?.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let record: EngineRecord = serde_json::from_str(line)?;
    for (field, value) in [("cpu", record.cpu), ("ram_percent", record.ram_percent), ("disk_percent", record.disk_percent)] {
        if !(0.0..=100.0).contains(&value) {
            return Err(serde_json::Error::custom(format!("{field} out of range: {value}")).into());
        }
    }
    Ok(Some(record.into()))
}

/// Client side of the engine link: keeps a connection open, analyses every
/// record and publishes the merged result to the store.
pub struct MetricsIngestor {
    conf: EngineConf,
    analyzer: Shared<AnomalyAnalyzer>,
    gpu: watch::Receiver<GpuReading>,
    store: StateStore,
    health: HealthTracker,
}

impl MetricsIngestor {
    pub fn new(
        conf: EngineConf,
        analyzer: Shared<AnomalyAnalyzer>,
        gpu: watch::Receiver<GpuReading>,
        store: StateStore,
        health: HealthTracker,
    ) -> Self {
        Self { conf, analyzer, gpu, store, health }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        task::spawn(self.run())
    }

    /// Connect, consume until the engine goes away, wait, repeat. Never returns.
    pub async fn run(self) {
        let addr = self.conf.addr();
        let delay = self.conf.reconnect_delay();
        loop {
            info!("connecting to metrics engine at {addr}");
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    info!("connected to metrics engine");
                    self.health.mark_engine_connected();
                    match self.consume(stream).await {
                        Ok(()) => warn!("metrics engine closed the stream"),
                        Err(e) => warn!("metrics engine connection lost: {e}"),
                    }
                }
                Err(e) => warn!("cannot reach metrics engine at {addr}: {e}"),
            }
            self.health.mark_engine_disconnected();
            self.health.increment_reconnects();
            info!("retrying in {}ms", delay.as_millis());
            tokio::time::sleep(delay).await;
        }
    }

    /// Reads newline-terminated records until end of stream. A trailing
    /// fragment without its newline is dropped. Lines longer than
    /// `max_record_bytes` are discarded without being buffered whole.
    pub async fn consume<R: AsyncRead + Unpin>(&self, reader: R) -> Result<(), IngestError> {
        let limit = self.conf.max_record_bytes;
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(1024);
        loop {
            buf.clear();
            let n = (&mut reader).take(limit).read_until(b'\n', &mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            if buf.last() == Some(&b'\n') {
                self.handle_line(&buf).await;
                continue;
            }
            if (n as u64) < limit {
                debug!(bytes = n, "dropping incomplete record at end of stream");
                return Ok(());
            }

            warn!("discarding record: {}", IngestError::Oversized(limit));
            self.health.record_discarded();
            if !skip_past_newline(&mut reader, limit, &mut buf).await? {
                return Ok(());
            }
        }
    }

    /// Runs one record through parse → analyse → merge → store. Returns the
    /// stored version, or `None` when the record was skipped.
    pub async fn handle_line(&self, raw: &[u8]) -> Option<u64> {
        match self.process(raw).await {
            Ok(version) => version,
            Err(e) => {
                warn!("discarding record: {e}");
                self.health.record_discarded();
                None
            }
        }
    }

    async fn process(&self, raw: &[u8]) -> Result<Option<u64>, IngestError> {
        let Some(sample) = parse_record(raw)? else { return Ok(None) };

        let analyzer = self.analyzer.clone();
        let (cpu, ram, disk) = (sample.cpu, sample.ram_percent, sample.disk_percent);
        let analysis = task::spawn_blocking(move || analyzer.lock().update(cpu, ram, disk)).await?;

        let gpu = *self.gpu.borrow();
        let snapshot = MergedSnapshot::merge(sample, analysis, gpu, unix_now());
        let version = self.store.write(snapshot);
        self.health.record_sample();
        Ok(Some(version))
    }
}

/// Drops input up to and including the next newline, `limit` bytes at a time.
/// Returns `false` if the stream ended first.
async fn skip_past_newline<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    limit: u64,
    buf: &mut Vec<u8>,
) -> Result<bool, IngestError> {
    loop {
        buf.clear();
        if (&mut *reader).take(limit).read_until(b'\n', buf).await? == 0 {
            return Ok(false);
        }
        if buf.last() == Some(&b'\n') {
            return Ok(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyzerConf;
    use crate::models::Recommendation;
    use crate::state::new_state;
    use std::time::Duration;
    use sysmon_devkit::test_utils::{engine_line, engine_line_with, wait_until};
    use sysmon_devkit::FakeEngine;

    struct Rig {
        ingestor: MetricsIngestor,
        store: StateStore,
        health: HealthTracker,
        gpu: watch::Sender<GpuReading>,
    }

    fn rig(conf: EngineConf) -> Rig {
        let store = StateStore::new();
        let health = HealthTracker::new();
        let (gpu, gpu_rx) = watch::channel(GpuReading::default());
        let analyzer = new_state(AnomalyAnalyzer::new(AnalyzerConf::default()));
        let ingestor = MetricsIngestor::new(conf, analyzer, gpu_rx, store.clone(), health.clone());
        Rig { ingestor, store, health, gpu }
    }

    #[test]
    fn test_parse_record() {
        let sample = parse_record(br#"{"cpu": 12.5, "ram_percent": 40}"#).unwrap().unwrap();
        assert_eq!(sample.cpu, 12.5);
        assert_eq!(sample.ram_percent, 40.0);
        assert_eq!(sample.disk_percent, 0.0);

        let sample = parse_record(b"{\"cpu_percent\": 1, \"ram_percent\": 2, \"disk_percent\": 93.1}\r\n").unwrap().unwrap();
        assert_eq!(sample.cpu, 1.0);
        assert_eq!(sample.disk_percent, 93.1);

        assert!(parse_record(b"   \n").unwrap().is_none());
    }

    #[test]
    fn test_parse_record_rejects_missing_fields() {
        assert!(matches!(parse_record(br#"{"ram_percent": 40}"#), Err(IngestError::Malformed(_))));
        assert!(matches!(parse_record(br#"{"cpu": 40}"#), Err(IngestError::Malformed(_))));
        assert!(matches!(parse_record(br#"{"cpu": "high", "ram_percent": 1}"#), Err(IngestError::Malformed(_))));
        assert!(matches!(parse_record(b"{\"cpu\": 1, \xff}"), Err(IngestError::Encoding(_))));
    }

    #[test]
    fn test_parse_record_rejects_out_of_range() {
        assert!(matches!(parse_record(br#"{"cpu": -1.7e308, "ram_percent": 1}"#), Err(IngestError::Malformed(_))));
        assert!(matches!(parse_record(br#"{"cpu": 1, "ram_percent": 1.7e308}"#), Err(IngestError::Malformed(_))));
        assert!(matches!(parse_record(br#"{"cpu": 100.5, "ram_percent": 1}"#), Err(IngestError::Malformed(_))));
        assert!(matches!(parse_record(br#"{"cpu": 1, "ram_percent": 1, "disk_percent": -3}"#), Err(IngestError::Malformed(_))));
        assert!(parse_record(br#"{"cpu": 0, "ram_percent": 100, "disk_percent": 100}"#).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_extreme_values_do_not_take_down_later_records() {
        let rig = rig(EngineConf::default());
        let mut stream = String::from("{\"cpu\": -1.7e308, \"ram_percent\": 1.7e308}\n{\"cpu\": 1.7e308, \"ram_percent\": -1.7e308}\n");
        for _ in 0..100 {
            stream.push_str(&engine_line(10.0, 1.0, None));
            stream.push('\n');
        }
        rig.ingestor.consume(stream.as_bytes()).await.unwrap();

        let health = rig.health.get_health(&rig.store);
        assert_eq!(health.records_discarded, 2);
        assert_eq!(health.samples_ingested, 100);
        assert_eq!(rig.store.version(), 100);
    }

    #[tokio::test]
    async fn test_oversized_line_is_discarded() {
        let rig = rig(EngineConf { max_record_bytes: 64, ..EngineConf::default() });
        let stream = format!(
            "{}\n{{\"cpu\": 1, \"pad\": \"{}\"}}\n{}\n",
            engine_line(10.0, 20.0, None),
            "x".repeat(500),
            engine_line(11.0, 21.0, None),
        );
        rig.ingestor.consume(stream.as_bytes()).await.unwrap();

        assert_eq!(rig.store.version(), 2);
        assert_eq!(rig.store.read().unwrap().snapshot.sample.cpu, 11.0);
        assert_eq!(rig.health.get_health(&rig.store).records_discarded, 1);

        // a peer that never sends a newline is cut off at the limit
        let endless = "y".repeat(10_000);
        rig.ingestor.consume(endless.as_bytes()).await.unwrap();
        assert_eq!(rig.health.get_health(&rig.store).records_discarded, 2);
        assert_eq!(rig.store.version(), 2);
    }

    #[tokio::test]
    async fn test_consume_skips_bad_lines_and_merges_gpu() {
        let rig = rig(EngineConf::default());
        rig.gpu.send_replace(GpuReading { gpu1: 42.0, gpu2: 3.0 });

        let stream = format!(
            "{}\nnot json\n{{\"cpu\": 1}}\n\n{}\n{{\"cpu\": 9",
            engine_line(10.0, 20.0, Some(30.0)),
            engine_line(11.0, 21.0, Some(95.0)),
        );
        rig.ingestor.consume(stream.as_bytes()).await.unwrap();

        assert_eq!(rig.store.version(), 2);
        let latest = rig.store.read().unwrap();
        assert_eq!(latest.snapshot.sample.cpu, 11.0);
        assert_eq!(latest.snapshot.gpu, GpuReading { gpu1: 42.0, gpu2: 3.0 });
        assert_eq!(latest.snapshot.analysis.recommendation, Recommendation::LowDiskSpace);
        assert!(latest.snapshot.timestamp > 0.0);

        let health = rig.health.get_health(&rig.store);
        assert_eq!(health.samples_ingested, 2);
        assert_eq!(health.records_discarded, 2);
    }

    #[tokio::test]
    async fn test_engine_extras_reach_the_store() {
        let rig = rig(EngineConf::default());
        let line = engine_line_with(3.0, 4.0, serde_json::json!({"bat_pct": 77, "gpu_name1": "RTX"}));
        let version = rig.ingestor.handle_line(format!("{line}\n").as_bytes()).await;
        assert_eq!(version, Some(1));

        let payload = serde_json::to_value(&rig.store.read().unwrap().snapshot).unwrap();
        assert_eq!(payload["bat_pct"], 77);
        assert_eq!(payload["gpu_name1"], "RTX");
        assert_eq!(payload["disk_percent"], 0.0);
    }

    #[tokio::test]
    async fn test_reconnects_after_engine_closes() {
        let engine = FakeEngine::serve_lines(vec![engine_line(5.0, 6.0, None), engine_line(7.0, 8.0, None)])
            .await
            .unwrap();
        let conf = EngineConf {
            host: engine.addr().ip().to_string(),
            port: engine.addr().port(),
            reconnect_delay_ms: 50,
            ..EngineConf::default()
        };
        let rig = rig(conf);
        let store = rig.store.clone();
        let health = rig.health.clone();
        let handle = rig.ingestor.spawn();

        // every connection replays both lines, so a second connection means
        // at least four stored versions
        let reconnected = wait_until(Duration::from_secs(5), || engine.connections() >= 2 && store.version() >= 4).await;
        handle.abort();

        assert!(reconnected);
        assert!(health.get_health(&store).engine_reconnects >= 1);
        assert_eq!(health.get_health(&store).records_discarded, 0);
    }

    #[tokio::test]
    async fn test_unreachable_engine_keeps_retrying() {
        let conf = EngineConf { host: "127.0.0.1".into(), port: 1, reconnect_delay_ms: 20, ..EngineConf::default() };
        let rig = rig(conf);
        let store = rig.store.clone();
        let health = rig.health.clone();
        let handle = rig.ingestor.spawn();

        let retried = wait_until(Duration::from_secs(5), || health.get_health(&store).engine_reconnects >= 3).await;
        handle.abort();

        assert!(retried);
        assert!(store.read().is_none());
        assert_eq!(health.get_health(&store).engine_status, "disconnected");
    }
}
