//! Periodic sampling of a session's media transports.
//!
//! Each session gets its own reporter with its own baseline: snapshots are
//! never diffed across session boundaries.

use crate::media::{MediaTransport, PeerSide, TracedMediaTransport};
use crate::session::{SessionSignal, SignalSender};
use crate::config::StatsConfig;
use async_trait::async_trait;
use callcore::protocol::sfu::TrackType;
use callcore::stats::{
    DecodeTracker, EncodeTracker, PerformanceStats, PublisherMetrics, StatsDelta, StatsSnapshot,
    SubscriberMetrics, delta_compress, publisher_metrics, round_trip_time_ms, subscriber_metrics,
};
use callcore::trace::{TraceBatch, TraceLog, TraceRecord};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Aggregated view of the last sample, exposed to observers of the call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStatsReport {
    pub timestamp: DateTime<Utc>,
    pub publisher: Option<PublisherMetrics>,
    pub subscriber: Option<SubscriberMetrics>,
    pub rtt_ms: Option<f64>,
    pub publisher_performance: Vec<PerformanceStats>,
    pub subscriber_performance: Vec<PerformanceStats>,
}

/// What is sent upstream for one sample.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsUpload {
    pub session_id: String,
    pub publisher_stats: Option<StatsDelta>,
    pub subscriber_stats: Option<StatsDelta>,
    pub publisher_performance: Vec<PerformanceStats>,
    pub subscriber_performance: Vec<PerformanceStats>,
    pub traces: Vec<TraceRecord>,
}

#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn send(&self, upload: &StatsUpload) -> anyhow::Result<()>;
}

pub type ReportCallback = Arc<dyn Fn(CallStatsReport) + Send + Sync>;

/// Owns the sampling task; dropping the reporter stops it.
pub struct StatsReporter {
    handle: JoinHandle<()>,
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl StatsReporter {
    pub fn start(
        session_id: String,
        transports: Vec<(PeerSide, Arc<TracedMediaTransport>)>,
        config: StatsConfig,
        sink: Option<Arc<dyn StatsSink>>,
        signals: SignalSender,
        on_report: ReportCallback,
    ) -> Self {
        let mut sampler = Sampler {
            session_id,
            transports,
            sink,
            previous: HashMap::new(),
            encode: EncodeTracker::new(),
            decode: DecodeTracker::new(),
        };
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = sampler.sample().await;
                if let Some(rtt_ms) = report.rtt_ms {
                    let _ = signals.send((sampler.session_id.clone(), SessionSignal::Quality { rtt_ms }));
                }
                on_report(report);
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

/// Maps each sent track id to the kind of track it carries.
fn track_types(transport: &TracedMediaTransport) -> HashMap<String, TrackType> {
    transport
        .transceivers()
        .into_iter()
        .filter_map(|(track_type, transceiver)| transceiver.track_id.map(|id| (id, track_type)))
        .collect()
}

struct Sampler {
    session_id: String,
    transports: Vec<(PeerSide, Arc<TracedMediaTransport>)>,
    sink: Option<Arc<dyn StatsSink>>,
    previous: HashMap<PeerSide, StatsSnapshot>,
    encode: EncodeTracker,
    decode: DecodeTracker,
}

impl Sampler {
    async fn sample(&mut self) -> CallStatsReport {
        let mut report = CallStatsReport {
            timestamp: Utc::now(),
            publisher: None,
            subscriber: None,
            rtt_ms: None,
            publisher_performance: Vec::new(),
            subscriber_performance: Vec::new(),
        };
        let mut publisher_stats = None;
        let mut subscriber_stats = None;

        for (side, transport) in &self.transports {
            let snapshot = match transport.get_stats().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(target: "Stats", "{} getStats failed: {e:#}", side.as_str());
                    continue;
                }
            };
            let previous = self.previous.get(side);
            let delta = delta_compress(previous, &snapshot);
            transport
                .trace_log()
                .trace("getstats", serde_json::to_value(&delta).unwrap_or_default());

            if report.rtt_ms.is_none() {
                report.rtt_ms = round_trip_time_ms(&snapshot);
            }
            if let Some(previous) = previous {
                match side {
                    PeerSide::Publisher => {
                        report.publisher = publisher_metrics(previous, &snapshot);
                        report.publisher_performance =
                            self.encode.sample(previous, &snapshot, &track_types(transport));
                    }
                    PeerSide::Subscriber => {
                        report.subscriber = Some(subscriber_metrics(previous, &snapshot));
                        report.subscriber_performance =
                            self.decode.sample(previous, &snapshot).into_iter().collect();
                    }
                }
            }
            match side {
                PeerSide::Publisher => publisher_stats = Some(delta),
                PeerSide::Subscriber => subscriber_stats = Some(delta),
            }
            self.previous.insert(*side, snapshot);
        }

        if let Some(sink) = self.sink.clone() {
            let upload = StatsUpload {
                session_id: self.session_id.clone(),
                publisher_stats,
                subscriber_stats,
                publisher_performance: report.publisher_performance.clone(),
                subscriber_performance: report.subscriber_performance.clone(),
                traces: Vec::new(),
            };
            self.upload(sink.as_ref(), upload).await;
        }
        report
    }

    /// Sends one upload with every pending trace record. The drained
    /// batches are put back when the send fails.
    async fn upload(&self, sink: &dyn StatsSink, mut upload: StatsUpload) {
        let batches: Vec<(TraceLog, TraceBatch)> = self
            .transports
            .iter()
            .map(|(_, t)| (t.trace_log().clone(), t.trace_log().take()))
            .collect();
        upload.traces = batches
            .iter()
            .flat_map(|(_, batch)| batch.records.iter().cloned())
            .collect();

        match sink.send(&upload).await {
            Ok(()) => debug!(target: "Stats", "Sent stats with {} trace records", upload.traces.len()),
            Err(e) => {
                warn!(target: "Stats", "Failed to send stats: {e:#}");
                for (log, batch) in batches {
                    log.rollback(batch);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::MockMediaTransport;
    use callcore::sdp::TransceiverInfo;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct RecordingSink {
        fail: AtomicBool,
        uploads: Mutex<Vec<StatsUpload>>,
    }

    #[async_trait]
    impl StatsSink for RecordingSink {
        async fn send(&self, upload: &StatsUpload) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("upstream unavailable");
            }
            self.uploads.lock().unwrap().push(upload.clone());
            Ok(())
        }
    }

    fn snapshot(timestamp: f64, rtt: f64) -> StatsSnapshot {
        let entries = [(
            "RIV1".to_string(),
            json!({"type": "remote-inbound-rtp", "kind": "video", "timestamp": timestamp, "roundTripTime": rtt}),
        )];
        entries
            .into_iter()
            .map(|(id, v)| (id, v.as_object().cloned().unwrap()))
            .collect()
    }

    fn config() -> StatsConfig {
        StatsConfig {
            interval: Duration::from_millis(100),
            ..StatsConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upload_keeps_traces_for_the_next_one() {
        let media = MockMediaTransport::new("", "");
        media.queue_stats(snapshot(1000.0, 0.25));
        let log = TraceLog::new(Some("0-pub".into()), 100);
        let transport = Arc::new(TracedMediaTransport::new(Arc::new(media), log.clone()));

        let sink = Arc::new(RecordingSink {
            fail: AtomicBool::new(true),
            uploads: Mutex::new(Vec::new()),
        });
        let (signals_tx, mut signals_rx) = mpsc::unbounded_channel();
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let reporter = StatsReporter::start(
            "s1".into(),
            vec![(PeerSide::Publisher, transport)],
            config(),
            Some(sink.clone()),
            signals_tx,
            Arc::new(move |report| {
                let _ = reports_tx.send(report);
            }),
        );

        let first = reports_rx.recv().await.unwrap();
        assert_eq!(first.rtt_ms, Some(250.0));
        assert_eq!(
            signals_rx.recv().await.unwrap(),
            ("s1".to_string(), SessionSignal::Quality { rtt_ms: 250.0 })
        );
        // "create" and the first "getstats" are still pending.
        assert_eq!(log.len(), 2);

        sink.fail.store(false, Ordering::SeqCst);
        reports_rx.recv().await.unwrap();
        let uploads = sink.uploads.lock().unwrap().clone();
        assert_eq!(uploads.len(), 1);
        let tags: Vec<&str> = uploads[0].traces.iter().map(|r| r.tag.as_str()).collect();
        assert_eq!(tags, ["create", "getstats", "getstats"]);
        assert!(log.is_empty());
        reporter.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn second_sample_is_a_delta_against_the_first() {
        let media = MockMediaTransport::new("", "");
        media.queue_stats(snapshot(1000.0, 0.05));
        media.queue_stats(snapshot(2000.0, 0.05));
        let transport = Arc::new(TracedMediaTransport::new(
            Arc::new(media),
            TraceLog::new(None, 100),
        ));
        let sink = Arc::new(RecordingSink {
            fail: AtomicBool::new(false),
            uploads: Mutex::new(Vec::new()),
        });
        let (signals_tx, _signals_rx) = mpsc::unbounded_channel();
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let _reporter = StatsReporter::start(
            "s1".into(),
            vec![(PeerSide::Publisher, transport)],
            config(),
            Some(sink.clone()),
            signals_tx,
            Arc::new(move |report| {
                let _ = reports_tx.send(report);
            }),
        );
        reports_rx.recv().await.unwrap();
        reports_rx.recv().await.unwrap();

        let uploads = sink.uploads.lock().unwrap().clone();
        let second = uploads[1].publisher_stats.as_ref().unwrap();
        let value = serde_json::to_value(second).unwrap();
        assert_eq!(value["timestamp"], json!(2000.0));
        // Only the changed timestamp remains, zeroed as the newest one.
        assert_eq!(value["RIV1"], json!({"timestamp": 0}));
    }

    fn encoding(timestamp: f64, frames: u64, encode_time: f64) -> StatsSnapshot {
        serde_json::from_value(json!({
            "OT01V": {
                "type": "outbound-rtp", "kind": "video", "timestamp": timestamp,
                "framesSent": frames, "totalEncodeTime": encode_time, "framesPerSecond": 30,
                "frameWidth": 1280, "frameHeight": 720, "mediaSourceId": "MS1",
            },
            "MS1": {"type": "media-source", "kind": "video", "timestamp": timestamp, "trackIdentifier": "camera-1"},
        }))
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn encode_performance_names_the_published_track() {
        let mut media = MockMediaTransport::new("", "");
        media.transceivers = vec![(
            TrackType::Video,
            TransceiverInfo {
                mid: Some("1".into()),
                kind: "video".into(),
                track_id: Some("camera-1".into()),
            },
        )];
        media.queue_stats(encoding(1000.0, 30, 0.3));
        media.queue_stats(encoding(2000.0, 60, 0.9));
        let transport = Arc::new(TracedMediaTransport::new(Arc::new(media), TraceLog::new(None, 100)));
        let (signals_tx, _signals_rx) = mpsc::unbounded_channel();
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let _reporter = StatsReporter::start(
            "s1".into(),
            vec![(PeerSide::Publisher, transport)],
            config(),
            None,
            signals_tx,
            Arc::new(move |report| {
                let _ = reports_tx.send(report);
            }),
        );

        assert!(reports_rx.recv().await.unwrap().publisher_performance.is_empty());
        let second = reports_rx.recv().await.unwrap();
        assert_eq!(second.publisher_performance.len(), 1);
        let performance = &second.publisher_performance[0];
        assert_eq!(performance.track_type, Some(TrackType::Video));
        assert_eq!(performance.width, 1280);
        assert!((performance.avg_frame_time_ms - 20.0).abs() < 1e-9);
    }
}
