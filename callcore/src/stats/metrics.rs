use super::{StatsEntry, StatsSnapshot, codec_name, number, string};
use serde::{Deserialize, Serialize};

/// Audio concealment is only meaningful after two seconds of 48 kHz audio.
const MIN_SAMPLES_FOR_CONCEALMENT: f64 = 96_000.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherMetrics {
    pub fps: f64,
    pub bitrate_bps: f64,
    pub avg_encode_time_ms: f64,
    /// Shorter side of the largest outgoing layer.
    pub min_dimension: u32,
    pub codec: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberMetrics {
    pub fps: f64,
    pub bitrate_bps: f64,
    pub avg_decode_time_ms: f64,
    pub packet_loss_pct: Option<f64>,
    pub concealment_pct: Option<f64>,
    pub codec: Option<String>,
}

/// Seconds elapsed between two samples of the same entry.
fn elapsed_secs(previous: &StatsEntry, current: &StatsEntry) -> Option<f64> {
    let dt = (number(current, "timestamp")? - number(previous, "timestamp")?) / 1000.0;
    (dt > 0.0).then_some(dt)
}

fn counter_delta(previous: &StatsEntry, current: &StatsEntry, field: &str) -> Option<f64> {
    let delta = number(current, field)? - number(previous, field)?;
    (delta >= 0.0).then_some(delta)
}

fn area(entry: &StatsEntry) -> f64 {
    number(entry, "frameWidth").unwrap_or(0.0) * number(entry, "frameHeight").unwrap_or(0.0)
}

fn largest<'a>(
    entries: impl Iterator<Item = (&'a String, &'a StatsEntry)>,
) -> Option<(&'a String, &'a StatsEntry)> {
    entries.max_by(|(_, a), (_, b)| area(a).total_cmp(&area(b)))
}

/// Derives publisher metrics from two consecutive publisher snapshots.
pub fn publisher_metrics(previous: &StatsSnapshot, current: &StatsSnapshot) -> Option<PublisherMetrics> {
    let video = || {
        current
            .of_type("outbound-rtp")
            .filter(|(_, e)| string(e, "kind") == Some("video"))
    };
    let (top_id, top) = largest(video())?;

    let mut metrics = PublisherMetrics {
        codec: codec_name(current, top),
        min_dimension: number(top, "frameWidth")
            .unwrap_or(0.0)
            .min(number(top, "frameHeight").unwrap_or(0.0)) as u32,
        avg_encode_time_ms: number(top, "totalEncodeTime").unwrap_or(0.0)
            / number(top, "framesEncoded").unwrap_or(0.0).max(1.0)
            * 1000.0,
        ..Default::default()
    };

    for (id, entry) in video() {
        let Some(prev) = previous.get(id) else {
            continue;
        };
        let Some(dt) = elapsed_secs(prev, entry) else {
            continue;
        };
        if let Some(bytes) = counter_delta(prev, entry, "bytesSent") {
            metrics.bitrate_bps += bytes * 8.0 / dt;
        }
        if id == top_id {
            if let Some(frames) = counter_delta(prev, entry, "framesEncoded") {
                metrics.fps = frames / dt;
            }
        }
    }
    Some(metrics)
}

/// Derives subscriber metrics from two consecutive subscriber snapshots.
pub fn subscriber_metrics(previous: &StatsSnapshot, current: &StatsSnapshot) -> SubscriberMetrics {
    let mut metrics = SubscriberMetrics::default();
    let mut lost_total = 0.0;
    let mut received_total = 0.0;
    let mut loss_sampled = false;

    for (id, entry) in current.of_type("inbound-rtp") {
        let Some(prev) = previous.get(id) else {
            continue;
        };
        if let (Some(lost), Some(received)) = (
            counter_delta(prev, entry, "packetsLost"),
            counter_delta(prev, entry, "packetsReceived"),
        ) {
            lost_total += lost;
            received_total += received;
            loss_sampled = true;
        }
        if let (Some(dt), Some(bytes)) = (elapsed_secs(prev, entry), counter_delta(prev, entry, "bytesReceived")) {
            metrics.bitrate_bps += bytes * 8.0 / dt;
        }
        if string(entry, "kind") == Some("audio") {
            let samples = number(entry, "totalSamplesReceived").unwrap_or(0.0);
            if samples >= MIN_SAMPLES_FOR_CONCEALMENT {
                let concealed = number(entry, "concealedSamples").unwrap_or(0.0);
                metrics.concealment_pct = Some(concealed / samples * 100.0);
            }
        }
    }

    if loss_sampled && lost_total + received_total > 0.0 {
        metrics.packet_loss_pct = Some(lost_total / (lost_total + received_total) * 100.0);
    }

    let video = current
        .of_type("inbound-rtp")
        .filter(|(_, e)| string(e, "kind") == Some("video"));
    if let Some((id, top)) = largest(video) {
        metrics.codec = codec_name(current, top);
        metrics.avg_decode_time_ms = number(top, "totalDecodeTime").unwrap_or(0.0)
            / number(top, "framesDecoded").unwrap_or(0.0).max(1.0)
            * 1000.0;
        if let Some(prev) = previous.get(id) {
            if let (Some(dt), Some(frames)) = (elapsed_secs(prev, top), counter_delta(prev, top, "framesDecoded")) {
                metrics.fps = frames / dt;
            }
        }
    }
    metrics
}

/// Round trip time in milliseconds, from the remote inbound reports or,
/// without those, from the active candidate pair.
pub fn round_trip_time_ms(snapshot: &StatsSnapshot) -> Option<f64> {
    let remote: Vec<f64> = snapshot
        .of_type("remote-inbound-rtp")
        .filter_map(|(_, e)| number(e, "roundTripTime"))
        .collect();
    if !remote.is_empty() {
        return Some(remote.iter().sum::<f64>() / remote.len() as f64 * 1000.0);
    }
    snapshot
        .of_type("candidate-pair")
        .filter(|(_, e)| {
            e.get("nominated").and_then(serde_json::Value::as_bool) == Some(true)
                || string(e, "state") == Some("succeeded")
        })
        .find_map(|(_, e)| number(e, "currentRoundTripTime"))
        .map(|rtt| rtt * 1000.0)
}
