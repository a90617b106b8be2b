use super::{StatsEntry, StatsSnapshot, number, string};
use crate::protocol::sfu::TrackType;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

const HISTORY_LEN: usize = 2;

/// Encode or decode performance of one video stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    pub track_type: Option<TrackType>,
    pub codec: Option<String>,
    pub avg_frame_time_ms: f64,
    pub avg_fps: f64,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_bitrate: Option<f64>,
}

#[derive(Debug, Default)]
struct History {
    frame_times: VecDeque<f64>,
    fps: VecDeque<f64>,
}

impl History {
    fn push(&mut self, frame_time: f64, fps: f64) {
        push_bounded(&mut self.frame_times, frame_time);
        push_bounded(&mut self.fps, fps);
    }

    fn averages(&self) -> (f64, f64) {
        (average(&self.frame_times), average(&self.fps))
    }
}

fn push_bounded(queue: &mut VecDeque<f64>, value: f64) {
    queue.push_back(value);
    while queue.len() > HISTORY_LEN {
        queue.pop_front();
    }
}

fn average(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Milliseconds spent per frame between two samples of the same stream.
fn frame_time_ms(previous: &StatsEntry, current: &StatsEntry, time_field: &str, frames_field: &str) -> f64 {
    let delta_time = number(current, time_field).unwrap_or(0.0) - number(previous, time_field).unwrap_or(0.0);
    let delta_frames = number(current, frames_field).unwrap_or(0.0) - number(previous, frames_field).unwrap_or(0.0);
    if delta_frames > 0.0 {
        delta_time / delta_frames * 1000.0
    } else {
        0.0
    }
}

/// The codec short name (`VP8`, `opus`, ...) an rtp entry refers to.
pub fn codec_name(snapshot: &StatsSnapshot, entry: &StatsEntry) -> Option<String> {
    let codec = snapshot.get(string(entry, "codecId")?)?;
    let mime = string(codec, "mimeType")?;
    mime.rsplit('/').next().map(str::to_string)
}

fn dimension(entry: &StatsEntry, field: &str) -> u32 {
    number(entry, field).map_or(0, |v| v.max(0.0) as u32)
}

/// Tracks encode time and frame rate of every outgoing video layer.
#[derive(Debug, Default)]
pub struct EncodeTracker {
    history: HashMap<String, History>,
}

impl EncodeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compares two publisher snapshots. Layers that are new in `current`
    /// are skipped until they have a previous sample.
    pub fn sample(
        &mut self,
        previous: &StatsSnapshot,
        current: &StatsSnapshot,
        track_types: &HashMap<String, TrackType>,
    ) -> Vec<PerformanceStats> {
        let mut out = Vec::new();
        let mut seen = Vec::new();
        for (id, entry) in current.of_type("outbound-rtp") {
            if string(entry, "kind") == Some("audio") {
                continue;
            }
            let Some(prev) = previous.get(id) else {
                continue;
            };
            seen.push(id.clone());

            let history = self.history.entry(id.clone()).or_default();
            history.push(
                frame_time_ms(prev, entry, "totalEncodeTime", "framesSent"),
                number(entry, "framesPerSecond").unwrap_or(0.0),
            );
            let (avg_frame_time_ms, avg_fps) = history.averages();

            let track_type = string(entry, "mediaSourceId")
                .and_then(|source| current.get(source))
                .and_then(|source| string(source, "trackIdentifier"))
                .and_then(|track| track_types.get(track).copied());

            out.push(PerformanceStats {
                track_type,
                codec: codec_name(current, entry),
                avg_frame_time_ms,
                avg_fps,
                width: dimension(entry, "frameWidth"),
                height: dimension(entry, "frameHeight"),
                target_bitrate: number(entry, "targetBitrate"),
            });
        }
        self.history.retain(|id, _| seen.contains(id));
        out
    }
}

/// Tracks decode time and frame rate of the largest incoming video stream.
#[derive(Debug, Default)]
pub struct DecodeTracker {
    selected: Option<String>,
    history: History,
}

impl DecodeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, previous: &StatsSnapshot, current: &StatsSnapshot) -> Option<PerformanceStats> {
        let (id, entry) = current
            .of_type("inbound-rtp")
            .filter(|(_, e)| string(e, "kind") == Some("video"))
            .max_by_key(|(_, e)| u64::from(dimension(e, "frameWidth")) * u64::from(dimension(e, "frameHeight")))?;
        let prev = previous.get(id)?;

        if self.selected.as_deref() != Some(id.as_str()) {
            self.selected = Some(id.clone());
            self.history = History::default();
        }
        self.history.push(
            frame_time_ms(prev, entry, "totalDecodeTime", "framesDecoded"),
            number(entry, "framesPerSecond").unwrap_or(0.0),
        );
        let (avg_frame_time_ms, avg_fps) = self.history.averages();

        Some(PerformanceStats {
            track_type: Some(TrackType::Video),
            codec: codec_name(current, entry),
            avg_frame_time_ms,
            avg_fps,
            width: dimension(entry, "frameWidth"),
            height: dimension(entry, "frameHeight"),
            target_bitrate: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn snapshot(value: Value) -> StatsSnapshot {
        serde_json::from_value(value).unwrap()
    }

    fn publisher(frames: u64, encode_time: f64, fps: f64) -> StatsSnapshot {
        snapshot(json!({
            "OT01V": {
                "type": "outbound-rtp", "kind": "video", "codecId": "C1", "mediaSourceId": "SV1",
                "framesSent": frames, "totalEncodeTime": encode_time, "framesPerSecond": fps,
                "frameWidth": 1280, "frameHeight": 720, "targetBitrate": 1200000.0
            },
            "OT01A": {"type": "outbound-rtp", "kind": "audio", "codecId": "C2"},
            "SV1": {"type": "media-source", "trackIdentifier": "cam-1"},
            "C1": {"type": "codec", "mimeType": "video/VP8"},
            "C2": {"type": "codec", "mimeType": "audio/opus"},
        }))
    }

    #[test]
    fn encode_time_is_averaged_over_two_samples() {
        let track_types = HashMap::from([("cam-1".to_string(), TrackType::Video)]);
        let mut tracker = EncodeTracker::new();

        let s0 = publisher(0, 0.0, 0.0);
        let s1 = publisher(30, 0.3, 30.0);
        let s2 = publisher(60, 0.9, 28.0);
        let s3 = publisher(60, 0.9, 26.0);

        assert!(tracker.sample(&StatsSnapshot::new(), &s0, &track_types).is_empty());

        let first = tracker.sample(&s0, &s1, &track_types);
        assert_eq!(first.len(), 1);
        assert!((first[0].avg_frame_time_ms - 10.0).abs() < 1e-9);
        assert_eq!(first[0].codec.as_deref(), Some("VP8"));
        assert_eq!(first[0].track_type, Some(TrackType::Video));
        assert_eq!((first[0].width, first[0].height), (1280, 720));

        let second = tracker.sample(&s1, &s2, &track_types);
        assert!((second[0].avg_frame_time_ms - 15.0).abs() < 1e-9);
        assert!((second[0].avg_fps - 29.0).abs() < 1e-9);

        // no new frames: zero frame time enters the window
        let third = tracker.sample(&s2, &s3, &track_types);
        assert!((third[0].avg_frame_time_ms - 10.0).abs() < 1e-9);
        assert!((third[0].avg_fps - 27.0).abs() < 1e-9);
    }

    fn subscriber(small_frames: u64, large_frames: u64, large_decode: f64) -> StatsSnapshot {
        snapshot(json!({
            "IT1": {"type": "inbound-rtp", "kind": "video", "frameWidth": 320, "frameHeight": 180,
                    "framesDecoded": small_frames, "totalDecodeTime": 0.1, "codecId": "C1"},
            "IT2": {"type": "inbound-rtp", "kind": "video", "frameWidth": 1920, "frameHeight": 1080,
                    "framesDecoded": large_frames, "totalDecodeTime": large_decode,
                    "framesPerSecond": 24.0, "codecId": "C3"},
            "IT3": {"type": "inbound-rtp", "kind": "audio"},
            "C1": {"type": "codec", "mimeType": "video/VP8"},
            "C3": {"type": "codec", "mimeType": "video/H264"},
        }))
    }

    #[test]
    fn decode_picks_largest_stream() {
        let mut tracker = DecodeTracker::new();
        let s0 = subscriber(10, 100, 1.0);
        let s1 = subscriber(20, 150, 1.25);
        assert!(tracker.sample(&StatsSnapshot::new(), &s0).is_none());

        let stats = tracker.sample(&s0, &s1).unwrap();
        assert_eq!(stats.codec.as_deref(), Some("H264"));
        assert_eq!(stats.width, 1920);
        assert!((stats.avg_frame_time_ms - 5.0).abs() < 1e-9);
        assert!((stats.avg_fps - 24.0).abs() < 1e-9);
    }

    #[test]
    fn codec_name_needs_cross_reference() {
        let s = subscriber(1, 1, 0.0);
        assert_eq!(codec_name(&s, s.get("IT3").unwrap()), None);
    }
}
