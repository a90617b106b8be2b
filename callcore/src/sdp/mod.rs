//! Session description model and the munging transforms applied to it.
//!
//! A [`SessionDescription`] keeps every line of the source text verbatim and
//! in order. Structure (media sections, payload types, codec attributes) is
//! derived on demand from the `m=`, `a=rtpmap`, `a=fmtp`, `a=rtcp-fb`, `a=mid`
//! and `a=msid` lines, so transforms only touch the lines they must.

mod mid;
pub mod munge;
mod munging;

pub use mid::{TransceiverInfo, extract_mid};
pub use munging::{
    enable_high_quality_audio, enable_stereo, remove_codecs_except, set_preferred_codec,
    set_start_bitrate, start_bitrate_kbps, toggle_dtx,
};

use std::fmt;
use thiserror::Error;

/// Errors raised while parsing or negotiating a session description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdpError {
    #[error("malformed session description at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("no payload in {kind} section {mid:?} satisfies codec {codec} with fmtp {profile}")]
    Unsatisfiable {
        kind: String,
        mid: Option<String>,
        codec: String,
        profile: String,
    },

    #[error("invalid codec mime type: {0}")]
    InvalidMimeType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
}

impl LineEnding {
    fn as_str(self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }
}

/// An immutable, line-preserving session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    session: Vec<String>,
    media: Vec<MediaSection>,
    line_ending: LineEnding,
    trailing_newline: bool,
}

impl SessionDescription {
    pub fn parse(text: &str) -> Result<Self, SdpError> {
        let line_ending = if text.contains("\r\n") {
            LineEnding::CrLf
        } else {
            LineEnding::Lf
        };
        let trailing_newline = text.ends_with('\n');

        let mut session = Vec::new();
        let mut media: Vec<MediaSection> = Vec::new();

        for (index, raw) in text.split('\n').enumerate() {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.trim().is_empty() {
                continue;
            }
            let bytes = line.as_bytes();
            if bytes.len() < 2 || bytes[1] != b'=' {
                return Err(SdpError::Malformed {
                    line: index + 1,
                    reason: format!("expected <type>=<value>, got {line:?}"),
                });
            }
            if line.starts_with("m=") {
                if line[2..].split_whitespace().count() < 3 {
                    return Err(SdpError::Malformed {
                        line: index + 1,
                        reason: "media line needs kind, port and protocol".to_string(),
                    });
                }
                media.push(MediaSection {
                    lines: vec![line.to_string()],
                });
            } else if let Some(section) = media.last_mut() {
                section.lines.push(line.to_string());
            } else {
                session.push(line.to_string());
            }
        }

        if session.is_empty() && media.is_empty() {
            return Err(SdpError::Malformed {
                line: 0,
                reason: "empty description".to_string(),
            });
        }

        Ok(Self {
            session,
            media,
            line_ending,
            trailing_newline,
        })
    }

    pub fn session_lines(&self) -> &[String] {
        &self.session
    }

    pub fn media(&self) -> &[MediaSection] {
        &self.media
    }

    pub fn media_by_mid(&self, mid: &str) -> Option<&MediaSection> {
        self.media.iter().find(|m| m.mid() == Some(mid))
    }

    pub fn line_ending(&self) -> LineEnding {
        self.line_ending
    }

    /// Returns a copy with every media section passed through `f`.
    pub(crate) fn map_media<F>(&self, mut f: F) -> Result<Self, SdpError>
    where
        F: FnMut(&MediaSection) -> Result<MediaSection, SdpError>,
    {
        let media = self.media.iter().map(&mut f).collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            media,
            ..self.clone()
        })
    }

    /// Like [`map_media`](Self::map_media) for rewrites that cannot fail.
    pub(crate) fn rewrite_media<F>(&self, f: F) -> Self
    where
        F: FnMut(&MediaSection) -> MediaSection,
    {
        Self {
            media: self.media.iter().map(f).collect(),
            ..self.clone()
        }
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let eol = self.line_ending.as_str();
        let mut lines = self
            .session
            .iter()
            .chain(self.media.iter().flat_map(|m| m.lines.iter()))
            .peekable();
        while let Some(line) = lines.next() {
            f.write_str(line)?;
            if lines.peek().is_some() || self.trailing_newline {
                f.write_str(eol)?;
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for SessionDescription {
    type Err = SdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// One `m=` section and the attribute lines that follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    lines: Vec<String>,
}

/// A payload type entry as described by a media section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codec {
    pub payload: String,
    pub name: String,
    pub clock_rate: Option<u32>,
    pub channels: Option<u32>,
    pub fmtp: Option<FmtpParams>,
    pub feedback: Vec<String>,
}

impl Codec {
    pub fn is_rtx(&self) -> bool {
        self.name.eq_ignore_ascii_case("rtx")
    }

    /// The primary payload an `rtx` entry repairs.
    pub fn apt(&self) -> Option<&str> {
        self.fmtp.as_ref().and_then(|p| p.get("apt"))
    }
}

impl MediaSection {
    fn media_line_fields(&self) -> impl Iterator<Item = &str> {
        self.lines[0][2..].split_whitespace()
    }

    /// `audio`, `video`, `application`, ...
    pub fn kind(&self) -> &str {
        self.media_line_fields().next().unwrap_or_default()
    }

    pub fn payload_types(&self) -> Vec<&str> {
        self.media_line_fields().skip(3).collect()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// First value of `a=<name>:<value>`, or `Some("")` for a flag attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let rest = line.strip_prefix("a=")?.strip_prefix(name)?;
            if rest.is_empty() {
                Some("")
            } else {
                rest.strip_prefix(':')
            }
        })
    }

    pub fn mid(&self) -> Option<&str> {
        self.attribute("mid").map(str::trim)
    }

    pub fn msid(&self) -> Option<&str> {
        self.attribute("msid").map(str::trim)
    }

    pub fn rtpmap(&self, payload: &str) -> Option<&str> {
        self.payload_attribute("rtpmap", payload)
    }

    pub fn fmtp(&self, payload: &str) -> Option<&str> {
        self.payload_attribute("fmtp", payload)
    }

    fn payload_attribute(&self, attr: &str, payload: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| match split_payload_line(line, attr) {
            Some((pt, rest)) if pt == payload => Some(rest),
            _ => None,
        })
    }

    pub fn codecs(&self) -> Vec<Codec> {
        self.payload_types()
            .into_iter()
            .map(|payload| {
                let (name, clock_rate, channels) = match self.rtpmap(payload) {
                    Some(rtpmap) => parse_rtpmap(rtpmap),
                    None => (String::new(), None, None),
                };
                let feedback = self
                    .lines
                    .iter()
                    .filter_map(|line| match split_payload_line(line, "rtcp-fb") {
                        Some((pt, rest)) if pt == payload => Some(rest.to_string()),
                        _ => None,
                    })
                    .collect();
                Codec {
                    payload: payload.to_string(),
                    name,
                    clock_rate,
                    channels,
                    fmtp: self.fmtp(payload).map(FmtpParams::parse),
                    feedback,
                }
            })
            .collect()
    }

    /// Keeps only the listed payload types, in their original order, and
    /// drops the per-payload attribute lines of everything else.
    pub(crate) fn retain_payloads(&self, keep: &[String]) -> MediaSection {
        let header: Vec<&str> = self.media_line_fields().take(3).collect();
        let kept: Vec<&str> = self
            .payload_types()
            .into_iter()
            .filter(|pt| keep.iter().any(|k| k == pt))
            .collect();
        let mut lines = Vec::with_capacity(self.lines.len());
        lines.push(format!("m={} {}", header.join(" "), kept.join(" ")).trim_end().to_string());
        for line in &self.lines[1..] {
            let dropped = ["rtpmap", "fmtp", "rtcp-fb"].iter().any(|attr| {
                matches!(split_payload_line(line, attr), Some((pt, _)) if pt != "*" && !kept.contains(&pt))
            });
            if !dropped {
                lines.push(line.clone());
            }
        }
        MediaSection { lines }
    }

    /// Rewrites the payload order on the `m=` line.
    pub(crate) fn with_payload_order(&self, order: &[&str]) -> MediaSection {
        let header: Vec<&str> = self.media_line_fields().take(3).collect();
        let mut lines = self.lines.clone();
        lines[0] = format!("m={} {}", header.join(" "), order.join(" "));
        MediaSection { lines }
    }

    /// Replaces the fmtp line of `payload`, or inserts one right after its
    /// rtpmap line (or at the end of the section) when absent.
    pub(crate) fn with_fmtp(&self, payload: &str, params: &FmtpParams) -> MediaSection {
        let rendered = format!("a=fmtp:{payload} {params}");
        let mut lines = self.lines.clone();
        let existing = lines
            .iter()
            .position(|l| matches!(split_payload_line(l, "fmtp"), Some((pt, _)) if pt == payload));
        match existing {
            Some(index) => lines[index] = rendered,
            None => {
                let anchor = lines
                    .iter()
                    .position(|l| matches!(split_payload_line(l, "rtpmap"), Some((pt, _)) if pt == payload));
                match anchor {
                    Some(index) => lines.insert(index + 1, rendered),
                    None => lines.push(rendered),
                }
            }
        }
        MediaSection { lines }
    }
}

/// Splits `a=<attr>:<pt> <rest>` into `(pt, rest)`.
fn split_payload_line<'a>(line: &'a str, attr: &str) -> Option<(&'a str, &'a str)> {
    let rest = line.strip_prefix("a=")?.strip_prefix(attr)?.strip_prefix(':')?;
    Some(match rest.split_once(' ') {
        Some((pt, value)) => (pt, value.trim()),
        None => (rest.trim(), ""),
    })
}

fn parse_rtpmap(value: &str) -> (String, Option<u32>, Option<u32>) {
    let mut parts = value.split('/');
    let name = parts.next().unwrap_or_default().trim().to_string();
    let clock_rate = parts.next().and_then(|v| v.trim().parse().ok());
    let channels = parts.next().and_then(|v| v.trim().parse().ok());
    (name, clock_rate, channels)
}

/// Ordered `key=value` parameters of an fmtp line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FmtpParams {
    params: Vec<(String, Option<String>)>,
}

impl FmtpParams {
    pub fn parse(value: &str) -> Self {
        let params = value
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
                None => (p.to_string(), None),
            })
            .collect();
        Self { params }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.params.iter().any(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    /// Sets `key` in place, or appends it when absent.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.params.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            Some(entry) => entry.1 = Some(value.to_string()),
            None => self.params.push((key.to_string(), Some(value.to_string()))),
        }
    }

    /// True when every pair in `other` is present here, regardless of order.
    pub fn contains_all(&self, other: &FmtpParams) -> bool {
        other.params.iter().all(|(key, value)| {
            self.params.iter().any(|(k, v)| {
                k.eq_ignore_ascii_case(key)
                    && match (v, value) {
                        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                        (None, None) => true,
                        _ => false,
                    }
            })
        })
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl fmt::Display for FmtpParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (key, value)) in self.params.iter().enumerate() {
            if index > 0 {
                f.write_str(";")?;
            }
            match value {
                Some(value) => write!(f, "{key}={value}")?,
                None => f.write_str(key)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97 98\r\n\
a=mid:0\r\n\
a=msid:stream track-1\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtcp-fb:96 nack\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=rtpmap:98 VP9/90000\r\n\
a=fmtp:98 profile-id=0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=mid:1\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n";

    #[test]
    fn parse_and_serialize_preserves_text() {
        let sdp = SessionDescription::parse(SDP).unwrap();
        assert_eq!(sdp.to_string(), SDP);
        assert_eq!(sdp.line_ending(), LineEnding::CrLf);
        assert_eq!(sdp.media().len(), 2);
    }

    #[test]
    fn media_accessors_derive_structure() {
        let sdp = SessionDescription::parse(SDP).unwrap();
        let video = &sdp.media()[0];
        assert_eq!(video.kind(), "video");
        assert_eq!(video.mid(), Some("0"));
        assert_eq!(video.msid(), Some("stream track-1"));
        assert_eq!(video.payload_types(), vec!["96", "97", "98"]);

        let codecs = video.codecs();
        assert_eq!(codecs[0].name, "VP8");
        assert_eq!(codecs[0].clock_rate, Some(90000));
        assert_eq!(codecs[0].feedback, vec!["nack".to_string()]);
        assert!(codecs[1].is_rtx());
        assert_eq!(codecs[1].apt(), Some("96"));

        let opus = &sdp.media()[1].codecs()[0];
        assert_eq!(opus.channels, Some(2));
    }

    #[test]
    fn lf_input_keeps_lf_output() {
        let text = SDP.replace("\r\n", "\n");
        let sdp = SessionDescription::parse(&text).unwrap();
        assert_eq!(sdp.line_ending(), LineEnding::Lf);
        assert_eq!(sdp.to_string(), text);
    }

    #[test]
    fn rejects_lines_without_type_prefix() {
        let err = SessionDescription::parse("v=0\nnot a line\n").unwrap_err();
        assert!(matches!(err, SdpError::Malformed { line: 2, .. }));
        assert!(SessionDescription::parse("").is_err());
        assert!(SessionDescription::parse("v=0\nm=video\n").is_err());
    }

    #[test]
    fn fmtp_params_superset_is_order_independent() {
        let have = FmtpParams::parse(
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=64001f",
        );
        let want = FmtpParams::parse("profile-level-id=64001F;level-asymmetry-allowed=1");
        assert!(have.contains_all(&want));
        assert!(!have.contains_all(&FmtpParams::parse("packetization-mode=0")));
    }

    #[test]
    fn fmtp_set_replaces_in_place() {
        let mut params = FmtpParams::parse("minptime=10;stereo=0;useinbandfec=1");
        params.set("stereo", "1");
        params.set("usedtx", "1");
        assert_eq!(
            params.to_string(),
            "minptime=10;stereo=1;useinbandfec=1;usedtx=1"
        );
    }
}
