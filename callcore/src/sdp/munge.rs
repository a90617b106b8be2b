//! Text-in, text-out wrappers over the munging transforms.
//!
//! Unchanged descriptions are returned byte-for-byte as given.

use super::{SdpError, SessionDescription};

fn rewrite<F>(sdp: &str, f: F) -> Result<String, SdpError>
where
    F: FnOnce(&SessionDescription) -> Result<SessionDescription, SdpError>,
{
    let parsed = SessionDescription::parse(sdp)?;
    let out = f(&parsed)?;
    if out == parsed {
        Ok(sdp.to_string())
    } else {
        Ok(out.to_string())
    }
}

pub fn remove_codecs_except(
    sdp: &str,
    codec_mime_type: &str,
    fmtp_profile: Option<&str>,
) -> Result<String, SdpError> {
    rewrite(sdp, |s| super::remove_codecs_except(s, codec_mime_type, fmtp_profile))
}

pub fn set_start_bitrate(
    sdp: &str,
    max_kbps: u32,
    start_factor: f64,
    target_mid: &str,
) -> Result<String, SdpError> {
    rewrite(sdp, |s| Ok(super::set_start_bitrate(s, max_kbps, start_factor, target_mid)))
}

pub fn enable_stereo(offer: &str, answer: &str) -> Result<String, SdpError> {
    let offer = SessionDescription::parse(offer)?;
    rewrite(answer, |s| Ok(super::enable_stereo(&offer, s)))
}

pub fn toggle_dtx(sdp: &str, enable: bool) -> Result<String, SdpError> {
    rewrite(sdp, |s| Ok(super::toggle_dtx(s, enable)))
}

pub fn enable_high_quality_audio(sdp: &str, mid: &str) -> Result<String, SdpError> {
    rewrite(sdp, |s| Ok(super::enable_high_quality_audio(s, mid)))
}

pub fn set_preferred_codec(sdp: &str, kind: &str, codec: &str) -> Result<String, SdpError> {
    rewrite(sdp, |s| Ok(super::set_preferred_codec(s, kind, codec)))
}
