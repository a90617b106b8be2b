use super::{FmtpParams, MediaSection, SdpError, SessionDescription};
use log::debug;
use std::collections::HashSet;

const MIN_START_BITRATE_KBPS: f64 = 300.0;
const START_BITRATE_KEY: &str = "x-google-start-bitrate";
const START_BITRATE_CODECS: [&str; 3] = ["AV1", "VP9", "H264"];
const HIGH_QUALITY_AUDIO_BITRATE: &str = "510000";

/// Keeps only the payloads of `codec_mime_type` (e.g. `video/h264`) in the
/// sections of that kind, plus the `rtx` payloads repairing them.
///
/// With an `fmtp_profile`, a payload must also carry every listed parameter.
/// When nothing matches and no profile was requested the section is left
/// untouched; a requested profile that matches nothing is an error.
pub fn remove_codecs_except(
    sdp: &SessionDescription,
    codec_mime_type: &str,
    fmtp_profile: Option<&str>,
) -> Result<SessionDescription, SdpError> {
    let (kind, codec) = codec_mime_type
        .split_once('/')
        .filter(|(k, c)| !k.is_empty() && !c.is_empty())
        .ok_or_else(|| SdpError::InvalidMimeType(codec_mime_type.to_string()))?;
    let profile = fmtp_profile
        .map(FmtpParams::parse)
        .filter(|p| !p.is_empty());

    sdp.map_media(|media| {
        if !media.kind().eq_ignore_ascii_case(kind) {
            return Ok(media.clone());
        }
        let codecs = media.codecs();
        let primaries: Vec<&str> = codecs
            .iter()
            .filter(|c| c.name.eq_ignore_ascii_case(codec))
            .filter(|c| match (&profile, &c.fmtp) {
                (None, _) => true,
                (Some(wanted), Some(have)) => have.contains_all(wanted),
                (Some(_), None) => false,
            })
            .map(|c| c.payload.as_str())
            .collect();

        if primaries.is_empty() {
            return match &profile {
                Some(profile) => Err(SdpError::Unsatisfiable {
                    kind: media.kind().to_string(),
                    mid: media.mid().map(str::to_string),
                    codec: codec.to_string(),
                    profile: profile.to_string(),
                }),
                None => {
                    debug!(target: "Sdp", "No {codec_mime_type} payload in section {:?}, leaving it as is", media.mid());
                    Ok(media.clone())
                }
            };
        }

        let keep: Vec<String> = codecs
            .iter()
            .filter(|c| {
                primaries.contains(&c.payload.as_str())
                    || (c.is_rtx() && c.apt().is_some_and(|apt| primaries.contains(&apt)))
            })
            .map(|c| c.payload.clone())
            .collect();
        Ok(media.retain_payloads(&keep))
    })
}

/// The start bitrate for a publisher capped at `max_kbps`.
pub fn start_bitrate_kbps(max_kbps: u32, start_factor: f64) -> u32 {
    let max = f64::from(max_kbps);
    (start_factor * max)
        .max(MIN_START_BITRATE_KBPS)
        .min(max)
        .round() as u32
}

/// Adds `x-google-start-bitrate` to the AV1, VP9 and H264 payloads of the
/// video section `target_mid`. VP8 payloads are never touched.
pub fn set_start_bitrate(
    sdp: &SessionDescription,
    max_kbps: u32,
    start_factor: f64,
    target_mid: &str,
) -> SessionDescription {
    let bitrate = start_bitrate_kbps(max_kbps, start_factor).to_string();
    sdp.rewrite_media(|media| {
        if !media.kind().eq_ignore_ascii_case("video") || media.mid() != Some(target_mid) {
            return media.clone();
        }
        let mut out = media.clone();
        for codec in media.codecs() {
            if !START_BITRATE_CODECS
                .iter()
                .any(|name| codec.name.eq_ignore_ascii_case(name))
            {
                continue;
            }
            let mut params = codec.fmtp.unwrap_or_default();
            if params.contains_key(START_BITRATE_KEY) {
                continue;
            }
            params.set(START_BITRATE_KEY, &bitrate);
            out = out.with_fmtp(&codec.payload, &params);
        }
        out
    })
}

/// Mirrors `stereo=1` from the offer's Opus payloads onto the answer, per mid.
pub fn enable_stereo(offer: &SessionDescription, answer: &SessionDescription) -> SessionDescription {
    let stereo_mids: HashSet<&str> = offer
        .media()
        .iter()
        .filter(|m| m.kind().eq_ignore_ascii_case("audio"))
        .filter(|m| {
            m.codecs().iter().any(|c| {
                is_opus(&c.name)
                    && c.fmtp.as_ref().and_then(|p| p.get("stereo")) == Some("1")
            })
        })
        .filter_map(|m| m.mid())
        .collect();

    if stereo_mids.is_empty() {
        return answer.clone();
    }

    update_opus(answer, |media| {
        media.kind().eq_ignore_ascii_case("audio")
            && media.mid().is_some_and(|mid| stereo_mids.contains(mid))
    }, |params| {
        if params.get("stereo") != Some("1") {
            params.set("stereo", "1");
        }
    })
}

/// Turns Opus discontinuous transmission on or off.
pub fn toggle_dtx(sdp: &SessionDescription, enable: bool) -> SessionDescription {
    update_opus(sdp, |media| media.kind().eq_ignore_ascii_case("audio"), |params| {
        let wanted = if enable { "1" } else { "0" };
        if params.contains_key("usedtx") || enable {
            params.set("usedtx", wanted);
        }
    })
}

/// Stereo at the maximum Opus bitrate for the audio section `mid`.
pub fn enable_high_quality_audio(sdp: &SessionDescription, mid: &str) -> SessionDescription {
    update_opus(sdp, |media| {
        media.kind().eq_ignore_ascii_case("audio") && media.mid() == Some(mid)
    }, |params| {
        params.set("stereo", "1");
        params.set("maxaveragebitrate", HIGH_QUALITY_AUDIO_BITRATE);
    })
}

/// Moves `codec` (and its rtx) to the front of every `kind` section's payload list.
pub fn set_preferred_codec(sdp: &SessionDescription, kind: &str, codec: &str) -> SessionDescription {
    sdp.rewrite_media(|media| {
        if !media.kind().eq_ignore_ascii_case(kind) {
            return media.clone();
        }
        let codecs = media.codecs();
        let preferred: Vec<&str> = codecs
            .iter()
            .filter(|c| c.name.eq_ignore_ascii_case(codec))
            .map(|c| c.payload.as_str())
            .collect();
        if preferred.is_empty() {
            return media.clone();
        }
        let is_front = |c: &super::Codec| {
            preferred.contains(&c.payload.as_str())
                || (c.is_rtx() && c.apt().is_some_and(|apt| preferred.contains(&apt)))
        };
        let front = codecs.iter().filter(|c| is_front(c));
        let rest = codecs.iter().filter(|c| !is_front(c));
        let order: Vec<&str> = front.chain(rest).map(|c| c.payload.as_str()).collect();
        media.with_payload_order(&order)
    })
}

fn is_opus(name: &str) -> bool {
    name.eq_ignore_ascii_case("opus")
}

fn update_opus<S, U>(sdp: &SessionDescription, select: S, update: U) -> SessionDescription
where
    S: Fn(&MediaSection) -> bool,
    U: Fn(&mut FmtpParams),
{
    sdp.rewrite_media(|media| {
        if !select(media) {
            return media.clone();
        }
        let mut out = media.clone();
        for codec in media.codecs().into_iter().filter(|c| is_opus(&c.name)) {
            let original = codec.fmtp.unwrap_or_default();
            let mut params = original.clone();
            update(&mut params);
            if params != original {
                out = out.with_fmtp(&codec.payload, &params);
            }
        }
        out
    })
}
