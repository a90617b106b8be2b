use super::SessionDescription;

/// What the negotiation layer knows about a transceiver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransceiverInfo {
    pub mid: Option<String>,
    /// `audio` or `video`
    pub kind: String,
    pub track_id: Option<String>,
}

/// Resolves the mid of a transceiver.
///
/// An assigned mid wins. Without a description the mid is empty. Otherwise
/// the first section of the same kind whose `msid` mentions the track (or
/// that has no `msid` at all) is used, and failing that the transceiver's
/// index, or an empty string without one.
pub fn extract_mid(
    transceiver: &TransceiverInfo,
    fallback_index: Option<usize>,
    sdp: Option<&SessionDescription>,
) -> String {
    if let Some(mid) = transceiver.mid.as_deref().filter(|m| !m.is_empty()) {
        return mid.to_string();
    }

    let Some(sdp) = sdp else {
        return String::new();
    };
    let from_sdp = sdp
        .media()
        .iter()
        .filter(|m| m.kind().eq_ignore_ascii_case(&transceiver.kind))
        .find(|m| match (m.msid(), transceiver.track_id.as_deref()) {
            (None, _) => true,
            (Some(msid), Some(track_id)) => msid.contains(track_id),
            (Some(_), None) => false,
        })
        .and_then(|m| m.mid());

    match (from_sdp, fallback_index) {
        (Some(mid), _) => mid.to_string(),
        (None, Some(index)) => index.to_string(),
        (None, None) => String::new(),
    }
}
