use serde::{Deserialize, Serialize};

/// A WebRTC SDP session description, carried verbatim between peer and relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// A single trickled ICE candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// The signaling envelope exchanged over both WebSocket listeners.
///
/// Exactly one of `description`/`candidate` is present on the wire; an
/// envelope with both or neither is rejected by `SignalingEnvelope::kind`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidateInit>,
}

impl SignalingEnvelope {
    pub fn description(desc: SessionDescription) -> Self {
        Self {
            description: Some(desc),
            candidate: None,
        }
    }

    pub fn candidate(candidate: IceCandidateInit) -> Self {
        Self {
            description: None,
            candidate: Some(candidate),
        }
    }

    /// Returns the parsed payload, or an error if the envelope carries zero
    /// or both fields. A caller that receives `Err` should drop the message
    /// and log a warning rather than closing the connection (see the
    /// protocol-error recovery policy).
    pub fn kind(&self) -> Result<EnvelopeKind<'_>, EnvelopeError> {
        match (&self.description, &self.candidate) {
            (Some(d), None) => Ok(EnvelopeKind::Description(d)),
            (None, Some(c)) => Ok(EnvelopeKind::Candidate(c)),
            (None, None) => Err(EnvelopeError::Empty),
            (Some(_), Some(_)) => Err(EnvelopeError::Ambiguous),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope carries neither a description nor a candidate")]
    Empty,
    #[error("envelope carries both a description and a candidate")]
    Ambiguous,
}

#[derive(Debug, Clone, Copy)]
pub enum EnvelopeKind<'a> {
    Description(&'a SessionDescription),
    Candidate(&'a IceCandidateInit),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_roundtrip() {
        let env = SignalingEnvelope::description(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0\r\n...".to_string(),
        });
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains(r#""description""#));
        assert!(json.contains(r#""type":"offer""#));
        assert!(!json.contains("candidate"));

        let parsed: SignalingEnvelope = serde_json::from_str(&json).unwrap();
        match parsed.kind().unwrap() {
            EnvelopeKind::Description(d) => {
                assert_eq!(d.kind, SdpKind::Offer);
                assert_eq!(d.sdp, "v=0\r\n...");
            }
            _ => panic!("expected description"),
        }
    }

    #[test]
    fn candidate_roundtrip() {
        let env = SignalingEnvelope::candidate(IceCandidateInit {
            candidate: "candidate:1 1 UDP 2130706431 192.168.1.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        });
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains(r#""candidate""#));
        assert!(!json.contains("description"));

        let parsed: SignalingEnvelope = serde_json::from_str(&json).unwrap();
        match parsed.kind().unwrap() {
            EnvelopeKind::Candidate(c) => {
                assert!(c.candidate.starts_with("candidate:1"));
                assert_eq!(c.sdp_mline_index, Some(0));
            }
            _ => panic!("expected candidate"),
        }
    }

    #[test]
    fn browser_shaped_offer_parses() {
        let browser_json = r#"{"description":{"type":"offer","sdp":"v=0\r\n..."}}"#;
        let env: SignalingEnvelope = serde_json::from_str(browser_json).unwrap();
        assert!(matches!(env.kind(), Ok(EnvelopeKind::Description(_))));
    }

    #[test]
    fn browser_shaped_candidate_parses() {
        let browser_json = r#"{"candidate":{"candidate":"candidate:1 1 UDP 2130706431 192.168.1.1 50000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let env: SignalingEnvelope = serde_json::from_str(browser_json).unwrap();
        assert!(matches!(env.kind(), Ok(EnvelopeKind::Candidate(_))));
    }

    #[test]
    fn empty_envelope_is_rejected() {
        let env: SignalingEnvelope = serde_json::from_str("{}").unwrap();
        assert_eq!(env.kind().unwrap_err(), EnvelopeError::Empty);
    }

    #[test]
    fn ambiguous_envelope_is_rejected() {
        let env = SignalingEnvelope {
            description: Some(SessionDescription {
                kind: SdpKind::Answer,
                sdp: "sdp".to_string(),
            }),
            candidate: Some(IceCandidateInit {
                candidate: "c".to_string(),
                sdp_mid: None,
                sdp_mline_index: None,
            }),
        };
        let json = serde_json::to_string(&env).unwrap();
        let parsed: SignalingEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind().unwrap_err(), EnvelopeError::Ambiguous);
    }

    #[test]
    fn unknown_top_level_keys_are_ignored() {
        let json = r#"{"description":{"type":"answer","sdp":"v=0"},"extra":"ignored"}"#;
        let env: SignalingEnvelope = serde_json::from_str(json).unwrap();
        assert!(matches!(env.kind(), Ok(EnvelopeKind::Description(_))));
    }
}
