use crate::error::SignalingError;
use crate::peer::types::{IceCandidate, MediaKind};
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tokio::sync::mpsc;

/// Upper bound for an inflated compact envelope.
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    Offer { sdp: String, media: MediaKind },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
    Hangup,
}

impl SignalingMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::Hangup => "hangup",
        }
    }
}

/// One signaling message addressed between two peers for one call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub call_id: String,
    pub from: String,
    pub to: String,
    /// Milliseconds since the Unix epoch at send time.
    pub ts: i64,
    pub message: SignalingMessage,
}

impl Envelope {
    pub fn new(call_id: &str, from: &str, to: &str, message: SignalingMessage) -> Self {
        Self {
            call_id: call_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            ts: chrono::Utc::now().timestamp_millis(),
            message,
        }
    }

    /// JSON, gzip, then base64. Suitable for copy-paste exchange.
    pub fn encode_compact(&self) -> Result<String, SignalingError> {
        let json = serde_json::to_vec(self).map_err(|e| SignalingError::Encode(e.to_string()))?;

        let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
        gz.write_all(&json)
            .map_err(|e| SignalingError::Encode(e.to_string()))?;
        let compressed = gz
            .finish()
            .map_err(|e| SignalingError::Encode(e.to_string()))?;

        Ok(general_purpose::STANDARD.encode(compressed))
    }

    pub fn decode_compact(s: &str) -> Result<Self, SignalingError> {
        let compressed = general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| SignalingError::Decode(e.to_string()))?;

        let gz = GzDecoder::new(&compressed[..]);
        let mut json = Vec::new();
        gz.take(MAX_DECOMPRESSED_SIZE + 1)
            .read_to_end(&mut json)
            .map_err(|e| SignalingError::Decode(e.to_string()))?;
        if json.len() as u64 > MAX_DECOMPRESSED_SIZE {
            return Err(SignalingError::Decode("payload too large".into()));
        }

        serde_json::from_slice(&json).map_err(|e| SignalingError::Decode(e.to_string()))
    }
}

/// Outbound half of the signaling channel.
pub trait SignalingSink: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<(), SignalingError>;
}

impl SignalingSink for mpsc::UnboundedSender<Envelope> {
    fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        mpsc::UnboundedSender::send(self, envelope).map_err(|_| SignalingError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            connection_id: "c1".into(),
        }
    }

    #[test]
    fn messages_are_tagged_in_snake_case() {
        let json = serde_json::to_value(SignalingMessage::Offer {
            sdp: "v=0".into(),
            media: MediaKind::AudioVideo,
        })
        .unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0");

        let json = serde_json::to_value(SignalingMessage::IceCandidate {
            candidate: candidate(),
        })
        .unwrap();
        assert_eq!(json["type"], "ice_candidate");

        let hangup: SignalingMessage = serde_json::from_str(r#"{"type":"hangup"}"#).unwrap();
        assert_eq!(hangup, SignalingMessage::Hangup);
    }

    #[test]
    fn compact_envelope_survives_transfer() {
        let env = Envelope::new(
            "call-1",
            "alice",
            "bob",
            SignalingMessage::IceCandidate {
                candidate: candidate(),
            },
        );
        let packed = env.encode_compact().unwrap();
        assert!(!packed.contains('{'));
        assert_eq!(Envelope::decode_compact(&packed).unwrap(), env);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            Envelope::decode_compact("not base64!"),
            Err(SignalingError::Decode(_))
        ));
        let not_gzip = general_purpose::STANDARD.encode(b"plain");
        assert!(matches!(
            Envelope::decode_compact(&not_gzip),
            Err(SignalingError::Decode(_))
        ));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
        gz.write_all(&vec![b' '; (MAX_DECOMPRESSED_SIZE + 10) as usize])
            .unwrap();
        let bomb = general_purpose::STANDARD.encode(gz.finish().unwrap());
        assert!(matches!(
            Envelope::decode_compact(&bomb),
            Err(SignalingError::Decode(_))
        ));
    }

    #[test]
    fn closed_channel_reports_closed() {
        let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
        drop(rx);
        let sink: &dyn SignalingSink = &tx;
        let env = Envelope::new("c", "a", "b", SignalingMessage::Hangup);
        assert_eq!(sink.send(env), Err(SignalingError::Closed));
    }
}
