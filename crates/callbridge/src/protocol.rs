use crate::signal::ConversationMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Envelope types
// ---------------------------------------------------------------------------

/// Closed set of message types carried over the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeType {
    CallBegin,
    CallAccept,
    CallEnd,
    WebRtcOffer,
    WebRtcAnswer,
    WebRtcIceCandidate,
    ConversationMessage,
    ConversationView,
    ComposingStatus,
}

impl EnvelopeType {
    pub const ALL: [EnvelopeType; 9] = [
        EnvelopeType::CallBegin,
        EnvelopeType::CallAccept,
        EnvelopeType::CallEnd,
        EnvelopeType::WebRtcOffer,
        EnvelopeType::WebRtcAnswer,
        EnvelopeType::WebRtcIceCandidate,
        EnvelopeType::ConversationMessage,
        EnvelopeType::ConversationView,
        EnvelopeType::ComposingStatus,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeType::CallBegin => "CallBegin",
            EnvelopeType::CallAccept => "CallAccept",
            EnvelopeType::CallEnd => "CallEnd",
            EnvelopeType::WebRtcOffer => "WebRtcOffer",
            EnvelopeType::WebRtcAnswer => "WebRtcAnswer",
            EnvelopeType::WebRtcIceCandidate => "WebRtcIceCandidate",
            EnvelopeType::ConversationMessage => "ConversationMessage",
            EnvelopeType::ConversationView => "ConversationView",
            EnvelopeType::ComposingStatus => "ComposingStatus",
        }
    }

    /// Call-control and WebRTC negotiation traffic. These travel peer-to-peer
    /// over the daemon's account message channel; the rest stay between one
    /// browser and its server.
    pub fn is_call_signaling(self) -> bool {
        matches!(
            self,
            EnvelopeType::CallBegin
                | EnvelopeType::CallAccept
                | EnvelopeType::CallEnd
                | EnvelopeType::WebRtcOffer
                | EnvelopeType::WebRtcAnswer
                | EnvelopeType::WebRtcIceCandidate
        )
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnvelopeType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EnvelopeError::UnknownType(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// WebRTC payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An SDP offer or answer, shaped like the browser's `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate, shaped like the browser's `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallBegin {
    pub conversation_id: String,
    pub contact_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_video_on: Option<bool>,
}

/// Data for `CallAccept` and `CallEnd`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallControl {
    pub conversation_id: String,
    pub contact_id: String,
}

/// Data for `WebRtcOffer` and `WebRtcAnswer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcDescription {
    pub conversation_id: String,
    pub contact_id: String,
    pub sdp: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcIce {
    pub conversation_id: String,
    pub contact_id: String,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessageData {
    pub conversation_id: String,
    pub message: ConversationMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposingStatus {
    pub conversation_id: String,
    /// Who is composing. Filled in by the server on the way out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    pub is_writing: bool,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A relay message: `{ "type": <EnvelopeType>, "data": { ... } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Envelope {
    CallBegin(CallBegin),
    CallAccept(CallControl),
    CallEnd(CallControl),
    WebRtcOffer(WebRtcDescription),
    WebRtcAnswer(WebRtcDescription),
    WebRtcIceCandidate(WebRtcIce),
    ConversationMessage(ConversationMessageData),
    ConversationView(ConversationView),
    ComposingStatus(ComposingStatus),
}

/// Why an incoming frame could not be turned into an [`Envelope`].
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("unknown envelope type: {0}")]
    UnknownType(String),

    #[error("invalid {kind} data: {source}")]
    InvalidData {
        kind: EnvelopeType,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    data: Option<Value>,
}

impl Envelope {
    /// Parse a relay text frame, classifying what is wrong with it if it is
    /// not a well-formed envelope.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        let (Some(kind), Some(data)) = (raw.kind, raw.data) else {
            return Err(EnvelopeError::Malformed(
                "missing `type` or `data`".to_string(),
            ));
        };
        Self::from_parts(kind.parse()?, data)
    }

    /// Build an envelope from an already-split type and data object.
    pub fn from_parts(kind: EnvelopeType, data: Value) -> Result<Self, EnvelopeError> {
        let invalid = |source: serde_json::Error| EnvelopeError::InvalidData { kind, source };
        Ok(match kind {
            EnvelopeType::CallBegin => {
                Envelope::CallBegin(serde_json::from_value(data).map_err(invalid)?)
            }
            EnvelopeType::CallAccept => {
                Envelope::CallAccept(serde_json::from_value(data).map_err(invalid)?)
            }
            EnvelopeType::CallEnd => {
                Envelope::CallEnd(serde_json::from_value(data).map_err(invalid)?)
            }
            EnvelopeType::WebRtcOffer => {
                Envelope::WebRtcOffer(serde_json::from_value(data).map_err(invalid)?)
            }
            EnvelopeType::WebRtcAnswer => {
                Envelope::WebRtcAnswer(serde_json::from_value(data).map_err(invalid)?)
            }
            EnvelopeType::WebRtcIceCandidate => {
                Envelope::WebRtcIceCandidate(serde_json::from_value(data).map_err(invalid)?)
            }
            EnvelopeType::ConversationMessage => {
                Envelope::ConversationMessage(serde_json::from_value(data).map_err(invalid)?)
            }
            EnvelopeType::ConversationView => {
                Envelope::ConversationView(serde_json::from_value(data).map_err(invalid)?)
            }
            EnvelopeType::ComposingStatus => {
                Envelope::ComposingStatus(serde_json::from_value(data).map_err(invalid)?)
            }
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> EnvelopeType {
        match self {
            Envelope::CallBegin(_) => EnvelopeType::CallBegin,
            Envelope::CallAccept(_) => EnvelopeType::CallAccept,
            Envelope::CallEnd(_) => EnvelopeType::CallEnd,
            Envelope::WebRtcOffer(_) => EnvelopeType::WebRtcOffer,
            Envelope::WebRtcAnswer(_) => EnvelopeType::WebRtcAnswer,
            Envelope::WebRtcIceCandidate(_) => EnvelopeType::WebRtcIceCandidate,
            Envelope::ConversationMessage(_) => EnvelopeType::ConversationMessage,
            Envelope::ConversationView(_) => EnvelopeType::ConversationView,
            Envelope::ComposingStatus(_) => EnvelopeType::ComposingStatus,
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            Envelope::CallBegin(d) => &d.conversation_id,
            Envelope::CallAccept(d) | Envelope::CallEnd(d) => &d.conversation_id,
            Envelope::WebRtcOffer(d) | Envelope::WebRtcAnswer(d) => &d.conversation_id,
            Envelope::WebRtcIceCandidate(d) => &d.conversation_id,
            Envelope::ConversationMessage(d) => &d.conversation_id,
            Envelope::ConversationView(d) => &d.conversation_id,
            Envelope::ComposingStatus(d) => &d.conversation_id,
        }
    }

    pub fn contact_id(&self) -> Option<&str> {
        match self {
            Envelope::CallBegin(d) => Some(&d.contact_id),
            Envelope::CallAccept(d) | Envelope::CallEnd(d) => Some(&d.contact_id),
            Envelope::WebRtcOffer(d) | Envelope::WebRtcAnswer(d) => Some(&d.contact_id),
            Envelope::WebRtcIceCandidate(d) => Some(&d.contact_id),
            Envelope::ComposingStatus(d) => d.contact_id.as_deref(),
            Envelope::ConversationMessage(_) | Envelope::ConversationView(_) => None,
        }
    }

    /// Replace the contact addressing. Outbound envelopes name the recipient;
    /// the server swaps that for the sender before delivery.
    pub fn with_contact_id(mut self, contact_id: &str) -> Self {
        match &mut self {
            Envelope::CallBegin(d) => d.contact_id = contact_id.to_string(),
            Envelope::CallAccept(d) | Envelope::CallEnd(d) => d.contact_id = contact_id.to_string(),
            Envelope::WebRtcOffer(d) | Envelope::WebRtcAnswer(d) => {
                d.contact_id = contact_id.to_string()
            }
            Envelope::WebRtcIceCandidate(d) => d.contact_id = contact_id.to_string(),
            Envelope::ComposingStatus(d) => d.contact_id = Some(contact_id.to_string()),
            Envelope::ConversationMessage(_) | Envelope::ConversationView(_) => {}
        }
        self
    }
}
