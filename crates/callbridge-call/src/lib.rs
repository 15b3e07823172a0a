//! Client half of callbridge.
//!
//! A [`Relay`] carries typed envelopes over one WebSocket connection. The
//! [`CallManager`] drives a single call at a time: it owns the session state,
//! creates the peer connection through a [`PeerFactory`] and lets a
//! [`NegotiationEngine`] exchange SDP and ICE candidates over the relay.

pub mod error;
pub mod ice;
pub mod negotiation;
pub mod peer;
pub mod relay;
pub mod session;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::{CallError, MediaError, RelayError, RtcError};
pub use ice::IceCandidateQueue;
pub use negotiation::NegotiationEngine;
pub use peer::{
    ConnectionState, MediaDevices, MediaTrack, PeerConnection, PeerEvent, PeerEventKind,
    PeerEventSink, PeerFactory, SenderId, TrackKind,
};
pub use relay::{BindingId, Relay, drive_websocket};
pub use session::{
    CallCommand, CallHandle, CallManager, CallRole, CallSession, CallStatus, StartCall,
};
