pub mod protocol;
pub mod signal;

pub use protocol::{Envelope, EnvelopeError, EnvelopeType, IceCandidate, SessionDescription};
pub use signal::{Signal, SignalDecodeError, SignalKind};

/// Payload key under which call-signaling envelopes travel over the daemon's
/// account text-message channel.
pub const RELAY_MIME_TYPE: &str = "application/x-callbridge-signal+json";

/// Maximum size of a single relay text frame (64 KiB).
pub const MAX_FRAME_BYTES: usize = 64 * 1024;
