//! Seams to the platform's peer connection and media capture.
//!
//! Only the operations the negotiation engine needs are modelled. A peer
//! reports asynchronous happenings (local ICE candidates, connection state,
//! remote tracks) through the [`PeerEventSink`] it was created with.

use crate::error::{MediaError, RtcError};
use callbridge::{IceCandidate, SessionDescription};
use std::future::Future;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub label: String,
}

/// Handle to an outgoing RTP sender, returned by [`PeerConnection::add_track`].
pub type SenderId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEventKind {
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    RemoteTrack(MediaTrack),
}

/// An event from a peer connection, tagged with the call generation that
/// created the peer so events from a torn-down call can be told apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub generation: u64,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, kind: PeerEventKind) {
        // The receiver only goes away when the call manager stops.
        let _ = self.tx.send(PeerEvent {
            generation: self.generation,
            kind,
        });
    }
}

pub trait PeerConnection: Send + 'static {
    fn create_offer(&mut self)
    -> impl Future<Output = Result<SessionDescription, RtcError>> + Send;

    fn create_answer(
        &mut self,
    ) -> impl Future<Output = Result<SessionDescription, RtcError>> + Send;

    fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> impl Future<Output = Result<(), RtcError>> + Send;

    fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> impl Future<Output = Result<(), RtcError>> + Send;

    fn add_ice_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> impl Future<Output = Result<(), RtcError>> + Send;

    fn add_track(&mut self, track: MediaTrack) -> Result<SenderId, RtcError>;

    /// Swap the track on an existing sender without renegotiating.
    fn replace_track(
        &mut self,
        sender: SenderId,
        track: MediaTrack,
    ) -> impl Future<Output = Result<(), RtcError>> + Send;

    fn close(&mut self);
}

pub trait PeerFactory: Send + Sync + 'static {
    type Peer: PeerConnection;

    fn create(&self, events: PeerEventSink) -> Result<Self::Peer, RtcError>;
}

pub trait MediaDevices: Send + Sync + 'static {
    /// Acquire microphone, and camera when `video` is set.
    fn user_media(
        &self,
        video: bool,
    ) -> impl Future<Output = Result<Vec<MediaTrack>, MediaError>> + Send;

    /// Stop capture for tracks that are no longer used.
    fn release(&self, tracks: &[MediaTrack]);
}
