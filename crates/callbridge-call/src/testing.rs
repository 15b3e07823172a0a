//! Scripted peer connection and media devices.
//!
//! `FakePeer` follows the browser's offer/answer rules closely enough to
//! catch ordering mistakes: remote candidates are rejected before a remote
//! description, an answer needs a local offer, and the connection reports
//! `Connected` once both descriptions are in place.

use crate::error::{MediaError, RtcError};
use crate::peer::{
    ConnectionState, MediaDevices, MediaTrack, PeerConnection, PeerEventKind, PeerEventSink,
    PeerFactory, SenderId, TrackKind,
};
use callbridge::protocol::SdpType;
use callbridge::{IceCandidate, SessionDescription};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub fn track(id: &str, kind: TrackKind) -> MediaTrack {
    MediaTrack {
        id: id.to_string(),
        kind,
        label: format!("{kind:?} {id}"),
    }
}

/// Everything a fake peer was asked to do.
#[derive(Debug, Clone, Default)]
pub struct PeerLog {
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub applied_candidates: Vec<IceCandidate>,
    pub tracks: Vec<(SenderId, MediaTrack)>,
    pub closed: bool,
}

pub struct FakePeer {
    name: String,
    events: PeerEventSink,
    log: Arc<Mutex<PeerLog>>,
    next_sender: SenderId,
    connected: bool,
}

impl FakePeer {
    /// Number of local candidates gathered after the first local description.
    pub const CANDIDATES: usize = 2;

    pub fn log(&self) -> PeerLog {
        self.log.lock().unwrap().clone()
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    fn maybe_connect(&mut self) {
        let log = self.log.lock().unwrap();
        if self.connected || log.local.is_none() || log.remote.is_none() {
            return;
        }
        drop(log);
        self.connected = true;
        self.events
            .emit(PeerEventKind::ConnectionState(ConnectionState::Connecting));
        self.events
            .emit(PeerEventKind::ConnectionState(ConnectionState::Connected));
    }

    fn check_open(&self, operation: &'static str) -> Result<(), RtcError> {
        if self.log.lock().unwrap().closed {
            return Err(RtcError::operation(operation, "peer connection is closed"));
        }
        Ok(())
    }

    /// Simulate a transport failure.
    pub fn fail(&self) {
        self.events
            .emit(PeerEventKind::ConnectionState(ConnectionState::Failed));
    }

    /// Simulate a remote track arriving.
    pub fn receive_track(&self, track: MediaTrack) {
        self.events.emit(PeerEventKind::RemoteTrack(track));
    }
}

impl PeerConnection for FakePeer {
    async fn create_offer(&mut self) -> Result<SessionDescription, RtcError> {
        self.check_open("createOffer")?;
        Ok(SessionDescription::offer(format!("v=0 o={} offer", self.name)))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, RtcError> {
        self.check_open("createAnswer")?;
        let has_offer = matches!(
            self.log.lock().unwrap().remote.as_ref().map(|d| d.sdp_type),
            Some(SdpType::Offer)
        );
        if !has_offer {
            return Err(RtcError::operation("createAnswer", "no remote offer"));
        }
        Ok(SessionDescription::answer(format!("v=0 o={} answer", self.name)))
    }

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        self.check_open("setLocalDescription")?;
        let first = {
            let mut log = self.log.lock().unwrap();
            let first = log.local.is_none();
            log.local = Some(description);
            first
        };
        if first {
            for n in 0..Self::CANDIDATES {
                self.events.emit(PeerEventKind::LocalCandidate(IceCandidate {
                    candidate: format!("candidate:{}-{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host", self.name),
                    sdp_mid: Some("0".to_string()),
                    sdp_m_line_index: Some(0),
                    username_fragment: None,
                }));
            }
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        self.check_open("setRemoteDescription")?;
        {
            let mut log = self.log.lock().unwrap();
            let local_offer = matches!(
                log.local.as_ref().map(|d| d.sdp_type),
                Some(SdpType::Offer)
            );
            match description.sdp_type {
                SdpType::Offer if log.local.is_some() => {
                    return Err(RtcError::operation(
                        "setRemoteDescription",
                        "offer while a local description is set",
                    ));
                }
                SdpType::Answer if !local_offer => {
                    return Err(RtcError::operation(
                        "setRemoteDescription",
                        "answer without a local offer",
                    ));
                }
                _ => {}
            }
            log.remote = Some(description);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.check_open("addIceCandidate")?;
        let mut log = self.log.lock().unwrap();
        if log.remote.is_none() {
            return Err(RtcError::operation(
                "addIceCandidate",
                "remote description is not set",
            ));
        }
        log.applied_candidates.push(candidate);
        Ok(())
    }

    fn add_track(&mut self, track: MediaTrack) -> Result<SenderId, RtcError> {
        self.check_open("addTrack")?;
        let sender = self.next_sender;
        self.next_sender += 1;
        self.log.lock().unwrap().tracks.push((sender, track));
        Ok(sender)
    }

    async fn replace_track(&mut self, sender: SenderId, track: MediaTrack) -> Result<(), RtcError> {
        self.check_open("replaceTrack")?;
        let mut log = self.log.lock().unwrap();
        let Some(slot) = log.tracks.iter_mut().find(|(id, _)| *id == sender) else {
            return Err(RtcError::UnknownSender(sender));
        };
        slot.1 = track;
        Ok(())
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closed = true;
    }
}

/// Creates [`FakePeer`]s and keeps a handle on every log.
#[derive(Clone)]
pub struct FakePeerFactory {
    name: String,
    peers: Arc<Mutex<Vec<Arc<Mutex<PeerLog>>>>>,
}

impl FakePeerFactory {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            peers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Snapshots of every peer created so far, oldest first.
    pub fn logs(&self) -> Vec<PeerLog> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .map(|log| log.lock().unwrap().clone())
            .collect()
    }

    /// Snapshot of the most recently created peer's log.
    pub fn last(&self) -> Option<PeerLog> {
        self.peers
            .lock()
            .unwrap()
            .last()
            .map(|log| log.lock().unwrap().clone())
    }
}

impl PeerFactory for FakePeerFactory {
    type Peer = FakePeer;

    fn create(&self, events: PeerEventSink) -> Result<FakePeer, RtcError> {
        let log = Arc::new(Mutex::new(PeerLog::default()));
        self.peers.lock().unwrap().push(log.clone());
        Ok(FakePeer {
            name: self.name.clone(),
            events,
            log,
            next_sender: 0,
            connected: false,
        })
    }
}

/// Media devices that hand out synthetic tracks, or refuse permission.
#[derive(Clone, Default)]
pub struct FakeMedia {
    deny: Arc<AtomicBool>,
    counter: Arc<AtomicU32>,
    released: Arc<Mutex<Vec<MediaTrack>>>,
}

impl FakeMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_permission(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    pub fn released(&self) -> Vec<MediaTrack> {
        self.released.lock().unwrap().clone()
    }

    /// A fresh track, as if the user picked another device.
    pub fn another(&self, kind: TrackKind) -> MediaTrack {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let prefix = match kind {
            TrackKind::Audio => "mic",
            TrackKind::Video => "cam",
        };
        track(&format!("{prefix}-{n}"), kind)
    }
}

impl MediaDevices for FakeMedia {
    async fn user_media(&self, video: bool) -> Result<Vec<MediaTrack>, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        let mut tracks = vec![self.another(TrackKind::Audio)];
        if video {
            tracks.push(self.another(TrackKind::Video));
        }
        Ok(tracks)
    }

    fn release(&self, tracks: &[MediaTrack]) {
        self.released.lock().unwrap().extend_from_slice(tracks);
    }
}
