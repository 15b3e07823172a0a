//! SDP offer/answer and ICE exchange for one peer connection.
//!
//! Remote candidates are only handed to the peer once a remote description
//! has been applied successfully; earlier ones wait in an
//! [`IceCandidateQueue`] and are flushed in arrival order.

use crate::error::CallError;
use crate::ice::IceCandidateQueue;
use crate::peer::{MediaTrack, PeerConnection, SenderId};
use crate::relay::Relay;
use callbridge::protocol::{WebRtcDescription, WebRtcIce};
use callbridge::{Envelope, IceCandidate, SessionDescription};
use tracing::{debug, warn};

pub struct NegotiationEngine<P: PeerConnection> {
    peer: P,
    relay: Relay,
    conversation_id: String,
    contact_id: String,
    queue: IceCandidateQueue,
    remote_applied: bool,
    senders: Vec<(SenderId, MediaTrack)>,
}

impl<P: PeerConnection> NegotiationEngine<P> {
    pub fn new(
        peer: P,
        relay: Relay,
        conversation_id: impl Into<String>,
        contact_id: impl Into<String>,
    ) -> Self {
        Self {
            peer,
            relay,
            conversation_id: conversation_id.into(),
            contact_id: contact_id.into(),
            queue: IceCandidateQueue::new(),
            remote_applied: false,
            senders: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn peer(&self) -> &P {
        &self.peer
    }

    pub fn remote_description_applied(&self) -> bool {
        self.remote_applied
    }

    pub fn pending_candidates(&self) -> usize {
        self.queue.len()
    }

    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        self.senders.iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn add_local_tracks(&mut self, tracks: &[MediaTrack]) -> Result<(), CallError> {
        for track in tracks {
            let sender = self.peer.add_track(track.clone())?;
            self.senders.push((sender, track.clone()));
        }
        Ok(())
    }

    pub async fn send_offer(&mut self) -> Result<(), CallError> {
        let offer = self.peer.create_offer().await?;
        self.peer.set_local_description(offer.clone()).await?;
        self.relay
            .send(&Envelope::WebRtcOffer(self.description(offer)))?;
        debug!(conversation_id = %self.conversation_id, "offer sent");
        Ok(())
    }

    pub async fn handle_offer(&mut self, offer: SessionDescription) -> Result<(), CallError> {
        self.peer.set_remote_description(offer).await?;
        self.remote_applied = true;

        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer.clone()).await?;
        self.relay
            .send(&Envelope::WebRtcAnswer(self.description(answer)))?;
        debug!(conversation_id = %self.conversation_id, "answer sent");

        self.flush_candidates().await?;
        Ok(())
    }

    pub async fn handle_answer(&mut self, answer: SessionDescription) -> Result<(), CallError> {
        self.peer.set_remote_description(answer).await?;
        self.remote_applied = true;
        self.flush_candidates().await?;
        Ok(())
    }

    /// Apply a remote candidate, or queue it until a remote description is
    /// in place. Returns whether it was applied now.
    pub async fn handle_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<bool, CallError> {
        if !self.remote_applied {
            self.queue.push(candidate);
            debug!(queued = self.queue.len(), "remote candidate queued");
            return Ok(false);
        }
        self.peer.add_ice_candidate(candidate).await?;
        Ok(true)
    }

    /// Forward a candidate discovered by the local peer to the remote side.
    pub fn handle_local_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        self.relay.send(&Envelope::WebRtcIceCandidate(WebRtcIce {
            conversation_id: self.conversation_id.clone(),
            contact_id: self.contact_id.clone(),
            candidate,
        }))?;
        Ok(())
    }

    /// Apply queued candidates in arrival order. Each candidate is applied at
    /// most once; a second flush finds the queue empty. A candidate the peer
    /// rejects is logged and skipped.
    pub async fn flush_candidates(&mut self) -> Result<usize, CallError> {
        if !self.remote_applied {
            return Ok(0);
        }
        let mut applied = 0;
        for candidate in self.queue.drain() {
            match self.peer.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => warn!(error = %e, "queued ICE candidate rejected"),
            }
        }
        if applied > 0 {
            debug!(applied, "flushed queued ICE candidates");
        }
        Ok(applied)
    }

    /// Route a negotiation envelope. Envelopes for another conversation are
    /// ignored with a warning; returns whether the envelope was handled.
    pub async fn handle_envelope(&mut self, envelope: &Envelope) -> Result<bool, CallError> {
        if envelope.conversation_id() != self.conversation_id {
            warn!(
                kind = %envelope.kind(),
                expected = %self.conversation_id,
                got = %envelope.conversation_id(),
                "ignoring envelope for another conversation"
            );
            return Ok(false);
        }
        match envelope {
            Envelope::WebRtcOffer(d) => self.handle_offer(d.sdp.clone()).await?,
            Envelope::WebRtcAnswer(d) => self.handle_answer(d.sdp.clone()).await?,
            Envelope::WebRtcIceCandidate(d) => {
                self.handle_remote_candidate(d.candidate.clone()).await?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Replace the outgoing track of the same kind. A kind with no existing
    /// sender would need renegotiation.
    pub async fn replace_track(&mut self, track: MediaTrack) -> Result<MediaTrack, CallError> {
        let Some(slot) = self.senders.iter().position(|(_, t)| t.kind == track.kind) else {
            return Err(CallError::RenegotiationUnsupported(track.kind));
        };
        let sender = self.senders[slot].0;
        self.peer.replace_track(sender, track.clone()).await?;
        let previous = std::mem::replace(&mut self.senders[slot].1, track);
        Ok(previous)
    }

    pub fn close(&mut self) {
        self.peer.close();
        self.queue.drain();
        self.remote_applied = false;
    }

    fn description(&self, sdp: SessionDescription) -> WebRtcDescription {
        WebRtcDescription {
            conversation_id: self.conversation_id.clone(),
            contact_id: self.contact_id.clone(),
            sdp,
        }
    }
}
