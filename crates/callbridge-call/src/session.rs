//! Call session state machine.
//!
//! One [`CallManager`] per client owns at most one live call. Status only
//! moves forward through `Default -> Ringing -> Connecting -> InCall`, or into
//! a terminal state. A terminal session stays visible until the next call
//! replaces it, but holds no peer connection or media.

use crate::error::{CallError, MediaError, RelayError};
use crate::ice::IceCandidateQueue;
use crate::negotiation::NegotiationEngine;
use crate::peer::{
    ConnectionState, MediaDevices, MediaTrack, PeerEvent, PeerEventKind, PeerEventSink,
    PeerFactory,
};
use crate::relay::{BindingId, Relay};
use callbridge::protocol::{CallBegin, CallControl};
use callbridge::{Envelope, EnvelopeType, SessionDescription};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallStatus {
    Default,
    Ringing,
    Connecting,
    InCall,
    Ended,
    /// Media capture was refused; reported separately from a plain hang-up.
    PermissionDenied,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::PermissionDenied)
    }

    fn rank(self) -> u8 {
        match self {
            CallStatus::Default => 0,
            CallStatus::Ringing => 1,
            CallStatus::Connecting => 2,
            CallStatus::InCall => 3,
            CallStatus::Ended | CallStatus::PermissionDenied => 4,
        }
    }

    /// Forward moves only; any live state may end.
    pub fn can_advance_to(self, next: CallStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Receiver,
}

/// Observable view of the current (or last) call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub conversation_id: String,
    pub contact_id: String,
    pub role: CallRole,
    pub status: CallStatus,
    pub with_video: bool,
    pub local_tracks: Vec<MediaTrack>,
    pub remote_tracks: Vec<MediaTrack>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCall {
    pub conversation_id: String,
    pub contact_id: String,
    pub with_video: bool,
}

struct ActiveCall<P: crate::peer::PeerConnection> {
    view: CallSession,
    generation: u64,
    engine: Option<NegotiationEngine<P>>,
    /// Remote candidates received before the peer connection exists.
    early_candidates: IceCandidateQueue,
    /// An offer that overtook our own `CallAccept`.
    early_offer: Option<SessionDescription>,
}

impl<P: crate::peer::PeerConnection> ActiveCall<P> {
    fn advance(&mut self, next: CallStatus) -> Result<(), CallError> {
        let current = self.view.status;
        if !current.can_advance_to(next) {
            return Err(CallError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        info!(
            conversation_id = %self.view.conversation_id,
            from = ?current,
            to = ?next,
            "call status"
        );
        self.view.status = next;
        Ok(())
    }

    fn control(&self) -> CallControl {
        CallControl {
            conversation_id: self.view.conversation_id.clone(),
            contact_id: self.view.contact_id.clone(),
        }
    }
}

pub struct CallManager<F: PeerFactory, M: MediaDevices> {
    factory: F,
    media: M,
    relay: Relay,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    call: Option<ActiveCall<F::Peer>>,
    generation: u64,
}

impl<F: PeerFactory, M: MediaDevices> CallManager<F, M> {
    /// `peer_events` is handed to every peer connection this manager creates;
    /// feed its receiver back through [`CallManager::handle_peer_event`] or
    /// [`CallManager::run`].
    pub fn new(
        factory: F,
        media: M,
        relay: Relay,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            factory,
            media,
            relay,
            peer_events,
            call: None,
            generation: 0,
        }
    }

    /// Route call-signaling envelopes from the relay into a channel for this
    /// manager. Bindings last for the current relay connection only.
    pub fn bind(&self) -> (mpsc::UnboundedReceiver<Envelope>, Vec<BindingId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ids = EnvelopeType::ALL
            .into_iter()
            .filter(|kind| kind.is_call_signaling())
            .map(|kind| {
                let tx = tx.clone();
                self.relay.bind(kind, move |envelope| {
                    let _ = tx.send(envelope.clone());
                })
            })
            .collect();
        (rx, ids)
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.call.as_ref().map(|c| &c.view)
    }

    pub fn status(&self) -> CallStatus {
        self.session()
            .map(|s| s.status)
            .unwrap_or(CallStatus::Default)
    }

    /// The negotiation engine of the live call, once the peer exists.
    pub fn engine(&self) -> Option<&NegotiationEngine<F::Peer>> {
        self.call.as_ref().and_then(|c| c.engine.as_ref())
    }

    fn live(&self) -> Option<&ActiveCall<F::Peer>> {
        self.call.as_ref().filter(|c| !c.view.status.is_terminal())
    }

    fn live_mut(&mut self) -> Option<&mut ActiveCall<F::Peer>> {
        self.call.as_mut().filter(|c| !c.view.status.is_terminal())
    }

    /// Ring a contact. Fails immediately if a call is already live.
    pub fn start_call(&mut self, request: StartCall) -> Result<(), CallError> {
        if let Some(call) = self.live() {
            return Err(CallError::SessionActive {
                conversation_id: call.view.conversation_id.clone(),
            });
        }

        self.relay.send(&Envelope::CallBegin(CallBegin {
            conversation_id: request.conversation_id.clone(),
            contact_id: request.contact_id.clone(),
            with_video_on: Some(request.with_video),
        }))?;

        let mut call = self.new_call(
            request.conversation_id,
            request.contact_id,
            CallRole::Caller,
            request.with_video,
        );
        call.advance(CallStatus::Ringing)?;
        self.call = Some(call);
        Ok(())
    }

    /// Answer a ringing incoming call.
    pub async fn accept_call(&mut self) -> Result<(), CallError> {
        let (with_video, status) = match self.live() {
            Some(call) if call.view.role == CallRole::Receiver => {
                (call.view.with_video, call.view.status)
            }
            Some(call) => {
                return Err(CallError::InvalidTransition {
                    from: call.view.status,
                    to: CallStatus::Connecting,
                });
            }
            None => return Err(CallError::NoSession),
        };
        if status != CallStatus::Ringing {
            return Err(CallError::InvalidTransition {
                from: status,
                to: CallStatus::Connecting,
            });
        }

        let tracks = self.acquire_media(with_video).await?;
        self.open_engine(tracks)?;

        let Some(call) = self.live() else {
            return Err(CallError::NoSession);
        };
        if let Err(e) = self.relay.send(&Envelope::CallAccept(call.control())) {
            // Still ringing with nothing held, so accept can be retried.
            self.discard_engine();
            return Err(e.into());
        }
        if let Err(e) = self.answer_accepted().await {
            return Err(self.fail_call(e));
        }
        Ok(())
    }

    async fn answer_accepted(&mut self) -> Result<(), CallError> {
        self.apply_early_candidates().await?;
        let Some(call) = self.live_mut() else {
            return Err(CallError::NoSession);
        };
        call.advance(CallStatus::Connecting)?;
        if let Some(offer) = call.early_offer.take()
            && let Some(engine) = call.engine.as_mut()
        {
            engine.handle_offer(offer).await?;
        }
        Ok(())
    }

    /// Hang up from any live state.
    pub fn end_call(&mut self) -> Result<(), CallError> {
        let Some(call) = self.live() else {
            return Err(CallError::NoSession);
        };
        if let Err(e) = self.relay.send(&Envelope::CallEnd(call.control())) {
            warn!(error = %e, "could not notify remote side of hang-up");
        }
        self.teardown(CallStatus::Ended);
        Ok(())
    }

    /// Switch microphone or camera on the live call without renegotiating.
    pub async fn switch_track(&mut self, track: MediaTrack) -> Result<(), CallError> {
        let Some(call) = self.live_mut() else {
            return Err(CallError::NoSession);
        };
        let Some(engine) = call.engine.as_mut() else {
            return Err(CallError::NoSession);
        };
        let previous = engine.replace_track(track).await?;
        call.view.local_tracks = engine.local_tracks();
        self.media.release(std::slice::from_ref(&previous));
        Ok(())
    }

    /// React to a call-signaling envelope. Returns whether it changed anything.
    pub async fn handle_envelope(&mut self, envelope: Envelope) -> Result<bool, CallError> {
        match envelope {
            Envelope::CallBegin(begin) => Ok(self.on_call_begin(begin)),
            Envelope::CallAccept(accept) => self.on_call_accept(accept).await,
            Envelope::CallEnd(end) => Ok(self.on_call_end(end)),
            envelope @ (Envelope::WebRtcOffer(_)
            | Envelope::WebRtcAnswer(_)
            | Envelope::WebRtcIceCandidate(_)) => self.on_negotiation(envelope).await,
            other => {
                debug!(kind = %other.kind(), "not a call envelope");
                Ok(false)
            }
        }
    }

    fn on_call_begin(&mut self, begin: CallBegin) -> bool {
        if let Some(call) = self.live() {
            warn!(
                active = %call.view.conversation_id,
                incoming = %begin.conversation_id,
                "ignoring CallBegin while a call is active"
            );
            return false;
        }
        let mut call = self.new_call(
            begin.conversation_id,
            begin.contact_id,
            CallRole::Receiver,
            begin.with_video_on.unwrap_or(false),
        );
        if call.advance(CallStatus::Ringing).is_err() {
            return false;
        }
        self.call = Some(call);
        true
    }

    async fn on_call_accept(&mut self, accept: CallControl) -> Result<bool, CallError> {
        let with_video = match self.live() {
            Some(call)
                if call.view.role == CallRole::Caller
                    && call.view.status == CallStatus::Ringing
                    && call.view.conversation_id == accept.conversation_id =>
            {
                call.view.with_video
            }
            _ => {
                warn!(conversation_id = %accept.conversation_id, "ignoring unexpected CallAccept");
                return Ok(false);
            }
        };

        let tracks = match self.acquire_media(with_video).await {
            Ok(tracks) => tracks,
            Err(e) => {
                self.notify_end();
                return Err(e);
            }
        };
        if let Err(e) = self.open_engine(tracks) {
            return Err(self.fail_call(e));
        }
        if let Err(e) = self.offer_accepted().await {
            return Err(self.fail_call(e));
        }
        Ok(true)
    }

    async fn offer_accepted(&mut self) -> Result<(), CallError> {
        self.apply_early_candidates().await?;
        let Some(call) = self.live_mut() else {
            return Err(CallError::NoSession);
        };
        if let Some(engine) = call.engine.as_mut() {
            engine.send_offer().await?;
        }
        call.advance(CallStatus::Connecting)?;
        Ok(())
    }

    fn on_call_end(&mut self, end: CallControl) -> bool {
        match self.live() {
            Some(call) if call.view.conversation_id == end.conversation_id => {
                info!(conversation_id = %end.conversation_id, "remote side hung up");
                self.teardown(CallStatus::Ended);
                true
            }
            _ => {
                debug!(conversation_id = %end.conversation_id, "CallEnd for no live call");
                false
            }
        }
    }

    async fn on_negotiation(&mut self, envelope: Envelope) -> Result<bool, CallError> {
        let Some(call) = self.live_mut() else {
            warn!(kind = %envelope.kind(), "ignoring negotiation envelope with no live call");
            return Ok(false);
        };
        if let Some(engine) = call.engine.as_mut() {
            return engine.handle_envelope(&envelope).await;
        }

        if envelope.conversation_id() != call.view.conversation_id {
            warn!(
                kind = %envelope.kind(),
                expected = %call.view.conversation_id,
                got = %envelope.conversation_id(),
                "ignoring envelope for another conversation"
            );
            return Ok(false);
        }
        match envelope {
            Envelope::WebRtcIceCandidate(ice) => {
                call.early_candidates.push(ice.candidate);
                Ok(true)
            }
            Envelope::WebRtcOffer(offer) => {
                call.early_offer = Some(offer.sdp);
                Ok(true)
            }
            other => {
                warn!(kind = %other.kind(), "negotiation envelope before the peer exists");
                Ok(false)
            }
        }
    }

    /// React to an event from the live call's peer connection. Events from an
    /// earlier call are dropped.
    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<(), CallError> {
        let Some(call) = self.live_mut() else {
            debug!(generation = event.generation, "peer event with no live call");
            return Ok(());
        };
        if call.generation != event.generation {
            debug!(
                generation = event.generation,
                current = call.generation,
                "dropping stale peer event"
            );
            return Ok(());
        }

        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                if let Some(engine) = call.engine.as_ref() {
                    engine.handle_local_candidate(candidate)?;
                }
            }
            PeerEventKind::RemoteTrack(track) => call.view.remote_tracks.push(track),
            PeerEventKind::ConnectionState(ConnectionState::Connected) => {
                if call.view.status != CallStatus::InCall {
                    call.advance(CallStatus::InCall)?;
                }
            }
            PeerEventKind::ConnectionState(
                state @ (ConnectionState::Failed | ConnectionState::Closed),
            ) => {
                warn!(conversation_id = %call.view.conversation_id, ?state, "peer connection lost");
                self.notify_end();
                self.teardown(CallStatus::Ended);
            }
            PeerEventKind::ConnectionState(state) => {
                debug!(?state, "peer connection state");
            }
        }
        Ok(())
    }

    /// Serve commands, relay envelopes and peer events until every command
    /// handle is dropped. `status` sees the session after every step.
    pub async fn run(
        mut self,
        mut envelopes: mpsc::UnboundedReceiver<Envelope>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        mut commands: mpsc::Receiver<CallCommand>,
        status: watch::Sender<Option<CallSession>>,
    ) {
        let mut relay_open = true;
        loop {
            tokio::select! {
                envelope = envelopes.recv(), if relay_open => match envelope {
                    Some(envelope) => {
                        if let Err(e) = self.handle_envelope(envelope).await {
                            warn!(error = %e, "call envelope failed");
                        }
                    }
                    None => {
                        // Relay bindings were cleared with the connection.
                        relay_open = false;
                        if self.live().is_some() {
                            warn!("relay closed during a call");
                            self.teardown(CallStatus::Ended);
                        }
                    }
                },
                Some(event) = peer_events.recv() => {
                    if let Err(e) = self.handle_peer_event(event).await {
                        warn!(error = %e, "peer event failed");
                    }
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
            status.send_replace(self.session().cloned());
        }
        if self.live().is_some() {
            let _ = self.end_call();
        }
        debug!("call manager stopped");
    }

    async fn handle_command(&mut self, command: CallCommand) {
        match command {
            CallCommand::Start { request, reply } => {
                let _ = reply.send(self.start_call(request));
            }
            CallCommand::Accept { reply } => {
                let _ = reply.send(self.accept_call().await);
            }
            CallCommand::End { reply } => {
                let _ = reply.send(self.end_call());
            }
            CallCommand::SwitchTrack { track, reply } => {
                let _ = reply.send(self.switch_track(track).await);
            }
        }
    }

    fn new_call(
        &mut self,
        conversation_id: String,
        contact_id: String,
        role: CallRole,
        with_video: bool,
    ) -> ActiveCall<F::Peer> {
        self.generation += 1;
        ActiveCall {
            view: CallSession {
                conversation_id,
                contact_id,
                role,
                status: CallStatus::Default,
                with_video,
                local_tracks: Vec::new(),
                remote_tracks: Vec::new(),
            },
            generation: self.generation,
            engine: None,
            early_candidates: IceCandidateQueue::new(),
            early_offer: None,
        }
    }

    async fn acquire_media(&mut self, with_video: bool) -> Result<Vec<MediaTrack>, CallError> {
        match self.media.user_media(with_video).await {
            Ok(tracks) => Ok(tracks),
            Err(e) => {
                warn!(error = %e, "media capture failed");
                let terminal = match e {
                    MediaError::PermissionDenied => CallStatus::PermissionDenied,
                    MediaError::NotFound(_) => CallStatus::Ended,
                };
                if terminal == CallStatus::PermissionDenied {
                    self.notify_end();
                }
                self.teardown(terminal);
                Err(e.into())
            }
        }
    }

    /// Create the peer connection for the live call and attach local tracks.
    /// A peer left over from an earlier attempt is closed first.
    fn open_engine(&mut self, tracks: Vec<MediaTrack>) -> Result<(), CallError> {
        self.discard_engine();
        let Some(call) = self.call.as_mut().filter(|c| !c.view.status.is_terminal()) else {
            self.media.release(&tracks);
            return Err(CallError::NoSession);
        };
        let sink = PeerEventSink::new(call.generation, self.peer_events.clone());
        let peer = match self.factory.create(sink) {
            Ok(peer) => peer,
            Err(e) => {
                self.media.release(&tracks);
                return Err(e.into());
            }
        };

        let mut engine = NegotiationEngine::new(
            peer,
            self.relay.clone(),
            call.view.conversation_id.clone(),
            call.view.contact_id.clone(),
        );
        if let Err(e) = engine.add_local_tracks(&tracks) {
            engine.close();
            self.media.release(&tracks);
            return Err(e);
        }
        call.view.local_tracks = tracks;
        call.engine = Some(engine);
        Ok(())
    }

    /// Hand candidates that arrived before the peer existed to the engine.
    async fn apply_early_candidates(&mut self) -> Result<(), CallError> {
        let Some(call) = self.live_mut() else {
            return Err(CallError::NoSession);
        };
        let Some(engine) = call.engine.as_mut() else {
            return Ok(());
        };
        for candidate in call.early_candidates.drain() {
            engine.handle_remote_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Close the peer connection and release local media, leaving the
    /// session status alone.
    fn discard_engine(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if let Some(mut engine) = call.engine.take() {
            engine.close();
        }
        let tracks = std::mem::take(&mut call.view.local_tracks);
        self.media.release(&tracks);
    }

    /// End a call whose setup failed after the remote side was involved.
    fn fail_call(&mut self, error: CallError) -> CallError {
        warn!(error = %error, "call setup failed");
        self.notify_end();
        self.teardown(CallStatus::Ended);
        error
    }

    /// Tell the remote side the call is over, best effort.
    fn notify_end(&self) {
        if let Some(call) = self.live() {
            match self.relay.send(&Envelope::CallEnd(call.control())) {
                Ok(()) | Err(RelayError::NotConnected) => {}
                Err(e) => warn!(error = %e, "could not send CallEnd"),
            }
        }
    }

    /// Release media, close the peer connection and leave the session in a
    /// terminal state.
    fn teardown(&mut self, terminal: CallStatus) {
        self.discard_engine();
        let Some(call) = self.call.as_mut() else {
            return;
        };
        call.early_candidates.drain();
        call.early_offer = None;
        if call.advance(terminal).is_err() {
            debug!(status = ?call.view.status, "call already ended");
        }
    }
}

/// Requests served by [`CallManager::run`].
pub enum CallCommand {
    Start {
        request: StartCall,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Accept {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    SwitchTrack {
        track: MediaTrack,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
}

/// Cheap handle for issuing commands to a running [`CallManager`].
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::Sender<CallCommand>,
    status: watch::Receiver<Option<CallSession>>,
}

impl CallHandle {
    /// Build the command channel and status watch for [`CallManager::run`].
    pub fn channel(
        capacity: usize,
    ) -> (
        Self,
        mpsc::Receiver<CallCommand>,
        watch::Sender<Option<CallSession>>,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        let (status_tx, status) = watch::channel(None);
        (Self { tx, status }, rx, status_tx)
    }

    pub fn status(&self) -> watch::Receiver<Option<CallSession>> {
        self.status.clone()
    }

    pub async fn start_call(&self, request: StartCall) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Start { request, reply })
            .await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Accept { reply }).await
    }

    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::End { reply }).await
    }

    pub async fn switch_track(&self, track: MediaTrack) -> Result<(), CallError> {
        self.request(|reply| CallCommand::SwitchTrack { track, reply })
            .await
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<(), CallError>>) -> CallCommand,
    ) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::TrackKind;
    use crate::testing::{FakeMedia, FakePeerFactory};
    use callbridge::IceCandidate;
    use callbridge::protocol::{WebRtcDescription, WebRtcIce};

    struct Client {
        manager: CallManager<FakePeerFactory, FakeMedia>,
        relay: Relay,
        factory: FakePeerFactory,
        media: FakeMedia,
        outbound: mpsc::UnboundedReceiver<String>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    impl Client {
        fn new(name: &str) -> Self {
            let relay = Relay::new();
            let outbound = relay.connect();
            let factory = FakePeerFactory::new(name);
            let media = FakeMedia::new();
            let (tx, events) = mpsc::unbounded_channel();
            Self {
                manager: CallManager::new(factory.clone(), media.clone(), relay.clone(), tx),
                relay,
                factory,
                media,
                outbound,
                events,
            }
        }

        fn sent(&mut self) -> Vec<Envelope> {
            let mut out = Vec::new();
            while let Ok(frame) = self.outbound.try_recv() {
                out.push(Envelope::parse(&frame).unwrap());
            }
            out
        }

        async fn pump_events(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.manager.handle_peer_event(event).await.unwrap();
            }
        }
    }

    fn start(conversation_id: &str) -> StartCall {
        StartCall {
            conversation_id: conversation_id.to_string(),
            contact_id: "bob".to_string(),
            with_video: false,
        }
    }

    fn call_begin(conversation_id: &str) -> Envelope {
        Envelope::CallBegin(CallBegin {
            conversation_id: conversation_id.to_string(),
            contact_id: "alice".to_string(),
            with_video_on: Some(true),
        })
    }

    /// Deliver everything `from` sent to `to`, as the server would: call
    /// signaling only, addressed to the sender.
    async fn deliver(from: &mut Client, to: &mut Client, sender: &str) {
        for envelope in from.sent() {
            if envelope.kind().is_call_signaling() {
                to.manager
                    .handle_envelope(envelope.with_contact_id(sender))
                    .await
                    .unwrap();
            }
        }
    }

    #[test]
    fn status_only_moves_forward() {
        use CallStatus::*;
        assert!(Default.can_advance_to(Ringing));
        assert!(Ringing.can_advance_to(InCall));
        assert!(InCall.can_advance_to(Ended));
        assert!(Ringing.can_advance_to(PermissionDenied));
        assert!(!Connecting.can_advance_to(Ringing));
        assert!(!InCall.can_advance_to(InCall));
        assert!(!Ended.can_advance_to(Default));
        assert!(!Ended.can_advance_to(PermissionDenied));
    }

    #[test]
    fn start_call_rings_and_second_start_fails_fast() {
        let mut alice = Client::new("alice");
        alice.manager.start_call(start("c1")).unwrap();
        assert_eq!(alice.manager.status(), CallStatus::Ringing);
        assert!(matches!(alice.sent()[..], [Envelope::CallBegin(_)]));

        let err = alice.manager.start_call(start("c1")).unwrap_err();
        assert_eq!(
            err,
            CallError::SessionActive {
                conversation_id: "c1".to_string()
            }
        );
        assert!(alice.sent().is_empty());
        assert_eq!(alice.manager.session().unwrap().role, CallRole::Caller);
    }

    #[tokio::test]
    async fn call_begin_creates_ringing_receiver_session() {
        let mut bob = Client::new("bob");
        assert!(bob.manager.handle_envelope(call_begin("c3")).await.unwrap());

        let session = bob.manager.session().unwrap();
        assert_eq!(session.conversation_id, "c3");
        assert_eq!(session.role, CallRole::Receiver);
        assert_eq!(session.status, CallStatus::Ringing);
        assert!(session.with_video);
    }

    #[tokio::test]
    async fn call_begin_while_busy_is_ignored() {
        let mut bob = Client::new("bob");
        bob.manager.handle_envelope(call_begin("c1")).await.unwrap();
        assert!(!bob.manager.handle_envelope(call_begin("c2")).await.unwrap());
        assert_eq!(bob.manager.session().unwrap().conversation_id, "c1");
    }

    #[tokio::test]
    async fn misaddressed_candidate_is_ignored_without_mutation() {
        let mut alice = Client::new("alice");
        let mut bob = Client::new("bob");
        alice.manager.start_call(start("c1")).unwrap();
        deliver(&mut alice, &mut bob, "alice").await;
        bob.manager.accept_call().await.unwrap();
        deliver(&mut bob, &mut alice, "bob").await;

        let before = alice.manager.session().cloned();
        let pending = alice.manager.engine().unwrap().pending_candidates();
        let stray = Envelope::WebRtcIceCandidate(WebRtcIce {
            conversation_id: "c2".to_string(),
            contact_id: "bob".to_string(),
            candidate: IceCandidate::new("candidate:stray"),
        });
        assert!(!alice.manager.handle_envelope(stray).await.unwrap());

        assert_eq!(alice.manager.session().cloned(), before);
        assert_eq!(alice.manager.engine().unwrap().pending_candidates(), pending);
        assert!(alice.factory.last().unwrap().applied_candidates.is_empty());
    }

    #[tokio::test]
    async fn full_call_reaches_in_call_on_both_sides_and_hangs_up() {
        let mut alice = Client::new("alice");
        let mut bob = Client::new("bob");

        alice.manager.start_call(start("c1")).unwrap();
        deliver(&mut alice, &mut bob, "alice").await;
        assert_eq!(bob.manager.status(), CallStatus::Ringing);

        bob.manager.accept_call().await.unwrap();
        assert_eq!(bob.manager.status(), CallStatus::Connecting);
        deliver(&mut bob, &mut alice, "bob").await;
        // CallAccept made alice offer.
        assert_eq!(alice.manager.status(), CallStatus::Connecting);

        alice.pump_events().await;
        deliver(&mut alice, &mut bob, "alice").await;
        bob.pump_events().await;
        deliver(&mut bob, &mut alice, "bob").await;
        alice.pump_events().await;

        assert_eq!(alice.manager.status(), CallStatus::InCall);
        assert_eq!(bob.manager.status(), CallStatus::InCall);
        assert_eq!(
            alice.factory.last().unwrap().applied_candidates.len(),
            crate::testing::FakePeer::CANDIDATES
        );
        assert_eq!(
            bob.factory.last().unwrap().applied_candidates.len(),
            crate::testing::FakePeer::CANDIDATES
        );

        alice.manager.end_call().unwrap();
        assert_eq!(alice.manager.status(), CallStatus::Ended);
        assert!(alice.factory.last().unwrap().closed);
        assert_eq!(alice.media.released().len(), 1);

        deliver(&mut alice, &mut bob, "alice").await;
        assert_eq!(bob.manager.status(), CallStatus::Ended);
        assert!(bob.factory.last().unwrap().closed);

        // A new call may start once the previous one ended.
        alice.manager.start_call(start("c4")).unwrap();
        assert_eq!(alice.manager.status(), CallStatus::Ringing);
    }

    #[tokio::test]
    async fn candidates_before_offer_are_applied_after_it() {
        let mut bob = Client::new("bob");
        bob.manager.handle_envelope(call_begin("c1")).await.unwrap();

        for c in ["c1", "c2", "c3"] {
            let ice = Envelope::WebRtcIceCandidate(WebRtcIce {
                conversation_id: "c1".to_string(),
                contact_id: "alice".to_string(),
                candidate: IceCandidate::new(c),
            });
            assert!(bob.manager.handle_envelope(ice).await.unwrap());
        }
        bob.manager.accept_call().await.unwrap();
        assert_eq!(bob.manager.engine().unwrap().pending_candidates(), 3);

        let offer = Envelope::WebRtcOffer(WebRtcDescription {
            conversation_id: "c1".to_string(),
            contact_id: "alice".to_string(),
            sdp: SessionDescription::offer("v=0 o=alice offer"),
        });
        bob.manager.handle_envelope(offer).await.unwrap();

        let applied: Vec<_> = bob
            .factory
            .last()
            .unwrap()
            .applied_candidates
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn offer_that_overtakes_accept_is_answered_on_accept() {
        let mut bob = Client::new("bob");
        bob.manager.handle_envelope(call_begin("c1")).await.unwrap();
        let offer = Envelope::WebRtcOffer(WebRtcDescription {
            conversation_id: "c1".to_string(),
            contact_id: "alice".to_string(),
            sdp: SessionDescription::offer("v=0 o=alice offer"),
        });
        bob.manager.handle_envelope(offer).await.unwrap();
        bob.sent();

        bob.manager.accept_call().await.unwrap();
        let kinds: Vec<_> = bob.sent().iter().map(Envelope::kind).collect();
        assert_eq!(
            kinds,
            vec![EnvelopeType::CallAccept, EnvelopeType::WebRtcAnswer]
        );
    }

    #[tokio::test]
    async fn permission_denied_is_a_distinct_terminal_state() {
        let mut bob = Client::new("bob");
        bob.media.deny_permission(true);
        bob.manager.handle_envelope(call_begin("c1")).await.unwrap();
        bob.sent();

        let err = bob.manager.accept_call().await.unwrap_err();
        assert_eq!(err, CallError::Media(MediaError::PermissionDenied));
        assert_eq!(bob.manager.status(), CallStatus::PermissionDenied);
        assert_eq!(bob.factory.created(), 0);
        assert!(matches!(bob.sent()[..], [Envelope::CallEnd(_)]));
    }

    #[tokio::test]
    async fn failed_accept_releases_peer_and_media() {
        let mut bob = Client::new("bob");
        bob.manager.handle_envelope(call_begin("c1")).await.unwrap();
        bob.relay.close();

        for attempt in 1..=2 {
            let err = bob.manager.accept_call().await.unwrap_err();
            assert_eq!(err, CallError::Relay(RelayError::NotConnected));
            assert_eq!(bob.manager.status(), CallStatus::Ringing);
            assert!(bob.manager.engine().is_none());
            assert!(bob.manager.session().unwrap().local_tracks.is_empty());
            assert_eq!(bob.factory.created(), attempt);
            assert!(bob.factory.logs().iter().all(|peer| peer.closed));
            // Video call: one microphone and one camera per attempt.
            assert_eq!(bob.media.released().len(), 2 * attempt);
        }

        bob.manager.end_call().unwrap();
        assert_eq!(bob.manager.status(), CallStatus::Ended);
        assert_eq!(bob.media.released().len(), 4);
    }

    #[tokio::test]
    async fn failed_offer_ends_the_call_and_releases_media() {
        let mut alice = Client::new("alice");
        alice.manager.start_call(start("c1")).unwrap();
        alice.sent();
        alice.relay.close();

        let accept = Envelope::CallAccept(CallControl {
            conversation_id: "c1".to_string(),
            contact_id: "bob".to_string(),
        });
        let err = alice.manager.handle_envelope(accept).await.unwrap_err();
        assert_eq!(err, CallError::Relay(RelayError::NotConnected));
        assert_eq!(alice.manager.status(), CallStatus::Ended);
        assert!(alice.factory.last().unwrap().closed);
        assert_eq!(alice.media.released().len(), 1);
    }

    #[tokio::test]
    async fn stale_peer_events_are_dropped() {
        let mut alice = Client::new("alice");
        let mut bob = Client::new("bob");
        alice.manager.start_call(start("c1")).unwrap();
        deliver(&mut alice, &mut bob, "alice").await;
        bob.manager.accept_call().await.unwrap();
        deliver(&mut bob, &mut alice, "bob").await;
        alice.manager.end_call().unwrap();
        alice.sent();

        alice.manager.start_call(start("c2")).unwrap();
        // Candidates gathered by the first call's peer are still queued.
        alice.pump_events().await;
        let kinds: Vec<_> = alice.sent().iter().map(Envelope::kind).collect();
        assert_eq!(kinds, vec![EnvelopeType::CallBegin]);
        assert_eq!(alice.manager.status(), CallStatus::Ringing);
    }

    #[tokio::test]
    async fn peer_failure_ends_the_call() {
        let mut alice = Client::new("alice");
        let mut bob = Client::new("bob");
        alice.manager.start_call(start("c1")).unwrap();
        deliver(&mut alice, &mut bob, "alice").await;
        bob.manager.accept_call().await.unwrap();

        bob.manager
            .handle_peer_event(PeerEvent {
                generation: 1,
                kind: PeerEventKind::ConnectionState(ConnectionState::Failed),
            })
            .await
            .unwrap();
        assert_eq!(bob.manager.status(), CallStatus::Ended);
        assert!(
            bob.sent()
                .iter()
                .any(|e| e.kind() == EnvelopeType::CallEnd)
        );
    }

    #[tokio::test]
    async fn switch_track_replaces_same_kind_only() {
        let mut alice = Client::new("alice");
        let mut bob = Client::new("bob");
        alice.manager.start_call(start("c1")).unwrap();
        deliver(&mut alice, &mut bob, "alice").await;
        bob.manager.accept_call().await.unwrap();

        let mic = bob.media.another(TrackKind::Audio);
        bob.manager.switch_track(mic.clone()).await.unwrap();
        assert_eq!(bob.manager.session().unwrap().local_tracks, vec![mic]);
        assert_eq!(bob.media.released().len(), 1);

        let cam = bob.media.another(TrackKind::Video);
        assert_eq!(
            bob.manager.switch_track(cam).await.unwrap_err(),
            CallError::RenegotiationUnsupported(TrackKind::Video)
        );
    }

    #[tokio::test]
    async fn run_loop_serves_commands_and_publishes_status() {
        let relay = Relay::new();
        let mut outbound = relay.connect();
        let (tx, peer_rx) = mpsc::unbounded_channel();
        let manager = CallManager::new(FakePeerFactory::new("alice"), FakeMedia::new(), relay, tx);
        let (envelopes_rx, ids) = manager.bind();
        assert_eq!(ids.len(), 6);

        let (handle, commands, status_tx) = CallHandle::channel(8);
        let task = tokio::spawn(manager.run(envelopes_rx, peer_rx, commands, status_tx));

        handle.start_call(start("c1")).await.unwrap();
        assert!(matches!(
            handle.start_call(start("c1")).await,
            Err(CallError::SessionActive { .. })
        ));
        let mut status = handle.status();
        let session = status.borrow_and_update().clone().unwrap();
        assert_eq!(session.status, CallStatus::Ringing);

        let frame = outbound.recv().await.unwrap();
        assert_eq!(Envelope::parse(&frame).unwrap().kind(), EnvelopeType::CallBegin);

        handle.end_call().await.unwrap();
        drop(handle);
        task.await.unwrap();
    }
}
