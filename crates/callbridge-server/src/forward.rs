//! Translation between browser envelopes and daemon actions and signals.

use crate::hub::{RelayHub, SocketId};
use callbridge::protocol::{ComposingStatus, ConversationMessageData};
use callbridge::signal::StringMap;
use callbridge::{Envelope, EnvelopeType, RELAY_MIME_TYPE, Signal, SignalKind};
use callbridge_daemon::{DaemonError, NativeDaemon, SignalHub, Subscription};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error("{0} envelope carries no contactId")]
    MissingContact(EnvelopeType),

    #[error("only text messages can be sent, got {0:?}")]
    NotText(String),

    #[error("encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Subscribe the daemon signals browsers care about. Forwarding stops when
/// the returned subscriptions are dropped.
pub fn forward_signals(signals: &SignalHub, relay: Arc<RelayHub>) -> Vec<Subscription> {
    let mut subscriptions = Vec::new();

    let hub = relay.clone();
    subscriptions.push(signals.subscribe(SignalKind::MessageReceived, move |signal| {
        if let Signal::MessageReceived {
            account_id,
            conversation_id,
            message,
        } = signal
        {
            let envelope = Envelope::ConversationMessage(ConversationMessageData {
                conversation_id: conversation_id.clone(),
                message: message.clone(),
            });
            send_viewers(&hub, account_id, conversation_id, &envelope);
        }
    }));

    let hub = relay.clone();
    subscriptions.push(signals.subscribe(
        SignalKind::ComposingStatusChanged,
        move |signal| {
            if let Signal::ComposingStatusChanged {
                account_id,
                conversation_id,
                from,
                status,
            } = signal
            {
                let envelope = Envelope::ComposingStatus(ComposingStatus {
                    conversation_id: conversation_id.clone(),
                    contact_id: Some(from.clone()),
                    is_writing: *status != 0,
                });
                send_viewers(&hub, account_id, conversation_id, &envelope);
            }
        },
    ));

    let hub = relay;
    subscriptions.push(signals.subscribe(
        SignalKind::IncomingAccountMessage,
        move |signal| {
            if let Signal::IncomingAccountMessage {
                account_id,
                from,
                payloads,
                ..
            } = signal
            {
                deliver_account_message(&hub, account_id, from, payloads);
            }
        },
    ));

    subscriptions
}

/// Hand a relayed call-signaling envelope to every socket of the receiving
/// account, with `contactId` rewritten to the sender.
fn deliver_account_message(relay: &RelayHub, account_id: &str, from: &str, payloads: &StringMap) {
    let Some(payload) = payloads.get(RELAY_MIME_TYPE) else {
        debug!(account_id = %account_id, "account message without relay payload");
        return;
    };
    let envelope = match Envelope::parse(payload) {
        Ok(envelope) if envelope.kind().is_call_signaling() => envelope,
        Ok(envelope) => {
            warn!(kind = %envelope.kind(), from = %from, "non-call envelope in account message");
            return;
        }
        Err(e) => {
            warn!(error = %e, from = %from, "malformed relay payload");
            return;
        }
    };
    let envelope = envelope.with_contact_id(from);
    match envelope.to_json() {
        Ok(frame) => {
            let delivered = relay.send_to_account(account_id, &frame);
            debug!(kind = %envelope.kind(), account_id = %account_id, delivered, "relayed call signal");
        }
        Err(e) => warn!(error = %e, "encode relayed envelope"),
    }
}

fn send_viewers(relay: &RelayHub, account_id: &str, conversation_id: &str, envelope: &Envelope) {
    match envelope.to_json() {
        Ok(frame) => {
            relay.send_to_viewers(account_id, conversation_id, &frame);
        }
        Err(e) => warn!(error = %e, "encode conversation envelope"),
    }
}

/// Act on an envelope received from a browser socket.
pub fn handle_client_envelope<D: NativeDaemon + ?Sized>(
    daemon: &D,
    relay: &RelayHub,
    socket: SocketId,
    account_id: &str,
    envelope: Envelope,
) -> Result<(), ForwardError> {
    let kind = envelope.kind();
    if kind.is_call_signaling() {
        let contact_id = envelope
            .contact_id()
            .ok_or(ForwardError::MissingContact(kind))?
            .to_string();
        let mut payloads = StringMap::new();
        payloads.insert(RELAY_MIME_TYPE.to_string(), envelope.to_json()?);
        daemon.send_account_text_message(account_id, &contact_id, &payloads)?;
        debug!(kind = %kind, account_id = %account_id, to = %contact_id, "call signal sent");
        return Ok(());
    }

    match envelope {
        Envelope::ConversationView(view) => {
            relay.set_view(socket, &view.conversation_id);
        }
        Envelope::ConversationMessage(data) => {
            let text = data
                .message
                .text_body()
                .ok_or_else(|| ForwardError::NotText(data.message.message_type.clone()))?;
            let reply_to = data.message.body.get("reply-to").map(String::as_str);
            daemon.send_message(account_id, &data.conversation_id, text, reply_to)?;
        }
        Envelope::ComposingStatus(status) => {
            daemon.set_is_composing(account_id, &status.conversation_id, status.is_writing)?;
        }
        other => {
            debug!(kind = %other.kind(), "envelope needs no forwarding");
        }
    }
    Ok(())
}
