use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

pub type SocketId = u64;

struct Socket {
    account_id: String,
    tx: mpsc::Sender<String>,
    /// Conversation this socket currently displays.
    view: Option<String>,
}

/// Connected sockets by account and by viewed conversation.
///
/// Delivery is at-most-once: a socket whose outbound queue is full loses the
/// frame rather than stalling every other recipient.
pub struct RelayHub {
    sockets: DashMap<SocketId, Socket>,
    accounts: DashMap<String, Vec<SocketId>>,
    next_id: AtomicU64,
}

impl RelayHub {
    pub fn new() -> Self {
        Self {
            sockets: DashMap::new(),
            accounts: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, account_id: &str, tx: mpsc::Sender<String>) -> SocketId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sockets.insert(
            id,
            Socket {
                account_id: account_id.to_string(),
                tx,
                view: None,
            },
        );
        self.accounts
            .entry(account_id.to_string())
            .or_default()
            .push(id);
        id
    }

    /// Forget a socket and whatever it was viewing.
    pub fn unregister(&self, id: SocketId) {
        let Some((_, socket)) = self.sockets.remove(&id) else {
            return;
        };
        let now_empty = match self.accounts.get_mut(&socket.account_id) {
            Some(mut ids) => {
                ids.retain(|s| *s != id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.accounts
                .remove_if(&socket.account_id, |_, ids| ids.is_empty());
        }
    }

    /// Replace the conversation a socket is viewing.
    pub fn set_view(&self, id: SocketId, conversation_id: &str) -> bool {
        match self.sockets.get_mut(&id) {
            Some(mut socket) => {
                debug!(socket = id, conversation_id = %conversation_id, "view changed");
                socket.view = Some(conversation_id.to_string());
                true
            }
            None => false,
        }
    }

    pub fn view_of(&self, id: SocketId) -> Option<String> {
        self.sockets.get(&id).and_then(|s| s.view.clone())
    }

    pub fn account_of(&self, id: SocketId) -> Option<String> {
        self.sockets.get(&id).map(|s| s.account_id.clone())
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Every socket of an account. Returns how many accepted the frame.
    pub fn send_to_account(&self, account_id: &str, frame: &str) -> usize {
        let targets = self
            .accounts
            .get(account_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        self.deliver(&targets, frame)
    }

    /// Sockets of `account_id` currently viewing `conversation_id`.
    pub fn send_to_viewers(&self, account_id: &str, conversation_id: &str, frame: &str) -> usize {
        let targets: Vec<SocketId> = self
            .accounts
            .get(account_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|id| {
                self.sockets
                    .get(id)
                    .is_some_and(|s| s.view.as_deref() == Some(conversation_id))
            })
            .collect();
        self.deliver(&targets, frame)
    }

    fn deliver(&self, targets: &[SocketId], frame: &str) -> usize {
        let mut delivered = 0;
        for id in targets {
            // Clone the sender so no map entry is held across the send.
            let Some(tx) = self.sockets.get(id).map(|s| s.tx.clone()) else {
                continue;
            };
            match tx.try_send(frame.to_string()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(socket = id, "outbound queue full, dropping frame");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(socket = id, "socket closed before delivery");
                }
            }
        }
        delivered
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}
