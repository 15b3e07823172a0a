//! Request/response correlation over the signal hub.
//!
//! Native actions acknowledge immediately and report their outcome later as a
//! signal. Each operation here opens the signal stream first, then calls the
//! daemon, then waits for the first signal whose key matches the request. A
//! signal emitted while the native call is still returning is therefore
//! buffered, and concurrent requests of the same kind never see each other's
//! answers.

use crate::daemon::{AccountDetails, NativeDaemon};
use crate::demux::{SignalHub, SignalStream};
use crate::error::BridgeError;
use callbridge::signal::{ConversationMessage, NameLookupState, NameRegistrationState};
use callbridge::{Signal, SignalKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_NAMESERVER: &str = "ns.callbridge.local";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Upper bound on how long a correlated request waits for its signal.
    /// `None` waits until the signal arrives or the future is dropped.
    pub request_timeout: Option<Duration>,
    /// Nameserver passed to name lookups.
    pub nameserver: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            nameserver: DEFAULT_NAMESERVER.to_string(),
        }
    }
}

/// Result of a forward or reverse name lookup that reached the nameserver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameLookup {
    pub state: NameLookupState,
    pub address: String,
    pub username: String,
}

impl NameLookup {
    pub fn is_found(&self) -> bool {
        self.state == NameLookupState::Found
    }
}

/// Awaitable facade over a [`NativeDaemon`].
pub struct DaemonBridge<D: NativeDaemon> {
    daemon: Arc<D>,
    hub: SignalHub,
    config: BridgeConfig,
}

impl<D: NativeDaemon> Clone for DaemonBridge<D> {
    fn clone(&self) -> Self {
        Self {
            daemon: self.daemon.clone(),
            hub: self.hub.clone(),
            config: self.config.clone(),
        }
    }
}

impl<D: NativeDaemon> DaemonBridge<D> {
    /// `hub` must already be attached to `daemon`.
    pub fn new(daemon: Arc<D>, hub: SignalHub, config: BridgeConfig) -> Self {
        Self {
            daemon,
            hub,
            config,
        }
    }

    pub fn daemon(&self) -> &Arc<D> {
        &self.daemon
    }

    pub fn hub(&self) -> &SignalHub {
        &self.hub
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Create an account and wait for its first terminal registration state.
    pub async fn add_account(&self, details: &AccountDetails) -> Result<String, BridgeError> {
        let stream = self.hub.stream(SignalKind::RegistrationStateChanged);
        let account_id = self.daemon.add_account(details)?;
        debug!(account_id = %account_id, "account created, waiting for registration");

        self.await_signal(stream, |signal| match signal {
            Signal::RegistrationStateChanged {
                account_id: id,
                state,
                ..
            } if id == account_id && state.is_terminal() => Some(if state.is_error() {
                Err(BridgeError::Registration {
                    account_id: id,
                    state,
                })
            } else {
                Ok(id)
            }),
            _ => None,
        })
        .await
    }

    /// Register `username` for an account on the nameserver.
    pub async fn register_name(
        &self,
        account_id: &str,
        password: &str,
        username: &str,
    ) -> Result<(), BridgeError> {
        let stream = self.hub.stream(SignalKind::NameRegistrationEnded);
        if !self.daemon.register_name(account_id, password, username)? {
            return Err(BridgeError::NoNameserver);
        }

        self.await_signal(stream, |signal| match signal {
            Signal::NameRegistrationEnded {
                account_id: id,
                state,
                username: name,
            } if id == account_id => Some(match state {
                NameRegistrationState::Success => Ok(()),
                state => Err(BridgeError::NameRegistration {
                    account_id: id,
                    username: name,
                    state,
                }),
            }),
            _ => None,
        })
        .await
    }

    /// Resolve a username to an address. `NotFound` and `InvalidName` are
    /// answers, not failures.
    ///
    /// Replies are keyed by the echoed query. A reverse lookup echoes its
    /// address in `address`, which is how its replies are told apart.
    pub async fn lookup_name(
        &self,
        account_id: Option<&str>,
        username: &str,
    ) -> Result<NameLookup, BridgeError> {
        let stream = self.hub.stream(SignalKind::RegisteredNameFound);
        if !self
            .daemon
            .lookup_name(account_id, &self.config.nameserver, username)
        {
            return Err(BridgeError::NoNameserver);
        }

        self.await_signal(stream, |signal| match signal {
            Signal::RegisteredNameFound {
                query,
                state,
                address,
                username: name,
                ..
            } if query.eq_ignore_ascii_case(username) && address != query => {
                Some(lookup_result(
                    username,
                    NameLookup {
                        state,
                        address,
                        username: name,
                    },
                ))
            }
            _ => None,
        })
        .await
    }

    /// Resolve an address to its registered name.
    pub async fn lookup_address(
        &self,
        account_id: Option<&str>,
        address: &str,
    ) -> Result<NameLookup, BridgeError> {
        let stream = self.hub.stream(SignalKind::RegisteredNameFound);
        if !self
            .daemon
            .lookup_address(account_id, &self.config.nameserver, address)
        {
            return Err(BridgeError::NoNameserver);
        }

        self.await_signal(stream, |signal| match signal {
            Signal::RegisteredNameFound {
                query,
                state,
                address: addr,
                username,
                ..
            } if query == address && addr == address => Some(lookup_result(
                address,
                NameLookup {
                    state,
                    address: addr,
                    username,
                },
            )),
            _ => None,
        })
        .await
    }

    /// Load up to `count` messages of a conversation ending at `from_message`
    /// (empty for the most recent).
    pub async fn load_messages(
        &self,
        account_id: &str,
        conversation_id: &str,
        from_message: &str,
        count: u32,
    ) -> Result<Vec<ConversationMessage>, BridgeError> {
        let stream = self.hub.stream(SignalKind::ConversationLoaded);
        let request_id =
            self.daemon
                .load_conversation_messages(account_id, conversation_id, from_message, count)?;
        debug!(request_id, conversation_id = %conversation_id, "waiting for conversation page");

        self.await_signal(stream, |signal| match signal {
            Signal::ConversationLoaded {
                request_id: id,
                account_id: acc,
                conversation_id: conv,
                messages,
            } if id == request_id && acc == account_id && conv == conversation_id => {
                Some(Ok(messages))
            }
            _ => None,
        })
        .await
    }

    async fn await_signal<T>(
        &self,
        mut stream: SignalStream,
        mut matcher: impl FnMut(Signal) -> Option<Result<T, BridgeError>>,
    ) -> Result<T, BridgeError> {
        let kind = stream.kind();
        let wait = async {
            while let Some(signal) = stream.recv().await {
                if let Some(outcome) = matcher(signal) {
                    return outcome;
                }
            }
            Err(BridgeError::Detached(kind))
        };

        match self.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| BridgeError::Timeout(kind))?,
            None => wait.await,
        }
    }
}

fn lookup_result(query: &str, lookup: NameLookup) -> Result<NameLookup, BridgeError> {
    if lookup.state == NameLookupState::Error {
        Err(BridgeError::LookupFailed {
            query: query.to_string(),
        })
    } else {
        Ok(lookup)
    }
}
