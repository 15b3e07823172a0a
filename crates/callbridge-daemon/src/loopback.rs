//! In-process daemon.
//!
//! Stands in for the native daemon: every account lives in this process and
//! every "remote" party is another local account. Signals are queued on an
//! unbounded channel and delivered in emission order by a task spawned when
//! the handler table is registered, so callers always observe them after the
//! action that caused them has returned.

use crate::daemon::{AccountDetails, HandlerTable, NativeDaemon, RawArgs};
use crate::error::DaemonError;
use callbridge::Signal;
use callbridge::signal::{
    ConversationMessage, NameLookupState, NameRegistrationState, RegistrationState, StringMap,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// `ConversationMemberEvent` code for a member joining.
pub const MEMBER_JOINED: i64 = 0;
/// `AccountMessageStatusChanged` code for a message handed to its recipient.
pub const MESSAGE_SENT: i64 = 3;

type Emission = (String, RawArgs);

struct Account {
    id: String,
    details: AccountDetails,
    contacts: Vec<String>,
    banned: Vec<String>,
}

impl Account {
    fn uri(&self) -> &str {
        self.details.uri().unwrap_or_default()
    }
}

struct Conversation {
    members: Vec<String>,
    messages: Vec<ConversationMessage>,
}

struct State {
    accounts: Vec<Account>,
    conversations: HashMap<String, Conversation>,
    /// Lowercased name -> (registered spelling, address).
    names: HashMap<String, (String, String)>,
    nameserver_available: bool,
    registration_outcome: RegistrationState,
    next_request_id: u32,
    next_message_id: u64,
}

impl State {
    fn account(&self, account_id: &str) -> Result<&Account, DaemonError> {
        self.accounts
            .iter()
            .find(|a| a.id == account_id)
            .ok_or_else(|| DaemonError::AccountNotFound(account_id.to_string()))
    }

    fn account_mut(&mut self, account_id: &str) -> Result<&mut Account, DaemonError> {
        self.accounts
            .iter_mut()
            .find(|a| a.id == account_id)
            .ok_or_else(|| DaemonError::AccountNotFound(account_id.to_string()))
    }

    fn account_by_uri(&self, uri: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.uri() == uri)
    }

    /// The conversation, if `account_id` is a member of it.
    fn conversation(
        &self,
        account_id: &str,
        conversation_id: &str,
    ) -> Result<&Conversation, DaemonError> {
        let uri = self.account(account_id)?.uri();
        self.conversations
            .get(conversation_id)
            .filter(|c| c.members.iter().any(|m| m == uri))
            .ok_or_else(|| DaemonError::ConversationNotFound(conversation_id.to_string()))
    }

    /// Local accounts that are members of a conversation.
    fn local_members(&self, conversation: &Conversation) -> Vec<(String, String)> {
        conversation
            .members
            .iter()
            .filter_map(|uri| self.account_by_uri(uri))
            .map(|a| (a.id.clone(), a.uri().to_string()))
            .collect()
    }
}

pub struct LoopbackDaemon {
    state: Mutex<State>,
    outbox: mpsc::UnboundedSender<Emission>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Emission>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

fn valid_username(name: &str) -> bool {
    (3..=32).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

impl LoopbackDaemon {
    pub fn new() -> Self {
        let (outbox, inbox) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(State {
                accounts: Vec::new(),
                conversations: HashMap::new(),
                names: HashMap::new(),
                nameserver_available: true,
                registration_outcome: RegistrationState::Registered,
                next_request_id: 1,
                next_message_id: 1,
            }),
            outbox,
            inbox: Mutex::new(Some(inbox)),
        }
    }

    /// Make name operations report that no nameserver is configured.
    pub fn set_nameserver_available(&self, available: bool) {
        lock(&self.state).nameserver_available = available;
    }

    /// Final registration state reported for accounts added from now on.
    /// `Trying` leaves registrations pending.
    pub fn set_registration_outcome(&self, state: RegistrationState) {
        lock(&self.state).registration_outcome = state;
    }

    /// Queue a native signal verbatim, including names no handler knows.
    pub fn emit_raw(&self, name: &str, args: RawArgs) {
        self.push(name.to_string(), args);
    }

    fn emit(&self, signal: Signal) {
        self.push(signal.kind().as_str().to_string(), signal.encode());
    }

    fn push(&self, name: String, args: RawArgs) {
        if self.outbox.send((name, args)).is_err() {
            warn!("loopback signal delivery task has stopped");
        }
    }
}

impl Default for LoopbackDaemon {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeDaemon for LoopbackDaemon {
    fn register(&self, handlers: HandlerTable) -> Result<(), DaemonError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| DaemonError::NoRuntime)?;
        let mut inbox = lock(&self.inbox)
            .take()
            .ok_or(DaemonError::AlreadyRegistered)?;

        let bound = handlers.len();
        runtime.spawn(async move {
            while let Some((name, args)) = inbox.recv().await {
                handlers.dispatch(&name, args);
            }
        });
        debug!(handlers = bound, "loopback daemon handlers registered");
        Ok(())
    }

    fn add_account(&self, details: &AccountDetails) -> Result<String, DaemonError> {
        let id = short_id();
        let uri = Uuid::new_v4().simple().to_string();
        let mut details = details.clone();
        details.set(AccountDetails::USERNAME, &uri);

        let outcome = {
            let mut state = lock(&self.state);
            state.accounts.push(Account {
                id: id.clone(),
                details,
                contacts: Vec::new(),
                banned: Vec::new(),
            });
            state.registration_outcome.clone()
        };

        self.emit(Signal::AccountsChanged);
        self.emit(Signal::RegistrationStateChanged {
            account_id: id.clone(),
            state: RegistrationState::Trying,
            code: 0,
            detail: String::new(),
        });
        if outcome != RegistrationState::Trying {
            let code = if outcome.is_error() { 1 } else { 0 };
            self.emit(Signal::RegistrationStateChanged {
                account_id: id.clone(),
                state: outcome,
                code,
                detail: String::new(),
            });
        }
        Ok(id)
    }

    fn remove_account(&self, account_id: &str) -> Result<(), DaemonError> {
        {
            let mut state = lock(&self.state);
            let before = state.accounts.len();
            state.accounts.retain(|a| a.id != account_id);
            if state.accounts.len() == before {
                return Err(DaemonError::AccountNotFound(account_id.to_string()));
            }
        }
        self.emit(Signal::AccountsChanged);
        Ok(())
    }

    fn account_ids(&self) -> Vec<String> {
        lock(&self.state)
            .accounts
            .iter()
            .map(|a| a.id.clone())
            .collect()
    }

    fn account_details(&self, account_id: &str) -> Result<AccountDetails, DaemonError> {
        Ok(lock(&self.state).account(account_id)?.details.clone())
    }

    fn set_account_details(
        &self,
        account_id: &str,
        details: &AccountDetails,
    ) -> Result<(), DaemonError> {
        let merged = {
            let mut state = lock(&self.state);
            let account = state.account_mut(account_id)?;
            for (key, value) in &details.0 {
                // The address is owned by the daemon.
                if key != AccountDetails::USERNAME {
                    account.details.set(key, value);
                }
            }
            account.details.0.clone()
        };
        self.emit(Signal::AccountDetailsChanged {
            account_id: account_id.to_string(),
            details: merged,
        });
        Ok(())
    }

    fn register_name(
        &self,
        account_id: &str,
        password: &str,
        username: &str,
    ) -> Result<bool, DaemonError> {
        let outcome = {
            let mut state = lock(&self.state);
            if !state.nameserver_available {
                return Ok(false);
            }
            let account = state.account(account_id)?;
            let address = account.uri().to_string();
            let archive_password = account
                .details
                .get(AccountDetails::ARCHIVE_PASSWORD)
                .unwrap_or_default();

            let key = username.to_ascii_lowercase();
            let outcome = if !valid_username(username) {
                NameRegistrationState::InvalidName
            } else if !archive_password.is_empty() && archive_password != password {
                NameRegistrationState::IncorrectPassword
            } else if state.names.get(&key).is_some_and(|(_, a)| *a != address) {
                NameRegistrationState::AlreadyTaken
            } else {
                NameRegistrationState::Success
            };

            if outcome == NameRegistrationState::Success {
                state
                    .names
                    .insert(key, (username.to_string(), address.clone()));
                state
                    .account_mut(account_id)?
                    .details
                    .set(AccountDetails::REGISTERED_NAME, username);
            }
            outcome
        };

        self.emit(Signal::NameRegistrationEnded {
            account_id: account_id.to_string(),
            state: outcome,
            username: username.to_string(),
        });
        Ok(true)
    }

    fn lookup_name(&self, account_id: Option<&str>, nameserver: &str, name: &str) -> bool {
        let (state, address, username) = {
            let state = lock(&self.state);
            if !state.nameserver_available {
                return false;
            }
            debug!(nameserver = %nameserver, name = %name, "loopback name lookup");
            match state.names.get(&name.to_ascii_lowercase()) {
                Some((registered, address)) => {
                    (NameLookupState::Found, address.clone(), registered.clone())
                }
                None if !valid_username(name) => {
                    (NameLookupState::InvalidName, String::new(), name.to_string())
                }
                None => (NameLookupState::NotFound, String::new(), name.to_string()),
            }
        };
        self.emit(Signal::RegisteredNameFound {
            account_id: account_id.unwrap_or_default().to_string(),
            query: name.to_string(),
            state,
            address,
            username,
        });
        true
    }

    fn lookup_address(&self, account_id: Option<&str>, nameserver: &str, address: &str) -> bool {
        let (state, username) = {
            let state = lock(&self.state);
            if !state.nameserver_available {
                return false;
            }
            debug!(nameserver = %nameserver, address = %address, "loopback address lookup");
            match state.names.values().find(|(_, a)| a == address) {
                Some((registered, _)) => (NameLookupState::Found, registered.clone()),
                None => (NameLookupState::NotFound, String::new()),
            }
        };
        self.emit(Signal::RegisteredNameFound {
            account_id: account_id.unwrap_or_default().to_string(),
            query: address.to_string(),
            state,
            address: address.to_string(),
            username,
        });
        true
    }

    fn add_contact(&self, account_id: &str, contact_id: &str) -> Result<(), DaemonError> {
        {
            let mut state = lock(&self.state);
            let account = state.account_mut(account_id)?;
            account.banned.retain(|c| c != contact_id);
            if !account.contacts.iter().any(|c| c == contact_id) {
                account.contacts.push(contact_id.to_string());
            }
        }
        self.emit(Signal::ContactAdded {
            account_id: account_id.to_string(),
            contact_id: contact_id.to_string(),
            confirmed: true,
        });
        Ok(())
    }

    fn remove_contact(
        &self,
        account_id: &str,
        contact_id: &str,
        ban: bool,
    ) -> Result<(), DaemonError> {
        {
            let mut state = lock(&self.state);
            let account = state.account_mut(account_id)?;
            account.contacts.retain(|c| c != contact_id);
            if ban && !account.banned.iter().any(|c| c == contact_id) {
                account.banned.push(contact_id.to_string());
            }
        }
        self.emit(Signal::ContactRemoved {
            account_id: account_id.to_string(),
            contact_id: contact_id.to_string(),
            banned: ban,
        });
        Ok(())
    }

    fn contacts(&self, account_id: &str) -> Result<Vec<String>, DaemonError> {
        Ok(lock(&self.state).account(account_id)?.contacts.clone())
    }

    fn start_conversation(&self, account_id: &str) -> Result<String, DaemonError> {
        let conversation_id = Uuid::new_v4().simple().to_string();
        {
            let mut state = lock(&self.state);
            let uri = state.account(account_id)?.uri().to_string();
            state.conversations.insert(
                conversation_id.clone(),
                Conversation {
                    members: vec![uri],
                    messages: Vec::new(),
                },
            );
        }
        self.emit(Signal::ConversationReady {
            account_id: account_id.to_string(),
            conversation_id: conversation_id.clone(),
        });
        Ok(conversation_id)
    }

    fn conversations(&self, account_id: &str) -> Result<Vec<String>, DaemonError> {
        let state = lock(&self.state);
        let uri = state.account(account_id)?.uri();
        let mut ids: Vec<String> = state
            .conversations
            .iter()
            .filter(|(_, c)| c.members.iter().any(|m| m == uri))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn conversation_members(
        &self,
        account_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<String>, DaemonError> {
        let state = lock(&self.state);
        Ok(state.conversation(account_id, conversation_id)?.members.clone())
    }

    fn add_conversation_member(
        &self,
        account_id: &str,
        conversation_id: &str,
        contact_id: &str,
    ) -> Result<(), DaemonError> {
        let (members, joined) = {
            let mut state = lock(&self.state);
            state.conversation(account_id, conversation_id)?;
            let Some(conversation) = state.conversations.get_mut(conversation_id) else {
                return Err(DaemonError::ConversationNotFound(conversation_id.to_string()));
            };
            if conversation.members.iter().any(|m| m == contact_id) {
                return Ok(());
            }
            conversation.members.push(contact_id.to_string());

            let conversation = state.conversation(account_id, conversation_id)?;
            let members = state.local_members(conversation);
            let joined = state.account_by_uri(contact_id).map(|a| a.id.clone());
            (members, joined)
        };

        // A local invitee joins straight away.
        if let Some(joined) = joined {
            self.emit(Signal::ConversationReady {
                account_id: joined,
                conversation_id: conversation_id.to_string(),
            });
        }
        for (member_account, _) in members {
            self.emit(Signal::ConversationMemberEvent {
                account_id: member_account,
                conversation_id: conversation_id.to_string(),
                member_uri: contact_id.to_string(),
                event: MEMBER_JOINED,
            });
        }
        Ok(())
    }

    fn send_message(
        &self,
        account_id: &str,
        conversation_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<(), DaemonError> {
        let (message, members) = {
            let mut state = lock(&self.state);
            let author = state.account(account_id)?.uri().to_string();
            state.conversation(account_id, conversation_id)?;

            let mut message = ConversationMessage::text(author, text);
            message.id = short_id();
            message.timestamp = Some(now_secs());
            if let Some(parent) = reply_to {
                message.body.insert("reply-to".to_string(), parent.to_string());
            }

            let Some(conversation) = state.conversations.get_mut(conversation_id) else {
                return Err(DaemonError::ConversationNotFound(conversation_id.to_string()));
            };
            conversation.messages.push(message.clone());
            let conversation = state.conversation(account_id, conversation_id)?;
            (message, state.local_members(conversation))
        };

        for (member_account, _) in members {
            self.emit(Signal::MessageReceived {
                account_id: member_account,
                conversation_id: conversation_id.to_string(),
                message: message.clone(),
            });
        }
        Ok(())
    }

    fn load_conversation_messages(
        &self,
        account_id: &str,
        conversation_id: &str,
        from_message: &str,
        count: u32,
    ) -> Result<u32, DaemonError> {
        let (request_id, page) = {
            let mut state = lock(&self.state);
            let messages = &state.conversation(account_id, conversation_id)?.messages;
            let end = if from_message.is_empty() {
                messages.len()
            } else {
                messages
                    .iter()
                    .position(|m| m.id == from_message)
                    .map(|i| i + 1)
                    .ok_or_else(|| {
                        DaemonError::InvalidArgument(format!("unknown message {from_message}"))
                    })?
            };
            let start = end.saturating_sub(count as usize);
            let page = messages[start..end].to_vec();

            let request_id = state.next_request_id;
            state.next_request_id = state.next_request_id.wrapping_add(1).max(1);
            (request_id, page)
        };

        self.emit(Signal::ConversationLoaded {
            request_id,
            account_id: account_id.to_string(),
            conversation_id: conversation_id.to_string(),
            messages: page,
        });
        Ok(request_id)
    }

    fn set_is_composing(
        &self,
        account_id: &str,
        conversation_id: &str,
        is_writing: bool,
    ) -> Result<(), DaemonError> {
        let (from, members) = {
            let state = lock(&self.state);
            let from = state.account(account_id)?.uri().to_string();
            let conversation = state.conversation(account_id, conversation_id)?;
            (from, state.local_members(conversation))
        };

        for (member_account, member_uri) in members {
            if member_uri == from {
                continue;
            }
            self.emit(Signal::ComposingStatusChanged {
                account_id: member_account,
                conversation_id: conversation_id.to_string(),
                from: from.clone(),
                status: i64::from(is_writing),
            });
        }
        Ok(())
    }

    fn send_account_text_message(
        &self,
        account_id: &str,
        to: &str,
        payloads: &StringMap,
    ) -> Result<u64, DaemonError> {
        let (message_id, from, recipient) = {
            let mut state = lock(&self.state);
            let from = state.account(account_id)?.uri().to_string();
            let recipient = state.account_by_uri(to).map(|a| a.id.clone());
            let message_id = state.next_message_id;
            state.next_message_id += 1;
            (message_id, from, recipient)
        };

        let Some(recipient) = recipient else {
            debug!(account_id = %account_id, to = %to, "no local recipient for account message");
            return Ok(message_id);
        };

        self.emit(Signal::IncomingAccountMessage {
            account_id: recipient,
            message_id: message_id.to_string(),
            from,
            payloads: payloads.clone(),
        });
        self.emit(Signal::AccountMessageStatusChanged {
            account_id: account_id.to_string(),
            conversation_id: String::new(),
            peer: to.to_string(),
            message_id: message_id.to_string(),
            status: MESSAGE_SENT,
        });
        Ok(message_id)
    }
}
