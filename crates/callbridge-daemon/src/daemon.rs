//! The native daemon's invocation and callback contract.
//!
//! The daemon offers exactly one registration point: [`NativeDaemon::register`]
//! installs a [`HandlerTable`] once and the daemon calls into it for every
//! signal it emits, from whatever thread it likes. Actions are plain calls;
//! most of them only acknowledge the request and report the outcome later
//! through a signal.

use crate::error::DaemonError;
use callbridge::signal::StringMap;
use serde_json::Value;
use std::collections::HashMap;

/// Positional arguments of a native signal, as handed over by the binding layer.
pub type RawArgs = Vec<Value>;

type Handler = Box<dyn Fn(RawArgs) + Send + Sync>;
type Fallback = Box<dyn Fn(&str, RawArgs) + Send + Sync>;

/// Named native callbacks plus a fallback for names with no handler.
pub struct HandlerTable {
    handlers: HashMap<String, Handler>,
    fallback: Fallback,
}

impl HandlerTable {
    pub fn new(fallback: impl Fn(&str, RawArgs) + Send + Sync + 'static) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Box::new(fallback),
        }
    }

    /// Install the handler for one signal name, replacing any previous one.
    pub fn on(
        &mut self,
        name: impl Into<String>,
        handler: impl Fn(RawArgs) + Send + Sync + 'static,
    ) {
        self.handlers.insert(name.into(), Box::new(handler));
    }

    pub fn dispatch(&self, name: &str, args: RawArgs) {
        match self.handlers.get(name) {
            Some(handler) => handler(args),
            None => (self.fallback)(name, args),
        }
    }

    pub fn handles(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new(|name, args| {
            tracing::warn!(signal = %name, args = args.len(), "unhandled daemon signal");
        })
    }
}

/// Account configuration, a loosely-typed string map on the native side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountDetails(pub StringMap);

impl AccountDetails {
    pub const TYPE: &'static str = "Account.type";
    pub const ALIAS: &'static str = "Account.alias";
    /// The account's public address (URI). Filled in by the daemon.
    pub const USERNAME: &'static str = "Account.username";
    pub const REGISTERED_NAME: &'static str = "Account.registeredName";
    pub const ARCHIVE_PASSWORD: &'static str = "Account.archivePassword";

    /// Details for a new peer-to-peer account.
    pub fn new_jami(alias: &str) -> Self {
        Self::default()
            .with(Self::TYPE, "RING")
            .with(Self::ALIAS, alias)
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_string(), value.to_string());
    }

    pub fn uri(&self) -> Option<&str> {
        self.get(Self::USERNAME)
    }
}

/// The native communication daemon.
///
/// Calls are synchronous and never block on the network; results that need
/// the network arrive later as signals through the registered handler table.
pub trait NativeDaemon: Send + Sync + 'static {
    /// Install the signal handler table. Only the first call succeeds.
    fn register(&self, handlers: HandlerTable) -> Result<(), DaemonError>;

    // -- Accounts --

    /// Create an account and return its id. Completion is reported by
    /// `RegistrationStateChanged`.
    fn add_account(&self, details: &AccountDetails) -> Result<String, DaemonError>;
    fn remove_account(&self, account_id: &str) -> Result<(), DaemonError>;
    fn account_ids(&self) -> Vec<String>;
    fn account_details(&self, account_id: &str) -> Result<AccountDetails, DaemonError>;
    fn set_account_details(
        &self,
        account_id: &str,
        details: &AccountDetails,
    ) -> Result<(), DaemonError>;

    // -- Name directory --

    /// Start a name registration. `false` means no nameserver is configured.
    /// Completion is reported by `NameRegistrationEnded`.
    fn register_name(
        &self,
        account_id: &str,
        password: &str,
        username: &str,
    ) -> Result<bool, DaemonError>;

    /// Start a forward lookup. `false` means no nameserver is configured.
    /// The result is reported by `RegisteredNameFound`.
    fn lookup_name(&self, account_id: Option<&str>, nameserver: &str, name: &str) -> bool;

    /// Start a reverse lookup. `false` means no nameserver is configured.
    fn lookup_address(&self, account_id: Option<&str>, nameserver: &str, address: &str) -> bool;

    // -- Contacts --

    fn add_contact(&self, account_id: &str, contact_id: &str) -> Result<(), DaemonError>;
    fn remove_contact(&self, account_id: &str, contact_id: &str, ban: bool)
    -> Result<(), DaemonError>;
    fn contacts(&self, account_id: &str) -> Result<Vec<String>, DaemonError>;

    // -- Conversations --

    fn start_conversation(&self, account_id: &str) -> Result<String, DaemonError>;
    fn conversations(&self, account_id: &str) -> Result<Vec<String>, DaemonError>;
    fn conversation_members(
        &self,
        account_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<String>, DaemonError>;
    fn add_conversation_member(
        &self,
        account_id: &str,
        conversation_id: &str,
        contact_id: &str,
    ) -> Result<(), DaemonError>;
    fn send_message(
        &self,
        account_id: &str,
        conversation_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<(), DaemonError>;

    /// Request a page of history. The returned request id is echoed by the
    /// `ConversationLoaded` signal carrying the page.
    fn load_conversation_messages(
        &self,
        account_id: &str,
        conversation_id: &str,
        from_message: &str,
        count: u32,
    ) -> Result<u32, DaemonError>;

    fn set_is_composing(
        &self,
        account_id: &str,
        conversation_id: &str,
        is_writing: bool,
    ) -> Result<(), DaemonError>;

    // -- Account messages --

    /// Send an out-of-band text message to another account. Delivered to the
    /// peer as `IncomingAccountMessage`. Returns the message id.
    fn send_account_text_message(
        &self,
        account_id: &str,
        to: &str,
        payloads: &StringMap,
    ) -> Result<u64, DaemonError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn dispatch_routes_by_name() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fallback_seen = Arc::new(Mutex::new(Vec::new()));

        let fb = fallback_seen.clone();
        let mut table = HandlerTable::new(move |name, _| fb.lock().unwrap().push(name.to_string()));
        let s = seen.clone();
        table.on("AccountsChanged", move |args| s.lock().unwrap().push(args.len()));

        table.dispatch("AccountsChanged", vec![]);
        table.dispatch("DataTransferEvent", vec![Value::Null]);

        assert_eq!(*seen.lock().unwrap(), vec![0]);
        assert_eq!(*fallback_seen.lock().unwrap(), vec!["DataTransferEvent".to_string()]);
        assert!(table.handles("AccountsChanged"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn account_details_builder() {
        let details = AccountDetails::new_jami("Alice").with(AccountDetails::USERNAME, "abc123");
        assert_eq!(details.get(AccountDetails::TYPE), Some("RING"));
        assert_eq!(details.get(AccountDetails::ALIAS), Some("Alice"));
        assert_eq!(details.uri(), Some("abc123"));
    }
}
