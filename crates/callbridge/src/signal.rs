//! Native daemon signals.
//!
//! The daemon reports everything through named callbacks with positional,
//! loosely-typed arguments. [`Signal::decode`] turns those into one typed
//! variant per [`SignalKind`] so nothing above the demultiplexer has to look
//! at raw JSON values.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// String-to-string map as produced by the daemon's binding layer.
pub type StringMap = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Signal names
// ---------------------------------------------------------------------------

/// The closed set of native signals the client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SignalKind {
    AccountsChanged,
    AccountDetailsChanged,
    RegistrationStateChanged,
    NameRegistrationEnded,
    RegisteredNameFound,
    KnownDevicesChanged,
    IncomingAccountMessage,
    AccountMessageStatusChanged,
    ContactAdded,
    ContactRemoved,
    ConversationReady,
    ConversationRemoved,
    ConversationRequestReceived,
    ConversationLoaded,
    ConversationMemberEvent,
    MessageReceived,
    ComposingStatusChanged,
}

impl SignalKind {
    pub const ALL: [SignalKind; 17] = [
        SignalKind::AccountsChanged,
        SignalKind::AccountDetailsChanged,
        SignalKind::RegistrationStateChanged,
        SignalKind::NameRegistrationEnded,
        SignalKind::RegisteredNameFound,
        SignalKind::KnownDevicesChanged,
        SignalKind::IncomingAccountMessage,
        SignalKind::AccountMessageStatusChanged,
        SignalKind::ContactAdded,
        SignalKind::ContactRemoved,
        SignalKind::ConversationReady,
        SignalKind::ConversationRemoved,
        SignalKind::ConversationRequestReceived,
        SignalKind::ConversationLoaded,
        SignalKind::ConversationMemberEvent,
        SignalKind::MessageReceived,
        SignalKind::ComposingStatusChanged,
    ];

    /// The callback name used by the native handler table.
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::AccountsChanged => "AccountsChanged",
            SignalKind::AccountDetailsChanged => "AccountDetailsChanged",
            SignalKind::RegistrationStateChanged => "RegistrationStateChanged",
            SignalKind::NameRegistrationEnded => "NameRegistrationEnded",
            SignalKind::RegisteredNameFound => "RegisteredNameFound",
            SignalKind::KnownDevicesChanged => "KnownDevicesChanged",
            SignalKind::IncomingAccountMessage => "IncomingAccountMessage",
            SignalKind::AccountMessageStatusChanged => "AccountMessageStatusChanged",
            SignalKind::ContactAdded => "ContactAdded",
            SignalKind::ContactRemoved => "ContactRemoved",
            SignalKind::ConversationReady => "ConversationReady",
            SignalKind::ConversationRemoved => "ConversationRemoved",
            SignalKind::ConversationRequestReceived => "ConversationRequestReceived",
            SignalKind::ConversationLoaded => "ConversationLoaded",
            SignalKind::ConversationMemberEvent => "ConversationMemberEvent",
            SignalKind::MessageReceived => "MessageReceived",
            SignalKind::ComposingStatusChanged => "ComposingStatusChanged",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = SignalDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SignalKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| SignalDecodeError::UnknownName(s.to_string()))
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignalDecodeError {
    #[error("unknown signal name: {0}")]
    UnknownName(String),

    #[error("{kind}: expected {expected} arguments, got {got}")]
    Arity {
        kind: SignalKind,
        expected: usize,
        got: usize,
    },

    #[error("{kind}: argument {index} ({field}) is not {expected}")]
    ArgumentType {
        kind: SignalKind,
        index: usize,
        field: &'static str,
        expected: &'static str,
    },
}

// ---------------------------------------------------------------------------
// State enums carried by signals
// ---------------------------------------------------------------------------

/// Account registration state as reported by `RegistrationStateChanged`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RegistrationState {
    Unregistered,
    Trying,
    Registered,
    ErrorGeneric,
    ErrorAuth,
    ErrorNetwork,
    ErrorHost,
    ErrorServiceUnavailable,
    ErrorNeedMigration,
    Initializing,
    /// A state string this client does not know yet.
    Other(String),
}

impl RegistrationState {
    pub fn as_str(&self) -> &str {
        match self {
            RegistrationState::Unregistered => "UNREGISTERED",
            RegistrationState::Trying => "TRYING",
            RegistrationState::Registered => "REGISTERED",
            RegistrationState::ErrorGeneric => "ERROR_GENERIC",
            RegistrationState::ErrorAuth => "ERROR_AUTH",
            RegistrationState::ErrorNetwork => "ERROR_NETWORK",
            RegistrationState::ErrorHost => "ERROR_HOST",
            RegistrationState::ErrorServiceUnavailable => "ERROR_SERVICE_UNAVAILABLE",
            RegistrationState::ErrorNeedMigration => "ERROR_NEED_MIGRATION",
            RegistrationState::Initializing => "INITIALIZING",
            RegistrationState::Other(s) => s,
        }
    }

    pub fn is_error(&self) -> bool {
        self.as_str().starts_with("ERROR")
    }

    /// States after which no further transition is expected for a freshly
    /// added account.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RegistrationState::Registered | RegistrationState::Unregistered
        ) || self.is_error()
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for RegistrationState {
    fn from(s: &str) -> Self {
        match s {
            "UNREGISTERED" => RegistrationState::Unregistered,
            "TRYING" => RegistrationState::Trying,
            "REGISTERED" => RegistrationState::Registered,
            "ERROR_GENERIC" => RegistrationState::ErrorGeneric,
            "ERROR_AUTH" => RegistrationState::ErrorAuth,
            "ERROR_NETWORK" => RegistrationState::ErrorNetwork,
            "ERROR_HOST" => RegistrationState::ErrorHost,
            "ERROR_SERVICE_UNAVAILABLE" => RegistrationState::ErrorServiceUnavailable,
            "ERROR_NEED_MIGRATION" => RegistrationState::ErrorNeedMigration,
            "INITIALIZING" => RegistrationState::Initializing,
            other => RegistrationState::Other(other.to_string()),
        }
    }
}

/// Outcome of a forward or reverse name lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameLookupState {
    Found,
    InvalidName,
    NotFound,
    Error,
}

impl NameLookupState {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => NameLookupState::Found,
            1 => NameLookupState::InvalidName,
            2 => NameLookupState::NotFound,
            _ => NameLookupState::Error,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            NameLookupState::Found => 0,
            NameLookupState::InvalidName => 1,
            NameLookupState::NotFound => 2,
            NameLookupState::Error => 3,
        }
    }
}

/// Outcome of a name registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameRegistrationState {
    Success,
    IncorrectPassword,
    InvalidName,
    AlreadyTaken,
    NetworkError,
    Unknown,
}

impl NameRegistrationState {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => NameRegistrationState::Success,
            1 => NameRegistrationState::IncorrectPassword,
            2 => NameRegistrationState::InvalidName,
            3 => NameRegistrationState::AlreadyTaken,
            4 => NameRegistrationState::NetworkError,
            _ => NameRegistrationState::Unknown,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            NameRegistrationState::Success => 0,
            NameRegistrationState::IncorrectPassword => 1,
            NameRegistrationState::InvalidName => 2,
            NameRegistrationState::AlreadyTaken => 3,
            NameRegistrationState::NetworkError => 4,
            NameRegistrationState::Unknown => -1,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation messages
// ---------------------------------------------------------------------------

/// A conversation message. The daemon hands these out as flat string maps;
/// the well-known keys are lifted into fields and the rest kept in `body`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub message_type: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub body: StringMap,
}

impl ConversationMessage {
    pub const TEXT_TYPE: &'static str = "text/plain";

    pub fn text(author: impl Into<String>, body: impl Into<String>) -> Self {
        let mut fields = StringMap::new();
        fields.insert("body".to_string(), body.into());
        Self {
            id: String::new(),
            message_type: Self::TEXT_TYPE.to_string(),
            author: author.into(),
            timestamp: None,
            body: fields,
        }
    }

    /// The text body, if this is a text message.
    pub fn text_body(&self) -> Option<&str> {
        self.body.get("body").map(String::as_str)
    }

    pub fn from_map(mut map: StringMap) -> Self {
        Self {
            id: map.remove("id").unwrap_or_default(),
            message_type: map.remove("type").unwrap_or_default(),
            author: map.remove("author").unwrap_or_default(),
            timestamp: map.remove("timestamp").and_then(|t| t.parse().ok()),
            body: map,
        }
    }

    pub fn to_map(&self) -> StringMap {
        let mut map = self.body.clone();
        map.insert("id".to_string(), self.id.clone());
        map.insert("type".to_string(), self.message_type.clone());
        map.insert("author".to_string(), self.author.clone());
        if let Some(ts) = self.timestamp {
            map.insert("timestamp".to_string(), ts.to_string());
        }
        map
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// A decoded native signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    AccountsChanged,
    AccountDetailsChanged {
        account_id: String,
        details: StringMap,
    },
    RegistrationStateChanged {
        account_id: String,
        state: RegistrationState,
        code: i64,
        detail: String,
    },
    NameRegistrationEnded {
        account_id: String,
        state: NameRegistrationState,
        username: String,
    },
    RegisteredNameFound {
        account_id: String,
        /// The name or address that was asked for, echoed back by the daemon.
        query: String,
        state: NameLookupState,
        address: String,
        username: String,
    },
    KnownDevicesChanged {
        account_id: String,
        devices: StringMap,
    },
    IncomingAccountMessage {
        account_id: String,
        message_id: String,
        from: String,
        payloads: StringMap,
    },
    AccountMessageStatusChanged {
        account_id: String,
        conversation_id: String,
        peer: String,
        message_id: String,
        status: i64,
    },
    ContactAdded {
        account_id: String,
        contact_id: String,
        confirmed: bool,
    },
    ContactRemoved {
        account_id: String,
        contact_id: String,
        banned: bool,
    },
    ConversationReady {
        account_id: String,
        conversation_id: String,
    },
    ConversationRemoved {
        account_id: String,
        conversation_id: String,
    },
    ConversationRequestReceived {
        account_id: String,
        conversation_id: String,
        metadata: StringMap,
    },
    ConversationLoaded {
        request_id: u32,
        account_id: String,
        conversation_id: String,
        messages: Vec<ConversationMessage>,
    },
    ConversationMemberEvent {
        account_id: String,
        conversation_id: String,
        member_uri: String,
        event: i64,
    },
    MessageReceived {
        account_id: String,
        conversation_id: String,
        message: ConversationMessage,
    },
    ComposingStatusChanged {
        account_id: String,
        conversation_id: String,
        from: String,
        status: i64,
    },
}

/// Cursor over positional native arguments.
struct Args<'a> {
    kind: SignalKind,
    args: &'a [Value],
    index: usize,
}

impl<'a> Args<'a> {
    fn new(kind: SignalKind, args: &'a [Value], expected: usize) -> Result<Self, SignalDecodeError> {
        // Trailing extras are tolerated so a newer daemon can append arguments.
        if args.len() < expected {
            return Err(SignalDecodeError::Arity {
                kind,
                expected,
                got: args.len(),
            });
        }
        Ok(Self {
            kind,
            args,
            index: 0,
        })
    }

    fn next(&mut self) -> &'a Value {
        let args = self.args;
        let value = &args[self.index];
        self.index += 1;
        value
    }

    fn type_error(&self, field: &'static str, expected: &'static str) -> SignalDecodeError {
        SignalDecodeError::ArgumentType {
            kind: self.kind,
            index: self.index - 1,
            field,
            expected,
        }
    }

    fn string(&mut self, field: &'static str) -> Result<String, SignalDecodeError> {
        match self.next() {
            Value::String(s) => Ok(s.clone()),
            _ => Err(self.type_error(field, "a string")),
        }
    }

    fn int(&mut self, field: &'static str) -> Result<i64, SignalDecodeError> {
        self.next()
            .as_i64()
            .ok_or_else(|| self.type_error(field, "an integer"))
    }

    fn boolean(&mut self, field: &'static str) -> Result<bool, SignalDecodeError> {
        self.next()
            .as_bool()
            .ok_or_else(|| self.type_error(field, "a boolean"))
    }

    fn map(&mut self, field: &'static str) -> Result<StringMap, SignalDecodeError> {
        let value = self.next();
        string_map(value).ok_or_else(|| self.type_error(field, "a string map"))
    }

    fn maps(&mut self, field: &'static str) -> Result<Vec<StringMap>, SignalDecodeError> {
        let value = self.next();
        value
            .as_array()
            .and_then(|items| items.iter().map(string_map).collect())
            .ok_or_else(|| self.type_error(field, "a list of string maps"))
    }
}

fn string_map(value: &Value) -> Option<StringMap> {
    value
        .as_object()?
        .iter()
        .map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect()
}

fn map_value(map: &StringMap) -> Value {
    json!(map)
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::AccountsChanged => SignalKind::AccountsChanged,
            Signal::AccountDetailsChanged { .. } => SignalKind::AccountDetailsChanged,
            Signal::RegistrationStateChanged { .. } => SignalKind::RegistrationStateChanged,
            Signal::NameRegistrationEnded { .. } => SignalKind::NameRegistrationEnded,
            Signal::RegisteredNameFound { .. } => SignalKind::RegisteredNameFound,
            Signal::KnownDevicesChanged { .. } => SignalKind::KnownDevicesChanged,
            Signal::IncomingAccountMessage { .. } => SignalKind::IncomingAccountMessage,
            Signal::AccountMessageStatusChanged { .. } => SignalKind::AccountMessageStatusChanged,
            Signal::ContactAdded { .. } => SignalKind::ContactAdded,
            Signal::ContactRemoved { .. } => SignalKind::ContactRemoved,
            Signal::ConversationReady { .. } => SignalKind::ConversationReady,
            Signal::ConversationRemoved { .. } => SignalKind::ConversationRemoved,
            Signal::ConversationRequestReceived { .. } => SignalKind::ConversationRequestReceived,
            Signal::ConversationLoaded { .. } => SignalKind::ConversationLoaded,
            Signal::ConversationMemberEvent { .. } => SignalKind::ConversationMemberEvent,
            Signal::MessageReceived { .. } => SignalKind::MessageReceived,
            Signal::ComposingStatusChanged { .. } => SignalKind::ComposingStatusChanged,
        }
    }

    /// The account a signal belongs to. Only `AccountsChanged` is global.
    pub fn account_id(&self) -> Option<&str> {
        match self {
            Signal::AccountsChanged => None,
            Signal::AccountDetailsChanged { account_id, .. }
            | Signal::RegistrationStateChanged { account_id, .. }
            | Signal::NameRegistrationEnded { account_id, .. }
            | Signal::RegisteredNameFound { account_id, .. }
            | Signal::KnownDevicesChanged { account_id, .. }
            | Signal::IncomingAccountMessage { account_id, .. }
            | Signal::AccountMessageStatusChanged { account_id, .. }
            | Signal::ContactAdded { account_id, .. }
            | Signal::ContactRemoved { account_id, .. }
            | Signal::ConversationReady { account_id, .. }
            | Signal::ConversationRemoved { account_id, .. }
            | Signal::ConversationRequestReceived { account_id, .. }
            | Signal::ConversationLoaded { account_id, .. }
            | Signal::ConversationMemberEvent { account_id, .. }
            | Signal::MessageReceived { account_id, .. }
            | Signal::ComposingStatusChanged { account_id, .. } => Some(account_id),
        }
    }

    /// Decode the positional arguments of a native callback.
    pub fn decode(kind: SignalKind, args: &[Value]) -> Result<Self, SignalDecodeError> {
        Ok(match kind {
            SignalKind::AccountsChanged => Signal::AccountsChanged,
            SignalKind::AccountDetailsChanged => {
                let mut a = Args::new(kind, args, 2)?;
                Signal::AccountDetailsChanged {
                    account_id: a.string("account_id")?,
                    details: a.map("details")?,
                }
            }
            SignalKind::RegistrationStateChanged => {
                let mut a = Args::new(kind, args, 4)?;
                Signal::RegistrationStateChanged {
                    account_id: a.string("account_id")?,
                    state: RegistrationState::from(a.string("state")?.as_str()),
                    code: a.int("code")?,
                    detail: a.string("detail")?,
                }
            }
            SignalKind::NameRegistrationEnded => {
                let mut a = Args::new(kind, args, 3)?;
                Signal::NameRegistrationEnded {
                    account_id: a.string("account_id")?,
                    state: NameRegistrationState::from_code(a.int("state")?),
                    username: a.string("username")?,
                }
            }
            SignalKind::RegisteredNameFound => {
                let mut a = Args::new(kind, args, 5)?;
                Signal::RegisteredNameFound {
                    account_id: a.string("account_id")?,
                    query: a.string("query")?,
                    state: NameLookupState::from_code(a.int("state")?),
                    address: a.string("address")?,
                    username: a.string("username")?,
                }
            }
            SignalKind::KnownDevicesChanged => {
                let mut a = Args::new(kind, args, 2)?;
                Signal::KnownDevicesChanged {
                    account_id: a.string("account_id")?,
                    devices: a.map("devices")?,
                }
            }
            SignalKind::IncomingAccountMessage => {
                let mut a = Args::new(kind, args, 4)?;
                Signal::IncomingAccountMessage {
                    account_id: a.string("account_id")?,
                    message_id: a.string("message_id")?,
                    from: a.string("from")?,
                    payloads: a.map("payloads")?,
                }
            }
            SignalKind::AccountMessageStatusChanged => {
                let mut a = Args::new(kind, args, 5)?;
                Signal::AccountMessageStatusChanged {
                    account_id: a.string("account_id")?,
                    conversation_id: a.string("conversation_id")?,
                    peer: a.string("peer")?,
                    message_id: a.string("message_id")?,
                    status: a.int("status")?,
                }
            }
            SignalKind::ContactAdded => {
                let mut a = Args::new(kind, args, 3)?;
                Signal::ContactAdded {
                    account_id: a.string("account_id")?,
                    contact_id: a.string("contact_id")?,
                    confirmed: a.boolean("confirmed")?,
                }
            }
            SignalKind::ContactRemoved => {
                let mut a = Args::new(kind, args, 3)?;
                Signal::ContactRemoved {
                    account_id: a.string("account_id")?,
                    contact_id: a.string("contact_id")?,
                    banned: a.boolean("banned")?,
                }
            }
            SignalKind::ConversationReady => {
                let mut a = Args::new(kind, args, 2)?;
                Signal::ConversationReady {
                    account_id: a.string("account_id")?,
                    conversation_id: a.string("conversation_id")?,
                }
            }
            SignalKind::ConversationRemoved => {
                let mut a = Args::new(kind, args, 2)?;
                Signal::ConversationRemoved {
                    account_id: a.string("account_id")?,
                    conversation_id: a.string("conversation_id")?,
                }
            }
            SignalKind::ConversationRequestReceived => {
                let mut a = Args::new(kind, args, 3)?;
                Signal::ConversationRequestReceived {
                    account_id: a.string("account_id")?,
                    conversation_id: a.string("conversation_id")?,
                    metadata: a.map("metadata")?,
                }
            }
            SignalKind::ConversationLoaded => {
                let mut a = Args::new(kind, args, 4)?;
                let request_id = a.int("request_id")?;
                let request_id =
                    u32::try_from(request_id).map_err(|_| a.type_error("request_id", "a u32"))?;
                Signal::ConversationLoaded {
                    request_id,
                    account_id: a.string("account_id")?,
                    conversation_id: a.string("conversation_id")?,
                    messages: a
                        .maps("messages")?
                        .into_iter()
                        .map(ConversationMessage::from_map)
                        .collect(),
                }
            }
            SignalKind::ConversationMemberEvent => {
                let mut a = Args::new(kind, args, 4)?;
                Signal::ConversationMemberEvent {
                    account_id: a.string("account_id")?,
                    conversation_id: a.string("conversation_id")?,
                    member_uri: a.string("member_uri")?,
                    event: a.int("event")?,
                }
            }
            SignalKind::MessageReceived => {
                let mut a = Args::new(kind, args, 3)?;
                Signal::MessageReceived {
                    account_id: a.string("account_id")?,
                    conversation_id: a.string("conversation_id")?,
                    message: ConversationMessage::from_map(a.map("message")?),
                }
            }
            SignalKind::ComposingStatusChanged => {
                let mut a = Args::new(kind, args, 4)?;
                Signal::ComposingStatusChanged {
                    account_id: a.string("account_id")?,
                    conversation_id: a.string("conversation_id")?,
                    from: a.string("from")?,
                    status: a.int("status")?,
                }
            }
        })
    }

    /// Positional native form of this signal, the inverse of [`Signal::decode`].
    pub fn encode(&self) -> Vec<Value> {
        match self {
            Signal::AccountsChanged => vec![],
            Signal::AccountDetailsChanged {
                account_id,
                details,
            } => vec![json!(account_id), map_value(details)],
            Signal::RegistrationStateChanged {
                account_id,
                state,
                code,
                detail,
            } => vec![
                json!(account_id),
                json!(state.as_str()),
                json!(code),
                json!(detail),
            ],
            Signal::NameRegistrationEnded {
                account_id,
                state,
                username,
            } => vec![json!(account_id), json!(state.code()), json!(username)],
            Signal::RegisteredNameFound {
                account_id,
                query,
                state,
                address,
                username,
            } => vec![
                json!(account_id),
                json!(query),
                json!(state.code()),
                json!(address),
                json!(username),
            ],
            Signal::KnownDevicesChanged {
                account_id,
                devices,
            } => vec![json!(account_id), map_value(devices)],
            Signal::IncomingAccountMessage {
                account_id,
                message_id,
                from,
                payloads,
            } => vec![
                json!(account_id),
                json!(message_id),
                json!(from),
                map_value(payloads),
            ],
            Signal::AccountMessageStatusChanged {
                account_id,
                conversation_id,
                peer,
                message_id,
                status,
            } => vec![
                json!(account_id),
                json!(conversation_id),
                json!(peer),
                json!(message_id),
                json!(status),
            ],
            Signal::ContactAdded {
                account_id,
                contact_id,
                confirmed,
            } => vec![json!(account_id), json!(contact_id), json!(confirmed)],
            Signal::ContactRemoved {
                account_id,
                contact_id,
                banned,
            } => vec![json!(account_id), json!(contact_id), json!(banned)],
            Signal::ConversationReady {
                account_id,
                conversation_id,
            }
            | Signal::ConversationRemoved {
                account_id,
                conversation_id,
            } => vec![json!(account_id), json!(conversation_id)],
            Signal::ConversationRequestReceived {
                account_id,
                conversation_id,
                metadata,
            } => vec![
                json!(account_id),
                json!(conversation_id),
                map_value(metadata),
            ],
            Signal::ConversationLoaded {
                request_id,
                account_id,
                conversation_id,
                messages,
            } => vec![
                json!(request_id),
                json!(account_id),
                json!(conversation_id),
                Value::Array(messages.iter().map(|m| map_value(&m.to_map())).collect()),
            ],
            Signal::ConversationMemberEvent {
                account_id,
                conversation_id,
                member_uri,
                event,
            } => vec![
                json!(account_id),
                json!(conversation_id),
                json!(member_uri),
                json!(event),
            ],
            Signal::MessageReceived {
                account_id,
                conversation_id,
                message,
            } => vec![
                json!(account_id),
                json!(conversation_id),
                map_value(&message.to_map()),
            ],
            Signal::ComposingStatusChanged {
                account_id,
                conversation_id,
                from,
                status,
            } => vec![
                json!(account_id),
                json!(conversation_id),
                json!(from),
                json!(status),
            ],
        }
    }
}
