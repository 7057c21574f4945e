use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upper bound on the length of an SMS body accepted by the send API.
pub const MAX_BODY_CHARS: usize = 1600;

// ---------------------------------------------------------------------------
// Typed enums for wire format safety
// ---------------------------------------------------------------------------

/// Whether a message was received from or sent to the counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// Inbox bucket a contact is filed under.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[default]
    General,
    Sales,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::General => "general",
            Category::Sales => "sales",
        }
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "general" => Ok(Category::General),
            "sales" => Ok(Category::Sales),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

/// Role of an authenticated user within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "member" => Ok(Role::Member),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// An authenticated user. Members carry the id of the admin that owns them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_id: Option<String>,
}

impl User {
    /// The admin that owns this user's tenant (the user itself for admins).
    pub fn tenant_admin_id(&self) -> &str {
        match self.role {
            Role::Admin => &self.id,
            Role::Member => self.admin_id.as_deref().unwrap_or(&self.id),
        }
    }

    /// Real-time scopes this user listens on regardless of the active number.
    pub fn personal_scopes(&self) -> Vec<Scope> {
        let mut scopes = vec![Scope::User(self.id.clone())];
        if self.role == Role::Admin {
            scopes.push(Scope::Admin(self.id.clone()));
        }
        scopes
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneNumber {
    pub id: String,
    pub admin_id: String,
    pub phone_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    pub active: bool,
    pub purchased_at: DateTime<Utc>,
}

impl PhoneNumber {
    /// Whether `user` may read and send on this number.
    pub fn accessible_by(&self, user: &User) -> bool {
        match user.role {
            Role::Admin => self.admin_id == user.id,
            Role::Member => self.assigned_to.as_deref() == Some(user.id.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub phone_number_id: String,
    pub phone_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread_count: u32,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub category: Category,
}

impl Contact {
    /// Name if one was given, otherwise the counterpart's number.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.phone_number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub phone_number_id: String,
    pub from: String,
    pub to: String,
    pub body: String,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

impl Message {
    /// The counterpart side of the message relative to the owned number.
    pub fn counterpart(&self) -> &str {
        match self.direction {
            Direction::Inbound => &self.from,
            Direction::Outbound => &self.to,
        }
    }

    pub fn involves(&self, phone_number: &str) -> bool {
        self.from == phone_number || self.to == phone_number
    }
}

/// Loose E.164 check: leading `+`, 8 to 15 digits, no leading zero.
pub fn is_e164(number: &str) -> bool {
    let Some(digits) = number.strip_prefix('+') else {
        return false;
    };
    (8..=15).contains(&digits.len())
        && digits.bytes().all(|b| b.is_ascii_digit())
        && !digits.starts_with('0')
}

// ---------------------------------------------------------------------------
// Real-time fan-out
// ---------------------------------------------------------------------------

/// Routing key for real-time events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    User(String),
    Admin(String),
    Phone(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::User(id) => write!(f, "user:{id}"),
            Scope::Admin(id) => write!(f, "admin:{id}"),
            Scope::Phone(number) => write!(f, "phone:{number}"),
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, key) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid scope: {s}"))?;
        if key.is_empty() {
            return Err(format!("invalid scope: {s}"));
        }
        match kind {
            "user" => Ok(Scope::User(key.to_string())),
            "admin" => Ok(Scope::Admin(key.to_string())),
            "phone" => Ok(Scope::Phone(key.to_string())),
            _ => Err(format!("invalid scope: {s}")),
        }
    }
}

impl Serialize for Scope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    NewMessage,
    ContactUpdated,
}

impl EventName {
    pub const ALL: [EventName; 2] = [EventName::NewMessage, EventName::ContactUpdated];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::NewMessage => "new_message",
            EventName::ContactUpdated => "contact_updated",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notification. Receivers treat it as a hint to re-fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "snake_case")]
pub enum Event {
    NewMessage { message: Message },
    ContactUpdated { contact: Contact },
}

impl Event {
    pub fn name(&self) -> EventName {
        match self {
            Event::NewMessage { .. } => EventName::NewMessage,
            Event::ContactUpdated { .. } => EventName::ContactUpdated,
        }
    }

    /// Phone-number id the event concerns.
    pub fn phone_number_id(&self) -> &str {
        match self {
            Event::NewMessage { message } => &message.phone_number_id,
            Event::ContactUpdated { contact } => &contact.phone_number_id,
        }
    }
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEvent {
    /// Process-wide, monotonically increasing publish sequence number.
    pub serial: u64,
    pub scope: Scope,
    pub published_at: DateTime<Utc>,
    pub event: Event,
}

/// Frames a client sends over the socket transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SocketClientFrame {
    Subscribe { scope: Scope },
    Unsubscribe { scope: Scope },
    Ping,
}

/// Frames the server sends over the socket transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SocketServerFrame {
    Subscribed {
        scope: Scope,
    },
    Unsubscribed {
        scope: Scope,
    },
    Event {
        event: RealtimeEvent,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<Scope>,
    },
    Pong,
}

// ---------------------------------------------------------------------------
// REST bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeResponse {
    pub user: User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneNumbersResponse {
    pub phone_numbers: Vec<PhoneNumber>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactsResponse {
    pub contacts: Vec<Contact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactResponse {
    pub contact: Contact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub transport: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub to: String,
    pub body: String,
    pub phone_number_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContactRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub phone_number: String,
    pub phone_number_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateContactRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
}

impl UpdateContactRequest {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.is_pinned.is_none() && self.category.is_none()
    }
}

/// Error body returned by every REST endpoint on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub code: String,
}
