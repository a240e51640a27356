use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A contact with an open set of named fields.
///
/// Any header seen during an import becomes a field; there is no fixed
/// "Name"/"Phone" schema. Reading a field that was never set yields `""`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contact {
    id: i64,
    fields: BTreeMap<String, String>,
}

impl Contact {
    pub fn new() -> Self {
        Self::default()
    }

    /// Row id, 0 while the contact has not been persisted.
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn remove_field(&mut self, key: &str) -> Option<String> {
        self.fields.remove(key)
    }

    pub fn field(&self, key: &str) -> &str {
        self.fields.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn field_keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Lowercase, space-joined concatenation of every value.
    pub fn search_index(&self) -> String {
        self.fields
            .values()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    pub fn display_name(&self) -> &str {
        let name = self.field("Name");
        if !name.is_empty() {
            return name;
        }
        self.fields
            .values()
            .map(String::as_str)
            .find(|v| !v.is_empty())
            .unwrap_or("(empty contact)")
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.fields)
    }

    /// Rebuilds a contact from its stored JSON object. Non-string scalars are
    /// kept as their JSON text and `null` reads as an empty string.
    pub fn from_json(id: i64, json: &str) -> Result<Self, serde_json::Error> {
        let raw: BTreeMap<String, Value> = serde_json::from_str(json)?;
        let fields = raw
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                (k, value)
            })
            .collect();
        Ok(Self { id, fields })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::Sms => "SMS",
        }
    }

    /// Contact field holding the address this channel sends to.
    pub fn contact_field(&self) -> &'static str {
        match self {
            Channel::Email => "Email",
            Channel::Sms => "Phone",
        }
    }

    /// Human label used in failure messages.
    pub fn label(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "SMS",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown channel `{0}`")]
pub struct ParseChannelError(String);

impl FromStr for Channel {
    type Err = ParseChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EMAIL" => Ok(Channel::Email),
            "SMS" => Ok(Channel::Sms),
            other => Err(ParseChannelError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Pending,
    Sent,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Sent => "SENT",
            Status::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown status `{0}`")]
pub struct ParseStatusError(String);

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Status::Pending),
            "SENT" => Ok(Status::Sent),
            "FAILED" => Ok(Status::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("message cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub from: Status,
    pub to: Status,
}

/// One dispatch attempt. History is append-only: every attempt is its own row.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: i64,
    pub content: String,
    pub recipient: String,
    pub channel: Channel,
    status: Status,
    pub sent_at: DateTime<Utc>,
    pub send_count: u32,
}

impl Message {
    /// Rebuilds a message read back from storage.
    pub(crate) fn restore(
        id: i64,
        content: String,
        recipient: String,
        channel: Channel,
        status: Status,
        sent_at: DateTime<Utc>,
        send_count: u32,
    ) -> Self {
        Self { id, content, recipient, channel, status, sent_at, send_count }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn transition(&mut self, to: Status) -> Result<(), InvalidTransition> {
        match (self.status, to) {
            (Status::Pending, Status::Sent | Status::Failed) => {
                self.status = to;
                Ok(())
            }
            (from, to) => Err(InvalidTransition { from, to }),
        }
    }

    pub fn record_attempt(&mut self) {
        self.send_count += 1;
    }

    pub fn recipients(&self) -> Vec<&str> {
        self.recipient
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .collect()
    }
}

/// Compose-screen input; anything left out gets a default in [`MessageDraft::into_message`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageDraft {
    pub content: Option<String>,
    pub recipient: Option<String>,
    pub channel: Option<Channel>,
    pub sent_at: Option<DateTime<Utc>>,
    pub send_count: Option<u32>,
}

impl MessageDraft {
    pub fn new(channel: Channel, recipient: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            recipient: Some(recipient.into()),
            channel: Some(channel),
            ..Self::default()
        }
    }

    /// Input for another attempt at an earlier message. The attempt count
    /// carries over and is bumped again when dispatched.
    pub fn retry_of(previous: &Message) -> Self {
        Self {
            send_count: Some(previous.send_count),
            ..Self::new(previous.channel, previous.recipient.clone(), previous.content.clone())
        }
    }

    pub fn into_message(self) -> Message {
        Message {
            id: 0,
            content: self.content.unwrap_or_default(),
            recipient: self.recipient.unwrap_or_default(),
            channel: self.channel.unwrap_or(Channel::Sms),
            status: Status::Pending,
            sent_at: self.sent_at.unwrap_or_else(Utc::now),
            send_count: self.send_count.unwrap_or(0),
        }
    }
}
