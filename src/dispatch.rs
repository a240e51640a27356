use crate::models::{Channel, InvalidTransition, Message, MessageDraft, Status};
use crate::storage::{Database, StoreError};
use chrono::{Duration, Utc};
use log::{debug, error, info};
use std::io::ErrorKind;
use thiserror::Error;

pub const DEFAULT_EMAIL_SUBJECT: &str = "Inspirational Message";

/// What gets handed to the system compose surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeRequest {
    Email {
        recipients: Vec<String>,
        subject: String,
        body: String,
    },
    Sms {
        recipient: String,
        body: String,
    },
}

impl ComposeRequest {
    pub fn for_message(message: &Message, subject: &str) -> Self {
        match message.channel {
            Channel::Email => ComposeRequest::Email {
                recipients: message.recipients().into_iter().map(str::to_string).collect(),
                subject: subject.to_string(),
                body: message.content.clone(),
            },
            Channel::Sms => ComposeRequest::Sms {
                recipient: message.recipient.trim().to_string(),
                body: message.content.clone(),
            },
        }
    }

    /// `mailto:` or `sms:` URI understood by desktop mail and messaging apps.
    pub fn uri(&self) -> String {
        match self {
            ComposeRequest::Email { recipients, subject, body } => format!(
                "mailto:{}?subject={}&body={}",
                encode_list(recipients.iter().map(String::as_str)),
                urlencoding::encode(subject),
                urlencoding::encode(body),
            ),
            ComposeRequest::Sms { recipient, body } => format!(
                "sms:{}?body={}",
                encode_list(recipient.split(',').map(str::trim).filter(|r| !r.is_empty())),
                urlencoding::encode(body),
            ),
        }
    }
}

fn encode_list<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items
        .map(|item| urlencoding::encode(item).into_owned())
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no app available to handle {0}")]
    NoHandler(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Opens the system compose surface. Implementations return once the handoff
/// happened; they know nothing about delivery.
pub trait ComposeLauncher {
    fn launch(&self, request: &ComposeRequest) -> Result<(), LaunchError>;
}

/// Hands the compose URI to whatever application the desktop has registered for it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ComposeLauncher for SystemLauncher {
    fn launch(&self, request: &ComposeRequest) -> Result<(), LaunchError> {
        let uri = request.uri();
        debug!("Opening {}", uri);
        open::that(&uri).map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                let scheme = uri.split(':').next().unwrap_or_default();
                LaunchError::NoHandler(format!("{}: links", scheme))
            }
            _ => LaunchError::Io(e),
        })
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error("no message with id {0} in the history")]
    UnknownMessage(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The compose surface opened; the row is persisted with `SENT`.
    Sent(Message),
    /// The compose surface could not be opened; the row is persisted with `FAILED`.
    Failed { message: Message, reason: String },
    /// The same recipient got a message inside the resend window. Nothing was
    /// dispatched; pass the message to [`Dispatcher::confirm_resend`] to go ahead.
    ConfirmResend(Message),
}

impl SendOutcome {
    pub fn message(&self) -> &Message {
        match self {
            SendOutcome::Sent(message) | SendOutcome::ConfirmResend(message) => message,
            SendOutcome::Failed { message, .. } => message,
        }
    }
}

pub struct Dispatcher<'a, L: ComposeLauncher + ?Sized> {
    db: &'a Database,
    launcher: &'a L,
    subject: String,
    resend_window: Option<Duration>,
}

impl<'a, L: ComposeLauncher + ?Sized> Dispatcher<'a, L> {
    pub fn new(db: &'a Database, launcher: &'a L) -> Self {
        Self {
            db,
            launcher,
            subject: DEFAULT_EMAIL_SUBJECT.to_string(),
            resend_window: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Enables the "already sent recently" guard.
    pub fn with_resend_window(mut self, window: Option<Duration>) -> Self {
        self.resend_window = window;
        self
    }

    pub fn send(&self, draft: MessageDraft) -> Result<SendOutcome, DispatchError> {
        let message = draft.into_message();
        if self.sent_recently(&message.recipient)? {
            info!("{} was messaged recently, asking before resending", message.recipient);
            return Ok(SendOutcome::ConfirmResend(message));
        }
        self.perform(message)
    }

    pub fn confirm_resend(&self, message: Message) -> Result<SendOutcome, DispatchError> {
        self.perform(message)
    }

    fn sent_recently(&self, recipient: &str) -> Result<bool, DispatchError> {
        match self.resend_window {
            Some(window) => Ok(self.db.sent_recently(recipient, Utc::now() - window)?),
            None => Ok(false),
        }
    }

    fn perform(&self, mut message: Message) -> Result<SendOutcome, DispatchError> {
        message.record_attempt();
        info!("Attempting to send {} to: {}", message.channel.label(), message.recipient);
        let request = ComposeRequest::for_message(&message, &self.subject);

        match self.launcher.launch(&request) {
            Ok(()) => {
                message.transition(Status::Sent)?;
                self.db.insert_message(&mut message)?;
                info!("Handed {} message {} to the system", message.channel.label(), message.id);
                Ok(SendOutcome::Sent(message))
            }
            Err(e) => {
                error!("{} send failed: {}", message.channel.label(), e);
                message.transition(Status::Failed)?;
                self.db.insert_message(&mut message)?;
                let reason = format!("Failed to send {}: {}", message.channel.label(), e);
                Ok(SendOutcome::Failed { message, reason })
            }
        }
    }
}
