use crate::models::{Channel, MessageDraft};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Contacts,
    Storage,
    Sms,
}

impl Permission {
    pub fn rationale(&self) -> &'static str {
        match self {
            Permission::Contacts => "Reading your address book lets you import people you already know.",
            Permission::Storage => "Reading files lets you import contact lists from CSV or spreadsheet exports.",
            Permission::Sms => "Sending text messages hands your message to the system SMS app.",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::Contacts => "contacts",
            Permission::Storage => "storage",
            Permission::Sms => "sms",
        };
        f.write_str(name)
    }
}

/// A user action that may have to wait for a permission.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    ImportFile { path: PathBuf, mime: Option<String> },
    ImportSample,
    ImportUrl { link: String },
    ImportAddressBook { path: PathBuf, id: Option<String> },
    Send(MessageDraft),
}

impl Operation {
    pub fn required_permission(&self) -> Option<Permission> {
        match self {
            Operation::ImportFile { .. } | Operation::ImportUrl { .. } => Some(Permission::Storage),
            Operation::ImportAddressBook { .. } => Some(Permission::Contacts),
            Operation::Send(draft) if draft.channel.unwrap_or(Channel::Sms) == Channel::Sms => Some(Permission::Sms),
            Operation::Send(_) | Operation::ImportSample => None,
        }
    }
}

/// Handle for a parked operation. Not `Clone`: each ticket resumes at most once.
/// The operation stays parked until the ticket is passed to
/// [`PermissionGate::resolve`] or [`PermissionGate::cancel`].
#[derive(Debug, PartialEq, Eq, Hash)]
#[must_use = "a parked operation is only released by resolving or cancelling its ticket"]
pub struct PermissionTicket(u64);

#[derive(Debug)]
pub enum Gate {
    Proceed(Operation),
    Deferred { ticket: PermissionTicket, permission: Permission },
}

#[derive(Debug)]
pub enum Resolution {
    /// Permission granted; run the operation now.
    Resume(Operation),
    /// Still denied; the operation stays parked under the returned ticket.
    Denied(PermissionTicket),
    Unknown,
}

#[derive(Debug, Default)]
pub struct PermissionGate {
    granted: BTreeSet<Permission>,
    pending: HashMap<u64, (Permission, Operation)>,
    next_ticket: u64,
}

impl PermissionGate {
    pub fn new(granted: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            granted: granted.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn is_granted(&self, permission: Permission) -> bool {
        self.granted.contains(&permission)
    }

    pub fn granted(&self) -> impl Iterator<Item = Permission> + '_ {
        self.granted.iter().copied()
    }

    pub fn check(&mut self, op: Operation) -> Gate {
        match op.required_permission() {
            Some(permission) if !self.is_granted(permission) => {
                self.next_ticket += 1;
                let ticket = self.next_ticket;
                debug!("Parking operation behind {} permission (ticket {})", permission, ticket);
                self.pending.insert(ticket, (permission, op));
                Gate::Deferred { ticket: PermissionTicket(ticket), permission }
            }
            _ => Gate::Proceed(op),
        }
    }

    pub fn resolve(&mut self, ticket: PermissionTicket, granted: bool) -> Resolution {
        let Some((permission, _)) = self.pending.get(&ticket.0) else {
            warn!("Permission result for unknown ticket {}", ticket.0);
            return Resolution::Unknown;
        };
        let permission = *permission;
        if !granted {
            warn!("Permission denied: {}", permission);
            return Resolution::Denied(ticket);
        }
        self.granted.insert(permission);
        debug!("Permission granted: {}", permission);
        match self.pending.remove(&ticket.0) {
            Some((_, op)) => Resolution::Resume(op),
            None => Resolution::Unknown,
        }
    }

    pub fn cancel(&mut self, ticket: PermissionTicket) -> Option<Operation> {
        self.pending.remove(&ticket.0).map(|(_, op)| op)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
