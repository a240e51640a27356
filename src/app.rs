use crate::dispatch::{ComposeLauncher, DispatchError, Dispatcher, SendOutcome, DEFAULT_EMAIL_SUBJECT};
use crate::import::vcard::AddressBook;
use crate::import::{self, ContactsProvider, ImportError, ImportPolicy};
use crate::models::{Channel, Contact, Message, MessageDraft};
use crate::permissions::{Gate, Operation, Permission, PermissionGate, PermissionTicket, Resolution};
use crate::remote::{DownloadClient, DownloadError};
use crate::storage::{Database, StoreError};
use directories::BaseDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// Ten years; keeps `now - window` far away from chrono's range limits.
const MAX_RESEND_WINDOW_MINUTES: u64 = 60 * 24 * 365 * 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppState {
    pub database_path: Option<PathBuf>,
    pub email_subject: String,
    pub resend_window_minutes: Option<u64>,
    pub granted_permissions: Vec<Permission>,
    #[serde(skip)]
    source: Option<PathBuf>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            database_path: None,
            email_subject: DEFAULT_EMAIL_SUBJECT.to_string(),
            resend_window_minutes: None,
            granted_permissions: Vec::new(),
            source: None,
        }
    }
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    // TOML is the primary format; an older JSON state file is converted on first load.
    fn toml_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        let cfg_dir = base.config_dir();
        Some(cfg_dir.join("contact-relay.toml"))
    }

    fn legacy_json_path() -> Option<PathBuf> {
        let proj = directories::ProjectDirs::from("com", "example", "ContactRelay")?;
        Some(proj.config_dir().join("state.json"))
    }

    pub fn load() -> Self {
        Self::load_paths(Self::toml_path(), Self::legacy_json_path())
    }

    pub fn load_from(path: &Path) -> Self {
        Self::load_paths(Some(path.to_path_buf()), None)
    }

    fn load_paths(toml_path: Option<PathBuf>, legacy: Option<PathBuf>) -> Self {
        if let Some(path) = &toml_path {
            if let Ok(text) = fs::read_to_string(path) {
                match toml::from_str::<AppState>(&text) {
                    Ok(mut state) => {
                        state.source = toml_path.clone();
                        return state;
                    }
                    Err(e) => warn!("Ignoring unreadable config {}: {}", path.display(), e),
                }
            }
        }

        if let Some(legacy) = legacy {
            if let Ok(bytes) = fs::read(&legacy) {
                if let Ok(mut state) = serde_json::from_slice::<AppState>(&bytes) {
                    state.source = toml_path.clone();
                    if let Err(e) = state.save() {
                        warn!("Could not convert legacy config {}: {}", legacy.display(), e);
                    }
                    return state;
                }
            }
        }

        Self { source: toml_path, ..Self::new() }
    }

    pub fn save(&self) -> std::io::Result<()> {
        if let Some(path) = &self.source {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let toml = toml::to_string_pretty(self)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            fs::write(path, toml)
        } else {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "No config file"))
        }
    }

    pub fn resend_window(&self) -> Option<chrono::Duration> {
        self.resend_window_minutes
            .map(|m| chrono::Duration::minutes(m.min(MAX_RESEND_WINDOW_MINUTES) as i64))
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("download was interrupted")]
    Interrupted,
    #[error("no pending operation for this permission result")]
    UnknownTicket,
    #[error("no contact #{0}")]
    UnknownContact(i64),
    #[error("{name} has no {field} to send to")]
    MissingAddress { name: String, field: &'static str },
}

#[derive(Debug)]
pub enum Outcome {
    /// Parsed but not saved yet; hand back to [`App::commit_import`] once confirmed.
    ImportReady(Vec<Contact>),
    Imported { saved: usize },
    Send(SendOutcome),
}

#[derive(Debug)]
#[must_use]
pub enum Step {
    Done(Outcome),
    NeedsPermission { ticket: PermissionTicket, permission: Permission },
    Denied(PermissionTicket),
}

pub struct App<L: ComposeLauncher> {
    state: AppState,
    db: Database,
    launcher: L,
    gate: PermissionGate,
}

impl<L: ComposeLauncher> App<L> {
    pub fn new(state: AppState, db: Database, launcher: L) -> Self {
        let gate = PermissionGate::new(state.granted_permissions.iter().copied());
        Self { state, db, launcher, gate }
    }

    pub fn request(&mut self, op: Operation) -> Result<Step, AppError> {
        match self.gate.check(op) {
            Gate::Proceed(op) => Ok(Step::Done(self.execute(op)?)),
            Gate::Deferred { ticket, permission } => Ok(Step::NeedsPermission { ticket, permission }),
        }
    }

    /// Feeds the user's answer back in; a grant resumes the parked operation.
    pub fn on_permission_result(&mut self, ticket: PermissionTicket, granted: bool) -> Result<Step, AppError> {
        match self.gate.resolve(ticket, granted) {
            Resolution::Resume(op) => {
                self.remember_permissions();
                Ok(Step::Done(self.execute(op)?))
            }
            Resolution::Denied(ticket) => Ok(Step::Denied(ticket)),
            Resolution::Unknown => Err(AppError::UnknownTicket),
        }
    }

    pub fn cancel(&mut self, ticket: PermissionTicket) {
        if self.gate.cancel(ticket).is_some() {
            debug!("Dropped parked operation, {} still waiting", self.gate.pending_count());
        }
    }

    fn remember_permissions(&mut self) {
        self.state.granted_permissions = self.gate.granted().collect();
        if let Err(e) = self.state.save() {
            warn!("Could not persist granted permissions: {}", e);
        }
    }

    fn dispatcher(&self) -> Dispatcher<'_, L> {
        Dispatcher::new(&self.db, &self.launcher)
            .with_subject(self.state.email_subject.clone())
            .with_resend_window(self.state.resend_window())
    }

    fn execute(&mut self, op: Operation) -> Result<Outcome, AppError> {
        match op {
            Operation::ImportFile { path, mime } => {
                let contacts = import::read_file(&path, mime.as_deref())?;
                if contacts.is_empty() {
                    return Err(ImportError::NoContacts.into());
                }
                Ok(Outcome::ImportReady(contacts))
            }
            Operation::ImportSample => {
                let mut contacts = import::sample_contacts();
                let saved = self.db.save_contacts(&mut contacts)?;
                info!("Imported {} contacts from sample data", saved);
                Ok(Outcome::Imported { saved })
            }
            Operation::ImportUrl { link } => {
                let client = DownloadClient::new()?;
                let rx = crate::utils::run_async_to_main(async move { client.fetch(&link).await });
                let download = rx.recv().map_err(|_| AppError::Interrupted)??;
                let contacts = import::parse_bytes(&download.bytes, download.kind, ImportPolicy::USER_FILE)?;
                if contacts.is_empty() {
                    return Err(ImportError::NoContacts.into());
                }
                info!("Found {} contacts in {}", contacts.len(), download.file_name);
                Ok(Outcome::ImportReady(contacts))
            }
            Operation::ImportAddressBook { path, id } => {
                let text = fs::read_to_string(&path).map_err(ImportError::Io)?;
                let book = AddressBook::parse(&text);
                if book.is_empty() {
                    return Err(ImportError::NoContacts.into());
                }
                debug!("{} has {} entries", path.display(), book.len());
                let mut contacts = self.address_book_contacts(&book, id.as_deref())?;
                let saved = self.db.save_contacts(&mut contacts)?;
                info!("Imported {} contacts from {}", saved, path.display());
                Ok(Outcome::Imported { saved })
            }
            Operation::Send(draft) => {
                let outcome = self.dispatcher().send(draft)?;
                debug!("Send finished with history row {}", outcome.message().id);
                Ok(Outcome::Send(outcome))
            }
        }
    }

    fn address_book_contacts(&self, book: &impl ContactsProvider, id: Option<&str>) -> Result<Vec<Contact>, ImportError> {
        match id {
            Some(id) => {
                let entry = book.lookup(id).ok_or_else(|| ImportError::UnknownContact(id.to_string()))?;
                let contact = entry.into_contact().ok_or(ImportError::NoContactData)?;
                Ok(vec![contact])
            }
            None => {
                let contacts: Vec<Contact> = book
                    .ids()
                    .iter()
                    .filter_map(|id| book.lookup(id))
                    .filter_map(|entry| entry.into_contact())
                    .collect();
                if contacts.is_empty() {
                    return Err(ImportError::NoContacts);
                }
                Ok(contacts)
            }
        }
    }

    pub fn commit_import(&self, mut contacts: Vec<Contact>) -> Result<usize, AppError> {
        Ok(self.db.save_contacts(&mut contacts)?)
    }

    pub fn contacts(&self, query: Option<&str>) -> Result<Vec<Contact>, AppError> {
        Ok(self.db.search_contacts(query)?)
    }

    /// Appends the channel's address (`Email` or `Phone`) of each stored
    /// contact to the typed recipients, joined with `", "`.
    pub fn recipients_with_contacts(&self, channel: Channel, typed: &str, ids: &[i64]) -> Result<String, AppError> {
        let mut recipients: Vec<String> = typed
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect();
        let field = channel.contact_field();
        for &id in ids {
            let contact = self.db.contact(id)?.ok_or(AppError::UnknownContact(id))?;
            let address = contact.field(field).trim();
            if address.is_empty() {
                return Err(AppError::MissingAddress { name: contact.display_name().to_string(), field });
            }
            debug!("Adding {} of contact {} to recipients", field, id);
            recipients.push(address.to_string());
        }
        Ok(recipients.join(", "))
    }

    pub fn contact(&self, id: i64) -> Result<Option<Contact>, AppError> {
        Ok(self.db.contact(id)?)
    }

    pub fn save_contact(&self, contact: &mut Contact) -> Result<i64, AppError> {
        Ok(self.db.save_contact(contact)?)
    }

    pub fn delete_contact(&self, id: i64) -> Result<bool, AppError> {
        Ok(self.db.delete_contact(id)?)
    }

    pub fn delete_all_contacts(&self) -> Result<usize, AppError> {
        Ok(self.db.delete_all_contacts()?)
    }

    pub fn history(&self) -> Result<Vec<Message>, AppError> {
        Ok(self.db.all_messages()?)
    }

    pub fn confirm_resend(&self, message: Message) -> Result<SendOutcome, AppError> {
        Ok(self.dispatcher().confirm_resend(message)?)
    }

    pub fn retry(&mut self, id: i64) -> Result<Step, AppError> {
        let previous = self.db.message(id)?.ok_or(DispatchError::UnknownMessage(id))?;
        self.request(Operation::Send(MessageDraft::retry_of(&previous)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::FakeLauncher;
    use crate::models::{Channel, Status};
    use std::io::Write;

    fn app(granted: &[Permission]) -> App<FakeLauncher> {
        let state = AppState { granted_permissions: granted.to_vec(), ..AppState::default() };
        App::new(state, Database::open_memory().unwrap(), FakeLauncher::default())
    }

    fn csv_file(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg").join("contact-relay.toml");
        let mut state = AppState::load_from(&path);
        assert_eq!(state.email_subject, DEFAULT_EMAIL_SUBJECT);
        state.resend_window_minutes = Some(30);
        state.granted_permissions = vec![Permission::Storage];
        state.save().unwrap();

        let loaded = AppState::load_from(&path);
        assert_eq!(loaded, state);
        assert_eq!(loaded.resend_window(), Some(chrono::Duration::minutes(30)));
    }

    #[test]
    fn legacy_json_is_converted_to_toml() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("contact-relay.toml");
        let json_path = dir.path().join("state.json");
        fs::write(&json_path, r#"{"email_subject":"Weekly note","granted_permissions":["sms"]}"#).unwrap();

        let state = AppState::load_paths(Some(toml_path.clone()), Some(json_path));
        assert_eq!(state.email_subject, "Weekly note");
        assert_eq!(state.granted_permissions, vec![Permission::Sms]);
        let text = fs::read_to_string(&toml_path).unwrap();
        assert!(text.contains("Weekly note"));
    }

    #[test]
    fn sample_import_needs_no_permission() {
        let mut app = app(&[]);
        let step = app.request(Operation::ImportSample).unwrap();
        assert!(matches!(step, Step::Done(Outcome::Imported { saved: 6 })));
        assert_eq!(app.contacts(None).unwrap().len(), 6);
    }

    #[test]
    fn file_import_waits_for_storage_then_previews() {
        let file = csv_file("Name,Phone\nAnn Lee,555\nBob,556\n");
        let mut app = app(&[]);
        let op = Operation::ImportFile { path: file.path().to_path_buf(), mime: None };

        let Step::NeedsPermission { ticket, permission } = app.request(op).unwrap() else {
            panic!("expected NeedsPermission");
        };
        assert_eq!(permission, Permission::Storage);

        let Step::Done(Outcome::ImportReady(contacts)) = app.on_permission_result(ticket, true).unwrap() else {
            panic!("expected ImportReady");
        };
        assert_eq!(contacts.len(), 2);
        assert!(app.contacts(None).unwrap().is_empty());
        assert_eq!(app.state.granted_permissions, vec![Permission::Storage]);

        assert_eq!(app.commit_import(contacts).unwrap(), 2);
        let found = app.contacts(Some("ann")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].field("Phone"), "555");
    }

    #[test]
    fn file_without_usable_rows_is_an_error() {
        let file = csv_file("Name,Phone\nAnn\nBob\n");
        let mut app = app(&[Permission::Storage]);
        let err = app
            .request(Operation::ImportFile { path: file.path().to_path_buf(), mime: None })
            .unwrap_err();
        assert!(matches!(err, AppError::Import(ImportError::NoContacts)));
    }

    #[test]
    fn address_book_import_saves_one_entry() {
        let mut file = tempfile::Builder::new().suffix(".vcf").tempfile().unwrap();
        write!(file, "BEGIN:VCARD\nFN:Ann Lee\nTEL:555\nEND:VCARD\nBEGIN:VCARD\nNOTE:x\nEND:VCARD\n").unwrap();
        let mut app = app(&[Permission::Contacts]);

        let step = app
            .request(Operation::ImportAddressBook { path: file.path().to_path_buf(), id: Some("1".into()) })
            .unwrap();
        assert!(matches!(step, Step::Done(Outcome::Imported { saved: 1 })));
        let all = app.contacts(None).unwrap();
        assert_eq!(all[0].field("Name"), "Ann Lee");
        assert_eq!(all[0].field("Phone"), "555");

        let err = app
            .request(Operation::ImportAddressBook { path: file.path().to_path_buf(), id: Some("2".into()) })
            .unwrap_err();
        assert!(matches!(err, AppError::Import(ImportError::NoContactData)));
    }

    #[test]
    fn denied_sms_stays_parked_until_granted() {
        let mut app = app(&[]);
        let op = Operation::Send(MessageDraft::new(Channel::Sms, "555", "hello"));
        let Step::NeedsPermission { ticket, .. } = app.request(op).unwrap() else {
            panic!("expected NeedsPermission");
        };
        let Step::Denied(ticket) = app.on_permission_result(ticket, false).unwrap() else {
            panic!("expected Denied");
        };
        assert!(app.history().unwrap().is_empty());

        let Step::Done(Outcome::Send(SendOutcome::Sent(message))) = app.on_permission_result(ticket, true).unwrap() else {
            panic!("expected Sent");
        };
        assert!(message.id > 0);
        assert_eq!(app.history().unwrap().len(), 1);
    }

    #[test]
    fn email_without_mail_app_is_recorded_as_failed() {
        let mut app = App::new(AppState::default(), Database::open_memory().unwrap(), FakeLauncher::without_apps());
        let step = app
            .request(Operation::Send(MessageDraft::new(Channel::Email, "a@x.org", "hello")))
            .unwrap();
        let Step::Done(Outcome::Send(SendOutcome::Failed { message, .. })) = step else {
            panic!("expected Failed");
        };
        assert!(message.id > 0);
        let history = app.history().unwrap();
        assert_eq!(history[0].status(), Status::Failed);
    }

    #[test]
    fn retry_goes_through_the_gate_and_counts_attempts() {
        let mut app = app(&[Permission::Sms]);
        let Step::Done(Outcome::Send(first)) = app
            .request(Operation::Send(MessageDraft::new(Channel::Sms, "555", "hello")))
            .unwrap()
        else {
            panic!("expected Send");
        };
        let Step::Done(Outcome::Send(SendOutcome::Sent(second))) = app.retry(first.message().id).unwrap() else {
            panic!("expected Sent");
        };
        assert_eq!(second.send_count, 2);
        assert!(matches!(app.retry(999), Err(AppError::Dispatch(DispatchError::UnknownMessage(999)))));
    }

    #[test]
    fn picked_contacts_add_the_address_for_the_channel() {
        let app = app(&[]);
        let mut ann = Contact::new();
        ann.set_field("Name", "Ann Lee");
        ann.set_field("Email", "ann@example.com");
        ann.set_field("Phone", "+1 555 0100");
        let ann = app.save_contact(&mut ann).unwrap();
        let mut bob = Contact::new();
        bob.set_field("Name", "Bob");
        bob.set_field("Phone", "+1 555 0101");
        let bob = app.save_contact(&mut bob).unwrap();

        assert_eq!(
            app.recipients_with_contacts(Channel::Email, "x@y.org", &[ann]).unwrap(),
            "x@y.org, ann@example.com"
        );
        assert_eq!(
            app.recipients_with_contacts(Channel::Sms, "", &[ann, bob]).unwrap(),
            "+1 555 0100, +1 555 0101"
        );

        let err = app.recipients_with_contacts(Channel::Email, "", &[bob]).unwrap_err();
        assert!(matches!(err, AppError::MissingAddress { ref name, field: "Email" } if name == "Bob"));
        assert!(matches!(
            app.recipients_with_contacts(Channel::Sms, "", &[bob + 50]),
            Err(AppError::UnknownContact(_))
        ));
    }

    #[test]
    fn cancelled_send_never_dispatches() {
        let mut app = app(&[]);
        let Step::NeedsPermission { ticket, .. } = app
            .request(Operation::Send(MessageDraft::new(Channel::Sms, "555", "hi")))
            .unwrap()
        else {
            panic!("expected NeedsPermission");
        };
        assert_eq!(app.gate.pending_count(), 1);
        app.cancel(ticket);
        assert_eq!(app.gate.pending_count(), 0);
        assert_eq!(app.history().unwrap().len(), 0);
    }
}
