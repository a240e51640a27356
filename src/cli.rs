use crate::app::{App, AppError, AppState, Outcome, Step};
use crate::dispatch::{ComposeLauncher, SendOutcome, SystemLauncher};
use crate::models::{Channel, Contact, MessageDraft};
use crate::permissions::Operation;
use crate::storage::Database;
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "contact-relay", version, about = "Import contacts and hand messages to your mail or SMS app")]
pub struct Cli {
    /// Config file (defaults to contact-relay.toml in the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// SQLite database to use instead of the configured one
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,
    /// Answer yes to every confirmation and permission prompt
    #[arg(short, long, global = true)]
    pub yes: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    #[command(subcommand)]
    Contacts(ContactsCommand),
    #[command(subcommand)]
    Import(ImportCommand),
    /// Compose a message and open it in the system mail or SMS app
    Send {
        #[arg(long, value_enum)]
        channel: Channel,
        /// Comma-separated addresses or numbers
        #[arg(long, required_unless_present = "contact")]
        to: Option<String>,
        /// Also send to this stored contact's email or phone (repeatable)
        #[arg(long, value_name = "ID")]
        contact: Vec<i64>,
        #[arg(long)]
        message: String,
    },
    /// Try a message from the history again
    Retry { id: i64 },
    /// Show sent and failed messages, newest first
    History,
}

#[derive(Debug, Subcommand)]
pub enum ContactsCommand {
    List {
        #[arg(long)]
        search: Option<String>,
    },
    /// Add a contact from FIELD=VALUE pairs
    Add {
        #[arg(value_parser = parse_field, required = true)]
        fields: Vec<(String, String)>,
    },
    /// Set fields on a contact; an empty value removes the field
    Edit {
        id: i64,
        #[arg(value_parser = parse_field, required = true)]
        fields: Vec<(String, String)>,
    },
    Delete { id: i64 },
    /// Delete every contact
    Clear,
}

#[derive(Debug, Subcommand)]
pub enum ImportCommand {
    /// Import a CSV (or CSV saved as .xls/.xlsx) file
    File {
        path: PathBuf,
        #[arg(long)]
        mime: Option<String>,
    },
    /// Import the bundled sample list
    Sample,
    /// Download a file from a direct link and import it
    Url { link: String },
    /// Import from an address book export (.vcf)
    AddressBook {
        path: PathBuf,
        /// Only import the entry with this UID (or 1-based position)
        #[arg(long)]
        id: Option<String>,
    },
}

fn parse_field(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected FIELD=VALUE, got `{}`", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing field name in `{}`", s));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

fn confirm(question: &str, yes: bool) -> bool {
    if yes {
        return true;
    }
    print!("{} [y/N] ", question);
    let _ = io::stdout().flush();
    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        Err(_) => false,
    }
}

pub fn run(cli: Cli) -> Result<(), AppError> {
    let mut state = match &cli.config {
        Some(path) => AppState::load_from(path),
        None => AppState::load(),
    };
    if let Some(path) = cli.database {
        state.database_path = Some(path);
    }
    let db = match &state.database_path {
        Some(path) => Database::open(path)?,
        None => Database::open_default()?,
    };
    let mut app = App::new(state, db, SystemLauncher);
    let yes = cli.yes;

    match cli.command {
        Command::Contacts(cmd) => contacts(&app, cmd, yes),
        Command::Import(cmd) => {
            let op = match cmd {
                ImportCommand::File { path, mime } => Operation::ImportFile { path, mime },
                ImportCommand::Sample => Operation::ImportSample,
                ImportCommand::Url { link } => Operation::ImportUrl { link },
                ImportCommand::AddressBook { path, id } => Operation::ImportAddressBook { path, id },
            };
            drive(&mut app, op, yes)
        }
        Command::Send { channel, to, contact, message } => {
            let to = app.recipients_with_contacts(channel, to.as_deref().unwrap_or_default(), &contact)?;
            let message = message.trim().to_string();
            if to.is_empty() || message.is_empty() {
                eprintln!("Please fill in all fields");
                return Ok(());
            }
            drive(&mut app, Operation::Send(MessageDraft::new(channel, to, message)), yes)
        }
        Command::Retry { id } => {
            let step = app.retry(id)?;
            follow(&mut app, step, yes)
        }
        Command::History => {
            for m in app.history()? {
                println!(
                    "#{:<5} {:<7} {:<5} {}  attempt {}  to {}",
                    m.id,
                    m.status(),
                    m.channel,
                    m.sent_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"),
                    m.send_count,
                    m.recipient
                );
                println!("       {}", m.content.lines().next().unwrap_or_default());
            }
            Ok(())
        }
    }
}

fn drive<L: ComposeLauncher>(app: &mut App<L>, op: Operation, yes: bool) -> Result<(), AppError> {
    let step = app.request(op)?;
    follow(app, step, yes)
}

/// Walks a step through permission prompts until it completes or is refused.
fn follow<L: ComposeLauncher>(app: &mut App<L>, mut step: Step, yes: bool) -> Result<(), AppError> {
    loop {
        step = match step {
            Step::Done(outcome) => return report(app, outcome, yes),
            Step::NeedsPermission { ticket, permission } => {
                println!("{}", permission.rationale());
                let granted = confirm(&format!("Allow {} access?", permission), yes);
                app.on_permission_result(ticket, granted)?
            }
            Step::Denied(ticket) => {
                eprintln!("Required permissions not granted");
                app.cancel(ticket);
                return Ok(());
            }
        };
    }
}

fn report<L: ComposeLauncher>(app: &App<L>, outcome: Outcome, yes: bool) -> Result<(), AppError> {
    match outcome {
        Outcome::ImportReady(contacts) => {
            if confirm(&format!("Found {} contacts. Import them?", contacts.len()), yes) {
                let saved = app.commit_import(contacts)?;
                println!("{} contacts imported successfully", saved);
            }
        }
        Outcome::Imported { saved } => println!("{} contacts imported successfully", saved),
        Outcome::Send(SendOutcome::Sent(message)) => {
            println!("Message handed to the {} app (history #{})", message.channel.label(), message.id)
        }
        Outcome::Send(SendOutcome::Failed { reason, .. }) => eprintln!("{}", reason),
        Outcome::Send(SendOutcome::ConfirmResend(message)) => {
            if confirm("This message was already sent. Do you want to send it again?", yes) {
                let outcome = app.confirm_resend(message)?;
                return report(app, Outcome::Send(outcome), yes);
            }
        }
    }
    Ok(())
}

fn print_contact(contact: &Contact) {
    println!("#{:<5} {}", contact.id(), contact.display_name());
    for key in contact.field_keys() {
        let value = contact.field(key);
        if !value.is_empty() {
            println!("       {}: {}", key, value);
        }
    }
}

fn apply_fields(contact: &mut Contact, fields: Vec<(String, String)>) {
    for (key, value) in fields {
        if value.is_empty() {
            contact.remove_field(&key);
        } else {
            contact.set_field(key, value);
        }
    }
}

fn contacts<L: ComposeLauncher>(app: &App<L>, cmd: ContactsCommand, yes: bool) -> Result<(), AppError> {
    match cmd {
        ContactsCommand::List { search } => {
            let found = app.contacts(search.as_deref())?;
            if found.is_empty() {
                println!("No contacts");
            }
            for contact in &found {
                print_contact(contact);
            }
        }
        ContactsCommand::Add { fields } => {
            let mut contact = Contact::new();
            apply_fields(&mut contact, fields);
            if contact.is_empty() {
                eprintln!("Please fill in at least one field");
                return Ok(());
            }
            let id = app.save_contact(&mut contact)?;
            println!("Contact #{} saved", id);
        }
        ContactsCommand::Edit { id, fields } => {
            let Some(mut contact) = app.contact(id)? else {
                eprintln!("No contact #{}", id);
                return Ok(());
            };
            apply_fields(&mut contact, fields);
            app.save_contact(&mut contact)?;
            print_contact(&contact);
        }
        ContactsCommand::Delete { id } => {
            if app.delete_contact(id)? {
                println!("Contact #{} deleted", id);
            } else {
                eprintln!("No contact #{}", id);
            }
        }
        ContactsCommand::Clear => {
            if confirm("Delete all contacts?", yes) {
                println!("{} contacts deleted", app.delete_all_contacts()?);
            }
        }
    }
    Ok(())
}
