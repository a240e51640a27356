pub mod csv;
pub mod vcard;

use crate::models::Contact;
use log::{debug, info};
use std::fs;
use std::path::Path;
use thiserror::Error;

const SAMPLE_CSV: &str = include_str!("../../assets/sample_contacts.csv");

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("unknown file type")]
    UnknownFileType,
    #[error("unsupported file type: {0}")]
    UnsupportedMime(String),
    #[error("binary spreadsheets are not supported, export the sheet as CSV first")]
    BinarySpreadsheet,
    #[error("file is not valid UTF-8 text")]
    Encoding(#[from] std::string::FromUtf8Error),
    #[error("file is empty")]
    EmptyFile,
    #[error("file has insufficient data (needs header + at least one record)")]
    InsufficientData,
    #[error("no valid contacts found in file")]
    NoContacts,
    #[error("no data found in the selected contact")]
    NoContactData,
    #[error("no contact with id {0} in the address book")]
    UnknownContact(String),
    #[error("could not read file: {0}")]
    Io(#[from] std::io::Error),
}

/// How short a data row may be before it is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportPolicy {
    pub min_columns: usize,
}

impl ImportPolicy {
    pub const USER_FILE: ImportPolicy = ImportPolicy { min_columns: 2 };
    pub const SAMPLE: ImportPolicy = ImportPolicy { min_columns: 3 };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Csv,
    /// Excel MIME types; only CSV text saved under them can be read.
    Spreadsheet,
}

impl FileKind {
    pub fn from_mime(mime: &str) -> Result<Self, ImportError> {
        match mime {
            "text/csv" | "text/comma-separated-values" => Ok(FileKind::Csv),
            "application/vnd.ms-excel"
            | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
                Ok(FileKind::Spreadsheet)
            }
            other => Err(ImportError::UnsupportedMime(other.to_string())),
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(FileKind::Csv),
            "xls" | "xlsx" => Some(FileKind::Spreadsheet),
            _ => None,
        }
    }
}

/// Zips the header line with every data line.
pub fn contacts_from_lines<'a, I>(lines: I, policy: ImportPolicy) -> Vec<Contact>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut lines = lines.into_iter();
    let headers = match lines.next() {
        Some(first) => csv::parse_line(first.trim_start_matches('\u{feff}')),
        None => return Vec::new(),
    };

    let mut contacts = Vec::new();
    for (idx, line) in lines.enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let values = csv::parse_line(line);
        if values.len() < policy.min_columns {
            debug!("Skipping row {} with {} values", idx + 2, values.len());
            continue;
        }

        let mut contact = Contact::new();
        for (header, value) in headers.iter().zip(values) {
            if !header.is_empty() {
                contact.set_field(header.as_str(), value);
            }
        }
        if contact.is_empty() {
            debug!("Skipping row {} with no named columns", idx + 2);
            continue;
        }
        contacts.push(contact);
    }
    contacts
}

pub fn parse_bytes(bytes: &[u8], kind: FileKind, policy: ImportPolicy) -> Result<Vec<Contact>, ImportError> {
    if kind == FileKind::Spreadsheet && (bytes.starts_with(ZIP_MAGIC) || bytes.starts_with(OLE_MAGIC)) {
        return Err(ImportError::BinarySpreadsheet);
    }
    let text = String::from_utf8(bytes.to_vec())?;
    if text.trim().is_empty() {
        return Err(ImportError::EmptyFile);
    }
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() < 2 {
        return Err(ImportError::InsufficientData);
    }
    Ok(contacts_from_lines(lines, policy))
}

/// Reads a user-picked file. The MIME type wins over the extension when both are known.
pub fn read_file(path: &Path, mime: Option<&str>) -> Result<Vec<Contact>, ImportError> {
    let kind = match mime {
        Some(mime) => FileKind::from_mime(mime)?,
        None => FileKind::from_path(path).ok_or(ImportError::UnknownFileType)?,
    };
    debug!("Reading {} as {:?}", path.display(), kind);
    let bytes = fs::read(path)?;
    let contacts = parse_bytes(&bytes, kind, ImportPolicy::USER_FILE)?;
    info!("Found {} contacts in {}", contacts.len(), path.display());
    Ok(contacts)
}

pub fn sample_contacts() -> Vec<Contact> {
    contacts_from_lines(SAMPLE_CSV.lines(), ImportPolicy::SAMPLE)
}

/// What the system address book knows about one of its entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemContact {
    pub display_name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl SystemContact {
    /// `None` when the entry carries none of name, phone or email.
    pub fn into_contact(self) -> Option<Contact> {
        let mut contact = Contact::new();
        for (key, value) in [("Name", self.display_name), ("Phone", self.phone), ("Email", self.email)] {
            if let Some(value) = value {
                contact.set_field(key, value);
            }
        }
        (!contact.is_empty()).then_some(contact)
    }
}

/// Source of address-book entries keyed by the provider's own ids.
pub trait ContactsProvider {
    fn ids(&self) -> Vec<String>;
    fn lookup(&self, id: &str) -> Option<SystemContact>;
}
