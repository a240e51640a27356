use super::{ContactsProvider, SystemContact};
use log::debug;

/// An address-book export (`.vcf`) read into memory.
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    entries: Vec<(String, SystemContact)>,
}

#[derive(Default)]
struct Card {
    uid: Option<String>,
    formatted_name: Option<String>,
    structured_name: Option<String>,
    phone: Option<String>,
    email: Option<String>,
}

impl AddressBook {
    pub fn parse(text: &str) -> Self {
        let mut entries = Vec::new();
        let mut card: Option<Card> = None;

        for line in unfold(text) {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            // Property name without parameters or group prefix.
            let prop = name.split(';').next().unwrap_or("");
            let prop = prop.rsplit('.').next().unwrap_or(prop).to_ascii_uppercase();
            let value = value.trim();

            match prop.as_str() {
                "BEGIN" if value.eq_ignore_ascii_case("VCARD") => card = Some(Card::default()),
                "END" if value.eq_ignore_ascii_case("VCARD") => {
                    if let Some(done) = card.take() {
                        let id = done.uid.clone().unwrap_or_else(|| (entries.len() + 1).to_string());
                        entries.push((id, done.into_system_contact()));
                    }
                }
                _ => {
                    let Some(card) = card.as_mut() else { continue };
                    if value.is_empty() {
                        continue;
                    }
                    let slot = match prop.as_str() {
                        "UID" => &mut card.uid,
                        "FN" => &mut card.formatted_name,
                        "N" => &mut card.structured_name,
                        "TEL" => &mut card.phone,
                        "EMAIL" => &mut card.email,
                        _ => continue,
                    };
                    if slot.is_none() {
                        *slot = Some(unescape(value));
                    }
                }
            }
        }

        debug!("Read {} address book entries", entries.len());
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Card {
    fn into_system_contact(self) -> SystemContact {
        // N is "Family;Given;Additional;Prefix;Suffix".
        let from_n = self.structured_name.map(|n| {
            let parts: Vec<&str> = n.split(';').collect();
            let given = parts.get(1).copied().unwrap_or("");
            let family = parts.first().copied().unwrap_or("");
            format!("{} {}", given, family).trim().to_string()
        });
        let display_name = self
            .formatted_name
            .or(from_n)
            .filter(|n| !n.is_empty());
        SystemContact {
            display_name,
            phone: self.phone.map(|p| strip_scheme(&p, "tel:").to_string()),
            email: self.email.map(|e| strip_scheme(&e, "mailto:").to_string()),
        }
    }
}

impl ContactsProvider for AddressBook {
    fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }

    fn lookup(&self, id: &str) -> Option<SystemContact> {
        self.entries
            .iter()
            .find(|(entry_id, _)| entry_id == id)
            .map(|(_, contact)| contact.clone())
    }
}

/// Joins folded continuation lines (leading space or tab) onto the previous line.
fn unfold(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix([' ', '\t']) {
            if let Some(last) = out.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        out.push(line.to_string());
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n' | 'N') => out.push(' '),
            Some(escaped) => out.push(escaped),
            None => out.push('\\'),
        }
    }
    out
}

/// Drops a URI scheme such as `tel:` (vCard 4 `VALUE=uri`), ignoring case.
fn strip_scheme<'a>(value: &'a str, scheme: &str) -> &'a str {
    match value.get(..scheme.len()) {
        Some(head) if head.eq_ignore_ascii_case(scheme) => &value[scheme.len()..],
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = "BEGIN:VCARD\r\n\
VERSION:3.0\r\n\
UID:abc-1\r\n\
FN:Ann Lee\r\n\
TEL;TYPE=CELL:+1 555 0100\r\n\
TEL;TYPE=HOME:+1 555 0199\r\n\
EMAIL;TYPE=INTERNET:ann@exa\r\n mple.com\r\n\
END:VCARD\r\n\
BEGIN:VCARD\r\n\
VERSION:4.0\r\n\
N:Baker;Tom;;;\r\n\
TEL;VALUE=uri;TYPE=cell:TEL:+1-555-0101\r\n\
item1.EMAIL:tom@example.com\r\n\
END:VCARD\r\n\
BEGIN:VCARD\r\n\
VERSION:3.0\r\n\
NOTE:nothing useful\r\n\
END:VCARD\r\n";

    #[test]
    fn reads_cards_with_folding_and_groups() {
        let book = AddressBook::parse(EXPORT);
        assert_eq!(book.len(), 3);
        assert_eq!(book.ids(), vec!["abc-1", "2", "3"]);

        let ann = book.lookup("abc-1").unwrap();
        assert_eq!(ann.display_name.as_deref(), Some("Ann Lee"));
        assert_eq!(ann.phone.as_deref(), Some("+1 555 0100"));
        assert_eq!(ann.email.as_deref(), Some("ann@example.com"));

        let tom = book.lookup("2").unwrap();
        assert_eq!(tom.display_name.as_deref(), Some("Tom Baker"));
        assert_eq!(tom.phone.as_deref(), Some("+1-555-0101"));
        assert_eq!(tom.email.as_deref(), Some("tom@example.com"));
    }

    #[test]
    fn card_without_data_maps_to_no_contact() {
        let book = AddressBook::parse(EXPORT);
        assert_eq!(book.lookup("3").unwrap().into_contact(), None);
        assert!(book.lookup("missing").is_none());
    }

    #[test]
    fn uri_valued_phone_loses_its_scheme() {
        let book = AddressBook::parse(
            "BEGIN:VCARD\r\nVERSION:4.0\r\nFN:Ann\r\nTEL;VALUE=uri;TYPE=cell:tel:+1-555-0100\r\n\
             EMAIL:MAILTO:ann@example.com\r\nEND:VCARD\r\n",
        );
        let ann = book.lookup("1").unwrap();
        assert_eq!(ann.phone.as_deref(), Some("+1-555-0100"));
        assert_eq!(ann.email.as_deref(), Some("ann@example.com"));
        assert_eq!(strip_scheme("te", "tel:"), "te");
    }

    #[test]
    fn escapes_are_read_left_to_right() {
        assert_eq!(unescape(r"C:\\new"), r"C:\new");
        assert_eq!(unescape(r"a\,b\;c\nd\Ne"), "a,b;c d e");
        assert_eq!(unescape("trailing\\"), "trailing\\");
    }
}
