use super::{Database, StoreError};
use crate::models::Contact;
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension};

fn write_contact(conn: &Connection, contact: &mut Contact) -> Result<i64, StoreError> {
    let json = contact.to_json()?;
    let search_index = contact.search_index();

    if contact.id() > 0 {
        let changed = conn.execute(
            "UPDATE contacts SET json_data = ?1, search_index = ?2 WHERE id = ?3",
            params![json, search_index, contact.id()],
        )?;
        if changed == 0 {
            warn!("No contact row with id {} to update", contact.id());
        }
        return Ok(contact.id());
    }

    conn.execute(
        "INSERT INTO contacts (json_data, search_index) VALUES (?1, ?2)",
        params![json, search_index],
    )?;
    let id = conn.last_insert_rowid();
    contact.set_id(id);
    Ok(id)
}

impl Database {
    /// Inserts a new contact or updates the row matching its id; returns the effective id.
    pub fn save_contact(&self, contact: &mut Contact) -> Result<i64, StoreError> {
        write_contact(&self.conn, contact)
    }

    /// Saves every contact in one transaction. Either all rows land or none do.
    pub fn save_contacts(&self, contacts: &mut [Contact]) -> Result<usize, StoreError> {
        if contacts.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        let mut assigned = Vec::new();
        let mut result = Ok(());
        for (idx, contact) in contacts.iter_mut().enumerate() {
            let was_new = contact.id() <= 0;
            match write_contact(&tx, contact) {
                Ok(_) if was_new => assigned.push(idx),
                Ok(_) => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        let result = result.and_then(|()| tx.commit().map_err(StoreError::from));

        if let Err(e) = result {
            // The rollback took those rows with it.
            for idx in assigned {
                contacts[idx].set_id(0);
            }
            warn!("Batch save of {} contacts rolled back: {}", contacts.len(), e);
            return Err(e);
        }
        info!("Saved {} contacts", contacts.len());
        Ok(contacts.len())
    }

    pub fn all_contacts(&self) -> Result<Vec<Contact>, StoreError> {
        self.query_contacts(None)
    }

    /// Case-insensitive substring search over every field value.
    pub fn search_contacts(&self, query: Option<&str>) -> Result<Vec<Contact>, StoreError> {
        match query.filter(|q| !q.is_empty()) {
            Some(q) => self.query_contacts(Some(&q.to_lowercase())),
            None => self.all_contacts(),
        }
    }

    pub fn contact(&self, id: i64) -> Result<Option<Contact>, StoreError> {
        let json: Option<String> = self
            .conn
            .query_row("SELECT json_data FROM contacts WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        let Some(json) = json else {
            return Ok(None);
        };
        match Contact::from_json(id, &json) {
            Ok(contact) => Ok(Some(contact)),
            Err(e) => {
                warn!("Error parsing contact {} JSON: {}", id, e);
                Ok(None)
            }
        }
    }

    fn query_contacts(&self, needle: Option<&str>) -> Result<Vec<Contact>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, json_data FROM contacts WHERE ?1 IS NULL OR instr(search_index, ?1) > 0 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![needle], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, json) = match row {
                Ok(r) => r,
                Err(e) => {
                    warn!("Skipping unreadable contact row: {}", e);
                    continue;
                }
            };
            match Contact::from_json(id, &json) {
                Ok(contact) => out.push(contact),
                Err(e) => warn!("Error parsing contact {} JSON: {}", id, e),
            }
        }
        debug!("Loaded {} contacts", out.len());
        Ok(out)
    }

    pub fn delete_contact(&self, id: i64) -> Result<bool, StoreError> {
        let deleted = self.conn.execute("DELETE FROM contacts WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub fn delete_all_contacts(&self) -> Result<usize, StoreError> {
        Ok(self.conn.execute("DELETE FROM contacts", [])?)
    }
}
