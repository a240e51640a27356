use super::{Database, StoreError};
use crate::models::{Channel, Message, Status};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let channel: String = row.get("recipient_type")?;
    let status: String = row.get("status")?;
    let millis: i64 = row.get("sent_date")?;
    let sent_at = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(4, millis))?;
    let send_count: Option<u32> = row.get("send_count")?;

    Ok(Message::restore(
        row.get("id")?,
        row.get("content")?,
        row.get("recipient")?,
        channel.parse::<Channel>().map_err(|e| conversion_error(3, e))?,
        status.parse::<Status>().map_err(|e| conversion_error(5, e))?,
        sent_at,
        send_count.unwrap_or(0),
    ))
}

const MESSAGE_COLUMNS: &str = "id, content, recipient, recipient_type, sent_date, status, send_count";

impl Database {
    /// Appends one dispatch attempt to the history and writes the row id back.
    pub fn insert_message(&self, message: &mut Message) -> Result<i64, StoreError> {
        debug!("Saving {} message to {}", message.channel, message.recipient);
        self.conn.execute(
            "INSERT INTO messages (content, recipient, recipient_type, sent_date, status, send_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.content,
                message.recipient,
                message.channel.as_str(),
                message.sent_at.timestamp_millis(),
                message.status().as_str(),
                message.send_count,
            ],
        )?;
        message.id = self.conn.last_insert_rowid();
        Ok(message.id)
    }

    /// Newest first. Rows that cannot be decoded are skipped one by one.
    pub fn all_messages(&self) -> Result<Vec<Message>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages ORDER BY sent_date DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], message_from_row)?;

        let mut out = Vec::new();
        for row in rows {
            match row {
                Ok(message) => out.push(message),
                Err(e) => warn!("Skipping unreadable message row: {}", e),
            }
        }
        Ok(out)
    }

    pub fn message(&self, id: i64) -> Result<Option<Message>, StoreError> {
        let message = self
            .conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    /// Whether a message to `recipient` was handed off at or after `since`.
    pub fn sent_recently(&self, recipient: &str, since: DateTime<Utc>) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM messages WHERE recipient = ?1 AND status = ?2 AND sent_date >= ?3 LIMIT 1",
                params![recipient, Status::Sent.as_str(), since.timestamp_millis()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageDraft;
    use chrono::Duration;

    fn draft_at(recipient: &str, at: DateTime<Utc>) -> Message {
        MessageDraft {
            sent_at: Some(at),
            send_count: Some(1),
            ..MessageDraft::new(Channel::Sms, recipient, "hello")
        }
        .into_message()
    }

    #[test]
    fn history_is_newest_first() {
        let db = Database::open_memory().unwrap();
        let now = Utc::now();
        let mut older = draft_at("555", now - Duration::hours(2));
        let mut newer = draft_at("556", now);
        newer.transition(Status::Sent).unwrap();
        db.insert_message(&mut older).unwrap();
        db.insert_message(&mut newer).unwrap();
        assert!(older.id > 0 && newer.id > older.id);

        let all = db.all_messages().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].recipient, "556");
        assert_eq!(all[0].status(), Status::Sent);
        assert_eq!(all[0].send_count, 1);
        assert_eq!(all[1].recipient, "555");
        assert_eq!(all[1].sent_at.timestamp_millis(), older.sent_at.timestamp_millis());
    }

    #[test]
    fn every_insert_is_a_new_row() {
        let db = Database::open_memory().unwrap();
        let mut m = draft_at("555", Utc::now());
        let first = db.insert_message(&mut m).unwrap();
        let mut again = MessageDraft::retry_of(&m).into_message();
        let second = db.insert_message(&mut again).unwrap();
        assert_ne!(first, second);
        assert_eq!(db.all_messages().unwrap().len(), 2);
    }

    #[test]
    fn undecodable_rows_are_skipped_individually() {
        let db = Database::open_memory().unwrap();
        db.insert_message(&mut draft_at("555", Utc::now())).unwrap();
        db.conn
            .execute(
                "INSERT INTO messages (content, recipient, recipient_type, sent_date, status, send_count)
                 VALUES ('x', '1', 'FAX', 0, 'SENT', 1)",
                [],
            )
            .unwrap();
        db.conn
            .execute(
                "INSERT INTO messages (content, recipient, recipient_type, sent_date, status, send_count)
                 VALUES ('y', '2', 'SMS', 0, 'LOST', 1)",
                [],
            )
            .unwrap();
        db.conn
            .execute(
                "INSERT INTO messages (content, recipient, recipient_type, sent_date, status)
                 VALUES ('z', '3', 'EMAIL', 0, 'FAILED')",
                [],
            )
            .unwrap();

        let all = db.all_messages().unwrap();
        let recipients: Vec<&str> = all.iter().map(|m| m.recipient.as_str()).collect();
        assert_eq!(recipients, vec!["555", "3"]);
        assert_eq!(all[1].send_count, 0);
    }

    #[test]
    fn lookup_by_id() {
        let db = Database::open_memory().unwrap();
        let mut m = draft_at("555", Utc::now());
        let id = db.insert_message(&mut m).unwrap();
        assert_eq!(db.message(id).unwrap().unwrap().recipient, "555");
        assert!(db.message(id + 100).unwrap().is_none());
    }

    #[test]
    fn recent_send_only_counts_sent_rows_inside_the_window() {
        let db = Database::open_memory().unwrap();
        let now = Utc::now();
        let mut failed = draft_at("555", now);
        failed.transition(Status::Failed).unwrap();
        db.insert_message(&mut failed).unwrap();
        assert!(!db.sent_recently("555", now - Duration::minutes(5)).unwrap());

        let mut old = draft_at("555", now - Duration::hours(3));
        old.transition(Status::Sent).unwrap();
        db.insert_message(&mut old).unwrap();
        assert!(!db.sent_recently("555", now - Duration::minutes(5)).unwrap());
        assert!(db.sent_recently("555", now - Duration::hours(4)).unwrap());
        assert!(!db.sent_recently("556", now - Duration::hours(4)).unwrap());
    }
}
