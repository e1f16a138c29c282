use std::sync::Arc;

use rusqlite::params;

use netmesh_proto::{now_ms, Message, MessageType};

use crate::database::Database;
use crate::error::Result;

/// Append-mostly message audit log. A message is appended only after it has
/// been decrypted and its signature verified; the log therefore mirrors
/// exactly what was fanned out.
pub struct MessageStore {
    db: Arc<Database>,
}

impl MessageStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn append(&self, message: &Message) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO messages (id, content, sender_id, sender_name, timestamp, type,
                                   room_id, is_encrypted, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.id,
                message.content,
                message.sender_id,
                message.sender_name,
                message.timestamp as i64,
                message.message_type.as_str(),
                message.room_id,
                message.is_encrypted,
                now_ms() as i64,
            ],
        )?;
        Ok(())
    }

    pub fn count(&self) -> Result<u64> {
        let n = self
            .db
            .conn()
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Most recent messages, newest first.
    pub fn recent(&self, limit: u32) -> Result<Vec<Message>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, content, sender_id, sender_name, timestamp, type, room_id, is_encrypted
             FROM messages ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn by_sender(&self, sender_id: &str, limit: u32) -> Result<Vec<Message>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, content, sender_id, sender_name, timestamp, type, room_id, is_encrypted
             FROM messages WHERE sender_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![sender_id, limit], row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let timestamp: i64 = row.get(4)?;
    let type_str: String = row.get(5)?;
    let message_type = MessageType::parse(&type_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown message type: {type_str}"),
            )),
        )
    })?;
    Ok(Message {
        id: row.get(0)?,
        content: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        timestamp: timestamp as u64,
        message_type,
        room_id: row.get(6)?,
        is_encrypted: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_message(id: &str, timestamp: u64) -> Message {
        Message {
            id: id.to_string(),
            content: "hello".to_string(),
            sender_id: "u1".to_string(),
            sender_name: "Alice".to_string(),
            timestamp,
            message_type: MessageType::Text,
            room_id: None,
            is_encrypted: true,
        }
    }

    fn store() -> MessageStore {
        MessageStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn append_and_count() {
        let messages = store();
        assert_eq!(messages.count().unwrap(), 0);
        messages.append(&make_message("m1", 1)).unwrap();
        messages.append(&make_message("m2", 2)).unwrap();
        assert_eq!(messages.count().unwrap(), 2);
    }

    #[test]
    fn recent_is_newest_first() {
        let messages = store();
        messages.append(&make_message("m1", 10)).unwrap();
        messages.append(&make_message("m2", 30)).unwrap();
        messages.append(&make_message("m3", 20)).unwrap();

        let recent = messages.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "m2");
        assert_eq!(recent[1].id, "m3");
    }

    #[test]
    fn by_sender_filters() {
        let messages = store();
        messages.append(&make_message("m1", 1)).unwrap();
        let mut other = make_message("m2", 2);
        other.sender_id = "u2".to_string();
        messages.append(&other).unwrap();

        let mine = messages.by_sender("u1", 10).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, "m1");
    }

    #[test]
    fn message_round_trips_all_fields() {
        let messages = store();
        let mut msg = make_message("m1", 42);
        msg.message_type = MessageType::System;
        msg.room_id = Some("global".to_string());
        messages.append(&msg).unwrap();

        let got = &messages.recent(1).unwrap()[0];
        assert_eq!(*got, msg);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let messages = store();
        messages.append(&make_message("m1", 1)).unwrap();
        assert!(messages.append(&make_message("m1", 2)).is_err());
    }
}
