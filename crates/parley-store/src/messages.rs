//! Message and unread-count queries.

use chrono::Utc;
use parley_core::{ConversationId, CursorMode, Message, MessageId, User, UserId};
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::{column_time, Database};
use crate::error::{Result, StoreError};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, text, system, created_at";

impl Database {
    /// Append a message and bump the conversation's last activity.
    pub fn add_message(
        &mut self,
        conversation_id: ConversationId,
        sender: UserId,
        text: &str,
        system: bool,
    ) -> Result<Message> {
        let now = Utc::now();
        let tx = self.conn_mut().transaction()?;

        let touched = tx.execute(
            "UPDATE conversations SET last_mod = ?2 WHERE id = ?1",
            params![conversation_id as i64, now.timestamp_millis()],
        )?;
        if touched == 0 {
            return Err(StoreError::NotFound);
        }

        tx.execute(
            "INSERT INTO chat_messages (conversation_id, sender_id, text, system, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                conversation_id as i64,
                sender as i64,
                text,
                system,
                now.timestamp_millis(),
            ],
        )?;
        let id = tx.last_insert_rowid() as MessageId;
        let message = tx.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE id = ?1"),
            params![id as i64],
            row_to_message,
        )?;
        tx.commit()?;

        Ok(message)
    }

    /// A page of messages, newest first.
    ///
    /// - `Start` skips `cursor` newest messages.
    /// - `Before` returns messages older than `cursor`.
    /// - `After` returns the newest messages newer than `cursor`.
    pub fn get_messages(
        &self,
        conversation_id: ConversationId,
        cursor: u64,
        mode: CursorMode,
        count: usize,
    ) -> Result<Vec<Message>> {
        let filter = match mode {
            CursorMode::Start => "",
            CursorMode::Before => "AND id < ?2",
            CursorMode::After => "AND id > ?2",
        };
        let (limit, offset) = match mode {
            CursorMode::Start => (count as i64, cursor as i64),
            CursorMode::Before | CursorMode::After => (count as i64, 0),
        };
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages
             WHERE conversation_id = ?1 {filter}
             ORDER BY id DESC
             LIMIT ?3 OFFSET ?4"
        );

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![conversation_id as i64, cursor as i64, limit, offset],
                row_to_message,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The newest message of a conversation.
    pub fn last_message(&self, conversation_id: ConversationId) -> Result<Option<Message>> {
        last_message(self.conn(), conversation_id)
    }

    /// Unread messages in one conversation for a user.
    ///
    /// Counts messages after the user's read marker, excluding system
    /// messages and the user's own. The anonymous user (0) has none.
    pub fn user_conversation_unread(
        &self,
        user: UserId,
        conversation_id: ConversationId,
    ) -> Result<u64> {
        conversation_unread(self.conn(), user, conversation_id)
    }

    /// Badge count: unread messages across the user's visible, unmuted and
    /// not ended conversations.
    pub fn unread_message_count(&self, user: UserId) -> Result<u64> {
        if user == 0 {
            return Ok(0);
        }
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*)
             FROM chat_messages m
             JOIN conversation_participants p ON p.conversation_id = m.conversation_id
             JOIN conversations c ON c.id = m.conversation_id
             WHERE p.participant_id = ?1
               AND p.deleted = 0
               AND p.muted = 0
               AND c.expiry_ended = 0
               AND m.id > p.last_read
               AND m.system = 0
               AND m.sender_id != ?1",
            params![user as i64],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get::<_, i64>(0)? as MessageId,
        conversation_id: row.get::<_, i64>(1)? as ConversationId,
        sender: User::with_id(row.get::<_, i64>(2)? as UserId),
        text: row.get(3)?,
        system: row.get(4)?,
        timestamp: column_time(row, 5)?,
    })
}

pub(crate) fn last_message(conn: &Connection, id: ConversationId) -> Result<Option<Message>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM chat_messages
                 WHERE conversation_id = ?1
                 ORDER BY id DESC LIMIT 1"
            ),
            params![id as i64],
            row_to_message,
        )
        .optional()?)
}

pub(crate) fn conversation_unread(
    conn: &Connection,
    user: UserId,
    id: ConversationId,
) -> Result<u64> {
    if user == 0 {
        return Ok(0);
    }
    let count: i64 = conn.query_row(
        "SELECT COUNT(*)
         FROM chat_messages m
         JOIN conversation_participants p
           ON p.conversation_id = m.conversation_id AND p.participant_id = ?1
         WHERE m.conversation_id = ?2
           AND m.id > p.last_read
           AND m.system = 0
           AND m.sender_id != ?1",
        params![user as i64, id as i64],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_conversation() -> (Database, ConversationId) {
        let mut db = Database::open_in_memory().unwrap();
        let conv = db.create_conversation(1, &[2], false, None).unwrap();
        (db, conv.id)
    }

    fn ids(messages: &[Message]) -> Vec<MessageId> {
        messages.iter().map(|m| m.id).collect()
    }

    #[test]
    fn test_message_ids_increase() {
        let (mut db, conv) = db_with_conversation();
        let first = db.add_message(conv, 1, "one", false).unwrap();
        let second = db.add_message(conv, 2, "two", false).unwrap();

        assert!(second.id > first.id);
        assert!(second.timestamp >= first.timestamp);
        assert_eq!(second.sender.id, 2);
        assert_eq!(db.last_message(conv).unwrap(), Some(second));
    }

    #[test]
    fn test_add_message_unknown_conversation() {
        let (mut db, _) = db_with_conversation();
        assert!(matches!(
            db.add_message(42, 1, "hi", false),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_cursor_modes() {
        let (mut db, conv) = db_with_conversation();
        let all: Vec<MessageId> = (0..6)
            .map(|n| db.add_message(conv, 1, &format!("m{n}"), false).unwrap().id)
            .collect();

        let newest = db.get_messages(conv, 0, CursorMode::Start, 3).unwrap();
        assert_eq!(ids(&newest), vec![all[5], all[4], all[3]]);

        let skipped = db.get_messages(conv, 2, CursorMode::Start, 2).unwrap();
        assert_eq!(ids(&skipped), vec![all[3], all[2]]);

        let before = db.get_messages(conv, all[3], CursorMode::Before, 2).unwrap();
        assert_eq!(ids(&before), vec![all[2], all[1]]);

        let after = db.get_messages(conv, all[1], CursorMode::After, 2).unwrap();
        assert_eq!(ids(&after), vec![all[5], all[4]]);

        let tail = db.get_messages(conv, all[0], CursorMode::Before, 5).unwrap();
        assert!(tail.is_empty());
    }

    #[test]
    fn test_unread_counts() {
        let (mut db, conv) = db_with_conversation();
        let first = db.add_message(conv, 2, "hello", false).unwrap();
        db.add_message(conv, 1, "own message", false).unwrap();
        db.add_message(conv, 2, "joined", true).unwrap();
        db.add_message(conv, 2, "again", false).unwrap();

        assert_eq!(db.user_conversation_unread(1, conv).unwrap(), 2);
        assert_eq!(db.unread_message_count(1).unwrap(), 2);

        db.mark_read(conv, 1, first.id).unwrap();
        assert_eq!(db.user_conversation_unread(1, conv).unwrap(), 1);

        assert_eq!(db.user_conversation_unread(0, conv).unwrap(), 0);
        assert_eq!(db.unread_message_count(0).unwrap(), 0);
        assert_eq!(db.user_conversation_unread(99, conv).unwrap(), 0);
    }

    #[test]
    fn test_badge_skips_muted_deleted_and_ended() {
        let mut db = Database::open_in_memory().unwrap();
        let muted = db.create_conversation(1, &[2], false, None).unwrap().id;
        let deleted = db.create_conversation(1, &[3], false, None).unwrap().id;
        let ended = db.create_conversation(1, &[4], false, None).unwrap().id;
        let visible = db.create_conversation(1, &[5], false, None).unwrap().id;

        for (conv, sender) in [(muted, 2), (deleted, 3), (ended, 4), (visible, 5)] {
            db.add_message(conv, sender, "ping", false).unwrap();
        }
        db.set_muted(muted, 1, true).unwrap();
        db.delete_conversation(deleted, 1).unwrap();
        db.terminate_conversation(ended).unwrap();

        assert_eq!(db.unread_message_count(1).unwrap(), 1);
    }
}
