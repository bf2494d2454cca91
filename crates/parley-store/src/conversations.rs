//! Conversation and participant queries.

use chrono::{DateTime, Utc};
use parley_core::{Conversation, ConversationId, Expiry, MessageId, Participant, UserId};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::database::{column_time, Database};
use crate::error::{Result, StoreError};
use crate::messages;

const CONVERSATION_COLUMNS: &str =
    "c.id, c.last_mod, c.is_primary, c.expiry_time, c.expiry_ended";

/// Key enforcing a single live primary conversation per pair of users.
fn pair_key(a: UserId, b: UserId) -> String {
    format!("{}:{}", a.min(b), a.max(b))
}

impl Database {
    /// Create a conversation, or return the live primary conversation of the
    /// same pair.
    ///
    /// The initiator is always a participant; duplicate participants are
    /// collapsed. Only two-person conversations can be primary.
    pub fn create_conversation(
        &mut self,
        initiator: UserId,
        participants: &[UserId],
        primary: bool,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<Conversation> {
        let mut members = vec![initiator];
        for &user in participants {
            if !members.contains(&user) {
                members.push(user);
            }
        }
        let pair = (primary && members.len() == 2).then(|| pair_key(members[0], members[1]));
        let now = Utc::now().timestamp_millis();

        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(key) = &pair {
            let existing: Option<(i64, bool)> = tx
                .query_row(
                    "SELECT id, expiry_ended FROM conversations WHERE primary_pair = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match existing {
                Some((id, false)) => {
                    let id = id as ConversationId;
                    for &user in &members {
                        upsert_participant(&tx, id, user)?;
                    }
                    let conversation = load_conversation(&tx, id)?;
                    tx.commit()?;
                    tracing::debug!(conversation = id, "reusing primary conversation");
                    return Ok(conversation);
                }
                Some((id, true)) => {
                    tx.execute(
                        "UPDATE conversations SET primary_pair = NULL WHERE id = ?1",
                        params![id],
                    )?;
                }
                None => {}
            }
        }

        tx.execute(
            "INSERT INTO conversations (initiator, last_mod, is_primary, primary_pair, expiry_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                initiator as i64,
                now,
                pair.is_some(),
                pair,
                expiry.map(|t| t.timestamp_millis()),
            ],
        )?;
        let id = tx.last_insert_rowid() as ConversationId;

        for &user in &members {
            upsert_participant(&tx, id, user)?;
        }
        let conversation = load_conversation(&tx, id)?;
        tx.commit()?;

        tracing::debug!(conversation = id, participants = members.len(), "created conversation");
        Ok(conversation)
    }

    /// Add participants, reactivating soft-deleted ones.
    ///
    /// Returns the users that were not active before the call.
    pub fn add_participants(
        &mut self,
        conversation_id: ConversationId,
        users: &[UserId],
    ) -> Result<Vec<UserId>> {
        let tx = self.conn_mut().transaction()?;
        if !conversation_exists(&tx, conversation_id)? {
            return Err(StoreError::NotFound);
        }

        let mut added = Vec::new();
        for &user in users {
            if added.contains(&user) {
                continue;
            }
            if upsert_participant(&tx, conversation_id, user)? {
                added.push(user);
            }
        }
        tx.commit()?;
        Ok(added)
    }

    /// Load a conversation with its active participants and last message.
    ///
    /// `unread` is left at zero; it is relative to a viewer.
    pub fn get_conversation(&self, conversation_id: ConversationId) -> Result<Conversation> {
        load_conversation(self.conn(), conversation_id)
    }

    /// A user's conversations, most recently active first.
    ///
    /// Soft-deleted memberships and ended conversations are excluded.
    pub fn get_conversations(
        &self,
        user: UserId,
        start: usize,
        count: usize,
    ) -> Result<Vec<Conversation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS}
             FROM conversations c
             JOIN conversation_participants p ON p.conversation_id = c.id
             WHERE p.participant_id = ?1 AND p.deleted = 0 AND c.expiry_ended = 0
             ORDER BY c.last_mod DESC, c.id DESC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let headers = stmt
            .query_map(params![user as i64, count as i64, start as i64], row_to_header)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        headers
            .into_iter()
            .map(|header| {
                let mut conversation = assemble(conn, header)?;
                conversation.unread = messages::conversation_unread(conn, user, conversation.id)?;
                Ok(conversation)
            })
            .collect()
    }

    /// Active participants of a conversation, in joining order.
    pub fn participants(&self, conversation_id: ConversationId) -> Result<Vec<Participant>> {
        load_participants(self.conn(), conversation_id)
    }

    /// Whether the user is an active participant.
    pub fn is_participant(&self, conversation_id: ConversationId, user: UserId) -> Result<bool> {
        Ok(self.conn().query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM conversation_participants
                 WHERE conversation_id = ?1 AND participant_id = ?2 AND deleted = 0
             )",
            params![conversation_id as i64, user as i64],
            |row| row.get(0),
        )?)
    }

    /// Advance a participant's read marker. The marker never moves backwards.
    ///
    /// Returns the marker after the update.
    pub fn mark_read(
        &self,
        conversation_id: ConversationId,
        user: UserId,
        message_id: MessageId,
    ) -> Result<MessageId> {
        self.conn()
            .query_row(
                "UPDATE conversation_participants
                 SET last_read = MAX(last_read, ?3)
                 WHERE conversation_id = ?1 AND participant_id = ?2
                 RETURNING last_read",
                params![conversation_id as i64, user as i64, message_id as i64],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .map(|last_read| last_read as MessageId)
            .ok_or(StoreError::NotFound)
    }

    /// Soft-delete the conversation for one participant.
    pub fn delete_conversation(&self, conversation_id: ConversationId, user: UserId) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE conversation_participants SET deleted = 1
             WHERE conversation_id = ?1 AND participant_id = ?2",
            params![conversation_id as i64, user as i64],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// End a conversation for everyone.
    ///
    /// A conversation without an expiry gets one at the current time.
    /// Terminating twice is harmless.
    pub fn terminate_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE conversations
             SET expiry_ended = 1, expiry_time = COALESCE(expiry_time, ?2)
             WHERE id = ?1",
            params![conversation_id as i64, Utc::now().timestamp_millis()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Set or clear a conversation's expiry. Clearing also lifts termination.
    pub fn set_expiry(
        &self,
        conversation_id: ConversationId,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let affected = match expiry {
            Some(time) => self.conn().execute(
                "UPDATE conversations SET expiry_time = ?2 WHERE id = ?1",
                params![conversation_id as i64, time.timestamp_millis()],
            )?,
            None => self.conn().execute(
                "UPDATE conversations SET expiry_time = NULL, expiry_ended = 0 WHERE id = ?1",
                params![conversation_id as i64],
            )?,
        };
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Mute or unmute a conversation for one participant.
    pub fn set_muted(
        &self,
        conversation_id: ConversationId,
        user: UserId,
        muted: bool,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE conversation_participants SET muted = ?3
             WHERE conversation_id = ?1 AND participant_id = ?2 AND deleted = 0",
            params![conversation_id as i64, user as i64, muted],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

struct Header {
    id: ConversationId,
    last_activity: DateTime<Utc>,
    primary: bool,
    expiry: Option<Expiry>,
}

fn row_to_header(row: &rusqlite::Row<'_>) -> rusqlite::Result<Header> {
    let id: i64 = row.get(0)?;
    let expiry_time: Option<i64> = row.get(3)?;
    let expiry = match expiry_time {
        Some(millis) => Some(Expiry {
            time: DateTime::from_timestamp_millis(millis)
                .ok_or(rusqlite::Error::IntegralValueOutOfRange(3, millis))?,
            ended: row.get(4)?,
        }),
        None => None,
    };

    Ok(Header {
        id: id as ConversationId,
        last_activity: column_time(row, 1)?,
        primary: row.get(2)?,
        expiry,
    })
}

fn assemble(conn: &Connection, header: Header) -> Result<Conversation> {
    let mut conversation = Conversation {
        id: header.id,
        participants: load_participants(conn, header.id)?,
        last_activity: header.last_activity,
        primary: header.primary,
        expiry: header.expiry,
        last_message: messages::last_message(conn, header.id)?,
        read: Vec::new(),
        unread: 0,
    };
    conversation.refresh_receipts();
    Ok(conversation)
}

pub(crate) fn load_conversation(conn: &Connection, id: ConversationId) -> Result<Conversation> {
    let header = conn
        .query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1"),
            params![id as i64],
            row_to_header,
        )
        .optional()?
        .ok_or(StoreError::NotFound)?;
    assemble(conn, header)
}

fn load_participants(conn: &Connection, id: ConversationId) -> Result<Vec<Participant>> {
    let mut stmt = conn.prepare(
        "SELECT participant_id, last_read, muted
         FROM conversation_participants
         WHERE conversation_id = ?1 AND deleted = 0
         ORDER BY rowid",
    )?;
    let participants = stmt
        .query_map(params![id as i64], |row| {
            let mut participant = Participant::new(row.get::<_, i64>(0)? as UserId);
            participant.last_read = row.get::<_, i64>(1)? as MessageId;
            participant.muted = row.get(2)?;
            Ok(participant)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(participants)
}

pub(crate) fn conversation_exists(conn: &Connection, id: ConversationId) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
        params![id as i64],
        |row| row.get(0),
    )?)
}

/// Insert or reactivate a membership. Returns `true` if the user was not
/// active before.
fn upsert_participant(conn: &Connection, id: ConversationId, user: UserId) -> Result<bool> {
    let deleted: Option<bool> = conn
        .query_row(
            "SELECT deleted FROM conversation_participants
             WHERE conversation_id = ?1 AND participant_id = ?2",
            params![id as i64, user as i64],
            |row| row.get(0),
        )
        .optional()?;

    if deleted == Some(false) {
        return Ok(false);
    }

    conn.execute(
        "INSERT INTO conversation_participants (conversation_id, participant_id)
         VALUES (?1, ?2)
         ON CONFLICT (conversation_id, participant_id) DO UPDATE SET deleted = 0",
        params![id as i64, user as i64],
    )?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use parley_core::ConversationState;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_includes_initiator_once() {
        let mut db = db();
        let conv = db.create_conversation(1, &[2, 1, 3, 2], false, None).unwrap();

        assert_eq!(conv.participant_ids(), vec![1, 2, 3]);
        assert!(!conv.primary);
        assert_eq!(conv.state(), ConversationState::Active);
        assert!(conv.last_message.is_none());
    }

    #[test]
    fn test_primary_is_reused_for_the_same_pair() {
        let mut db = db();
        let first = db.create_conversation(1, &[2], true, None).unwrap();
        let second = db.create_conversation(2, &[1], true, None).unwrap();

        assert!(first.primary);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_ended_primary_is_replaced() {
        let mut db = db();
        let first = db.create_conversation(1, &[2], true, None).unwrap();
        db.terminate_conversation(first.id).unwrap();

        let second = db.create_conversation(1, &[2], true, None).unwrap();
        assert_ne!(first.id, second.id);
        assert!(second.primary);
    }

    #[test]
    fn test_primary_requires_a_pair() {
        let mut db = db();
        let group = db.create_conversation(1, &[2, 3], true, None).unwrap();
        assert!(!group.primary);
    }

    #[test]
    fn test_add_participants_is_idempotent() {
        let mut db = db();
        let conv = db.create_conversation(1, &[2], false, None).unwrap();

        assert_eq!(db.add_participants(conv.id, &[3, 3, 2]).unwrap(), vec![3]);
        assert!(db.add_participants(conv.id, &[3]).unwrap().is_empty());
        assert_eq!(db.participants(conv.id).unwrap().len(), 3);
    }

    #[test]
    fn test_add_participants_unknown_conversation() {
        let mut db = db();
        assert!(matches!(
            db.add_participants(99, &[1]),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_soft_delete_is_reversible() {
        let mut db = db();
        let conv = db.create_conversation(1, &[2], false, None).unwrap();

        db.delete_conversation(conv.id, 2).unwrap();
        assert!(!db.is_participant(conv.id, 2).unwrap());
        assert!(db.get_conversations(2, 0, 10).unwrap().is_empty());
        assert_eq!(db.get_conversations(1, 0, 10).unwrap().len(), 1);

        assert_eq!(db.add_participants(conv.id, &[2]).unwrap(), vec![2]);
        assert!(db.is_participant(conv.id, 2).unwrap());
        assert_eq!(db.get_conversations(2, 0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_terminated_conversations_are_hidden() {
        let mut db = db();
        let conv = db.create_conversation(1, &[2], false, None).unwrap();

        db.terminate_conversation(conv.id).unwrap();
        db.terminate_conversation(conv.id).unwrap();

        assert!(db.get_conversations(1, 0, 10).unwrap().is_empty());
        let loaded = db.get_conversation(conv.id).unwrap();
        assert_eq!(loaded.state(), ConversationState::Terminated);
    }

    #[test]
    fn test_terminate_keeps_existing_expiry_time() {
        let mut db = db();
        let at = DateTime::from_timestamp_millis((Utc::now() + Duration::hours(1)).timestamp_millis())
            .unwrap();
        let conv = db.create_conversation(1, &[2], false, Some(at)).unwrap();
        assert_eq!(conv.expiry, Some(Expiry::at(at)));

        db.terminate_conversation(conv.id).unwrap();
        let loaded = db.get_conversation(conv.id).unwrap();
        assert_eq!(loaded.expiry, Some(Expiry { time: at, ended: true }));
    }

    #[test]
    fn test_clearing_expiry_lifts_termination() {
        let mut db = db();
        let conv = db.create_conversation(1, &[2], false, None).unwrap();
        db.terminate_conversation(conv.id).unwrap();

        db.set_expiry(conv.id, None).unwrap();
        let loaded = db.get_conversation(conv.id).unwrap();
        assert_eq!(loaded.state(), ConversationState::Active);
        assert_eq!(db.get_conversations(1, 0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_mark_read_never_moves_backwards() {
        let mut db = db();
        let conv = db.create_conversation(1, &[2], false, None).unwrap();

        assert_eq!(db.mark_read(conv.id, 2, 10).unwrap(), 10);
        assert_eq!(db.mark_read(conv.id, 2, 4).unwrap(), 10);

        let loaded = db.get_conversation(conv.id).unwrap();
        assert_eq!(loaded.participant(2).unwrap().last_read, 10);
        assert_eq!(loaded.read.len(), 1);
        assert!(matches!(db.mark_read(conv.id, 9, 1), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_conversations_ordered_by_activity() {
        let mut db = db();
        let older = db.create_conversation(1, &[2], false, None).unwrap();
        let newer = db.create_conversation(1, &[3], false, None).unwrap();

        let ids: Vec<_> = db
            .get_conversations(1, 0, 10)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![newer.id, older.id]);

        std::thread::sleep(std::time::Duration::from_millis(5));
        db.add_message(older.id, 2, "bump", false).unwrap();
        let first = db.get_conversations(1, 0, 1).unwrap();
        assert_eq!(first[0].id, older.id);
        assert_eq!(db.get_conversations(1, 1, 10).unwrap()[0].id, newer.id);
    }

    #[test]
    fn test_set_muted() {
        let mut db = db();
        let conv = db.create_conversation(1, &[2], false, None).unwrap();

        db.set_muted(conv.id, 2, true).unwrap();
        assert!(db.participants(conv.id).unwrap()[1].muted);
        assert!(matches!(db.set_muted(conv.id, 7, true), Err(StoreError::NotFound)));
    }
}
