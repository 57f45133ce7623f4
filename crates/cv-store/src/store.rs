//! The Event Store: exclusive owner of `conversations`, `conversation_events`,
//! `idempotency_keys`, and `runner_registry`. One
//! `rusqlite::Connection` per `EventStore`, guarded by a `parking_lot::Mutex`
//! — the per-conversation append lock is a layer above this, held by the
//! orchestrator, so the store itself only ever needs single-thread-at-a-time
//! access to its own connection.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use cv_domain::{
    Conversation, ConversationFilter, ConversationMeta, ConversationStatus, ConversationSummary,
    Error, Event, EventPayload, EventType, Finality, Result,
};

use crate::migrations;

pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(migrations::open(path)?),
        })
    }

    /// An in-memory store, used by tests and `cv-gateway doctor`'s scratch check.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Conversations ──────────────────────────────────────────────

    pub fn create_conversation(&self, metadata: &ConversationMeta) -> Result<i64> {
        let now = Utc::now();
        let conn = self.conn.lock();
        let metadata_json = serde_json::to_string(metadata)?;
        conn.execute(
            "INSERT INTO conversations (status, metadata_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![
                ConversationStatus::Active.as_str(),
                metadata_json,
                now.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_conversation(&self, conversation_id: i64) -> Result<Conversation> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT conversation_id, status, metadata_json, created_at, updated_at
             FROM conversations WHERE conversation_id = ?1",
            params![conversation_id],
            row_to_conversation,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("conversation {conversation_id}")))
    }

    pub fn set_conversation_status(
        &self,
        conversation_id: i64,
        status: ConversationStatus,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE conversations SET status = ?1, updated_at = ?2 WHERE conversation_id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), conversation_id],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("conversation {conversation_id}")));
        }
        Ok(())
    }

    pub fn touch_conversation(&self, conversation_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE conversation_id = ?2",
            params![Utc::now().to_rfc3339(), conversation_id],
        )?;
        Ok(())
    }

    pub fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<ConversationSummary>> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT conversation_id, status, metadata_json, created_at, updated_at
             FROM conversations WHERE 1=1",
        );
        if filter.status.is_some() {
            sql.push_str(" AND status = :status");
        }
        if filter.hours.is_some() {
            sql.push_str(" AND updated_at >= :since");
        }
        sql.push_str(" ORDER BY updated_at DESC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT :limit");
        }
        if filter.offset.is_some() {
            sql.push_str(" OFFSET :offset");
        }

        let mut stmt = conn.prepare(&sql)?;
        let since = filter
            .hours
            .map(|h| (Utc::now() - chrono::Duration::hours(h)).to_rfc3339());

        let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
        if let Some(status) = &filter.status {
            named.push((":status", status));
        }
        if let Some(since) = &since {
            named.push((":since", since));
        }
        if let Some(limit) = &filter.limit {
            named.push((":limit", limit));
        }
        if let Some(offset) = &filter.offset {
            named.push((":offset", offset));
        }

        let rows = stmt
            .query_map(named.as_slice(), row_to_conversation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter(|c| {
                filter
                    .scenario_id
                    .as_ref()
                    .map(|sid| c.metadata.scenario_id.as_deref() == Some(sid.as_str()))
                    .unwrap_or(true)
            })
            .map(|c| ConversationSummary {
                conversation_id: c.conversation_id,
                title: c.metadata.title,
                status: c.status,
                scenario_id: c.metadata.scenario_id,
                created_at: c.created_at,
                updated_at: c.updated_at,
            })
            .collect())
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Allocates `seq = head + 1` and persists atomically. Must be called
    /// while the caller holds the conversation's append lock.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        conversation_id: i64,
        turn: i64,
        event: i64,
        event_type: EventType,
        payload: &EventPayload,
        finality: Finality,
        agent_id: &str,
        ts: DateTime<Utc>,
    ) -> Result<Event> {
        let conn = self.conn.lock();
        let head: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM conversation_events WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        let seq = head + 1;
        let payload_json = serde_json::to_string(payload)?;

        conn.execute(
            "INSERT INTO conversation_events
                (conversation_id, seq, turn, event, type, payload_json, finality, agent_id, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                conversation_id,
                seq,
                turn,
                event,
                event_type.as_str(),
                payload_json,
                finality.as_str(),
                agent_id,
                ts.to_rfc3339(),
            ],
        )?;
        conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE conversation_id = ?2",
            params![ts.to_rfc3339(), conversation_id],
        )?;

        Ok(Event {
            conversation_id,
            seq,
            turn,
            event,
            event_type,
            payload: payload.clone(),
            finality,
            agent_id: agent_id.to_string(),
            ts,
        })
    }

    pub fn get_head(&self, conversation_id: i64) -> Result<i64> {
        let conn = self.conn.lock();
        let head: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM conversation_events WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(head)
    }

    pub fn get_events_since(&self, conversation_id: i64, seq_exclusive: i64) -> Result<Vec<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT conversation_id, seq, turn, event, type, payload_json, finality, agent_id, ts
             FROM conversation_events
             WHERE conversation_id = ?1 AND seq > ?2
             ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![conversation_id, seq_exclusive], row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_events_page(
        &self,
        conversation_id: i64,
        after_seq: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT conversation_id, seq, turn, event, type, payload_json, finality, agent_id, ts
             FROM conversation_events
             WHERE conversation_id = ?1 AND seq > ?2
             ORDER BY seq ASC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![conversation_id, after_seq.unwrap_or(0), limit],
                row_to_event,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// `{status, metadata, events, last_closed_seq}` — `last_closed_seq` is the
    /// greatest `seq` whose event closed a turn or the conversation, else 0.
    pub fn get_conversation_snapshot(&self, conversation_id: i64) -> Result<ConversationSnapshot> {
        let conversation = self.get_conversation(conversation_id)?;
        let events = self.get_events_since(conversation_id, 0)?;
        let last_closed_seq = events
            .iter()
            .filter(|e| e.finality.closes_turn())
            .map(|e| e.seq)
            .max()
            .unwrap_or(0);
        Ok(ConversationSnapshot {
            status: conversation.status,
            metadata: conversation.metadata,
            events,
            last_closed_seq,
        })
    }

    // ── Idempotency ────────────────────────────────────────────────

    /// Looks up a previously recorded `(seq, turn, event)` for this
    /// `(conversation_id, client_request_id)` pair, if any.
    pub fn find_idempotent(
        &self,
        conversation_id: i64,
        client_request_id: &str,
    ) -> Result<Option<(i64, i64, i64)>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT seq, turn, event FROM idempotency_keys
                 WHERE conversation_id = ?1 AND client_request_id = ?2",
                params![conversation_id, client_request_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(row)
    }

    pub fn record_idempotent(
        &self,
        conversation_id: i64,
        client_request_id: &str,
        seq: i64,
        turn: i64,
        event: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO idempotency_keys
                (conversation_id, client_request_id, seq, turn, event, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conversation_id,
                client_request_id,
                seq,
                turn,
                event,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Deletes idempotency keys older than `older_than`, returning the count
    /// removed. The background sweeper's primitive.
    pub fn vacuum_idempotency_keys(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM idempotency_keys WHERE created_at < ?1",
            params![older_than.to_rfc3339()],
        )?;
        Ok(removed)
    }

    // ── Runner registry ────────────────────────────────────────────

    pub fn register_runner(&self, conversation_id: i64, agent_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO runner_registry (conversation_id, agent_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![conversation_id, agent_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn deregister_runner(&self, conversation_id: i64, agent_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM runner_registry WHERE conversation_id = ?1 AND agent_id = ?2",
            params![conversation_id, agent_id],
        )?;
        Ok(())
    }

    pub fn list_runners(&self, conversation_id: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT agent_id FROM runner_registry WHERE conversation_id = ?1 ORDER BY agent_id",
        )?;
        let rows = stmt
            .query_map(params![conversation_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every `(conversation_id, agent_ids)` pair that needs resumption at
    /// startup: active conversations with at least one registry row.
    pub fn list_active_runner_intents(&self) -> Result<Vec<(i64, Vec<String>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT rr.conversation_id, rr.agent_id
             FROM runner_registry rr
             JOIN conversations c ON c.conversation_id = rr.conversation_id
             WHERE c.status = ?1
             ORDER BY rr.conversation_id, rr.agent_id",
        )?;
        let rows = stmt
            .query_map(params![ConversationStatus::Active.as_str()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut grouped: Vec<(i64, Vec<String>)> = Vec::new();
        for (conversation_id, agent_id) in rows {
            match grouped.last_mut() {
                Some((id, agents)) if *id == conversation_id => agents.push(agent_id),
                _ => grouped.push((conversation_id, vec![agent_id])),
            }
        }
        Ok(grouped)
    }

    /// Exposes the underlying connection so `cv-collab`/`cv-bridge` default
    /// implementations can share the one open file handle rather than each
    /// opening (and re-migrating) their own.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConversationSnapshot {
    pub status: ConversationStatus,
    pub metadata: ConversationMeta,
    pub events: Vec<Event>,
    pub last_closed_seq: i64,
}

fn row_to_conversation(row: &Row) -> rusqlite::Result<Conversation> {
    let status_str: String = row.get(1)?;
    let metadata_json: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(Conversation {
        conversation_id: row.get(0)?,
        status: ConversationStatus::from_str(&status_str).unwrap_or(ConversationStatus::Active),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(ConversationMeta {
            title: String::new(),
            scenario_id: None,
            agents: Vec::new(),
            starting_agent_id: None,
            config: Default::default(),
            custom: Value::Null,
        }),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
    let type_str: String = row.get(4)?;
    let payload_json: String = row.get(5)?;
    let finality_str: String = row.get(6)?;
    let ts: String = row.get(8)?;
    Ok(Event {
        conversation_id: row.get(0)?,
        seq: row.get(1)?,
        turn: row.get(2)?,
        event: row.get(3)?,
        event_type: EventType::from_str(&type_str).unwrap_or(EventType::Trace),
        payload: serde_json::from_str(&payload_json).unwrap_or(EventPayload::Trace {
            raw: Default::default(),
        }),
        finality: Finality::from_str(&finality_str).unwrap_or(Finality::None),
        agent_id: row.get(7)?,
        ts: parse_ts(&ts),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_domain::{AgentKind, AgentSpec};

    fn meta() -> ConversationMeta {
        ConversationMeta {
            title: "test".into(),
            scenario_id: None,
            agents: vec![AgentSpec {
                agent_id: "alice".into(),
                kind: AgentKind::Internal,
                agent_class: None,
            }],
            starting_agent_id: None,
            config: Default::default(),
            custom: Value::Null,
        }
    }

    #[test]
    fn append_allocates_dense_sequential_seq() {
        let store = EventStore::open_in_memory().unwrap();
        let cid = store.create_conversation(&meta()).unwrap();

        let e1 = store
            .append(
                cid,
                1,
                1,
                EventType::Message,
                &EventPayload::Message {
                    text: Some("hi".into()),
                    attachments: None,
                    raw: Default::default(),
                },
                Finality::None,
                "alice",
                Utc::now(),
            )
            .unwrap();
        assert_eq!(e1.seq, 1);

        let e2 = store
            .append(
                cid,
                1,
                2,
                EventType::Message,
                &EventPayload::Message {
                    text: Some("there".into()),
                    attachments: None,
                    raw: Default::default(),
                },
                Finality::Turn,
                "alice",
                Utc::now(),
            )
            .unwrap();
        assert_eq!(e2.seq, 2);
        assert_eq!(store.get_head(cid).unwrap(), 2);
    }

    #[test]
    fn snapshot_reports_last_closed_seq() {
        let store = EventStore::open_in_memory().unwrap();
        let cid = store.create_conversation(&meta()).unwrap();
        store
            .append(
                cid,
                1,
                1,
                EventType::Message,
                &EventPayload::Message {
                    text: Some("hi".into()),
                    attachments: None,
                    raw: Default::default(),
                },
                Finality::None,
                "alice",
                Utc::now(),
            )
            .unwrap();
        store
            .append(
                cid,
                1,
                2,
                EventType::Message,
                &EventPayload::Message {
                    text: Some("bye".into()),
                    attachments: None,
                    raw: Default::default(),
                },
                Finality::Turn,
                "alice",
                Utc::now(),
            )
            .unwrap();

        let snap = store.get_conversation_snapshot(cid).unwrap();
        assert_eq!(snap.last_closed_seq, 2);
        assert_eq!(snap.events.len(), 2);
    }

    #[test]
    fn idempotency_key_roundtrips() {
        let store = EventStore::open_in_memory().unwrap();
        let cid = store.create_conversation(&meta()).unwrap();
        assert!(store.find_idempotent(cid, "R1").unwrap().is_none());
        store.record_idempotent(cid, "R1", 2, 1, 1).unwrap();
        assert_eq!(store.find_idempotent(cid, "R1").unwrap(), Some((2, 1, 1)));
    }

    #[test]
    fn vacuum_removes_only_expired_keys() {
        let store = EventStore::open_in_memory().unwrap();
        let cid = store.create_conversation(&meta()).unwrap();
        store.record_idempotent(cid, "R1", 2, 1, 1).unwrap();
        let removed = store
            .vacuum_idempotency_keys(Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(removed, 0);
        let removed = store
            .vacuum_idempotency_keys(Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn runner_registry_tracks_resumption_intents() {
        let store = EventStore::open_in_memory().unwrap();
        let cid = store.create_conversation(&meta()).unwrap();
        store.register_runner(cid, "alice").unwrap();
        store.register_runner(cid, "bob").unwrap();
        assert_eq!(store.list_runners(cid).unwrap(), vec!["alice", "bob"]);

        let intents = store.list_active_runner_intents().unwrap();
        assert_eq!(intents, vec![(cid, vec!["alice".to_string(), "bob".to_string()])]);

        store.deregister_runner(cid, "alice").unwrap();
        assert_eq!(store.list_runners(cid).unwrap(), vec!["bob"]);
    }
}
