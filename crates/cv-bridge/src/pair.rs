//! The pair/room entity: a string-identified pairing of an initiator and a
//! responder, advancing through integer epochs. Each epoch is backed by one
//! orchestrator conversation (two roster entries, `init` and `resp`) so turn
//! ownership, finality, and guidance all come from the existing append
//! pipeline instead of a second state machine — the `pairs`/`tasks` tables
//! here only ever record the `pair_id -> epoch -> conversation_id` mapping;
//! messages themselves live in `conversation_events`, read back through
//! `EventStore`, not duplicated into a pair-scoped table.

use std::sync::Arc;

use cv_domain::{AgentKind, AgentSpec, ConversationMeta, Result};
use cv_orchestrator::Orchestrator;
use cv_store::EventStore;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Which side of a pair appended a given message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Author {
    Init,
    Resp,
}

impl Author {
    pub fn as_str(self) -> &'static str {
        match self {
            Author::Init => "init",
            Author::Resp => "resp",
        }
    }

    pub fn agent_id(self) -> &'static str {
        self.as_str()
    }

    pub fn other(self) -> Author {
        match self {
            Author::Init => Author::Resp,
            Author::Resp => Author::Init,
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "init" => Some(Author::Init),
            "resp" => Some(Author::Resp),
            _ => None,
        }
    }

    /// Same vocabulary as `from_str`, named for the call sites that read an
    /// event's `agent_id` rather than parsing a task id.
    pub fn from_agent_id(agent_id: &str) -> Option<Self> {
        Self::from_str(agent_id)
    }
}

/// `init:<pair>#<epoch>` / `resp:<pair>#<epoch>`.
pub fn task_id(pair_id: &str, epoch: i64, author: Author) -> String {
    format!("{}:{}#{}", author.as_str(), pair_id, epoch)
}

/// Parses a task id back into its components, validating the `author`
/// prefix against the known vocabulary.
pub fn parse_task_id(task_id: &str) -> Option<(String, i64, Author)> {
    let (prefix, rest) = task_id.split_once(':')?;
    let author = Author::from_str(prefix)?;
    let (pair_id, epoch_str) = rest.rsplit_once('#')?;
    let epoch: i64 = epoch_str.parse().ok()?;
    Some((pair_id.to_string(), epoch, author))
}

#[derive(Debug, Clone)]
pub struct EpochInfo {
    pub pair_id: String,
    pub epoch: i64,
    pub conversation_id: i64,
    pub init_task_id: String,
    pub resp_task_id: String,
}

/// The `pairs`/`tasks` SQL tables: a thin index from pair/epoch to the
/// orchestrator conversation actually holding the messages.
pub struct PairStore {
    store: Arc<EventStore>,
}

impl PairStore {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self { store }
    }

    /// `0` if the pair has never had an epoch begin.
    pub fn current_epoch(&self, pair_id: &str) -> Result<i64> {
        let pair_id = pair_id.to_string();
        self.store.with_connection(move |conn| {
            let epoch: Option<i64> = conn
                .query_row(
                    "SELECT epoch FROM pairs WHERE pair_id = ?1",
                    params![pair_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(epoch.unwrap_or(0))
        })
    }

    pub fn get_epoch(&self, pair_id: &str, epoch: i64) -> Result<Option<EpochInfo>> {
        let pair_id_owned = pair_id.to_string();
        let init_id = task_id(pair_id, epoch, Author::Init);
        self.store.with_connection(move |conn| {
            let conversation_id: Option<i64> = conn
                .query_row(
                    "SELECT conversation_id FROM tasks WHERE task_id = ?1",
                    params![init_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(conversation_id.map(|cid| EpochInfo {
                pair_id: pair_id_owned.clone(),
                epoch,
                conversation_id: cid,
                init_task_id: task_id(&pair_id_owned, epoch, Author::Init),
                resp_task_id: task_id(&pair_id_owned, epoch, Author::Resp),
            }))
        })
    }

    pub fn current(&self, pair_id: &str) -> Result<Option<EpochInfo>> {
        let epoch = self.current_epoch(pair_id)?;
        if epoch == 0 {
            return Ok(None);
        }
        self.get_epoch(pair_id, epoch)
    }

    /// Resolves a task id to `(pair_id, epoch, author)` iff it is actually
    /// registered (i.e. `begin_epoch` created it).
    pub fn resolve_task(&self, task_id_str: &str) -> Result<Option<(String, i64, Author)>> {
        let Some((pair_id, epoch, author)) = parse_task_id(task_id_str) else {
            return Ok(None);
        };
        let exists = self.get_epoch(&pair_id, epoch)?.is_some();
        Ok(exists.then_some((pair_id, epoch, author)))
    }

    /// Starts a fresh epoch for `pair_id`: allocates the next epoch number,
    /// opens a backing orchestrator conversation with `init`/`resp` on the
    /// roster (`init` goes first — the initiator always opens an epoch),
    /// and records both task ids.
    pub async fn begin_epoch(
        &self,
        orchestrator: &Orchestrator,
        pair_id: &str,
    ) -> Result<EpochInfo> {
        let next_epoch = self.current_epoch(pair_id)? + 1;

        let metadata = ConversationMeta {
            title: format!("pair:{pair_id}#{next_epoch}"),
            scenario_id: None,
            agents: vec![
                AgentSpec {
                    agent_id: Author::Init.agent_id().into(),
                    kind: AgentKind::External,
                    agent_class: None,
                },
                AgentSpec {
                    agent_id: Author::Resp.agent_id().into(),
                    kind: AgentKind::External,
                    agent_class: None,
                },
            ],
            starting_agent_id: Some(Author::Init.agent_id().into()),
            config: Default::default(),
            custom: serde_json::json!({ "pair_id": pair_id, "epoch": next_epoch }),
        };
        let conversation_id = orchestrator.create_conversation(metadata).await?;

        let pair_id_owned = pair_id.to_string();
        let init_id = task_id(pair_id, next_epoch, Author::Init);
        let resp_id = task_id(pair_id, next_epoch, Author::Resp);
        let init_id_clone = init_id.clone();
        let resp_id_clone = resp_id.clone();

        self.store.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO pairs (pair_id, epoch, metadata_json)
                 VALUES (?1, ?2, '{}')
                 ON CONFLICT(pair_id) DO UPDATE SET epoch = excluded.epoch",
                params![pair_id_owned, next_epoch],
            )?;
            conn.execute(
                "INSERT INTO tasks (task_id, pair_id, epoch, conversation_id) VALUES (?1, ?2, ?3, ?4)",
                params![init_id_clone, pair_id_owned, next_epoch, conversation_id],
            )?;
            conn.execute(
                "INSERT INTO tasks (task_id, pair_id, epoch, conversation_id) VALUES (?1, ?2, ?3, ?4)",
                params![resp_id_clone, pair_id_owned, next_epoch, conversation_id],
            )?;
            Ok(())
        })?;

        Ok(EpochInfo {
            pair_id: pair_id.to_string(),
            epoch: next_epoch,
            conversation_id,
            init_task_id: init_id,
            resp_task_id: resp_id,
        })
    }

    /// History listing for `GET /api/rooms/:roomId/epochs`: one entry per
    /// epoch with the count of `message` events on its backing
    /// conversation, ascending by epoch (the HTTP handler applies the
    /// scenario-expected `desc` default and any `order`/`limit` override).
    pub fn list_epochs(&self, pair_id: &str) -> Result<Vec<EpochSummary>> {
        let pair_id = pair_id.to_string();
        self.store.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT e.epoch, COUNT(CASE WHEN ce.type = 'message' THEN 1 END)
                 FROM (SELECT DISTINCT epoch, conversation_id FROM tasks WHERE pair_id = ?1) e
                 LEFT JOIN conversation_events ce ON ce.conversation_id = e.conversation_id
                 GROUP BY e.epoch
                 ORDER BY e.epoch ASC",
            )?;
            let rows = stmt
                .query_map(params![pair_id], |row| {
                    Ok(EpochSummary {
                        epoch: row.get(0)?,
                        message_count: row.get(1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

/// One row of `GET /api/rooms/:roomId/epochs`.
#[derive(Debug, Clone, Serialize)]
pub struct EpochSummary {
    pub epoch: i64,
    #[serde(rename = "messageCount")]
    pub message_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_round_trips() {
        let id = task_id("room-1", 3, Author::Resp);
        assert_eq!(id, "resp:room-1#3");
        assert_eq!(parse_task_id(&id), Some(("room-1".to_string(), 3, Author::Resp)));
    }

    #[test]
    fn parse_task_id_rejects_unknown_prefix() {
        assert!(parse_task_id("ghost:room-1#1").is_none());
    }

    #[test]
    fn parse_task_id_rejects_non_numeric_epoch() {
        assert!(parse_task_id("init:room-1#x").is_none());
    }
}
