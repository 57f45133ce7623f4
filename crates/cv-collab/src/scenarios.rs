use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use cv_domain::{Error, Result, Scenario, ScenarioStore};
use cv_store::EventStore;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use uuid::Uuid;

pub struct SqliteScenarioStore {
    store: Arc<EventStore>,
}

impl SqliteScenarioStore {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ScenarioStore for SqliteScenarioStore {
    async fn list(&self) -> Result<Vec<Scenario>> {
        self.store.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, config_json, history_json, created_at, updated_at
                 FROM scenarios ORDER BY updated_at DESC",
            )?;
            let rows = stmt
                .query_map([], row_to_scenario)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    async fn get(&self, id: &str) -> Result<Option<Scenario>> {
        let id = id.to_string();
        self.store.with_connection(move |conn| {
            conn.query_row(
                "SELECT id, name, config_json, history_json, created_at, updated_at
                 FROM scenarios WHERE id = ?1",
                params![id],
                row_to_scenario,
            )
            .optional()
            .map_err(Error::from)
        })
    }

    async fn insert(&self, name: String, config: Value) -> Result<Scenario> {
        self.validate(&name, &config)?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let config_json = serde_json::to_string(&config)?;
        let id_clone = id.clone();
        let name_clone = name.clone();
        let config_clone = config.clone();
        self.store.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO scenarios (id, name, config_json, history_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, '[]', ?4, ?4)",
                params![id_clone, name_clone, config_json, now.to_rfc3339()],
            )?;
            Ok(())
        })?;
        Ok(Scenario {
            id,
            name,
            config: config_clone,
            history: Value::Array(vec![]),
            created_at: now,
            updated_at: now,
        })
    }

    async fn update(&self, id: &str, name: Option<String>, config: Option<Value>) -> Result<Scenario> {
        let existing = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("scenario {id}")))?;
        let new_name = name.unwrap_or(existing.name);
        let new_config = config.unwrap_or(existing.config);
        self.validate(&new_name, &new_config)?;

        let now = Utc::now();
        let config_json = serde_json::to_string(&new_config)?;
        let history_json = serde_json::to_string(&append_history(existing.history, now))?;
        let id_owned = id.to_string();
        let name_clone = new_name.clone();
        let config_clone = new_config.clone();
        let history_clone = history_json.clone();
        self.store.with_connection(move |conn| {
            let updated = conn.execute(
                "UPDATE scenarios SET name = ?1, config_json = ?2, history_json = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![name_clone, config_json, history_clone, now.to_rfc3339(), id_owned],
            )?;
            if updated == 0 {
                return Err(Error::NotFound(format!("scenario {id_owned}")));
            }
            Ok(())
        })?;

        Ok(Scenario {
            id: id.to_string(),
            name: new_name,
            config: config_clone,
            history: serde_json::from_str(&history_json).unwrap_or(Value::Array(vec![])),
            created_at: existing.created_at,
            updated_at: now,
        })
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.store.with_connection(move |conn| {
            let deleted = conn.execute("DELETE FROM scenarios WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(Error::NotFound(format!("scenario {id}")));
            }
            Ok(())
        })
    }
}

/// Appends a `{at}` entry to the scenario's history array. Kept as plain
/// timestamps rather than full diffs since no history schema beyond a
/// plain array is required.
fn append_history(history: Value, at: chrono::DateTime<Utc>) -> Value {
    let mut arr = match history {
        Value::Array(a) => a,
        _ => vec![],
    };
    arr.push(serde_json::json!({ "at": at.to_rfc3339() }));
    Value::Array(arr)
}

fn row_to_scenario(row: &Row) -> rusqlite::Result<Scenario> {
    let config_json: String = row.get(2)?;
    let history_json: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(Scenario {
        id: row.get(0)?,
        name: row.get(1)?,
        config: serde_json::from_str(&config_json).unwrap_or(Value::Null),
        history: serde_json::from_str(&history_json).unwrap_or(Value::Array(vec![])),
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_update_appends_history() {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let scenarios = SqliteScenarioStore::new(store);

        let created = scenarios
            .insert("demo".into(), serde_json::json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(created.history, Value::Array(vec![]));

        let updated = scenarios
            .update(&created.id, None, Some(serde_json::json!({"a": 2})))
            .await
            .unwrap();
        assert_eq!(updated.config["a"], 2);
        assert_eq!(updated.history.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_non_object_config() {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let scenarios = SqliteScenarioStore::new(store);
        let err = scenarios
            .insert("demo".into(), serde_json::json!("not an object"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
    }

    #[tokio::test]
    async fn delete_unknown_is_not_found() {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let scenarios = SqliteScenarioStore::new(store);
        let err = scenarios.delete("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
