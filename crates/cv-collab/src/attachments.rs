use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use cv_domain::{Attachment, AttachmentMeta, AttachmentStore, Error, Result};
use cv_store::EventStore;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

pub struct SqliteAttachmentStore {
    store: Arc<EventStore>,
}

impl SqliteAttachmentStore {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AttachmentStore for SqliteAttachmentStore {
    async fn put(&self, conversation_id: i64, meta: AttachmentMeta, bytes: Vec<u8>) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let id_clone = id.clone();
        self.store.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO attachments
                    (id, conversation_id, doc_id, name, content_type, content, summary, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id_clone,
                    conversation_id,
                    meta.doc_id,
                    meta.name,
                    meta.content_type,
                    bytes,
                    meta.summary,
                    created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Attachment>> {
        let id = id.to_string();
        self.store.with_connection(move |conn| {
            conn.query_row(
                "SELECT id, conversation_id, doc_id, name, content_type, content, summary, created_at
                 FROM attachments WHERE id = ?1",
                params![id],
                row_to_attachment,
            )
            .optional()
            .map_err(Error::from)
        })
    }

    async fn get_by_doc_id(&self, conversation_id: i64, doc_id: &str) -> Result<Option<Attachment>> {
        let doc_id = doc_id.to_string();
        self.store.with_connection(move |conn| {
            conn.query_row(
                "SELECT id, conversation_id, doc_id, name, content_type, content, summary, created_at
                 FROM attachments WHERE conversation_id = ?1 AND doc_id = ?2
                 ORDER BY created_at DESC LIMIT 1",
                params![conversation_id, doc_id],
                row_to_attachment,
            )
            .optional()
            .map_err(Error::from)
        })
    }
}

fn row_to_attachment(row: &Row) -> rusqlite::Result<Attachment> {
    let created_at: String = row.get(7)?;
    Ok(Attachment {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        meta: AttachmentMeta {
            doc_id: row.get(2)?,
            name: row.get(3)?,
            content_type: row.get(4)?,
            summary: row.get(6)?,
        },
        content: row.get(5)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_by_id_round_trips() {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        store
            .create_conversation(&cv_domain::ConversationMeta {
                title: "t".into(),
                scenario_id: None,
                agents: vec![],
                starting_agent_id: None,
                config: Default::default(),
                custom: serde_json::Value::Null,
            })
            .unwrap();
        let attachments = SqliteAttachmentStore::new(store);

        let id = attachments
            .put(
                1,
                AttachmentMeta {
                    name: "notes.txt".into(),
                    content_type: "text/plain".into(),
                    doc_id: Some("doc-1".into()),
                    summary: None,
                },
                b"hello".to_vec(),
            )
            .await
            .unwrap();

        let fetched = attachments.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(fetched.content, b"hello");
        assert_eq!(fetched.meta.name, "notes.txt");

        let by_doc = attachments.get_by_doc_id(1, "doc-1").await.unwrap().unwrap();
        assert_eq!(by_doc.id, id);
    }

    #[tokio::test]
    async fn unknown_id_returns_none() {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let attachments = SqliteAttachmentStore::new(store);
        assert!(attachments.get_by_id("nope").await.unwrap().is_none());
    }
}
