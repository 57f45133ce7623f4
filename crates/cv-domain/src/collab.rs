//! Interfaces for the external collaborators the orchestrator consults but
//! does not own: attachments and scenarios. Defined here rather
//! than alongside their SQLite implementations (in `cv-collab`) because
//! `cv-orchestrator` needs to call through them — `cv-collab` is wired in
//! later and depends back on these shapes, not the other way around.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub name: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub conversation_id: i64,
    pub meta: AttachmentMeta,
    #[serde(with = "serde_bytes_as_base64")]
    pub content: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Bytes are stored inline; no URI dereference.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn put(&self, conversation_id: i64, meta: AttachmentMeta, bytes: Vec<u8>) -> Result<String>;
    async fn get_by_id(&self, id: &str) -> Result<Option<Attachment>>;
    async fn get_by_doc_id(&self, conversation_id: i64, doc_id: &str) -> Result<Option<Attachment>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    pub config: Value,
    #[serde(default)]
    pub history: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ScenarioStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Scenario>>;
    async fn get(&self, id: &str) -> Result<Option<Scenario>>;
    async fn insert(&self, name: String, config: Value) -> Result<Scenario>;
    async fn update(&self, id: &str, name: Option<String>, config: Option<Value>) -> Result<Scenario>;
    async fn delete(&self, id: &str) -> Result<()>;

    /// Rejects malformed input before `insert`/`update` persist it.
    fn validate(&self, name: &str, config: &Value) -> Result<()> {
        if name.trim().is_empty() {
            return Err(crate::Error::InvalidParams("scenario name must not be empty".into()));
        }
        if !config.is_object() {
            return Err(crate::Error::InvalidParams("scenario config must be a JSON object".into()));
        }
        Ok(())
    }
}

/// `serde(with = ...)` helper so `Attachment` JSON responses carry base64
/// rather than a raw byte array.
mod serde_bytes_as_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> std::result::Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[derive(serde::Serialize, serde::Deserialize)]
        struct Wrapper(#[serde(with = "super")] Vec<u8>);

        #[test]
        fn roundtrips_arbitrary_bytes() {
            let data = b"hello, conversation orchestrator!".to_vec();
            let encoded = serde_json::to_string(&Wrapper(data.clone())).unwrap();
            let Wrapper(decoded) = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, data);
        }
    }
}
