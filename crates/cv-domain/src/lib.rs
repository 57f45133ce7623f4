//! Shared types for the conversation orchestrator: the event log record,
//! conversation/roster metadata, ephemeral guidance, configuration, and
//! the unified error taxonomy. Every other `cv-*` crate depends on this
//! one and none of its types depend back on them.

pub mod collab;
pub mod config;
pub mod conversation;
pub mod error;
pub mod event;
pub mod guidance;

pub use collab::{
    Attachment, AttachmentMeta, AttachmentStore, Scenario, ScenarioStore,
};
pub use config::{Config, ConfigError, ConfigSeverity};
pub use conversation::{
    AgentKind, AgentSpec, Conversation, ConversationConfig, ConversationFilter,
    ConversationMeta, ConversationStatus, ConversationSummary, SchedulePolicy,
};
pub use error::{Error, Result};
pub use event::{Event, EventPayload, EventType, Finality, SystemKind};
pub use guidance::{Guidance, GuidanceKind};
