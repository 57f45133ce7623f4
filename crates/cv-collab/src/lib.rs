//! SQLite-backed implementations of the external collaborators the core
//! consults but does not own: attachments and scenarios. Also carries the
//! one collaborator with no natural SQL backing, the LLM provider.
//!
//! Both SQL-backed stores share the `cv-store::EventStore`'s open
//! connection via `with_connection` rather than opening a second handle to
//! the same file — `cv-store::migrations` already created their tables, so
//! there's nothing left for this crate to migrate.

mod attachments;
mod provider;
mod scenarios;

pub use attachments::SqliteAttachmentStore;
pub use provider::{
    CompletionMessage, CompletionRequest, CompletionResponse, EchoProvider, LlmProvider,
    ProviderError, ScriptedProvider,
};
pub use scenarios::SqliteScenarioStore;
