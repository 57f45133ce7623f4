//! HTTP/WebSocket server, CLI, and bootstrap wiring for the conversation
//! orchestrator. Everything that isn't transport lives in the `cv-*`
//! library crates this one assembles; this crate only turns `AppState`
//! into routes and a runnable binary.

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod llm_agent;
pub mod state;
