//! Projects orchestrator conversations onto the A2A (JSON-RPC over
//! HTTP+SSE) and MCP surfaces a room/pair is addressed by, including epoch
//! advancement and the single-responder backend lease. Every epoch is
//! backed by its own two-agent orchestrator conversation, so turn ownership
//! and finality are inherited from [`cv_orchestrator`] rather than
//! reimplemented here.

pub mod a2a;
pub mod agent_card;
pub mod finality;
pub mod lease;
pub mod mcp;
pub mod pair;
pub mod rpc;

pub use a2a::{Bridge, DispatchOutcome, EXT_NAMESPACE};
pub use finality::NextState;
pub use lease::{LeaseSignal, LeaseStatus, LeaseTable};
pub use pair::{parse_task_id, task_id, Author, EpochInfo, PairStore};
pub use rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
