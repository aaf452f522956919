//! Trait seams between the bridge and its embedding host.
//!
//! The bridge never imports its host. Anything the host provides — the
//! agent engine, the tool registry, the session store — is handed in at
//! construction behind one of these traits.

pub mod agent;
pub mod store;
pub mod tool;

pub use agent::{AgentDelta, AgentEngine, AgentRequest, Turn, TurnRole};
pub use store::{MsgContext, NullSessionStore, SessionRecord, SessionStore};
pub use tool::{NullToolExecutor, ToolCallContext, ToolExecutor, ToolSpec};
