//! Voice bridge server.
//!
//! Exposes the single authenticated WebSocket endpoint the media gateway
//! connects to, and owns everything per-call that is not audio-path:
//! session registry, authorization, outbound call coordination, health
//! checking and best-effort session recording.

pub mod auth;
pub mod authorize;
pub mod bridge;
pub mod connection;
pub mod http;
pub mod outbound;
pub mod protocol;
pub mod rate_limit;
pub mod recorder;
pub mod session;
pub mod state;

pub use authorize::{authorize, AuthDecision};
pub use connection::{Connection, ConnectionSet};
pub use http::create_router;
pub use outbound::OutboundCoordinator;
pub use protocol::{CallTarget, ClientMessage, ServerMessage};
pub use rate_limit::SlidingWindowRateLimiter;
pub use recorder::SessionRecorder;
pub use session::{CallSession, SessionRegistry};
pub use state::{AppState, BridgeDeps};
