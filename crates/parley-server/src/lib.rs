pub mod error;
pub mod handlers;
pub mod orchestrator;
pub mod relay;
pub mod server;
pub mod wire;

pub use error::{ApiError, ChatError};
pub use orchestrator::{ChatOrchestrator, ChatReply, TurnRequest};
pub use relay::{RelayOutcome, RelayState, StreamRelay};
pub use server::{start, AppState, ServerConfig, ServerHandle};
