//! Runtime core for an autonomous coding-agent harness.
//!
//! Three subsystems, layered bottom-up:
//!
//! - [`connection`] / [`manager`]: spawned tool-server processes speaking
//!   line-delimited JSON-RPC over stdio, with request correlation, capability
//!   pools, and fault isolation per server.
//! - [`execution`]: multi-runtime code execution with a synchronous capture
//!   window, background handover, and interception of tool calls issued by
//!   the running code.
//! - [`history`] / [`eager`]: a bounded self-compacting record of everything
//!   that happened, and the queue of asynchronous status prompts awaiting
//!   the planner's next turn.

pub mod config;
pub mod connection;
pub mod eager;
pub mod execution;
pub mod history;
pub mod manager;
pub mod protocol;

pub use config::AppConfig;
pub use connection::{Connection, ConnectionError, Timeouts};
pub use eager::{EagerPrompt, EagerPromptQueue};
pub use execution::{ExecOutcome, ExecRequest, ExecutionEngine};
pub use history::HistoryStore;
pub use manager::{ConnectionManager, ManagerError, ToolDispatcher};
