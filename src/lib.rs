//! restexec — sandboxed TypeScript execution service and MCP gateway.
//! Stores, lints and runs user-supplied code in strictly permissioned
//! interpreter subprocesses, and multiplexes JSON-RPC tool calls across a
//! fleet of managed child processes.

pub mod auth;
pub mod config;
pub mod counter;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod linter;
pub mod server;
pub mod supervisor;
pub mod validate;
pub mod workspace;

pub use auth::rate_limit::{RateLimitSettings, RateLimiter};
pub use auth::{AuthSettings, Authenticator};
pub use config::{LogFormat, ServiceConfig};
pub use counter::ActiveProcessCounter;
pub use error::{RestexecError, Result};
pub use executor::Executor;
pub use gateway::config::{GatewaySettings, RestartPolicy};
pub use gateway::registry::ToolRegistry;
pub use gateway::session::{SessionManager, SessionStatus};
pub use linter::{LintReport, Linter};
pub use supervisor::{RunOutput, RunSpec};
pub use workspace::WorkspaceStore;
