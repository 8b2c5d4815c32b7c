#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! studiod library — the core of the web IDE shell backend.
//!
//! - `config` — TOML + env-var configuration
//! - `shell` — PTY allocation and process spawning
//! - `terminal` — connection-scoped terminal sessions
//! - `assistant` — assistant CLI session manager, stream classifier, prompt detector
//! - `subagent` — subagent transcript watcher
//! - `ws` — WebSocket protocol handling
//! - `routes` — plain HTTP endpoints (health)

pub mod assistant;
pub mod config;
pub mod routes;
pub mod shell;
pub mod state;
pub mod subagent;
pub mod terminal;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use assistant::AssistantManager;
pub use config::Config;
pub use state::AppState;
pub use subagent::SubagentWatcher;
pub use terminal::TerminalRegistry;
