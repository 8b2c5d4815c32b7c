//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::assistant::AssistantManager;
use crate::config::Config;
use crate::shell::pty::PtyFactory;
use crate::subagent::SubagentWatcher;

/// Shared application state for the studiod server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Spawns PTY sessions for terminals and assistant CLI processes.
    pub pty_factory: Arc<dyn PtyFactory>,
    /// Global registry of assistant CLI conversations.
    pub assistant: AssistantManager,
    /// Single-slot subagent transcript watcher.
    pub subagents: SubagentWatcher,
}
