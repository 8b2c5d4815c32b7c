//! Subagent transcript watcher.
//!
//! When the assistant CLI dispatches background subagents, each child writes
//! its own JSONL transcript next to the parent's in a per-workspace log
//! directory. The children give no direct signal of their activity, so
//! [`SubagentWatcher`] polls the directory, tails files that have grown, and
//! attributes them to named logical tasks by fuzzy-matching their first
//! prompt against the targets' descriptions.
//!
//! Polling (not filesystem notification) is deliberate: transcript files are
//! written rapidly and change-event delivery for them is unreliable on some
//! filesystems. The cost is bounded by two rules — files whose mtime is
//! older than ten minutes are permanently stale, and only files that have
//! grown past their recorded offset are read (tail only, fixed window).
//!
//! There is at most one watch per process; starting a new one tears down the
//! previous one first. Poll-cycle errors are logged and skipped — the
//! watcher degrades rather than dies, since transcripts may be mid-write.

pub mod transcript;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use self::transcript::{
    extract_first_prompt, extract_latest_activity, match_target, read_head, read_tail, WatchTarget,
};
use crate::config::WatcherConfig;

/// Fixed poll cadence.
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// Delay before the first poll — early enough to feel immediate, late enough
/// not to race the interval's first tick.
const FIRST_POLL_DELAY: std::time::Duration = std::time::Duration::from_millis(500);

/// Files untouched for this long are permanently excluded from polling.
const STALE_AFTER: std::time::Duration = std::time::Duration::from_secs(10 * 60);

/// Tail window read from grown files.
const TAIL_BYTES: u64 = 8192;

/// Head window read for first-prompt extraction.
const HEAD_BYTES: usize = 8192;

/// A memoized file→target association.
#[derive(Debug, Clone)]
struct Association {
    name: String,
    task_id: Option<String>,
}

/// State of the single active watch.
struct WatchState {
    conversation_id: String,
    parent_session_id: String,
    project_dir: PathBuf,
    targets: Vec<WatchTarget>,
    /// Last recorded size per file — only strictly-grown files are read.
    file_positions: HashMap<String, u64>,
    /// Memoized name correlation per file.
    associations: HashMap<String, Association>,
    /// Files permanently excluded for this watch.
    stale_files: HashSet<String>,
    events: mpsc::Sender<Value>,
    poll_task: Option<tokio::task::JoinHandle<()>>,
    polls: u64,
}

/// Single-slot, globally-scoped subagent watcher.
///
/// Cloneable — all clones share the same slot.
#[derive(Clone)]
pub struct SubagentWatcher {
    state: Arc<Mutex<Option<WatchState>>>,
    log_root: PathBuf,
}

impl SubagentWatcher {
    pub fn new(log_root: PathBuf) -> Self {
        Self {
            state: Arc::new(Mutex::new(None)),
            log_root,
        }
    }

    /// Build from config, defaulting the log root to `~/.claude/projects`.
    pub fn from_config(config: &WatcherConfig) -> Self {
        let root = config.log_root.as_ref().map_or_else(
            || {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("~"))
                    .join(".claude")
                    .join("projects")
            },
            PathBuf::from,
        );
        Self::new(root)
    }

    /// Start watching for subagents of `parent_session_id`. Any active watch
    /// is stopped first. Returns false when no log directory for the parent
    /// session can be resolved — the feature is simply unavailable then.
    pub async fn start_watch(
        &self,
        conversation_id: &str,
        parent_session_id: &str,
        workspace_path: &str,
        targets: Vec<WatchTarget>,
        events: mpsc::Sender<Value>,
    ) -> bool {
        self.stop_watch().await;

        let Some(project_dir) =
            find_project_dir(&self.log_root, parent_session_id, workspace_path).await
        else {
            warn!("Subagent watcher: no log directory found for {workspace_path}");
            return false;
        };

        info!(
            "Subagent watcher started — dir: {}, targets: {}",
            project_dir.display(),
            targets
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        );

        {
            let mut slot = self.state.lock().await;
            *slot = Some(WatchState {
                conversation_id: conversation_id.to_string(),
                parent_session_id: parent_session_id.to_string(),
                project_dir,
                targets,
                file_positions: HashMap::new(),
                associations: HashMap::new(),
                stale_files: HashSet::new(),
                events,
                poll_task: None,
                polls: 0,
            });
        }

        let slot = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            // One early poll, then the fixed interval phased so its first
            // tick lands a full period after the early poll.
            tokio::time::sleep(FIRST_POLL_DELAY).await;
            if !poll_once(&slot).await {
                return;
            }
            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + (POLL_INTERVAL - FIRST_POLL_DELAY),
                POLL_INTERVAL,
            );
            loop {
                interval.tick().await;
                if !poll_once(&slot).await {
                    break;
                }
            }
        });

        if let Some(state) = self.state.lock().await.as_mut() {
            state.poll_task = Some(task);
        } else {
            // A concurrent stop_watch won the race; don't leave the task running.
            task.abort();
        }
        true
    }

    /// Replace the target list of the active watch. No-op when stopped.
    pub async fn update_targets(&self, targets: Vec<WatchTarget>) {
        if let Some(state) = self.state.lock().await.as_mut() {
            state.targets = targets;
        }
    }

    /// Stop the active watch and clear all state. Idempotent.
    pub async fn stop_watch(&self) {
        let mut slot = self.state.lock().await;
        if let Some(state) = slot.take() {
            if let Some(task) = state.poll_task {
                task.abort();
            }
            info!(
                "Subagent watcher stopped for {}",
                state.conversation_id
            );
        }
    }

    /// Whether a watch is currently active.
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }
}

/// Run one poll cycle against the slot. Returns false when the watch is
/// gone and the poll task should end.
async fn poll_once(slot: &Arc<Mutex<Option<WatchState>>>) -> bool {
    let mut guard = slot.lock().await;
    let Some(state) = guard.as_mut() else {
        return false;
    };
    state.polls += 1;
    if let Err(e) = poll_cycle(state).await {
        error!("Subagent watcher poll error: {e}");
    }
    true
}

/// One pass over the log directory: stat candidates, tail grown files,
/// correlate names, emit a batched activity event.
async fn poll_cycle(state: &mut WatchState) -> Result<(), String> {
    let parent_file = format!("{}.jsonl", state.parent_session_id);

    let mut dir = tokio::fs::read_dir(&state.project_dir)
        .await
        .map_err(|e| format!("read_dir {}: {e}", state.project_dir.display()))?;
    let mut candidates: Vec<String> = Vec::new();
    while let Ok(Some(entry)) = dir.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".jsonl") && name != parent_file && !state.stale_files.contains(&name) {
            candidates.push(name);
        }
    }

    if state.polls % 10 == 1 {
        info!(
            "Subagent watcher poll #{}: {} candidate file(s), {} target(s)",
            state.polls,
            candidates.len(),
            state.targets.len(),
        );
    }

    let mut activities: Vec<Value> = Vec::new();

    for name in candidates {
        let path = state.project_dir.join(&name);

        // Transiently unreadable files are skipped, not fatal.
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            continue;
        };

        if let Ok(modified) = meta.modified() {
            if is_stale(modified, SystemTime::now()) {
                info!("Subagent watcher: {name} stale, excluding");
                state.stale_files.insert(name);
                continue;
            }
        }

        let size = meta.len();
        let prev = state.file_positions.get(&name).copied().unwrap_or(0);
        if size <= prev {
            continue;
        }
        state.file_positions.insert(name.clone(), size);

        let Ok(tail) = read_tail(&path, TAIL_BYTES).await else {
            continue;
        };
        let Some(activity) = extract_latest_activity(&tail) else {
            continue;
        };

        let matched = match state.associations.get(&name) {
            Some(assoc) => Some(assoc.clone()),
            None => correlate(state, &name, &path).await,
        };

        let child_session_id = name.trim_end_matches(".jsonl").to_string();
        let mut entry = Map::new();
        if let Some(assoc) = &matched {
            entry.insert("matchedName".to_string(), json!(assoc.name));
            if let Some(task_id) = &assoc.task_id {
                entry.insert("matchedTaskId".to_string(), json!(task_id));
            }
        }
        entry.insert("childSessionId".to_string(), json!(child_session_id));
        if let Some(tool) = &activity.tool {
            entry.insert("latestTool".to_string(), json!(tool));
        }
        entry.insert("latestStatus".to_string(), json!(activity.status));
        activities.push(Value::Object(entry));
    }

    if !activities.is_empty() {
        let _ = state
            .events
            .send(json!({
                "type": "subagent.activity",
                "conversation_id": state.conversation_id,
                "activities": activities,
            }))
            .await;
    }

    Ok(())
}

/// Correlate a file to a target, memoizing the result. Fuzzy match on the
/// child's first prompt; when that fails and some target has no file yet,
/// loose-match the first such target — best-effort is the only option, as
/// nothing authoritative links transcripts to tasks.
async fn correlate(state: &mut WatchState, name: &str, path: &Path) -> Option<Association> {
    if let Ok(head) = read_head(path, HEAD_BYTES).await {
        if let Some(prompt) = extract_first_prompt(&head) {
            let matched = match_target(&prompt, &state.targets).map(|t| Association {
                name: t.name.clone(),
                task_id: t.task_id.clone(),
            });
            if let Some(assoc) = matched {
                info!("Subagent watcher: matched {name} → {}", assoc.name);
                state.associations.insert(name.to_string(), assoc.clone());
                return Some(assoc);
            }
        }
    }

    let taken: HashSet<&str> = state.associations.values().map(|a| a.name.as_str()).collect();
    let loose = state
        .targets
        .iter()
        .find(|t| !taken.contains(t.name.as_str()))
        .map(|t| Association {
            name: t.name.clone(),
            task_id: t.task_id.clone(),
        });
    if let Some(assoc) = loose {
        info!("Subagent watcher: loose-matched {name} → {}", assoc.name);
        state.associations.insert(name.to_string(), assoc.clone());
        return Some(assoc);
    }
    None
}

/// Resolve the log directory for a parent session: first the directory whose
/// encoded name matches the workspace path, then a scan of every directory
/// under the root for the parent's transcript.
async fn find_project_dir(
    root: &Path,
    parent_session_id: &str,
    workspace_path: &str,
) -> Option<PathBuf> {
    let parent_file = format!("{parent_session_id}.jsonl");

    let encoded = workspace_path.replace('/', "-");
    let direct = root.join(&encoded);
    if tokio::fs::try_exists(direct.join(&parent_file))
        .await
        .unwrap_or(false)
    {
        return Some(direct);
    }

    let mut dir = tokio::fs::read_dir(root).await.ok()?;
    while let Ok(Some(entry)) = dir.next_entry().await {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        if is_dir
            && tokio::fs::try_exists(entry.path().join(&parent_file))
                .await
                .unwrap_or(false)
        {
            return Some(entry.path());
        }
    }
    None
}

/// Whether a file's mtime puts it past the staleness cutoff.
fn is_stale(modified: SystemTime, now: SystemTime) -> bool {
    now.duration_since(modified)
        .map(|age| age > STALE_AFTER)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const ASSISTANT_LINE: &str = "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"tool_use\",\"name\":\"Read\",\"input\":{\"file_path\":\"/src/lib.rs\"}}]}}\n";

    fn child_transcript(first_prompt: &str) -> String {
        format!(
            "{{\"type\":\"user\",\"message\":{{\"role\":\"user\",\"content\":\"{first_prompt}\"}}}}\n{ASSISTANT_LINE}"
        )
    }

    fn test_state(dir: &Path, targets: Vec<WatchTarget>, events: mpsc::Sender<Value>) -> WatchState {
        WatchState {
            conversation_id: "conv-1".to_string(),
            parent_session_id: "parent".to_string(),
            project_dir: dir.to_path_buf(),
            targets,
            file_positions: HashMap::new(),
            associations: HashMap::new(),
            stale_files: HashSet::new(),
            events,
            poll_task: None,
            polls: 0,
        }
    }

    fn target(name: &str, description: &str) -> WatchTarget {
        WatchTarget {
            name: name.to_string(),
            task_id: Some(format!("task-{name}")),
            description: Some(description.to_string()),
        }
    }

    #[test]
    fn test_is_stale_cutoff() {
        let now = SystemTime::now();
        assert!(is_stale(now - Duration::from_secs(11 * 60), now));
        assert!(!is_stale(now - Duration::from_secs(9 * 60), now));
        // A file modified "in the future" (clock skew) is not stale.
        assert!(!is_stale(now + Duration::from_secs(60), now));
    }

    #[tokio::test]
    async fn test_find_project_dir_direct_and_scan() {
        let root = tempfile::tempdir().unwrap();
        let encoded = root.path().join("-work-proj");
        tokio::fs::create_dir(&encoded).await.unwrap();
        tokio::fs::write(encoded.join("parent.jsonl"), "{}").await.unwrap();

        // Direct hit via encoded workspace path.
        let found = find_project_dir(root.path(), "parent", "/work/proj").await;
        assert_eq!(found.unwrap(), encoded);

        // Fallback scan when the encoded name doesn't match.
        let found = find_project_dir(root.path(), "parent", "/elsewhere").await;
        assert_eq!(found.unwrap(), encoded);

        // Unknown session id resolves nothing.
        assert!(find_project_dir(root.path(), "ghost", "/work/proj").await.is_none());
    }

    #[tokio::test]
    async fn test_start_watch_false_without_log_dir() {
        let root = tempfile::tempdir().unwrap();
        let watcher = SubagentWatcher::new(root.path().to_path_buf());
        let (tx, _rx) = mpsc::channel(16);
        let ok = watcher
            .start_watch("conv", "parent", "/nope", Vec::new(), tx)
            .await;
        assert!(!ok);
        assert!(!watcher.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_watch_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let watcher = SubagentWatcher::new(root.path().to_path_buf());
        watcher.stop_watch().await;
        watcher.stop_watch().await;
        assert!(!watcher.is_running().await);
        // update_targets on a stopped watcher is a no-op, not a panic.
        watcher.update_targets(Vec::new()).await;
    }

    #[tokio::test]
    async fn test_poll_cycle_emits_matched_activity() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("parent.jsonl"), "{}").await.unwrap();
        tokio::fs::write(
            dir.path().join("child-a.jsonl"),
            child_transcript("Refactor the parser module for clarity"),
        )
        .await
        .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let targets = vec![
            target("refactorer", "Refactor the parser module"),
            target("tester", "Run the integration tests"),
        ];
        let mut state = test_state(dir.path(), targets, tx);

        poll_cycle(&mut state).await.unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event["type"], "subagent.activity");
        assert_eq!(event["conversation_id"], "conv-1");
        let activities = event["activities"].as_array().unwrap();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0]["matchedName"], "refactorer");
        assert_eq!(activities[0]["matchedTaskId"], "task-refactorer");
        assert_eq!(activities[0]["childSessionId"], "child-a");
        assert_eq!(activities[0]["latestTool"], "Read");
        assert_eq!(activities[0]["latestStatus"], "Reading: /src/lib.rs");
    }

    #[tokio::test]
    async fn test_poll_cycle_skips_unchanged_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("parent.jsonl"), "{}").await.unwrap();
        tokio::fs::write(dir.path().join("child.jsonl"), child_transcript("do work"))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let mut state = test_state(dir.path(), vec![target("worker", "do work")], tx);

        poll_cycle(&mut state).await.unwrap();
        assert!(rx.try_recv().is_ok());

        // Same size — no activity on the second cycle.
        poll_cycle(&mut state).await.unwrap();
        assert!(rx.try_recv().is_err());

        // Grown file is picked up again.
        let path = dir.path().join("child.jsonl");
        let mut content = tokio::fs::read_to_string(&path).await.unwrap();
        content.push_str(ASSISTANT_LINE);
        tokio::fs::write(&path, content).await.unwrap();

        poll_cycle(&mut state).await.unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_poll_cycle_excludes_stale_marked_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("parent.jsonl"), "{}").await.unwrap();
        tokio::fs::write(dir.path().join("child.jsonl"), child_transcript("do work"))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let mut state = test_state(dir.path(), vec![target("worker", "do work")], tx);
        // Stale status is never revoked within a watch, even for a file that
        // keeps growing.
        state.stale_files.insert("child.jsonl".to_string());

        poll_cycle(&mut state).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(state.file_positions.is_empty());
    }

    #[tokio::test]
    async fn test_poll_cycle_ignores_parent_and_non_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("parent.jsonl"), ASSISTANT_LINE)
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), ASSISTANT_LINE)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let mut state = test_state(dir.path(), Vec::new(), tx);

        poll_cycle(&mut state).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_loose_match_assigns_first_unmatched_target() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("parent.jsonl"), "{}").await.unwrap();
        tokio::fs::write(
            dir.path().join("child.jsonl"),
            child_transcript("totally unrelated to any description"),
        )
        .await
        .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let targets = vec![target("alpha", "build the compiler frontend")];
        let mut state = test_state(dir.path(), targets, tx);

        poll_cycle(&mut state).await.unwrap();

        let event = rx.try_recv().unwrap();
        let activities = event["activities"].as_array().unwrap();
        assert_eq!(activities[0]["matchedName"], "alpha");

        // The association is memoized for later cycles.
        assert_eq!(state.associations["child.jsonl"].name, "alpha");
    }

    #[tokio::test]
    async fn test_watch_lifecycle_end_to_end() {
        let root = tempfile::tempdir().unwrap();
        let project = root.path().join("-ws-app");
        tokio::fs::create_dir(&project).await.unwrap();
        tokio::fs::write(project.join("parent.jsonl"), "{}").await.unwrap();
        tokio::fs::write(
            project.join("child.jsonl"),
            child_transcript("investigate the flaky test"),
        )
        .await
        .unwrap();

        let watcher = SubagentWatcher::new(root.path().to_path_buf());
        let (tx, mut rx) = mpsc::channel(16);
        let ok = watcher
            .start_watch(
                "conv-9",
                "parent",
                "/ws/app",
                vec![target("sleuth", "investigate the flaky test")],
                tx,
            )
            .await;
        assert!(ok);
        assert!(watcher.is_running().await);

        // First poll fires after FIRST_POLL_DELAY.
        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("no activity before timeout")
            .unwrap();
        assert_eq!(event["type"], "subagent.activity");
        assert_eq!(event["conversation_id"], "conv-9");

        watcher.stop_watch().await;
        assert!(!watcher.is_running().await);
    }
}
