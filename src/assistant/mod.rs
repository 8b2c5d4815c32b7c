//! Assistant CLI session management.
//!
//! [`AssistantManager`] is the single authority for the mapping from
//! conversation id to a resumable assistant CLI interaction. Each
//! conversation owns at most one live PTY-backed CLI process at a time; the
//! session record outlives the process so a conversation can be resumed
//! after the CLI exits (or dies unexpectedly).
//!
//! The CLI is spawned attached to a PTY deliberately: off-terminal it
//! behaves differently and sometimes demands interactive confirmation it
//! can't receive. Output is routed through the
//! [`classifier::StreamClassifier`] before anything reaches the transport,
//! so the client only ever sees structured events, detected prompts, or
//! coalesced free text.
//!
//! ## Concurrency
//!
//! The session map is behind a `tokio::sync::Mutex`. The per-session resume
//! id lives in its own shared slot so the classifier driver task can adopt a
//! mid-stream session id without touching the map. A per-session generation
//! counter keeps a stale driver (for a killed-and-replaced process) from
//! clearing the replacement's process handle.

pub mod classifier;
pub mod prompt;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

use self::classifier::{Classified, StreamClassifier};
use crate::config::AssistantConfig;
use crate::shell::pty::{PtyCommand, PtyEvent, PtyFactory, PtySession};
use crate::util::truncate_str;

/// How long buffered free text may sit before it is flushed through the
/// prompt detector. A single logical message often arrives across several
/// terminal writes; flushing each fragment independently would misclassify
/// all of them.
const DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(300);

/// ETX — what the terminal line discipline turns into SIGINT.
const INTERRUPT_BYTE: &[u8] = b"\x03";

/// One conversation's assistant state. The record survives process exit;
/// only an explicit close removes it.
struct AssistantSession {
    /// Live CLI process, if any. Killed and replaced, never shared.
    process: Option<Box<dyn PtySession>>,
    /// Resumable session id assigned by the CLI on first response. Shared
    /// with the classifier driver task, which adopts ids mid-stream.
    resume_id: Arc<Mutex<Option<String>>>,
    /// Fixed at first spawn.
    working_dir: String,
    /// Incremented on every spawn; guards against stale exit cleanup.
    generation: u64,
}

/// Manages the pool of assistant CLI sessions.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone)]
pub struct AssistantManager {
    sessions: Arc<Mutex<HashMap<String, AssistantSession>>>,
    factory: Arc<dyn PtyFactory>,
    config: AssistantConfig,
}

impl AssistantManager {
    pub fn new(factory: Arc<dyn PtyFactory>, config: AssistantConfig) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            factory,
            config,
        }
    }

    /// Spawn (or respawn) the CLI for a conversation and start streaming its
    /// classified output to `events`.
    ///
    /// Returns whether the spawn succeeded. Spawn failure is reported as a
    /// synthetic `error` event followed by a `done` event with exit code 1 —
    /// callers must never see a silent failure.
    pub async fn send(
        &self,
        conversation_id: &str,
        prompt: &str,
        working_dir: &str,
        model: Option<&str>,
        resume_id: Option<&str>,
        events: mpsc::Sender<Value>,
    ) -> bool {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| AssistantSession {
                process: None,
                resume_id: Arc::new(Mutex::new(None)),
                working_dir: working_dir.to_string(),
                generation: 0,
            });

        // A caller-supplied resume id is only adopted when the session
        // doesn't know one yet — an id learned from the stream wins.
        if let Some(rid) = resume_id {
            let mut slot = session.resume_id.lock().await;
            if slot.is_none() {
                *slot = Some(rid.to_string());
            }
        }

        // At most one live process per conversation.
        if let Some(old) = session.process.take() {
            info!("Conversation {conversation_id}: killing previous CLI process before respawn");
            old.kill();
        }

        let resume = session.resume_id.lock().await.clone();

        // A prompt that starts with `-` would parse as a flag.
        let safe_prompt = if prompt.starts_with('-') {
            format!("\n{prompt}")
        } else {
            prompt.to_string()
        };

        let mut args = vec![
            "-p".to_string(),
            safe_prompt,
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(m) = model {
            args.push("--model".to_string());
            args.push(m.to_string());
        }
        if let Some(rid) = &resume {
            args.push("--resume".to_string());
            args.push(rid.clone());
            args.push("--continue".to_string());
        }

        let effective_dir = if Path::new(&session.working_dir).is_dir() {
            session.working_dir.clone()
        } else {
            dirs::home_dir()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "/".to_string())
        };

        let mut env = HashMap::new();
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        env.insert("COLORTERM".to_string(), "truecolor".to_string());
        env.insert(
            "LANG".to_string(),
            std::env::var("LANG").unwrap_or_else(|_| "en_US.UTF-8".to_string()),
        );

        info!(
            "Spawning assistant CLI for conversation {conversation_id}: {} -p \"{}\" (cwd: {effective_dir}, resume: {})",
            self.config.binary,
            truncate_str(prompt, 60),
            resume.as_deref().unwrap_or("none"),
        );

        let spec = PtyCommand {
            program: self.config.binary.clone(),
            args,
            working_dir: effective_dir,
            env,
            rows: self.config.terminal_rows,
            cols: self.config.terminal_cols,
        };

        let mut process = match self.factory.spawn(spec) {
            Ok(p) => p,
            Err(e) => {
                warn!("Assistant CLI spawn failed for {conversation_id}: {e}");
                let session_id = session.resume_id.lock().await.clone();
                drop(sessions);
                let _ = events
                    .send(json!({
                        "type": "assistant.event",
                        "conversation_id": conversation_id,
                        "event": { "type": "error", "text": e.to_string() },
                    }))
                    .await;
                let _ = events
                    .send(json!({
                        "type": "assistant.done",
                        "conversation_id": conversation_id,
                        "exit_code": 1,
                        "session_id": session_id,
                    }))
                    .await;
                return false;
            }
        };

        let Some(rx) = process.take_events() else {
            // Unreachable for a fresh session; treat like a spawn failure.
            warn!("Assistant PTY for {conversation_id} yielded no event stream");
            return false;
        };

        info!(
            "Assistant CLI for {conversation_id} running, pid {}",
            process.pid()
        );

        session.generation += 1;
        session.process = Some(process);

        tokio::spawn(run_classifier(
            conversation_id.to_string(),
            session.generation,
            rx,
            Arc::clone(&session.resume_id),
            Arc::clone(&self.sessions),
            events,
        ));

        true
    }

    /// Write a response line to the live CLI process.
    ///
    /// When no process is live but a resume id and working directory are
    /// known, transparently respawns with the resume id — PTY death is
    /// masked from the user. Returns false only when neither a live process
    /// nor resume context exists.
    pub async fn respond(
        &self,
        conversation_id: &str,
        text: &str,
        events: mpsc::Sender<Value>,
    ) -> bool {
        let resume_context = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(conversation_id) else {
                warn!("respond: no session for {conversation_id}");
                return false;
            };
            if let Some(process) = &session.process {
                if process.write(format!("{text}\n").as_bytes()).is_ok() {
                    info!(
                        "Responding to assistant [{conversation_id}]: \"{}\"",
                        truncate_str(text, 60)
                    );
                    return true;
                }
                warn!("respond: write to assistant PTY failed for {conversation_id}");
            }
            let resume = session.resume_id.lock().await.clone();
            resume.map(|rid| (rid, session.working_dir.clone()))
        };

        match resume_context {
            Some((rid, cwd)) => {
                info!("Assistant PTY unavailable for [{conversation_id}], re-spawning with resume");
                self.send(conversation_id, text, &cwd, None, Some(&rid), events)
                    .await
            }
            None => {
                warn!("respond: no live process or resume context for {conversation_id}");
                false
            }
        }
    }

    /// Send the interrupt byte to the live CLI process. Reported no-op
    /// (false) when nothing is live — termination is only authoritative via
    /// the process's own exit.
    pub async fn abort(&self, conversation_id: &str) -> bool {
        let sessions = self.sessions.lock().await;
        match sessions.get(conversation_id).and_then(|s| s.process.as_ref()) {
            Some(process) => process.write(INTERRUPT_BYTE).is_ok(),
            None => false,
        }
    }

    /// Kill any live process (best-effort) and delete the session record.
    /// No resume is possible afterwards.
    pub async fn close(&self, conversation_id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.remove(conversation_id) {
            if let Some(process) = session.process {
                process.kill();
            }
            info!("Conversation {conversation_id} closed");
        }
        true
    }

    /// Best-effort kill of every live process and removal of all records.
    /// Used on transport disconnect and process shutdown.
    pub async fn kill_all(&self) {
        let mut sessions = self.sessions.lock().await;
        let count = sessions.len();
        for (id, session) in sessions.drain() {
            if let Some(process) = session.process {
                process.kill();
                info!("Conversation {id}: CLI process killed (teardown)");
            }
        }
        if count > 0 {
            info!("Cleared {count} assistant session(s)");
        }
    }

    /// Number of known conversations (live or resumable).
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Number of conversations with a live CLI process.
    pub async fn live_count(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.process.is_some())
            .count()
    }
}

/// Per-process driver: pulls PTY events, runs them through the classifier,
/// owns the single-slot debounce deadline, and emits wire events.
async fn run_classifier(
    conversation_id: String,
    generation: u64,
    mut rx: mpsc::Receiver<PtyEvent>,
    resume_slot: Arc<Mutex<Option<String>>>,
    sessions: Arc<Mutex<HashMap<String, AssistantSession>>>,
    events: mpsc::Sender<Value>,
) {
    let initial = resume_slot.lock().await.clone();
    let mut classifier = StreamClassifier::new(initial);
    let mut deadline: Option<Instant> = None;

    let exit_code = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(PtyEvent::Data(chunk)) => {
                    let outcome = classifier.feed(&chunk);
                    for classified in outcome.events {
                        emit_classified(&events, &conversation_id, classified).await;
                    }
                    sync_session_id(&classifier, &resume_slot).await;
                    if outcome.rearm_debounce {
                        deadline = Some(Instant::now() + DEBOUNCE);
                    } else if !classifier.has_pending() {
                        deadline = None;
                    }
                }
                Some(PtyEvent::Exit(code)) => break code,
                // Channel closed without an exit event: the process was
                // killed and its I/O tasks aborted.
                None => break -1,
            },
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                if deadline.is_some() =>
            {
                if let Some(classified) = classifier.flush_pending() {
                    emit_classified(&events, &conversation_id, classified).await;
                }
                deadline = None;
            }
        }
    };

    // Exit-time flush: a trailing partial line may still carry the session
    // id, so finish() runs before the done event is built.
    for classified in classifier.finish() {
        emit_classified(&events, &conversation_id, classified).await;
    }
    sync_session_id(&classifier, &resume_slot).await;

    let session_id = resume_slot.lock().await.clone();

    {
        let mut sessions = sessions.lock().await;
        if let Some(session) = sessions.get_mut(&conversation_id) {
            // Only the current generation may clear the slot — a respawn may
            // already have replaced the process this driver belonged to.
            if session.generation == generation {
                session.process = None;
            }
        }
    }

    info!("Assistant CLI for {conversation_id} finished, exit={exit_code}");
    let _ = events
        .send(json!({
            "type": "assistant.done",
            "conversation_id": conversation_id,
            "exit_code": exit_code,
            "session_id": session_id,
        }))
        .await;
}

async fn sync_session_id(classifier: &StreamClassifier, slot: &Arc<Mutex<Option<String>>>) {
    if let Some(id) = classifier.session_id() {
        let mut slot = slot.lock().await;
        if slot.as_deref() != Some(id) {
            *slot = Some(id.to_string());
        }
    }
}

async fn emit_classified(events: &mpsc::Sender<Value>, conversation_id: &str, c: Classified) {
    let event = match c {
        Classified::Structured(v) => v,
        Classified::Prompt { prompt, raw_text } => {
            info!(
                "Assistant prompt detected for {conversation_id}: type={:?}, {} option(s)",
                prompt.prompt_type,
                prompt.options.len()
            );
            let mut v = serde_json::to_value(&prompt).unwrap_or_else(|_| json!({}));
            v["type"] = json!("prompt");
            v["rawText"] = json!(raw_text);
            v
        }
        Classified::Stderr(text) => json!({ "type": "stderr", "text": text }),
    };
    let _ = events
        .send(json!({
            "type": "assistant.event",
            "conversation_id": conversation_id,
            "event": event,
        }))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Records spawn/kill ordering and captures the commands it was given.
    struct FakeFactory {
        log: Arc<StdMutex<Vec<String>>>,
        specs: Arc<StdMutex<Vec<PtyCommand>>>,
        /// Event senders for each spawned session, so tests can drive output.
        taps: Arc<StdMutex<Vec<mpsc::Sender<PtyEvent>>>>,
        fail: bool,
    }

    impl FakeFactory {
        fn new() -> Self {
            Self {
                log: Arc::new(StdMutex::new(Vec::new())),
                specs: Arc::new(StdMutex::new(Vec::new())),
                taps: Arc::new(StdMutex::new(Vec::new())),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn spawn_count(&self) -> usize {
            self.specs.lock().unwrap().len()
        }

        fn spec(&self, n: usize) -> PtyCommand {
            self.specs.lock().unwrap()[n].clone()
        }

        fn tap(&self, n: usize) -> mpsc::Sender<PtyEvent> {
            self.taps.lock().unwrap()[n].clone()
        }
    }

    struct FakeSession {
        index: usize,
        log: Arc<StdMutex<Vec<String>>>,
        writes: Arc<StdMutex<Vec<Vec<u8>>>>,
        events: Option<mpsc::Receiver<PtyEvent>>,
    }

    impl PtySession for FakeSession {
        fn pid(&self) -> u32 {
            1000 + u32::try_from(self.index).unwrap()
        }
        fn write(&self, data: &[u8]) -> Result<(), String> {
            self.writes.lock().unwrap().push(data.to_vec());
            Ok(())
        }
        fn resize(&self, _rows: u16, _cols: u16) -> Result<(), String> {
            Ok(())
        }
        fn kill(&self) {
            self.log.lock().unwrap().push(format!("kill:{}", self.index));
        }
        fn take_events(&mut self) -> Option<mpsc::Receiver<PtyEvent>> {
            self.events.take()
        }
    }

    impl PtyFactory for FakeFactory {
        fn spawn(&self, cmd: PtyCommand) -> std::io::Result<Box<dyn PtySession>> {
            if self.fail {
                return Err(std::io::Error::other("no such binary"));
            }
            let index = self.spawn_count();
            self.log.lock().unwrap().push(format!("spawn:{index}"));
            self.specs.lock().unwrap().push(cmd);
            let (tx, rx) = mpsc::channel(64);
            self.taps.lock().unwrap().push(tx);
            Ok(Box::new(FakeSession {
                index,
                log: Arc::clone(&self.log),
                writes: Arc::new(StdMutex::new(Vec::new())),
                events: Some(rx),
            }))
        }
    }

    fn manager_with(factory: FakeFactory) -> (AssistantManager, Arc<FakeFactory>) {
        let factory = Arc::new(factory);
        let manager = AssistantManager::new(
            Arc::clone(&factory) as Arc<dyn PtyFactory>,
            AssistantConfig::default(),
        );
        (manager, factory)
    }

    async fn recv_event(rx: &mut mpsc::Receiver<Value>) -> Value {
        tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_second_send_kills_first_process_before_spawning() {
        let (manager, factory) = manager_with(FakeFactory::new());
        let (tx, _rx) = mpsc::channel(64);

        assert!(manager.send("conv", "first", "/tmp", None, None, tx.clone()).await);
        assert!(manager.send("conv", "second", "/tmp", None, None, tx).await);

        assert_eq!(factory.log(), vec!["spawn:0", "kill:0", "spawn:1"]);
        assert_eq!(manager.live_count().await, 1);
    }

    #[tokio::test]
    async fn test_send_builds_resume_invocation() {
        let (manager, factory) = manager_with(FakeFactory::new());
        let (tx, _rx) = mpsc::channel(64);

        manager
            .send("conv", "hello", "/tmp", Some("opus"), Some("sess-9"), tx)
            .await;

        let spec = factory.spec(0);
        let args = spec.args;
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], "hello");
        assert!(args.contains(&"--output-format".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&"--verbose".to_string()));
        let model_at = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[model_at + 1], "opus");
        let resume_at = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume_at + 1], "sess-9");
        assert_eq!(args[resume_at + 2], "--continue");
    }

    #[tokio::test]
    async fn test_leading_dash_prompt_is_escaped() {
        let (manager, factory) = manager_with(FakeFactory::new());
        let (tx, _rx) = mpsc::channel(64);

        manager.send("conv", "-rf /", "/tmp", None, None, tx).await;
        assert_eq!(factory.spec(0).args[1], "\n-rf /");
    }

    #[tokio::test]
    async fn test_missing_working_dir_falls_back_to_home() {
        let (manager, factory) = manager_with(FakeFactory::new());
        let (tx, _rx) = mpsc::channel(64);

        manager
            .send("conv", "hi", "/definitely/not/a/real/dir", None, None, tx)
            .await;
        let home = dirs::home_dir().unwrap();
        assert_eq!(factory.spec(0).working_dir, home.to_string_lossy());
    }

    #[tokio::test]
    async fn test_spawn_failure_emits_error_then_done() {
        let (manager, _factory) = manager_with(FakeFactory::failing());
        let (tx, mut rx) = mpsc::channel(64);

        let ok = manager.send("conv", "hello", "/tmp", None, None, tx).await;
        assert!(!ok);

        let error = recv_event(&mut rx).await;
        assert_eq!(error["type"], "assistant.event");
        assert_eq!(error["event"]["type"], "error");

        let done = recv_event(&mut rx).await;
        assert_eq!(done["type"], "assistant.done");
        assert_eq!(done["exit_code"], 1);
    }

    #[tokio::test]
    async fn test_respond_writes_to_live_process() {
        let (manager, factory) = manager_with(FakeFactory::new());
        let (tx, _rx) = mpsc::channel(64);

        manager.send("conv", "hello", "/tmp", None, None, tx.clone()).await;
        assert!(manager.respond("conv", "y", tx).await);
        // No second spawn happened.
        assert_eq!(factory.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_respond_respawns_with_resume_after_exit() {
        let (manager, factory) = manager_with(FakeFactory::new());
        let (tx, mut rx) = mpsc::channel(64);

        manager
            .send("conv", "hello", "/tmp", None, Some("sess-1"), tx.clone())
            .await;

        // Let the CLI die and wait for its done event.
        factory.tap(0).send(PtyEvent::Exit(0)).await.unwrap();
        loop {
            let event = recv_event(&mut rx).await;
            if event["type"] == "assistant.done" {
                assert_eq!(event["session_id"], "sess-1");
                break;
            }
        }
        assert_eq!(manager.live_count().await, 0);

        // Respond now has no live process: exactly one respawn, with resume.
        assert!(manager.respond("conv", "continue please", tx).await);
        assert_eq!(factory.spawn_count(), 2);
        let args = factory.spec(1).args;
        let resume_at = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume_at + 1], "sess-1");
        assert_eq!(args[1], "continue please");
    }

    #[tokio::test]
    async fn test_respond_without_context_is_false() {
        let (manager, _factory) = manager_with(FakeFactory::new());
        let (tx, _rx) = mpsc::channel(64);
        assert!(!manager.respond("ghost", "hello", tx).await);
    }

    #[tokio::test]
    async fn test_abort_writes_interrupt_byte_only_when_live() {
        let (manager, _factory) = manager_with(FakeFactory::new());
        let (tx, _rx) = mpsc::channel(64);

        assert!(!manager.abort("conv").await);
        manager.send("conv", "hello", "/tmp", None, None, tx).await;
        assert!(manager.abort("conv").await);
    }

    #[tokio::test]
    async fn test_close_deletes_record() {
        let (manager, factory) = manager_with(FakeFactory::new());
        let (tx, _rx) = mpsc::channel(64);

        manager.send("conv", "hello", "/tmp", None, Some("sess-1"), tx.clone()).await;
        assert!(manager.close("conv").await);
        assert!(factory.log().contains(&"kill:0".to_string()));
        assert_eq!(manager.session_count().await, 0);
        // Resume context is gone with the record.
        assert!(!manager.respond("conv", "more", tx).await);
    }

    #[tokio::test]
    async fn test_kill_all_clears_everything() {
        let (manager, factory) = manager_with(FakeFactory::new());
        let (tx, _rx) = mpsc::channel(64);

        manager.send("a", "one", "/tmp", None, None, tx.clone()).await;
        manager.send("b", "two", "/tmp", None, None, tx).await;
        manager.kill_all().await;

        assert_eq!(manager.session_count().await, 0);
        let log = factory.log();
        assert!(log.contains(&"kill:0".to_string()));
        assert!(log.contains(&"kill:1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_structured_lines_stream_through() {
        let (manager, factory) = manager_with(FakeFactory::new());
        let (tx, mut rx) = mpsc::channel(64);

        manager.send("conv", "hello", "/tmp", None, None, tx).await;
        let tap = factory.tap(0);
        tap.send(PtyEvent::Data(
            "{\"type\":\"system\",\"sessionId\":\"s-77\"}\n".into(),
        ))
        .await
        .unwrap();

        let event = recv_event(&mut rx).await;
        assert_eq!(event["type"], "assistant.event");
        assert_eq!(event["conversation_id"], "conv");
        assert_eq!(event["event"]["type"], "system");

        tap.send(PtyEvent::Exit(0)).await.unwrap();
        let done = recv_event(&mut rx).await;
        assert_eq!(done["type"], "assistant.done");
        assert_eq!(done["exit_code"], 0);
        // The id adopted mid-stream rides the done event.
        assert_eq!(done["session_id"], "s-77");
    }

    #[tokio::test(start_paused = true)]
    async fn test_free_text_flushes_after_debounce() {
        let (manager, factory) = manager_with(FakeFactory::new());
        let (tx, mut rx) = mpsc::channel(64);

        manager.send("conv", "hello", "/tmp", None, None, tx).await;
        factory
            .tap(0)
            .send(PtyEvent::Data("Installing dependencies...\n".into()))
            .await
            .unwrap();

        // Nothing yet; the debounce window (auto-advanced under paused time)
        // must elapse first.
        let event = recv_event(&mut rx).await;
        assert_eq!(event["event"]["type"], "stderr");
        assert_eq!(event["event"]["text"], "Installing dependencies...\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_time_session_id_adoption() {
        let (manager, factory) = manager_with(FakeFactory::new());
        let (tx, mut rx) = mpsc::channel(64);

        manager.send("conv", "hello", "/tmp", None, None, tx).await;
        let tap = factory.tap(0);
        // Final chunk has no trailing newline; the id only exists in the
        // exit-time flush path.
        tap.send(PtyEvent::Data(
            "{\"type\":\"result\",\"session_id\":\"late-1\"}".into(),
        ))
        .await
        .unwrap();
        tap.send(PtyEvent::Exit(0)).await.unwrap();

        let event = recv_event(&mut rx).await;
        assert_eq!(event["event"]["type"], "result");
        let done = recv_event(&mut rx).await;
        assert_eq!(done["type"], "assistant.done");
        assert_eq!(done["session_id"], "late-1");
    }
}
