//! Connection-scoped terminal sessions.
//!
//! Each WebSocket connection owns a [`TerminalRegistry`]: a map of small
//! integer ids (counting from 1) to live PTY shells. Terminal output is
//! forwarded to the client verbatim — no classification, no buffering, no
//! replay — and every terminal dies with its connection. Ids are unique only
//! within the owning connection.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::config::Config;
use crate::shell::pty::{PtyCommand, PtyEvent, PtyFactory, PtySession};
use crate::util::expand_tilde;

/// Terminal sessions owned by one client connection.
pub struct TerminalRegistry {
    terminals: Arc<Mutex<HashMap<u32, Box<dyn PtySession>>>>,
    next_id: u32,
    factory: Arc<dyn PtyFactory>,
    config: Arc<Config>,
}

impl TerminalRegistry {
    pub fn new(factory: Arc<dyn PtyFactory>, config: Arc<Config>) -> Self {
        Self {
            terminals: Arc::new(Mutex::new(HashMap::new())),
            next_id: 1,
            factory,
            config,
        }
    }

    /// Spawn a login shell bound to `working_dir` and start forwarding its
    /// output as `terminal.data` / `terminal.exit` events on `events`.
    ///
    /// Returns the connection-scoped terminal id.
    pub async fn create(
        &mut self,
        working_dir: Option<&str>,
        events: mpsc::Sender<Value>,
    ) -> Result<u32, String> {
        let id = self.next_id;
        self.next_id += 1;

        let raw_dir = working_dir.unwrap_or(&self.config.shell.default_working_dir);
        let dir = expand_tilde(raw_dir);

        let mut env = HashMap::new();
        env.insert("TERM".to_string(), "xterm-256color".to_string());

        let spec = PtyCommand {
            program: self.config.shell.default_shell.clone(),
            // Login shell so rc files are sourced, matching what a standalone
            // terminal emulator would give the user.
            args: vec!["-l".to_string()],
            working_dir: dir.into_owned(),
            env,
            rows: self.config.server.default_terminal_rows,
            cols: self.config.server.default_terminal_cols,
        };

        let mut process = self
            .factory
            .spawn(spec)
            .map_err(|e| format!("Failed to spawn terminal shell: {e}"))?;
        let Some(mut rx) = process.take_events() else {
            return Err("Terminal PTY yielded no event stream".to_string());
        };

        info!("Terminal {id} created, pid {}", process.pid());
        self.terminals.lock().await.insert(id, process);

        // Forwarder: PTY events → wire events, removing the registry entry
        // once the shell exits.
        let terminals = Arc::clone(&self.terminals);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    PtyEvent::Data(data) => {
                        if events
                            .send(json!({ "type": "terminal.data", "id": id, "data": data }))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    PtyEvent::Exit(exit_code) => {
                        info!("Terminal {id} exited with code {exit_code}");
                        terminals.lock().await.remove(&id);
                        let _ = events
                            .send(json!({
                                "type": "terminal.exit",
                                "id": id,
                                "exit_code": exit_code,
                            }))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(id)
    }

    /// Write keyboard input to a terminal. Unknown ids are ignored.
    pub async fn write(&self, id: u32, data: &str) {
        let terminals = self.terminals.lock().await;
        if let Some(terminal) = terminals.get(&id) {
            if let Err(e) = terminal.write(data.as_bytes()) {
                warn!("terminal.write failed for id={id}: {e}");
            }
        }
    }

    /// Resize a terminal. Best-effort; failures are logged.
    pub async fn resize(&self, id: u32, cols: u16, rows: u16) {
        let terminals = self.terminals.lock().await;
        if let Some(terminal) = terminals.get(&id) {
            if let Err(e) = terminal.resize(rows, cols) {
                warn!("terminal.resize failed for id={id}: {e}");
            }
        }
    }

    /// Kill a terminal and remove it. Returns whether the id existed.
    pub async fn kill(&self, id: u32) -> bool {
        let mut terminals = self.terminals.lock().await;
        if let Some(terminal) = terminals.remove(&id) {
            terminal.kill();
            info!("Terminal {id} killed");
            true
        } else {
            false
        }
    }

    /// Kill every terminal owned by this connection. Called on disconnect.
    pub async fn kill_all(&self) {
        let mut terminals = self.terminals.lock().await;
        let count = terminals.len();
        for (id, terminal) in terminals.drain() {
            terminal.kill();
            info!("Terminal {id} killed (disconnect)");
        }
        if count > 0 {
            info!("Cleaned up {count} terminal(s) on disconnect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::pty::PtyEvent;
    use std::sync::Mutex as StdMutex;

    struct FakeFactory {
        taps: Arc<StdMutex<Vec<mpsc::Sender<PtyEvent>>>>,
        kills: Arc<StdMutex<Vec<u32>>>,
    }

    impl FakeFactory {
        fn new() -> Self {
            Self {
                taps: Arc::new(StdMutex::new(Vec::new())),
                kills: Arc::new(StdMutex::new(Vec::new())),
            }
        }
    }

    struct FakeSession {
        pid: u32,
        kills: Arc<StdMutex<Vec<u32>>>,
        events: Option<mpsc::Receiver<PtyEvent>>,
    }

    impl PtySession for FakeSession {
        fn pid(&self) -> u32 {
            self.pid
        }
        fn write(&self, _data: &[u8]) -> Result<(), String> {
            Ok(())
        }
        fn resize(&self, _rows: u16, _cols: u16) -> Result<(), String> {
            Ok(())
        }
        fn kill(&self) {
            self.kills.lock().unwrap().push(self.pid);
        }
        fn take_events(&mut self) -> Option<mpsc::Receiver<PtyEvent>> {
            self.events.take()
        }
    }

    impl PtyFactory for FakeFactory {
        fn spawn(&self, _cmd: PtyCommand) -> std::io::Result<Box<dyn PtySession>> {
            let (tx, rx) = mpsc::channel(16);
            let mut taps = self.taps.lock().unwrap();
            let pid = u32::try_from(taps.len()).unwrap() + 1;
            taps.push(tx);
            Ok(Box::new(FakeSession {
                pid,
                kills: Arc::clone(&self.kills),
                events: Some(rx),
            }))
        }
    }

    fn registry() -> (TerminalRegistry, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::new());
        let config = Arc::new(Config::load(None));
        let registry =
            TerminalRegistry::new(Arc::clone(&factory) as Arc<dyn PtyFactory>, config);
        (registry, factory)
    }

    #[tokio::test]
    async fn test_ids_count_from_one() {
        let (mut registry, _factory) = registry();
        let (tx, _rx) = mpsc::channel(16);
        assert_eq!(registry.create(Some("/tmp"), tx.clone()).await.unwrap(), 1);
        assert_eq!(registry.create(Some("/tmp"), tx).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_data_and_exit_are_forwarded() {
        let (mut registry, factory) = registry();
        let (tx, mut rx) = mpsc::channel(16);
        let id = registry.create(Some("/tmp"), tx).await.unwrap();

        let tap = factory.taps.lock().unwrap()[0].clone();
        tap.send(PtyEvent::Data("hello".into())).await.unwrap();
        tap.send(PtyEvent::Exit(0)).await.unwrap();

        let data = rx.recv().await.unwrap();
        assert_eq!(data["type"], "terminal.data");
        assert_eq!(data["id"], id);
        assert_eq!(data["data"], "hello");

        let exit = rx.recv().await.unwrap();
        assert_eq!(exit["type"], "terminal.exit");
        assert_eq!(exit["exit_code"], 0);

        // The entry is removed after exit, so kill reports false.
        assert!(!registry.kill(id).await);
    }

    #[tokio::test]
    async fn test_kill_and_kill_all() {
        let (mut registry, factory) = registry();
        let (tx, _rx) = mpsc::channel(16);
        let a = registry.create(Some("/tmp"), tx.clone()).await.unwrap();
        let _b = registry.create(Some("/tmp"), tx).await.unwrap();

        assert!(registry.kill(a).await);
        assert!(!registry.kill(a).await);

        registry.kill_all().await;
        assert_eq!(factory.kills.lock().unwrap().len(), 2);
    }
}
