//! PTY allocation, child spawning, and terminal I/O plumbing.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The PTY master fd is kept alive
//! for the session lifetime so write and resize operations can be performed
//! on it.
//!
//! Everything that runs in a terminal here — plain shells and assistant CLI
//! processes alike — goes through [`PtyFactory::spawn`]. The factory is a
//! trait so tests can substitute a fake that records spawn/kill ordering
//! without touching the OS.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::process::Stdio;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

/// Capacity of the stdin write queue per PTY session.
const STDIN_QUEUE: usize = 64;

/// Capacity of the output event channel per PTY session.
const EVENT_QUEUE: usize = 256;

/// Everything needed to start a process on a fresh PTY.
#[derive(Debug, Clone)]
pub struct PtyCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: String,
    pub env: HashMap<String, String>,
    pub rows: u16,
    pub cols: u16,
}

/// Output of a running PTY child.
///
/// `Exit` is always the final event on a session's channel: the reader task
/// drains the master to EOF before waiting on the child, so no `Data` can
/// trail the exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// A chunk of terminal output (lossy UTF-8).
    Data(String),
    /// The child exited with the given code (-1 when killed by signal).
    Exit(i32),
}

/// A live PTY-backed child process.
pub trait PtySession: Send {
    /// OS process id of the child.
    fn pid(&self) -> u32;

    /// Enqueue bytes for the child's terminal input. Non-blocking; fails
    /// when the stdin queue is full or the writer task has died.
    fn write(&self, data: &[u8]) -> Result<(), String>;

    /// Resize the terminal window.
    fn resize(&self, rows: u16, cols: u16) -> Result<(), String>;

    /// Kill the child's entire process group immediately (SIGKILL).
    fn kill(&self);

    /// Take the output event receiver. Yields `Some` exactly once.
    fn take_events(&mut self) -> Option<mpsc::Receiver<PtyEvent>>;
}

/// Spawns PTY sessions. Implemented by [`NativePtyFactory`] in production
/// and by recording fakes in tests.
pub trait PtyFactory: Send + Sync {
    fn spawn(&self, cmd: PtyCommand) -> std::io::Result<Box<dyn PtySession>>;
}

/// The real thing: `openpty` + exec with the child as session leader.
pub struct NativePtyFactory;

impl PtyFactory for NativePtyFactory {
    fn spawn(&self, cmd: PtyCommand) -> std::io::Result<Box<dyn PtySession>> {
        NativePtySession::spawn(cmd).map(|s| Box::new(s) as Box<dyn PtySession>)
    }
}

/// Allocate a PTY pair with the given terminal size.
fn allocate_pty(rows: u16, cols: u16) -> Result<OpenptyResult, nix::Error> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    openpty(&winsize, None)
}

/// Resize a PTY's terminal window via the master fd.
fn resize_pty(master: &OwnedFd, rows: u16, cols: u16) -> Result<(), nix::Error> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCSWINSZ is a well-defined ioctl that reads a Winsize struct.
    let ret = unsafe {
        libc::ioctl(
            master.as_raw_fd(),
            libc::TIOCSWINSZ,
            std::ptr::addr_of!(winsize),
        )
    };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

/// A PTY session backed by a real child process.
///
/// Two background tasks route I/O: a stdin writer (mpsc → master) and an
/// output reader (master → event channel) that also reaps the child and
/// sends the terminal [`PtyEvent::Exit`].
pub struct NativePtySession {
    pid: u32,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    /// Master fd kept alive for resize. The reader/writer tasks hold dups.
    master: OwnedFd,
    events: Option<mpsc::Receiver<PtyEvent>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl NativePtySession {
    fn spawn(spec: PtyCommand) -> std::io::Result<Self> {
        let pty = allocate_pty(spec.rows, spec.cols)
            .map_err(|e| std::io::Error::other(format!("openpty failed: {e}")))?;

        let slave_fd = pty.slave.as_raw_fd();
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .kill_on_drop(true);

        // The child's stdio is handled by pre_exec (dup2 to PTY slave), so
        // tell tokio not to set up pipes.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // SAFETY: All syscalls used here are async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(move || {
                // Create a new session so the child is the session leader
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                // Set the PTY slave as the controlling terminal
                if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                // Redirect stdin/stdout/stderr to the PTY slave
                libc::dup2(slave_fd, 0);
                libc::dup2(slave_fd, 1);
                libc::dup2(slave_fd, 2);
                if slave_fd > 2 {
                    libc::close(slave_fd);
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or(0);
        // The slave side belongs to the child now.
        drop(pty.slave);

        let master_raw: RawFd = pty.master.as_raw_fd();

        // Dup the master fd: one for writing, one for reading, the original
        // kept for resize.
        let writer_fd: RawFd = unsafe { libc::dup(master_raw) };
        if writer_fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let reader_fd: RawFd = unsafe { libc::dup(master_raw) };
        if reader_fd < 0 {
            unsafe {
                libc::close(writer_fd);
            }
            return Err(std::io::Error::last_os_error());
        }

        // SAFETY: we own these file descriptors via dup
        let master_write =
            tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(writer_fd) });
        let master_read =
            tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(reader_fd) });

        // stdin writer task: mpsc → PTY master
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(STDIN_QUEUE);
        let stdin_task = tokio::spawn(async move {
            let mut writer = master_write;
            while let Some(data) = stdin_rx.recv().await {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        // Output reader task: PTY master → events, then reap the child.
        // Reading to EOF before wait() guarantees Exit is the last event.
        let (event_tx, event_rx) = mpsc::channel::<PtyEvent>(EVENT_QUEUE);
        let output_task = tokio::spawn(async move {
            let mut reader = master_read;
            let mut tmp = [0u8; 4096];
            loop {
                match reader.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let data = String::from_utf8_lossy(&tmp[..n]).into_owned();
                        if event_tx.send(PtyEvent::Data(data)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            debug!("PTY child {pid} exited with code {code}");
            let _ = event_tx.send(PtyEvent::Exit(code)).await;
        });

        Ok(NativePtySession {
            pid,
            stdin_tx,
            master: pty.master,
            events: Some(event_rx),
            tasks: vec![stdin_task, output_task],
        })
    }
}

impl PtySession for NativePtySession {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn write(&self, data: &[u8]) -> Result<(), String> {
        self.stdin_tx
            .try_send(data.to_vec())
            .map_err(|_| "PTY stdin closed or backed up".to_string())
    }

    fn resize(&self, rows: u16, cols: u16) -> Result<(), String> {
        resize_pty(&self.master, rows, cols).map_err(|e| e.to_string())
    }

    fn kill(&self) {
        // The child is a session leader via setsid(), so pgid == pid and
        // kill(-pgid, …) reaches the whole process tree.
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pid as i32;
        if pgid > 0 {
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
        for task in &self.tasks {
            task.abort();
        }
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<PtyEvent>> {
        self.events.take()
    }
}
