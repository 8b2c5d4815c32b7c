//! PTY process management.
//!
//! All terminal-attached children — interactive shells for the terminal
//! panel and assistant CLI invocations — are spawned through
//! [`pty::PtyFactory`]. The factory trait is the seam between the session
//! managers and the operating system.

pub mod pty;
