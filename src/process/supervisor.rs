//! Process supervisor - one child process and its output reader
//!
//! The supervisor:
//! - Spawns the command locally (`sh -c`) or on a remote host over ssh
//! - Reads the child's stdout line by line on a dedicated thread
//! - Tracks whether the output stream is still open
//! - Puts the child in its own process group and signals the whole group
//!   on teardown, so wrapper scripts do not leave their children behind
//!
//! There is no automatic restart.

use crate::error::SpawnError;
use crate::process::LineSink;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long the group gets to exit after SIGTERM before SIGKILL
const TERM_GRACE: Duration = Duration::from_millis(500);

/// Where a command runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launch {
    /// Child of this process, stderr merged into stdout
    Local,

    /// Over ssh on `host`
    Ssh { host: String },
}

impl Launch {
    fn build(&self, command: &str) -> Command {
        let mut cmd = self.base_command(command);
        // New group led by the child: teardown signals everything it started
        cmd.process_group(0);
        cmd
    }

    fn base_command(&self, command: &str) -> Command {
        match self {
            Launch::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(format!("exec 2>&1; {}", command));
                cmd.stderr(Stdio::null());
                cmd
            }
            Launch::Ssh { host } => {
                // -tt: the remote side gets a pty, so its output is merged
                // and it is hung up when the ssh client dies
                let mut cmd = Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes", "-tt", host.as_str(), command]);
                cmd.stderr(Stdio::inherit());
                cmd
            }
        }
    }

    /// Name of the target, for logging
    pub fn target(&self) -> &str {
        match self {
            Launch::Local => "local",
            Launch::Ssh { host } => host,
        }
    }
}

/// Flips the output-open flag when the reader thread ends, even by panic
struct OpenGuard(Arc<AtomicBool>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A supervised child process
pub struct ProcessSupervisor {
    command: String,
    pid: u32,
    /// `None` once terminated and reaped
    child: Mutex<Option<Child>>,
    output_open: Arc<AtomicBool>,
}

impl ProcessSupervisor {
    /// Spawn `command` and stream its output into `sink`
    pub fn spawn<S: LineSink>(launch: &Launch, command: &str, sink: S) -> Result<Self, SpawnError> {
        let mut child = launch
            .build(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| SpawnError::Failed {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                reap(&mut child);
                return Err(SpawnError::NoOutput {
                    command: command.to_string(),
                });
            }
        };

        let pid = child.id();
        let output_open = Arc::new(AtomicBool::new(true));
        let guard = OpenGuard(Arc::clone(&output_open));

        let spawned = thread::Builder::new()
            .name(format!("reader-{}", pid))
            .spawn(move || {
                let _guard = guard;
                read_lines(stdout, sink);
            });

        if let Err(e) = spawned {
            reap(&mut child);
            return Err(SpawnError::Reader {
                command: command.to_string(),
                reason: e.to_string(),
            });
        }

        debug!(pid = pid, target = launch.target(), command = %command, "Process spawned");

        Ok(Self {
            command: command.to_string(),
            pid,
            child: Mutex::new(Some(child)),
            output_open,
        })
    }

    /// OS process id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Command line the process was started with
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Whether the child has not exited yet
    pub fn running(&self) -> bool {
        match self.child.lock().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Whether the reader may still deliver lines
    ///
    /// Once this is false every line the child wrote has been handed to
    /// the sink.
    pub fn output_open(&self) -> bool {
        self.output_open.load(Ordering::SeqCst)
    }

    /// Stop the child's process group and reap the child
    ///
    /// The group gets SIGTERM, then SIGKILL after a grace period. The
    /// group is signalled even when the child itself already exited, since
    /// its children may still be running. Calling this again is a no-op.
    pub fn terminate(&self) {
        let Some(mut child) = self.child.lock().take() else {
            return;
        };
        let group = Pid::from_raw(self.pid as i32);

        if signal_group(group, Signal::SIGTERM) {
            debug!(pid = self.pid, "Terminating process group");
            let deadline = Instant::now() + TERM_GRACE;
            while matches!(child.try_wait(), Ok(None)) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            // Stragglers, including children that ignore SIGTERM
            signal_group(group, Signal::SIGKILL);
        }

        let _ = child.wait();
    }
}

/// Signal a process group; false if the group no longer exists
fn signal_group(group: Pid, signal: Signal) -> bool {
    match killpg(group, signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(
                pgid = group.as_raw(),
                signal = ?signal,
                error = %e,
                "Failed to signal process group"
            );
            false
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // The reader is detached: grandchildren may keep the pipe open
        self.terminate();
    }
}

fn reap(child: &mut Child) {
    signal_group(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
    let _ = child.wait();
}

fn read_lines<S: LineSink>(stdout: ChildStdout, sink: S) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::with_capacity(256);
    let mut delivering = true;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if !delivering {
                    continue;
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                // Keep draining after the sink closes so the child never
                // blocks on a full pipe
                delivering = sink.push_line(line);
            }
            Err(e) => {
                debug!(error = %e, "Process output read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::LogBuffer;

    fn wait_closed(process: &ProcessSupervisor) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while process.output_open() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_captures_stdout_and_stderr() {
        let buffer = LogBuffer::new(16);
        let command = "echo out; echo err >&2; printf 'x\\r\\n'";
        let process = ProcessSupervisor::spawn(&Launch::Local, command, buffer.writer()).unwrap();
        wait_closed(&process);

        assert_eq!(buffer.drain(), vec!["out", "err", "x"]);
    }

    #[test]
    fn test_terminate_kills_child() {
        let buffer = LogBuffer::new(4);
        let process =
            ProcessSupervisor::spawn(&Launch::Local, "exec sleep 30", buffer.writer()).unwrap();
        assert!(process.pid() > 0);
        assert!(process.running());

        process.terminate();
        assert!(!process.running());
        wait_closed(&process);
        assert!(!process.output_open());
    }

    /// Whether `pid` is gone or only a zombie left to be reaped
    #[cfg(target_os = "linux")]
    fn exited(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_terminate_stops_grandchildren() {
        let buffer = LogBuffer::new(16);
        let command = "sleep 317 & echo $!; wait; echo done";
        let process = ProcessSupervisor::spawn(&Launch::Local, command, buffer.writer()).unwrap();

        let grandchild: u32 = buffer
            .pop_timeout(Duration::from_secs(5))
            .and_then(|line| line.trim().parse().ok())
            .unwrap();
        assert!(!exited(grandchild));

        process.terminate();
        assert!(!process.running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !exited(grandchild) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(exited(grandchild), "sleep {} survived terminate", grandchild);

        // Second call is a no-op
        process.terminate();
    }

    #[test]
    fn test_closed_sink_keeps_draining() {
        struct Closed;
        impl LineSink for Closed {
            fn push_line(&self, _line: String) -> bool {
                false
            }
        }

        let process = ProcessSupervisor::spawn(&Launch::Local, "seq 1 20000", Closed).unwrap();
        wait_closed(&process);
        assert!(!process.output_open());
    }
}
