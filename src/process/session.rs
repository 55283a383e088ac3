//! One spawned external command and the tasks that serve it.
//!
//! A session owns three tasks: two readers (stdout, stderr) and a supervisor
//! that owns the `Child`. The supervisor marks the session terminal only after
//! the process has been reaped and both readers have finished.

use super::buffer::OutputBuffer;
use super::signal::{self, Signal};
use super::{lock, EventBus};
use crate::error::ProcessError;
use crate::model::{
    CommandSpec, OutputLine, ProcessEvent, SessionId, SessionState, SessionStatus, StreamOrigin,
    TerminalId,
};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long readers may keep draining after the process exited. A grandchild
/// that inherited the pipes can hold them open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on waiting for the reap after a forced kill.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Control {
    ForceKill,
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    exit_code: Option<i32>,
    paused: bool,
    kill_requested: bool,
    started_at: Option<String>,
    ended_at: Option<String>,
    output: OutputBuffer,
}

pub(crate) struct Session {
    id: SessionId,
    terminal: TerminalId,
    command: String,
    pid: Option<u32>,
    inner: Mutex<Inner>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    control: mpsc::UnboundedSender<Control>,
    done: watch::Receiver<bool>,
    bus: Arc<EventBus>,
}

fn now_rfc3339() -> Option<String> {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .ok()
}

impl Session {
    /// Spawn `spec` and start its reader and supervisor tasks.
    ///
    /// Must be called from within a Tokio runtime. A spawn failure is
    /// published as `Starting → Failed` before the error is returned.
    pub(crate) fn start(
        id: SessionId,
        terminal: TerminalId,
        spec: &CommandSpec,
        buffer_lines: usize,
        bus: Arc<EventBus>,
    ) -> Result<Arc<Session>, ProcessError> {
        let command = spec.to_string();
        bus.publish(ProcessEvent::StateChanged {
            terminal: terminal.clone(),
            session: id,
            command: command.clone(),
            state: SessionState::Starting,
        });

        let mut std_cmd = std::process::Command::new(&spec.program);
        std_cmd
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }
        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                warn!(%terminal, %command, error = %source, "spawn failed");
                bus.publish(ProcessEvent::StateChanged {
                    terminal: terminal.clone(),
                    session: id,
                    command: command.clone(),
                    state: SessionState::Failed,
                });
                bus.publish(ProcessEvent::SessionEnded {
                    terminal,
                    session: id,
                    state: SessionState::Failed,
                    exit_code: None,
                });
                return Err(ProcessError::Spawn { command, source });
            }
        };

        let pid = child.id();
        info!(%terminal, session = %id, pid, %command, cwd = %spec.cwd.display(), "process started");
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);

        let session = Arc::new(Session {
            id,
            terminal,
            command,
            pid,
            inner: Mutex::new(Inner {
                state: SessionState::Running,
                exit_code: None,
                paused: false,
                kill_requested: false,
                started_at: now_rfc3339(),
                ended_at: None,
                output: OutputBuffer::new(buffer_lines),
            }),
            stdin: tokio::sync::Mutex::new(child.stdin.take()),
            control: control_tx,
            done: done_rx,
            bus,
        });
        session.bus.publish(ProcessEvent::StateChanged {
            terminal: session.terminal.clone(),
            session: id,
            command: session.command.clone(),
            state: SessionState::Running,
        });

        let mut readers = Vec::with_capacity(2);
        if let Some(out) = stdout {
            readers.push(tokio::spawn(read_stream(
                out,
                StreamOrigin::Stdout,
                session.clone(),
            )));
        }
        if let Some(err) = stderr {
            readers.push(tokio::spawn(read_stream(
                err,
                StreamOrigin::Stderr,
                session.clone(),
            )));
        }
        tokio::spawn(supervise(session.clone(), child, readers, control_rx, done_tx));
        Ok(session)
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    pub(crate) fn status(&self) -> SessionStatus {
        let inner = lock(&self.inner);
        SessionStatus {
            session: self.id,
            command: self.command.clone(),
            state: inner.state,
            exit_code: inner.exit_code,
            pid: self.pid,
            paused: inner.paused,
            started_at: inner.started_at.clone(),
            ended_at: inner.ended_at.clone(),
            dropped_lines: inner.output.dropped(),
        }
    }

    pub(crate) fn output(&self) -> Vec<OutputLine> {
        lock(&self.inner).output.snapshot()
    }

    /// Resolves once the session reached a terminal state.
    pub(crate) async fn wait(&self) -> SessionStatus {
        let mut done = self.done.clone();
        if done.wait_for(|finished| *finished).await.is_err() {
            warn!(terminal = %self.terminal, "supervisor ended without reporting completion");
        }
        self.status()
    }

    async fn wait_for_exit(&self, limit: Duration) -> bool {
        let mut done = self.done.clone();
        let finished = matches!(
            tokio::time::timeout(limit, done.wait_for(|finished| *finished)).await,
            Ok(Ok(_))
        );
        finished
    }

    pub(crate) async fn write_line(&self, text: &str) -> Result<(), ProcessError> {
        let stdin_error = |source| ProcessError::Stdin {
            terminal: self.terminal.clone(),
            source,
        };
        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(ProcessError::NoActiveSession {
                terminal: self.terminal.clone(),
            });
        };
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        pipe.write_all(line.as_bytes()).await.map_err(stdin_error)?;
        pipe.flush().await.map_err(stdin_error)
    }

    /// Stop or continue the process group.
    pub(crate) fn set_paused(&self, paused: bool) -> Result<(), ProcessError> {
        let operation = if paused { "pause" } else { "resume" };
        let Some(pid) = self.pid else {
            return Err(ProcessError::NoActiveSession {
                terminal: self.terminal.clone(),
            });
        };
        let signal = if paused { Signal::Stop } else { Signal::Continue };
        signal::send(pid, signal).map_err(|source| {
            if source.kind() == std::io::ErrorKind::Unsupported {
                ProcessError::Unsupported { operation }
            } else {
                ProcessError::Signal {
                    terminal: self.terminal.clone(),
                    source,
                }
            }
        })?;
        lock(&self.inner).paused = paused;
        debug!(terminal = %self.terminal, paused, "pause state changed");
        Ok(())
    }

    /// Interrupt, wait up to `grace`, then force-kill. Idempotent once terminal.
    pub(crate) async fn terminate(&self, grace: Duration) -> SessionState {
        {
            let mut inner = lock(&self.inner);
            if inner.state.is_terminal() {
                return inner.state;
            }
            inner.kill_requested = true;
        }

        let mut interrupted = false;
        if let Some(pid) = self.pid {
            // a stopped process cannot act on the interrupt
            let _ = signal::send(pid, Signal::Continue);
            match signal::send(pid, Signal::Interrupt) {
                Ok(()) => interrupted = true,
                Err(e) => debug!(terminal = %self.terminal, error = %e, "interrupt not delivered"),
            }
        }

        if !(interrupted && self.wait_for_exit(grace).await) {
            info!(terminal = %self.terminal, "forcing the process to stop");
            let _ = self.control.send(Control::ForceKill);
            if !self.wait_for_exit(REAP_TIMEOUT).await {
                warn!(terminal = %self.terminal, "process was not reaped after kill");
            }
        }
        self.state()
    }

    fn record(&self, stream: StreamOrigin, text: String) {
        let mut inner = lock(&self.inner);
        let line = inner.output.push(stream, text);
        // published under the lock so subscribers see sequence order
        self.bus.publish(ProcessEvent::Output {
            terminal: self.terminal.clone(),
            session: self.id,
            line,
        });
    }

    fn finish(&self, status: Option<ExitStatus>) {
        let state = {
            let mut inner = lock(&self.inner);
            let next = match status {
                _ if inner.kill_requested => SessionState::Killed,
                Some(s) if s.success() => SessionState::Completed,
                _ => SessionState::Failed,
            };
            debug_assert!(inner.state.can_transition_to(next));
            inner.state = next;
            inner.exit_code = status.and_then(|s| s.code());
            inner.paused = false;
            inner.ended_at = now_rfc3339();
            next
        };
        let exit_code = status.and_then(|s| s.code());
        info!(terminal = %self.terminal, session = %self.id, ?state, ?exit_code, "process ended");
        self.bus.publish(ProcessEvent::StateChanged {
            terminal: self.terminal.clone(),
            session: self.id,
            command: self.command.clone(),
            state,
        });
        self.bus.publish(ProcessEvent::SessionEnded {
            terminal: self.terminal.clone(),
            session: self.id,
            state,
            exit_code,
        });
    }
}

async fn read_stream<R>(reader: R, stream: StreamOrigin, session: Arc<Session>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.ends_with(b"\n") {
                    buf.pop();
                }
                if buf.ends_with(b"\r") {
                    buf.pop();
                }
                session.record(stream, String::from_utf8_lossy(&buf).into_owned());
            }
            Err(e) => {
                warn!(terminal = %session.terminal, ?stream, error = %e, "output stream failed");
                break;
            }
        }
    }
}

async fn supervise(
    session: Arc<Session>,
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    mut control: mpsc::UnboundedReceiver<Control>,
    done: watch::Sender<bool>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(Control::ForceKill) = control.recv() => {
                if let Some(pid) = session.pid {
                    let _ = signal::send(pid, Signal::Kill);
                }
                if let Err(e) = child.start_kill() {
                    debug!(terminal = %session.terminal, error = %e, "kill after exit");
                }
            }
        }
    };
    let status = match status {
        Ok(status) => Some(status),
        Err(e) => {
            warn!(terminal = %session.terminal, error = %e, "failed to reap process");
            None
        }
    };

    let deadline = tokio::time::Instant::now() + READER_DRAIN_TIMEOUT;
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            debug!(terminal = %session.terminal, "output still open after exit, detaching reader");
            reader.abort();
        }
    }

    // no more input once the process is gone
    session.stdin.lock().await.take();
    session.finish(status);
    let _ = done.send(true);
}
