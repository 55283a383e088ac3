use super::buffer::DEFAULT_CAPACITY;
use super::session::Session;
use super::{lock, EventBus};
use crate::error::ProcessError;
use crate::model::{CommandSpec, OutputLine, ProcessEvent, SessionId, SessionState, SessionStatus, TerminalId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSettings {
    /// Capacity of each session's output ring buffer.
    pub output_buffer_lines: usize,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            output_buffer_lines: DEFAULT_CAPACITY,
        }
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<TerminalId, Arc<Session>>,
    /// Terminals with a spawn in progress.
    starting: HashSet<TerminalId>,
}

/// A terminal slot claimed for a spawn. Released on drop.
struct Reservation<'a> {
    registry: &'a Mutex<Registry>,
    terminal: TerminalId,
}

impl Reservation<'_> {
    fn install(self, session: Arc<Session>) {
        let mut registry = lock(self.registry);
        if let Some(previous) = registry.sessions.insert(self.terminal.clone(), session) {
            debug!(terminal = %self.terminal, superseded = %previous.id(), "session replaced");
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        lock(self.registry).starting.remove(&self.terminal);
    }
}

struct Inner {
    registry: Mutex<Registry>,
    bus: Arc<EventBus>,
    settings: ProcessSettings,
    next_id: AtomicU64,
}

/// Registry of process sessions, one slot per terminal.
///
/// Cloning is cheap and every clone drives the same registry. Sessions on
/// different terminals are fully independent. Starting a session reserves its
/// terminal under the registry lock, then spawns with the lock released.
#[derive(Clone)]
pub struct ProcessController {
    inner: Arc<Inner>,
}

impl Default for ProcessController {
    fn default() -> Self {
        Self::new(ProcessSettings::default())
    }
}

impl ProcessController {
    pub fn new(settings: ProcessSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::default(),
                bus: Arc::new(EventBus::default()),
                settings,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ProcessEvent> {
        self.inner.bus.subscribe()
    }

    /// Spawn `command` on `terminal`. Returns as soon as the process exists;
    /// output and state changes arrive as events.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        &self,
        terminal: &TerminalId,
        command: &CommandSpec,
    ) -> Result<SessionHandle, ProcessError> {
        let reservation = self.reserve(terminal)?;
        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Session::start(
            id,
            terminal.clone(),
            command,
            self.inner.settings.output_buffer_lines,
            self.inner.bus.clone(),
        )?;
        reservation.install(session.clone());
        Ok(SessionHandle {
            terminal: terminal.clone(),
            session,
        })
    }

    fn reserve(&self, terminal: &TerminalId) -> Result<Reservation<'_>, ProcessError> {
        let mut registry = lock(&self.inner.registry);
        let busy = registry.starting.contains(terminal)
            || registry
                .sessions
                .get(terminal)
                .is_some_and(|current| !current.state().is_terminal());
        if busy {
            return Err(ProcessError::SessionBusy {
                terminal: terminal.clone(),
            });
        }
        registry.starting.insert(terminal.clone());
        Ok(Reservation {
            registry: &self.inner.registry,
            terminal: terminal.clone(),
        })
    }

    /// Send `text` plus a newline to the running process.
    pub async fn write_stdin(&self, terminal: &TerminalId, text: &str) -> Result<(), ProcessError> {
        self.live(terminal)?.write_line(text).await
    }

    /// Interrupt the process, force-kill it after `grace`, and return the final state.
    ///
    /// Returns the existing state for a session that already ended.
    pub async fn terminate(
        &self,
        terminal: &TerminalId,
        grace: Duration,
    ) -> Result<SessionState, ProcessError> {
        let session = self.session(terminal)?;
        Ok(session.terminate(grace).await)
    }

    pub fn pause(&self, terminal: &TerminalId) -> Result<(), ProcessError> {
        self.live(terminal)?.set_paused(true)
    }

    pub fn resume(&self, terminal: &TerminalId) -> Result<(), ProcessError> {
        self.live(terminal)?.set_paused(false)
    }

    /// Status of the latest session on `terminal`, live or ended.
    pub fn status(&self, terminal: &TerminalId) -> Option<SessionStatus> {
        lock(&self.inner.registry).sessions.get(terminal).map(|s| s.status())
    }

    /// Snapshot of the buffered output of the latest session on `terminal`.
    pub fn output(&self, terminal: &TerminalId) -> Option<Vec<OutputLine>> {
        lock(&self.inner.registry).sessions.get(terminal).map(|s| s.output())
    }

    /// Terminals with a session that has not ended yet.
    pub fn active_terminals(&self) -> Vec<TerminalId> {
        lock(&self.inner.registry)
            .sessions
            .iter()
            .filter(|(_, s)| !s.state().is_terminal())
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Terminate every live session concurrently, e.g. when a project closes.
    pub async fn shutdown(&self, grace: Duration) {
        let live: Vec<Arc<Session>> = lock(&self.inner.registry)
            .sessions
            .values()
            .filter(|s| !s.state().is_terminal())
            .cloned()
            .collect();
        futures::future::join_all(live.iter().map(|s| s.terminate(grace))).await;
    }

    fn session(&self, terminal: &TerminalId) -> Result<Arc<Session>, ProcessError> {
        lock(&self.inner.registry)
            .sessions
            .get(terminal)
            .cloned()
            .ok_or_else(|| ProcessError::NoActiveSession {
                terminal: terminal.clone(),
            })
    }

    fn live(&self, terminal: &TerminalId) -> Result<Arc<Session>, ProcessError> {
        let session = self.session(terminal)?;
        if session.state() == SessionState::Running {
            Ok(session)
        } else {
            Err(ProcessError::NoActiveSession {
                terminal: terminal.clone(),
            })
        }
    }
}

/// Handle to one started session.
#[derive(Clone)]
pub struct SessionHandle {
    terminal: TerminalId,
    session: Arc<Session>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.session.id()
    }

    pub fn terminal(&self) -> &TerminalId {
        &self.terminal
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    /// Wait until the process was reaped and its output fully drained.
    pub async fn wait(&self) -> SessionStatus {
        self.session.wait().await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::StreamOrigin;
    use std::path::PathBuf;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", std::env::temp_dir()).args(["-c", script])
    }

    #[tokio::test]
    async fn second_start_on_a_busy_terminal_is_refused() {
        let controller = ProcessController::default();
        let t1 = TerminalId::from("t1");
        let first = controller.start(&t1, &sh("sleep 30")).unwrap();

        let err = controller.start(&t1, &sh("true")).err().unwrap();
        assert!(matches!(err, ProcessError::SessionBusy { .. }));

        // other terminals are unaffected
        let other = controller.start(&TerminalId::from("t2"), &sh("true")).unwrap();
        assert_eq!(other.wait().await.state, SessionState::Completed);

        controller.terminate(&t1, Duration::from_secs(2)).await.unwrap();
        assert_eq!(first.status().state, SessionState::Killed);
    }

    #[tokio::test]
    async fn reserved_terminal_leaves_the_registry_usable() {
        // given: a spawn in progress on t1
        let controller = ProcessController::default();
        let t1 = TerminalId::from("t1");
        let reservation = controller.reserve(&t1).unwrap();

        // when
        let other = controller.start(&TerminalId::from("t2"), &sh("true")).unwrap();
        let second = controller.start(&t1, &sh("true")).err().unwrap();

        // then
        assert!(matches!(second, ProcessError::SessionBusy { .. }));
        assert!(controller.status(&t1).is_none());
        assert_eq!(other.wait().await.state, SessionState::Completed);

        // and: the slot frees up once the reservation is gone
        drop(reservation);
        let reused = controller.start(&t1, &sh("true")).unwrap().wait().await;
        assert_eq!(reused.state, SessionState::Completed);
    }

    #[tokio::test]
    async fn exit_codes_map_to_states() {
        let controller = ProcessController::default();
        let t = TerminalId::from("codes");
        let ok = controller.start(&t, &sh("exit 0")).unwrap().wait().await;
        assert_eq!((ok.state, ok.exit_code), (SessionState::Completed, Some(0)));
        let failed = controller.start(&t, &sh("exit 3")).unwrap().wait().await;
        assert_eq!((failed.state, failed.exit_code), (SessionState::Failed, Some(3)));
        assert!(failed.ended_at.is_some());
    }

    #[tokio::test]
    async fn output_is_buffered_per_stream() {
        let controller = ProcessController::new(ProcessSettings {
            output_buffer_lines: 2,
        });
        let t = TerminalId::from("out");
        let handle = controller
            .start(&t, &sh("echo one; echo two; echo three; echo oops >&2"))
            .unwrap();
        let status = handle.wait().await;
        let output = controller.output(&t).unwrap();
        assert_eq!(output.len(), 2);
        assert_eq!(status.dropped_lines, 2);
        let stdout: Vec<_> = output
            .iter()
            .filter(|l| l.stream == StreamOrigin::Stdout)
            .map(|l| l.text.as_str())
            .collect();
        assert!(stdout.iter().all(|text| *text == "two" || *text == "three"));
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let controller = ProcessController::default();
        let mut events = controller.subscribe();
        let t = TerminalId::from("missing");
        let spec = CommandSpec::new("battery-foam-no-such-program", PathBuf::from("/"));
        let err = controller.start(&t, &spec).err().unwrap();
        assert!(matches!(err, ProcessError::Spawn { .. }));

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ProcessEvent::StateChanged { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(states, [SessionState::Starting, SessionState::Failed]);
        assert!(controller.status(&t).is_none());
    }

    #[tokio::test]
    async fn stdin_requires_a_running_session() {
        let controller = ProcessController::default();
        let t = TerminalId::from("stdin");
        let err = controller.write_stdin(&t, "y").await.unwrap_err();
        assert!(matches!(err, ProcessError::NoActiveSession { .. }));

        let handle = controller.start(&t, &sh("read answer; echo got-$answer")).unwrap();
        controller.write_stdin(&t, "yes").await.unwrap();
        handle.wait().await;
        let output = controller.output(&t).unwrap();
        assert_eq!(output[0].text, "got-yes");
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        let controller = ProcessController::default();
        let t = TerminalId::from("pause");
        let handle = controller.start(&t, &sh("sleep 30")).unwrap();
        controller.pause(&t).unwrap();
        assert!(handle.status().paused);
        controller.resume(&t).unwrap();
        assert!(!handle.status().paused);
        controller.shutdown(Duration::from_secs(2)).await;
        assert_eq!(handle.status().state, SessionState::Killed);
        assert!(controller.active_terminals().is_empty());
    }
}
