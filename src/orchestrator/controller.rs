//! Sequence lifecycle controller.
//!
//! Runs one solver sequence on a terminal, forwards its process events to the
//! output writer and turns Ctrl-C into a stop request.

use crate::cli::OutputLine;
use anyhow::{anyhow, Context, Result};
use battery_foam::error::ProcessError;
use battery_foam::model::{ProcessEvent, SessionState, StreamOrigin, TerminalId};
use battery_foam::{Project, SequenceOutcome, SolverManager};
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

/// Long-running project operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Meshify,
    Build,
    Run,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Meshify => "meshify",
            Operation::Build => "build",
            Operation::Run => "run",
        })
    }
}

/// Spawn the sequence for `operation` on `terminal`.
fn start_sequence(
    solver: &SolverManager,
    project: &Project,
    operation: Operation,
    terminal: &TerminalId,
) -> JoinHandle<Result<SequenceOutcome, ProcessError>> {
    let solver = solver.clone();
    let project = project.clone();
    let terminal = terminal.clone();
    tokio::spawn(async move {
        match operation {
            Operation::Meshify => solver.meshify(&terminal, &project).await,
            Operation::Build => solver.build(&terminal, &project).await,
            Operation::Run => solver.run(&terminal, &project).await,
        }
    })
}

/// Route one event of our terminal to the writer.
fn forward_event(out_tx: &UnboundedSender<OutputLine>, event: &ProcessEvent, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
        return;
    }
    match event {
        ProcessEvent::Output { line, .. } => {
            let text = line.text.clone();
            let _ = out_tx.send(match line.stream {
                StreamOrigin::Stdout => OutputLine::Stdout(text),
                StreamOrigin::Stderr => OutputLine::Stderr(text),
            });
        }
        ProcessEvent::StateChanged {
            command,
            state: SessionState::Running,
            ..
        } => {
            let _ = out_tx.send(OutputLine::Stderr(format!("==> {command}")));
        }
        ProcessEvent::SessionEnded {
            state, exit_code, ..
        } if *state != SessionState::Completed => {
            let code = exit_code.map_or_else(|| "-".to_string(), |c| c.to_string());
            let _ = out_tx.send(OutputLine::Stderr(format!(
                "<== {state:?} (exit code {code})"
            )));
        }
        _ => {}
    }
}

/// The outcome reported when the user stopped the sequence.
fn stopped_outcome(solver: &SolverManager, terminal: &TerminalId, started: usize) -> SequenceOutcome {
    let status = solver.controller().status(terminal);
    SequenceOutcome::Aborted {
        step: started.saturating_sub(1),
        command: status.as_ref().map(|s| s.command.clone()).unwrap_or_default(),
        state: match status.as_ref().map(|s| s.state) {
            Some(SessionState::Failed) => SessionState::Failed,
            _ => SessionState::Killed,
        },
        exit_code: status.and_then(|s| s.exit_code),
    }
}

/// Drive `operation` to its end, streaming output to `out_tx`.
///
/// The first Ctrl-C cancels the sequence so no further step starts, then
/// terminates the running step with the solver's grace period.
pub(crate) async fn run_sequence(
    solver: &SolverManager,
    project: &Project,
    operation: Operation,
    terminal: &TerminalId,
    out_tx: &UnboundedSender<OutputLine>,
    json: bool,
) -> Result<SequenceOutcome> {
    let mut events = solver.controller().subscribe();
    let mut sequence = Some(start_sequence(solver, project, operation, terminal));
    let mut stopping: Option<JoinHandle<Result<SessionState, ProcessError>>> = None;
    let mut stop_requested = false;
    let mut signals_available = true;
    let mut started = 0usize;
    // Stop watchdog: if stopping takes longer than the grace period, say so.
    let mut stop_deadline: Option<Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    let res = loop {
        tokio::select! {
            Some(event) = events.recv() => {
                if event.terminal() != terminal {
                    continue;
                }
                if matches!(event, ProcessEvent::StateChanged { state: SessionState::Starting, .. }) {
                    started += 1;
                }
                forward_event(out_tx, &event, json);
            }
            signal = tokio::signal::ctrl_c(), if !stop_requested && signals_available => {
                if let Err(e) = signal {
                    warn!(error = %e, "cannot listen for Ctrl-C");
                    signals_available = false;
                    continue;
                }
                stop_requested = true;
                if let Some(handle) = sequence.as_ref() {
                    handle.abort();
                }
                let _ = out_tx.send(OutputLine::Stderr("Stopping…".into()));
                stop_deadline = Some(Instant::now() + solver.grace() + Duration::from_secs(1));
            }
            // Do not take the JoinHandle before this branch wins; otherwise it can be dropped
            // if another select branch is chosen, and we'll never observe completion.
            maybe_done = async {
                if let Some(h) = sequence.as_mut() {
                    return Some(h.await);
                }
                futures::future::pending().await
            } => {
                if let Some(join_res) = maybe_done {
                    sequence.take();
                    match join_res {
                        Ok(res) => break res.with_context(|| format!("{operation} failed")),
                        Err(e) if e.is_cancelled() => {
                            debug!(%terminal, "sequence cancelled, stopping the current step");
                            let solver = solver.clone();
                            let terminal = terminal.clone();
                            stopping = Some(tokio::spawn(async move { solver.stop(&terminal).await }));
                        }
                        Err(e) => break Err(anyhow!("{operation} task failed: {e}")),
                    }
                }
            }
            maybe_stopped = async {
                if let Some(h) = stopping.as_mut() {
                    return Some(h.await);
                }
                futures::future::pending().await
            } => {
                if let Some(join_res) = maybe_stopped {
                    stopping.take();
                    match join_res {
                        Ok(Ok(_)) | Ok(Err(ProcessError::NoActiveSession { .. })) => {
                            break Ok(stopped_outcome(solver, terminal, started));
                        }
                        Ok(Err(e)) => break Err(anyhow::Error::new(e).context("failed to stop the process")),
                        Err(e) => break Err(anyhow!("stop task failed: {e}")),
                    }
                }
            }
            // If the solver ignores the interrupt, keep the user informed.
            _ = watchdog.tick() => {
                if let Some(deadline) = stop_deadline {
                    if Instant::now() >= deadline {
                        let _ = out_tx.send(OutputLine::Stderr("Still stopping…".into()));
                        stop_deadline = None;
                    }
                }
            }
        }
    };

    // everything the sessions published before ending is already queued
    while let Ok(event) = events.try_recv() {
        if event.terminal() == terminal {
            forward_event(out_tx, &event, json);
        }
    }
    res
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use battery_foam::model::{ModuleType, SessionId};
    use battery_foam::{ProcessController, Toolchain};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    fn write_tool(dir: &std::path::Path, name: &str, script: &str) {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn failed_sessions_are_announced_on_stderr() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let event = ProcessEvent::SessionEnded {
            terminal: TerminalId::from("main"),
            session: SessionId(1),
            state: SessionState::Failed,
            exit_code: Some(1),
        };
        forward_event(&tx, &event, false);
        match rx.try_recv().unwrap() {
            OutputLine::Stderr(text) => assert_eq!(text, "<== Failed (exit code 1)"),
            OutputLine::Stdout(text) => panic!("unexpected stdout line {text}"),
        }
    }

    #[tokio::test]
    async fn build_output_is_streamed_in_order() {
        // given
        let tools = tempdir().unwrap();
        write_tool(tools.path(), "wclean", "echo cleaned");
        write_tool(tools.path(), "wmake", "echo compiled; echo warning >&2");
        let root = tempdir().unwrap();
        let project = Project::new(root.path(), ModuleType::SingleParticle, "spm");
        fs::create_dir_all(&project.solver_dir).unwrap();
        let solver = SolverManager::new(
            ProcessController::default(),
            Toolchain {
                tool_dir: Some(tools.path().to_path_buf()),
                ..Toolchain::default()
            },
            Duration::from_secs(2),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        // when
        let outcome = run_sequence(
            &solver,
            &project,
            Operation::Build,
            &TerminalId::from("main"),
            &tx,
            false,
        )
        .await
        .unwrap();

        // then
        assert_eq!(outcome, SequenceOutcome::Completed { steps: 2 });
        drop(tx);
        let mut stdout = Vec::new();
        while let Some(line) = rx.recv().await {
            if let OutputLine::Stdout(text) = line {
                stdout.push(text);
            }
        }
        assert_eq!(stdout, ["cleaned", "compiled"]);
    }
}
