//! Build, mesh and run command sequences per module, driven through the
//! [`ProcessController`].

use crate::error::{FailureKind, ProcessError};
use crate::model::{CommandSpec, SessionState, TerminalId};
use crate::process::{lock, ProcessController};
use crate::project::Project;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

const NO_ARGS: [&str; 0] = [];

/// Where the OpenFOAM executables come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toolchain {
    /// Directory holding the OpenFOAM utilities; `PATH` is searched when unset.
    pub tool_dir: Option<PathBuf>,
    /// Directory `wmake` installs solvers into (`$FOAM_USER_APPBIN`); `PATH`
    /// is searched when unset.
    #[serde(default)]
    pub user_app_dir: Option<PathBuf>,
    /// Environment script sourced before every command (OpenFOAM's `etc/bashrc`).
    pub openfoam_bashrc: Option<PathBuf>,
}

impl Toolchain {
    /// An OpenFOAM utility such as `blockMesh` or `wmake`.
    pub fn command<I, S>(&self, program: &str, args: I, cwd: &Path) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wrap(resolve(self.tool_dir.as_deref(), program), args, cwd)
    }

    /// A solver built from the project sources.
    pub fn solver_command<I, S>(&self, binary: &str, args: I, cwd: &Path) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wrap(resolve(self.user_app_dir.as_deref(), binary), args, cwd)
    }

    fn wrap<I, S>(&self, program: String, args: I, cwd: &Path) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match &self.openfoam_bashrc {
            // `exec` keeps the tool as the process the interrupt is sent to
            Some(bashrc) => CommandSpec::new("bash", cwd)
                .args(["-c", r#"source "$0" && exec "$@""#])
                .arg(bashrc.to_string_lossy())
                .arg(program)
                .args(args),
            None => CommandSpec::new(program, cwd).args(args),
        }
    }
}

fn resolve(dir: Option<&Path>, program: &str) -> String {
    match dir {
        Some(dir) => dir.join(program).to_string_lossy().into_owned(),
        None => program.to_string(),
    }
}

/// Result of a fail-fast command sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SequenceOutcome {
    Completed {
        steps: usize,
    },
    /// Step `step` (0-based) did not complete; later steps were not started.
    Aborted {
        step: usize,
        command: String,
        state: SessionState,
        exit_code: Option<i32>,
    },
}

impl SequenceOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SequenceOutcome::Completed { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            SequenceOutcome::Completed { .. } => None,
            SequenceOutcome::Aborted {
                state: SessionState::Killed,
                ..
            } => None,
            SequenceOutcome::Aborted { .. } => Some(FailureKind::Solver),
        }
    }
}

type CancelFlags = Mutex<HashMap<TerminalId, Arc<AtomicBool>>>;

/// Composes [`ProcessController`] with the per-module command sequences.
/// Besides the processes it only tracks which running sequences were cancelled.
#[derive(Clone)]
pub struct SolverManager {
    controller: ProcessController,
    toolchain: Toolchain,
    grace: Duration,
    cancels: Arc<CancelFlags>,
}

/// Cancel flag of one `execute` call, unregistered when the call returns.
struct CancelToken<'a> {
    flags: &'a CancelFlags,
    terminal: TerminalId,
    flag: Arc<AtomicBool>,
}

impl<'a> CancelToken<'a> {
    fn register(flags: &'a CancelFlags, terminal: &TerminalId) -> Self {
        let flag = Arc::new(AtomicBool::new(false));
        lock(flags).insert(terminal.clone(), flag.clone());
        Self {
            flags,
            terminal: terminal.clone(),
            flag,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Drop for CancelToken<'_> {
    fn drop(&mut self) {
        let mut flags = lock(self.flags);
        // a newer sequence on the same terminal owns the entry
        if flags
            .get(&self.terminal)
            .is_some_and(|flag| Arc::ptr_eq(flag, &self.flag))
        {
            flags.remove(&self.terminal);
        }
    }
}

impl SolverManager {
    pub fn new(controller: ProcessController, toolchain: Toolchain, grace: Duration) -> Self {
        Self {
            controller,
            toolchain,
            grace,
            cancels: Arc::default(),
        }
    }

    pub fn controller(&self) -> &ProcessController {
        &self.controller
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// `wclean` then `wmake` in the solver source directory.
    pub fn build_commands(&self, project: &Project) -> Vec<CommandSpec> {
        let dir = &project.solver_dir;
        vec![
            self.toolchain.command("wclean", NO_ARGS, dir),
            self.toolchain.command("wmake", NO_ARGS, dir),
        ]
    }

    /// `blockMesh`, `topoSet`, then split the cell zones into regions.
    pub fn meshify_commands(&self, project: &Project) -> Vec<CommandSpec> {
        let case = project.case_dir();
        vec![
            self.toolchain.command("blockMesh", NO_ARGS, &case),
            self.toolchain.command("topoSet", NO_ARGS, &case),
            self.toolchain
                .command("splitMeshRegions", ["-cellZones", "-overwrite"], &case),
        ]
    }

    pub fn run_commands(&self, project: &Project) -> Vec<CommandSpec> {
        vec![self.toolchain.solver_command(
            &project.solver_binary(),
            NO_ARGS,
            &project.case_dir(),
        )]
    }

    pub async fn build(
        &self,
        terminal: &TerminalId,
        project: &Project,
    ) -> Result<SequenceOutcome, ProcessError> {
        self.execute(terminal, self.build_commands(project)).await
    }

    pub async fn meshify(
        &self,
        terminal: &TerminalId,
        project: &Project,
    ) -> Result<SequenceOutcome, ProcessError> {
        self.execute(terminal, self.meshify_commands(project)).await
    }

    pub async fn run(
        &self,
        terminal: &TerminalId,
        project: &Project,
    ) -> Result<SequenceOutcome, ProcessError> {
        self.execute(terminal, self.run_commands(project)).await
    }

    /// Terminate whatever runs on `terminal`, with the configured grace period.
    /// A sequence running there starts no further step.
    pub async fn stop(&self, terminal: &TerminalId) -> Result<SessionState, ProcessError> {
        self.cancel(terminal);
        self.controller.terminate(terminal, self.grace).await
    }

    /// Keep the sequence running on `terminal` from starting another step.
    /// The current step runs on.
    pub fn cancel(&self, terminal: &TerminalId) {
        if let Some(flag) = lock(&self.cancels).get(terminal) {
            debug!(%terminal, "sequence cancel requested");
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Run `steps` one after another on `terminal`, starting each only once
    /// the previous one completed with exit code 0 and no cancel arrived.
    pub async fn execute(
        &self,
        terminal: &TerminalId,
        steps: Vec<CommandSpec>,
    ) -> Result<SequenceOutcome, ProcessError> {
        let token = CancelToken::register(&self.cancels, terminal);
        let total = steps.len();
        for (step, command) in steps.into_iter().enumerate() {
            if token.is_cancelled() {
                warn!(%terminal, step, %command, "sequence cancelled");
                return Ok(SequenceOutcome::Aborted {
                    step,
                    command: command.to_string(),
                    state: SessionState::Killed,
                    exit_code: None,
                });
            }
            let handle = self.controller.start(terminal, &command)?;
            let status = handle.wait().await;
            if status.state != SessionState::Completed {
                warn!(%terminal, step, command = %status.command, state = ?status.state, "sequence aborted");
                return Ok(SequenceOutcome::Aborted {
                    step,
                    command: status.command,
                    state: status.state,
                    exit_code: status.exit_code,
                });
            }
        }
        info!(%terminal, steps = total, "sequence completed");
        Ok(SequenceOutcome::Completed { steps: total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModuleType;

    fn project() -> Project {
        Project::new("/work/cell", ModuleType::FullCell, "cell")
    }

    #[test]
    fn build_runs_in_the_solver_directory() {
        let manager = SolverManager::new(
            ProcessController::default(),
            Toolchain::default(),
            DEFAULT_GRACE,
        );
        let steps = manager.build_commands(&project());
        let programs: Vec<_> = steps.iter().map(|c| c.program.as_str()).collect();
        assert_eq!(programs, ["wclean", "wmake"]);
        assert!(steps.iter().all(|c| c.cwd == Path::new("/work/cell/cell")));
    }

    #[test]
    fn meshify_splits_cell_zones() {
        let manager = SolverManager::new(
            ProcessController::default(),
            Toolchain::default(),
            DEFAULT_GRACE,
        );
        let steps = manager.meshify_commands(&project());
        assert_eq!(steps[2].to_string(), "splitMeshRegions -cellZones -overwrite");
        assert_eq!(steps[2].cwd, Path::new("/work/cell/Case"));
    }

    #[test]
    fn bashrc_wraps_commands() {
        let toolchain = Toolchain {
            openfoam_bashrc: Some(PathBuf::from("/opt/openfoam6/etc/bashrc")),
            ..Toolchain::default()
        };
        let cmd = toolchain.command("blockMesh", ["-case", "."], Path::new("/tmp"));
        assert_eq!(cmd.program, "bash");
        assert_eq!(
            cmd.args,
            [
                "-c",
                r#"source "$0" && exec "$@""#,
                "/opt/openfoam6/etc/bashrc",
                "blockMesh",
                "-case",
                "."
            ]
        );
    }

    #[test]
    fn tool_dir_resolves_programs() {
        let toolchain = Toolchain {
            tool_dir: Some(PathBuf::from("/opt/of/bin")),
            ..Toolchain::default()
        };
        let cmd = toolchain.command("wmake", NO_ARGS, Path::new("/tmp"));
        assert_eq!(cmd.program, "/opt/of/bin/wmake");
    }

    #[test]
    fn solver_comes_from_the_user_app_dir() {
        let toolchain = Toolchain {
            tool_dir: Some(PathBuf::from("/opt/openfoam6/platforms/linux64GccDPInt32Opt/bin")),
            user_app_dir: Some(PathBuf::from("/home/user/OpenFOAM/user-6/platforms/bin")),
            openfoam_bashrc: None,
        };
        let manager = SolverManager::new(ProcessController::default(), toolchain, DEFAULT_GRACE);

        let run = manager.run_commands(&project());
        assert_eq!(
            run[0].program,
            "/home/user/OpenFOAM/user-6/platforms/bin/fullCellFoam_OF6"
        );
        assert_eq!(run[0].cwd, Path::new("/work/cell/Case"));
        let build = manager.build_commands(&project());
        assert_eq!(
            build[1].program,
            "/opt/openfoam6/platforms/linux64GccDPInt32Opt/bin/wmake"
        );
    }

    #[test]
    fn solver_is_searched_on_the_path_without_a_user_app_dir() {
        let toolchain = Toolchain {
            tool_dir: Some(PathBuf::from("/opt/of/bin")),
            ..Toolchain::default()
        };
        let manager = SolverManager::new(ProcessController::default(), toolchain, DEFAULT_GRACE);
        assert_eq!(manager.run_commands(&project())[0].program, "fullCellFoam_OF6");
    }

    #[tokio::test]
    async fn cancel_without_a_sequence_is_ignored() {
        let manager = SolverManager::new(
            ProcessController::default(),
            Toolchain::default(),
            DEFAULT_GRACE,
        );
        let terminal = TerminalId::from("idle");
        manager.cancel(&terminal);

        let outcome = manager.execute(&terminal, Vec::new()).await.unwrap();
        assert_eq!(outcome, SequenceOutcome::Completed { steps: 0 });
        assert!(lock(&manager.cancels).is_empty());
    }

    #[test]
    fn killed_sequences_are_not_solver_failures() {
        let killed = SequenceOutcome::Aborted {
            step: 0,
            command: "SPMFoam_OF6".into(),
            state: SessionState::Killed,
            exit_code: None,
        };
        assert_eq!(killed.failure_kind(), None);
        let failed = SequenceOutcome::Aborted {
            step: 1,
            command: "wmake".into(),
            state: SessionState::Failed,
            exit_code: Some(2),
        };
        assert_eq!(failed.failure_kind(), Some(FailureKind::Solver));
    }
}
