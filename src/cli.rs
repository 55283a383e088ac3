use crate::config::{self, Settings};
use crate::orchestrator::{self, Operation};
use anyhow::{anyhow, bail, Context, Result};
use battery_foam::model::{
    FieldMap, ModuleType, ParamValue, ParameterCategory, Region, SessionState, TerminalId,
};
use battery_foam::{
    DirectoryTemplates, FailureKind, ParamError, ParameterManager, ProcessController,
    ProcessError, ProcessSettings, Project, ProjectError, SequenceOutcome, SolverManager,
    Toolchain,
};
use clap::{ArgAction, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Exit code of a sequence stopped with Ctrl-C.
const EXIT_INTERRUPTED: i32 = 130;

/// Output line routing for stdout/stderr writer.
pub(crate) enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "battery-foam",
    version,
    about = "Edit OpenFOAM battery-simulation parameters and drive the mesh, build and solver"
)]
pub struct Cli {
    /// Project directory (holds `Case/` and the solver source)
    #[arg(long, global = true, default_value = ".")]
    pub project: PathBuf,

    /// Module type, for projects whose Case does not identify it
    #[arg(long, global = true)]
    pub module: Option<ModuleType>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// How long a stopped process may take to exit before it is killed
    #[arg(long, global = true)]
    pub grace: Option<humantime::Duration>,

    /// OpenFOAM environment script sourced before every command
    #[arg(long, global = true)]
    pub openfoam_bashrc: Option<PathBuf>,

    /// Directory holding the OpenFOAM executables
    #[arg(long, global = true)]
    pub tool_dir: Option<PathBuf>,

    /// Directory the built solvers are installed in ($FOAM_USER_APPBIN)
    #[arg(long, global = true)]
    pub user_app_dir: Option<PathBuf>,

    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Show the project layout, regions and written result times
    Info,
    /// Print the parameters of a category
    Get {
        category: ParameterCategory,
        #[arg(long)]
        region: Option<Region>,
    },
    /// Update existing parameters
    Set {
        category: ParameterCategory,
        #[arg(long)]
        region: Option<Region>,
        /// Assignments such as `Ds_value=3.9e-14`
        #[arg(required = true, value_parser = parse_assignment)]
        values: Vec<(String, String)>,
    },
    /// Add a parameter that the dictionary does not define yet
    Insert {
        category: ParameterCategory,
        #[arg(long)]
        region: Option<Region>,
        #[arg(value_parser = parse_assignment)]
        value: (String, String),
    },
    /// Generate the mesh and split it into regions
    Meshify,
    /// Clean and compile the solver
    Build,
    /// Run the solver on the Case
    Run,
    /// Create a new project from a template directory (needs --module)
    Create {
        name: String,
        /// Directory with one template tree per module
        #[arg(long)]
        templates: Option<PathBuf>,
    },
}

fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected `field=value`, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing field name in `{raw}`"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Find the typed library error behind `err`, if any.
pub(crate) fn failure_kind(err: &anyhow::Error) -> Option<FailureKind> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<ParamError>() {
            Some(e.failure_kind())
        } else if let Some(e) = cause.downcast_ref::<ProcessError>() {
            Some(e.failure_kind())
        } else {
            cause.downcast_ref::<ProjectError>().map(ProjectError::failure_kind)
        }
    })
}

/// Run the selected subcommand and return the process exit code.
pub async fn run(args: Cli) -> Result<i32> {
    let settings = config::load(args.config.as_deref()).context("failed to load settings")?;
    let (out_tx, out_handle) = spawn_output_writer();
    let res = dispatch(&args, &settings, &out_tx).await;
    drop(out_tx);
    let _ = out_handle.await;
    res
}

async fn dispatch(
    args: &Cli,
    settings: &Settings,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<i32> {
    match &args.command {
        Command::Create { name, templates } => {
            let module = args
                .module
                .ok_or_else(|| anyhow!("--module is required to create a project"))?;
            let templates = templates
                .clone()
                .or_else(|| settings.templates_dir.clone())
                .ok_or_else(|| anyhow!("no template directory given (--templates)"))?;
            let project = Project::create(
                &DirectoryTemplates::new(templates),
                &args.project,
                name,
                module,
            )?;
            emit(out_tx, args.json, &project, || {
                vec![format!("Created: {}", project.root.display())]
            })?;
            Ok(0)
        }
        Command::Info => {
            let project = open_project(args)?;
            let times = project.time_directories()?;
            if args.json {
                let info = serde_json::json!({ "project": project, "result_times": times });
                let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(&info)?));
            } else {
                for line in crate::text_summary::build_info_summary(&project, &times).lines {
                    let _ = out_tx.send(OutputLine::Stdout(line));
                }
            }
            Ok(0)
        }
        Command::Get { category, region } => {
            let manager = ParameterManager::for_project(&open_project(args)?);
            let fields = manager.load(*category, *region)?;
            emit(out_tx, args.json, &fields, || {
                crate::text_summary::build_parameter_summary(*category, *region, &fields).lines
            })?;
            Ok(0)
        }
        Command::Set {
            category,
            region,
            values,
        } => {
            let manager = ParameterManager::for_project(&open_project(args)?);
            let mut fields = FieldMap::new();
            for (name, raw) in values {
                fields.insert(name.clone(), typed_value(&manager, *category, *region, name, raw)?);
            }
            let written = manager.save(*category, *region, &fields)?;
            emit(out_tx, args.json, &written, || {
                if written.is_empty() {
                    vec!["No changes".to_string()]
                } else {
                    written
                        .iter()
                        .map(|p| format!("Updated: {}", p.display()))
                        .collect()
                }
            })?;
            Ok(0)
        }
        Command::Insert {
            category,
            region,
            value: (name, raw),
        } => {
            let manager = ParameterManager::for_project(&open_project(args)?);
            let value = typed_value(&manager, *category, *region, name, raw)?;
            let path = manager.insert(*category, *region, name, &value)?;
            emit(out_tx, args.json, &path, || {
                vec![format!("Inserted {name} into {}", path.display())]
            })?;
            Ok(0)
        }
        Command::Meshify => run_operation(args, settings, out_tx, Operation::Meshify).await,
        Command::Build => run_operation(args, settings, out_tx, Operation::Build).await,
        Command::Run => run_operation(args, settings, out_tx, Operation::Run).await,
    }
}

/// Print `value` as pretty JSON, or the text lines from `text`.
fn emit<T, F>(
    out_tx: &mpsc::UnboundedSender<OutputLine>,
    json: bool,
    value: &T,
    text: F,
) -> Result<()>
where
    T: serde::Serialize,
    F: FnOnce() -> Vec<String>,
{
    if json {
        let out = serde_json::to_string_pretty(value)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else {
        for line in text() {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    Ok(())
}

fn open_project(args: &Cli) -> Result<Project> {
    let root = args
        .project
        .canonicalize()
        .with_context(|| format!("cannot access {}", args.project.display()))?;
    match Project::open(&root) {
        Ok(project) => {
            if let Some(module) = args.module {
                if module != project.module {
                    bail!(
                        "--module {module} does not match the project's {} Case",
                        project.module
                    );
                }
            }
            Ok(project)
        }
        Err(ProjectError::NotAProject { .. }) if args.module.is_some() => {
            let module = args.module.ok_or_else(|| anyhow!("--module is required"))?;
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| anyhow!("{} has no directory name", root.display()))?;
            Ok(Project::new(root, module, name))
        }
        Err(e) => Err(e.into()),
    }
}

/// Parse `raw` with the field's schema so integers stay integers.
fn typed_value(
    manager: &ParameterManager,
    category: ParameterCategory,
    region: Option<Region>,
    name: &str,
    raw: &str,
) -> Result<ParamValue> {
    let spec = manager.field(category, region, name)?;
    Ok(spec.parse_input(raw)?)
}

fn solver_manager(args: &Cli, settings: &Settings) -> SolverManager {
    let controller = ProcessController::new(ProcessSettings {
        output_buffer_lines: settings.output_buffer_lines,
    });
    let toolchain = Toolchain {
        tool_dir: args.tool_dir.clone().or_else(|| settings.tool_dir.clone()),
        user_app_dir: args
            .user_app_dir
            .clone()
            .or_else(|| settings.user_app_dir.clone()),
        openfoam_bashrc: args
            .openfoam_bashrc
            .clone()
            .or_else(|| settings.openfoam_bashrc.clone()),
    };
    let grace = args.grace.map(Duration::from).unwrap_or(settings.grace_timeout);
    SolverManager::new(controller, toolchain, grace)
}

async fn run_operation(
    args: &Cli,
    settings: &Settings,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
    operation: Operation,
) -> Result<i32> {
    let project = open_project(args)?;
    let solver = solver_manager(args, settings);
    let terminal = TerminalId::new(operation.to_string());

    let outcome =
        orchestrator::run_sequence(&solver, &project, operation, &terminal, out_tx, args.json)
            .await?;
    let messages = orchestrator::process_sequence_completion(&project, operation, &outcome);

    if args.json {
        let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(&outcome)?));
    } else {
        for line in crate::text_summary::build_outcome_summary(&outcome).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
        for message in messages {
            let _ = out_tx.send(OutputLine::Stderr(message));
        }
    }

    Ok(match &outcome {
        SequenceOutcome::Completed { .. } => 0,
        SequenceOutcome::Aborted {
            state: SessionState::Killed,
            ..
        } => EXIT_INTERRUPTED,
        SequenceOutcome::Aborted { .. } => {
            if let Some(kind) = outcome.failure_kind() {
                let _ = out_tx.send(OutputLine::Stderr(kind.remediation().to_string()));
            }
            1
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Ds_value=3.9e-14", Ok(("Ds_value", "3.9e-14")))]
    #[case(" endTime = 3600 ", Ok(("endTime", "3600")))]
    #[case("Cs.relTol=0.1", Ok(("Cs.relTol", "0.1")))]
    #[case("radius", Err(()))]
    #[case("=5", Err(()))]
    fn assignments(#[case] raw: &str, #[case] expected: Result<(&str, &str), ()>) {
        let parsed = parse_assignment(raw);
        match expected {
            Ok((name, value)) => {
                assert_eq!(parsed, Ok((name.to_string(), value.to_string())))
            }
            Err(()) => assert!(parsed.is_err()),
        }
    }

    #[test]
    fn subcommands_parse_with_global_flags() {
        let cli = Cli::try_parse_from([
            "battery-foam",
            "set",
            "material",
            "--region",
            "anode",
            "Cs_max=51554",
            "--project",
            "/work/cell",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.project, PathBuf::from("/work/cell"));
        match cli.command {
            Command::Set {
                category, region, values,
            } => {
                assert_eq!(category, ParameterCategory::Material);
                assert_eq!(region, Some(Region::Anode));
                assert_eq!(values, [("Cs_max".to_string(), "51554".to_string())]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn failure_kind_is_found_through_context() {
        let err = anyhow::Error::new(ParamError::Validation {
            field: "radius".into(),
            constraint: "must be > 0".into(),
        })
        .context("saving geometry");
        assert_eq!(failure_kind(&err), Some(FailureKind::Input));
        assert_eq!(failure_kind(&anyhow!("plain")), None);
    }
}
