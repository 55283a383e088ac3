//! Parameter synchronization and solver orchestration for OpenFOAM battery
//! simulations.
//!
//! [`params::ParameterManager`] reads and writes typed, validated parameters
//! in a project's case dictionaries. [`process::ProcessController`] runs
//! external commands per terminal slot and streams their output, and
//! [`solver::SolverManager`] composes it into the mesh, build and run
//! sequences of each module.

pub mod error;
pub mod model;
pub mod params;
pub mod process;
pub mod project;
pub mod solver;

pub use error::{CodecError, FailureKind, ParamError, ProcessError, ProjectError};
pub use params::{ParameterCodec, ParameterManager};
pub use process::{ProcessController, ProcessSettings, SessionHandle};
pub use project::{DirectoryTemplates, Project, TemplateStore};
pub use solver::{SequenceOutcome, SolverManager, Toolchain};
