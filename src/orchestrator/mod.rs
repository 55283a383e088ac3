//! Application-level orchestration utilities.
//!
//! This module drives a solver sequence to completion or cancellation and
//! inspects what it produced. The CLI layer calls into it for the
//! long-running subcommands.

mod controller;
mod post_process;

pub(crate) use controller::{run_sequence, Operation};
pub(crate) use post_process::process_sequence_completion;
