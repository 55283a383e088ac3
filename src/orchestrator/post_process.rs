//! Post-sequence checks.
//!
//! Looks at what a successful sequence left in the project so the front end
//! can tell the user where the mesh, binary or results ended up.

use super::Operation;
use battery_foam::{Project, SequenceOutcome};
use tracing::warn;

/// Messages describing the artifacts of a finished sequence.
pub(crate) fn process_sequence_completion(
    project: &Project,
    operation: Operation,
    outcome: &SequenceOutcome,
) -> Vec<String> {
    if !outcome.is_success() {
        return Vec::new();
    }
    let mut messages = Vec::new();
    match operation {
        Operation::Meshify => {
            let constant = project.case_dir().join("constant");
            let missing: Vec<String> = project
                .module
                .regions()
                .iter()
                .filter(|r| !constant.join(r.dir_name()).join("polyMesh").is_dir())
                .map(|r| r.to_string())
                .collect();
            if missing.is_empty() {
                messages.push(format!(
                    "Mesh written for {} region(s)",
                    project.module.regions().len()
                ));
            } else {
                messages.push(format!("No mesh found for: {}", missing.join(", ")));
            }
        }
        Operation::Build => {
            messages.push(format!("Built solver: {}", project.solver_binary()));
        }
        Operation::Run => match project.time_directories() {
            Ok(times) => match times.last().and_then(|p| p.file_name()) {
                Some(latest) => messages.push(format!(
                    "Results: {} time(s), latest {}",
                    times.len(),
                    latest.to_string_lossy()
                )),
                None => messages.push("The solver wrote no result times".into()),
            },
            Err(e) => warn!(error = %e, "could not list result times"),
        },
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use battery_foam::model::ModuleType;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn run_reports_latest_time() {
        let dir = tempdir().unwrap();
        let project = Project::new(dir.path(), ModuleType::SingleParticle, "spm");
        for time in ["0", "50", "100"] {
            fs::create_dir_all(project.case_dir().join(time)).unwrap();
        }
        let messages = process_sequence_completion(
            &project,
            Operation::Run,
            &SequenceOutcome::Completed { steps: 1 },
        );
        assert_eq!(messages, ["Results: 2 time(s), latest 100"]);
    }

    #[test]
    fn meshify_names_regions_without_mesh() {
        let dir = tempdir().unwrap();
        let project = Project::new(dir.path(), ModuleType::HalfCell, "hc");
        let constant = project.case_dir().join("constant");
        fs::create_dir_all(constant.join("WE/polyMesh")).unwrap();
        let messages = process_sequence_completion(
            &project,
            Operation::Meshify,
            &SequenceOutcome::Completed { steps: 3 },
        );
        assert_eq!(messages, ["No mesh found for: sep"]);
    }
}
