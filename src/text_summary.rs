//! Text summary builder for CLI output.
//!
//! Formats projects, parameter sets and sequence outcomes as human-readable
//! lines for text mode.

use battery_foam::model::{FieldMap, ParameterCategory, Region, SessionState};
use battery_foam::{Project, SequenceOutcome};
use std::path::PathBuf;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

pub(crate) fn build_info_summary(project: &Project, times: &[PathBuf]) -> TextSummary {
    let mut lines = vec![
        format!("Project: {}", project.name),
        format!(
            "Module: {} ({})",
            project.module,
            project.module.description()
        ),
        format!("Case: {}", project.case_dir().display()),
        format!("Solver source: {}", project.solver_dir.display()),
        format!("Solver binary: {}", project.solver_binary()),
    ];
    let regions: Vec<String> = project.module.regions().iter().map(|r| r.to_string()).collect();
    lines.push(format!("Regions: {}", regions.join(", ")));

    let names: Vec<String> = times
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect();
    match names.last() {
        Some(latest) => lines.push(format!(
            "Results: {} time(s), latest {latest}",
            names.len()
        )),
        None => lines.push("Results: none".into()),
    }
    TextSummary { lines }
}

/// One `name = value` line per field, with a header naming the scope.
pub(crate) fn build_parameter_summary(
    category: ParameterCategory,
    region: Option<Region>,
    fields: &FieldMap,
) -> TextSummary {
    let header = match region {
        Some(region) => format!("[{category}] {region}"),
        None => format!("[{category}]"),
    };
    let width = fields.keys().map(String::len).max().unwrap_or(0);
    let mut lines = Vec::with_capacity(fields.len() + 1);
    lines.push(header);
    for (name, value) in fields {
        lines.push(format!("  {name:<width$} = {value}"));
    }
    TextSummary { lines }
}

pub(crate) fn build_outcome_summary(outcome: &SequenceOutcome) -> TextSummary {
    let line = match outcome {
        SequenceOutcome::Completed { steps } => format!("Completed {steps} step(s)"),
        SequenceOutcome::Aborted {
            step,
            command,
            state: SessionState::Killed,
            ..
        } => format!("Stopped at step {}: {command}", step + 1),
        SequenceOutcome::Aborted {
            step,
            command,
            state,
            exit_code,
        } => {
            let code = exit_code.map_or_else(|| "-".to_string(), |c| c.to_string());
            format!(
                "Step {} failed: {command} ({state:?}, exit code {code})",
                step + 1
            )
        }
    };
    TextSummary { lines: vec![line] }
}

#[cfg(test)]
mod tests {
    use super::*;
    use battery_foam::model::{ModuleType, ParamValue};

    #[test]
    fn parameters_are_aligned_under_their_scope() {
        let mut fields = FieldMap::new();
        fields.insert("Cs_max".into(), ParamValue::Scalar(51554.0));
        fields.insert("alphaA".into(), ParamValue::Scalar(0.5));
        let summary =
            build_parameter_summary(ParameterCategory::Material, Some(Region::Anode), &fields);
        assert_eq!(
            summary.lines,
            ["[material] anode", "  Cs_max = 51554", "  alphaA = 0.5"]
        );
    }

    #[test]
    fn failed_step_reports_exit_code() {
        let outcome = SequenceOutcome::Aborted {
            step: 1,
            command: "wmake".into(),
            state: SessionState::Failed,
            exit_code: Some(2),
        };
        assert_eq!(
            build_outcome_summary(&outcome).lines,
            ["Step 2 failed: wmake (Failed, exit code 2)"]
        );
    }

    #[test]
    fn info_without_results() {
        let project = Project::new("/work/cell", ModuleType::FullCell, "cell");
        let summary = build_info_summary(&project, &[]);
        assert!(summary.lines.contains(&"Regions: anode, sep, cathode".to_string()));
        assert_eq!(summary.lines.last().map(String::as_str), Some("Results: none"));
    }
}
