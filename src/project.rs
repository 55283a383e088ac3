//! On-disk project layout: `<root>/<name>/` holds the solver source and
//! `<root>/Case/` the OpenFOAM case.

use crate::error::ProjectError;
use crate::model::ModuleType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{info, warn};

pub const CASE_DIR: &str = "Case";

static PROJECT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_]+$").unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

static MAKE_EXE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*EXE\s*=\s*(?:\S*/)?(\w+)\s*$")
        .unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

/// Materializes a module's template tree into a new project directory.
pub trait TemplateStore {
    /// Create `dest` with the full template contents for `module`.
    fn instantiate(&self, module: ModuleType, dest: &Path) -> io::Result<()>;
}

/// Templates stored as plain directories named after each module
/// (`<root>/single-particle`, `<root>/half-cell`, `<root>/full-cell`).
#[derive(Debug, Clone)]
pub struct DirectoryTemplates {
    root: PathBuf,
}

impl DirectoryTemplates {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TemplateStore for DirectoryTemplates {
    fn instantiate(&self, module: ModuleType, dest: &Path) -> io::Result<()> {
        copy_tree(&self.root.join(module.to_string()), dest)
    }
}

fn copy_tree(src: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub root: PathBuf,
    pub module: ModuleType,
    pub name: String,
    /// Solver source directory, the one holding `Make/files`.
    pub solver_dir: PathBuf,
}

impl Project {
    pub fn new(root: impl Into<PathBuf>, module: ModuleType, name: impl Into<String>) -> Self {
        let root = root.into();
        let name = name.into();
        Self {
            solver_dir: root.join(&name),
            root,
            module,
            name,
        }
    }

    pub fn case_dir(&self) -> PathBuf {
        self.root.join(CASE_DIR)
    }

    pub fn validate_name(name: &str) -> Result<(), ProjectError> {
        if PROJECT_NAME.is_match(name) {
            Ok(())
        } else {
            Err(ProjectError::InvalidName {
                name: name.to_string(),
            })
        }
    }

    /// Open an existing project, telling its module from the region
    /// directories under `Case/constant`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ProjectError> {
        let root = root.into();
        let not_a_project = |reason: &str| ProjectError::NotAProject {
            path: root.clone(),
            reason: reason.to_string(),
        };
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| not_a_project("the path has no final component"))?;

        let constant = root.join(CASE_DIR).join("constant");
        if !constant.is_dir() {
            return Err(not_a_project("missing Case/constant"));
        }
        let matching: Vec<ModuleType> = ModuleType::ALL
            .into_iter()
            .filter(|m| m.regions().iter().all(|r| constant.join(r.dir_name()).is_dir()))
            .collect();
        let module = match matching.as_slice() {
            [module] => *module,
            [] => return Err(not_a_project("the region directories match no module")),
            _ => return Err(not_a_project("the region directories match several modules")),
        };

        let preferred = root.join(&name);
        let solver_dir = if preferred.join("Make").join("files").is_file() {
            preferred
        } else {
            find_solver_dir(&root)
                .map_err(|source| ProjectError::Io {
                    path: root.clone(),
                    source,
                })?
                .ok_or_else(|| not_a_project("no solver source directory with Make/files"))?
        };

        Ok(Self {
            root,
            module,
            name,
            solver_dir,
        })
    }

    /// Create `<parent>/<name>` from the module's template.
    ///
    /// The template's solver directory is renamed to the project name and
    /// `Make/files` is rewritten so the built binary carries that name. A
    /// partially created directory is removed on failure.
    pub fn create(
        store: &dyn TemplateStore,
        parent: &Path,
        name: &str,
        module: ModuleType,
    ) -> Result<Self, ProjectError> {
        Self::validate_name(name)?;
        let root = parent.join(name);
        if root.exists() {
            return Err(ProjectError::AlreadyExists { path: root });
        }

        let result = store
            .instantiate(module, &root)
            .map_err(|source| ProjectError::Template { module, source })
            .and_then(|()| Self::adopt_template(&root, name, module));
        if let Err(e) = result {
            if root.exists() {
                if let Err(cleanup) = fs::remove_dir_all(&root) {
                    warn!(path = %root.display(), error = %cleanup, "could not remove partial project");
                }
            }
            return Err(e);
        }
        info!(path = %root.display(), %module, "project created");
        Ok(Self::new(root, module, name))
    }

    fn adopt_template(root: &Path, name: &str, module: ModuleType) -> Result<(), ProjectError> {
        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| ProjectError::Io { path, source }
        };
        let template_solver = root.join(module.solver_name());
        let solver_dir = root.join(name);
        if template_solver.is_dir() && template_solver != solver_dir {
            fs::rename(&template_solver, &solver_dir).map_err(io_error(&template_solver))?;
        }
        let make_files = solver_dir.join("Make").join("files");
        if make_files.is_file() {
            let text = fs::read_to_string(&make_files).map_err(io_error(&make_files))?;
            let text = text.replace(module.solver_name(), name);
            fs::write(&make_files, text).map_err(io_error(&make_files))?;
        }
        Ok(())
    }

    /// Name of the binary `wmake` produces, from the `EXE` line of `Make/files`.
    pub fn solver_binary(&self) -> String {
        fs::read_to_string(self.solver_dir.join("Make").join("files"))
            .ok()
            .and_then(|text| MAKE_EXE.captures(&text).map(|c| c[1].to_string()))
            .unwrap_or_else(|| self.module.solver_name().to_string())
    }

    /// Written result times in the Case, sorted by time. The initial `0`
    /// directory is not a result.
    pub fn time_directories(&self) -> Result<Vec<PathBuf>, ProjectError> {
        let case = self.case_dir();
        let entries = fs::read_dir(&case).map_err(|source| ProjectError::Io {
            path: case.clone(),
            source,
        })?;
        let mut times: Vec<(f64, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|e| {
                let time: f64 = e.file_name().to_str()?.parse().ok()?;
                (time.is_finite() && time > 0.0).then(|| (time, e.path()))
            })
            .collect();
        times.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(times.into_iter().map(|(_, path)| path).collect())
    }
}

fn find_solver_dir(root: &Path) -> io::Result<Option<PathBuf>> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.join("Make").join("files").is_file())
        .collect();
    candidates.sort();
    Ok(candidates.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::tempdir;

    /// Writes a minimal template the way the shipped ones are laid out.
    struct FakeTemplates;

    impl TemplateStore for FakeTemplates {
        fn instantiate(&self, module: ModuleType, dest: &Path) -> io::Result<()> {
            let make = dest.join(module.solver_name()).join("Make");
            fs::create_dir_all(&make)?;
            fs::write(
                make.join("files"),
                format!("{0}.C\n\nEXE = $(FOAM_USER_APPBIN)/{0}\n", module.solver_name()),
            )?;
            for region in module.regions() {
                fs::create_dir_all(dest.join(CASE_DIR).join("constant").join(region.dir_name()))?;
            }
            Ok(())
        }
    }

    struct BrokenTemplates;

    impl TemplateStore for BrokenTemplates {
        fn instantiate(&self, _: ModuleType, dest: &Path) -> io::Result<()> {
            fs::create_dir_all(dest)?;
            Err(io::Error::other("template archive truncated"))
        }
    }

    #[rstest]
    #[case("cell_01", true)]
    #[case("my project", false)]
    #[case("../escape", false)]
    #[case("", false)]
    fn project_names(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(Project::validate_name(name).is_ok(), ok);
    }

    #[test]
    fn create_renames_solver_and_rewrites_make_files() {
        let dir = tempdir().unwrap();
        let project =
            Project::create(&FakeTemplates, dir.path(), "anode_study", ModuleType::FullCell).unwrap();
        assert_eq!(project.solver_dir, dir.path().join("anode_study/anode_study"));
        assert_eq!(project.solver_binary(), "anode_study");
        assert!(!dir.path().join("anode_study/fullCellFoam_OF6").exists());

        let reopened = Project::open(dir.path().join("anode_study")).unwrap();
        assert_eq!(reopened, project);
    }

    #[test]
    fn create_refuses_existing_destination() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("taken")).unwrap();
        let err = Project::create(&FakeTemplates, dir.path(), "taken", ModuleType::HalfCell)
            .unwrap_err();
        assert!(matches!(err, ProjectError::AlreadyExists { .. }));
    }

    #[test]
    fn failed_template_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let err = Project::create(&BrokenTemplates, dir.path(), "partial", ModuleType::HalfCell)
            .unwrap_err();
        assert!(matches!(err, ProjectError::Template { .. }));
        assert!(!dir.path().join("partial").exists());
    }

    #[test]
    fn open_rejects_plain_directories() {
        let dir = tempdir().unwrap();
        let err = Project::open(dir.path()).unwrap_err();
        assert!(matches!(err, ProjectError::NotAProject { .. }));
    }

    #[test]
    fn time_directories_are_numeric_and_sorted() {
        let dir = tempdir().unwrap();
        let project = Project::new(dir.path(), ModuleType::SingleParticle, "spm");
        for name in ["0", "10", "2.5", "constant", "100"] {
            fs::create_dir_all(project.case_dir().join(name)).unwrap();
        }
        let times: Vec<_> = project
            .time_directories()
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(times, ["2.5", "10", "100"]);
    }

    #[test]
    fn solver_binary_falls_back_to_module_default() {
        let dir = tempdir().unwrap();
        let project = Project::new(dir.path(), ModuleType::HalfCell, "hc");
        assert_eq!(project.solver_binary(), "halfCellFoam_OF6");
    }
}
