use crate::error::ParamError;
use crate::model::{FieldMap, ModuleType, ParamValue, ParameterCategory, Region};
use crate::params::codec::ParameterCodec;
use crate::params::schema::{self, DictKind, FieldSpec, FileRoot, Scope};
use crate::project::Project;
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, Level};

/// Typed, validated access to every parameter file of one project's Case.
///
/// The dictionary files are the only persisted state: every `load` re-reads
/// them and every `save` is a read-modify-write. Fields kept in the solver
/// source (the open-circuit-voltage model) are only available once a solver
/// directory is known.
#[derive(Debug, Clone)]
pub struct ParameterManager {
    case_dir: PathBuf,
    solver_dir: Option<PathBuf>,
    module: ModuleType,
}

impl ParameterManager {
    pub fn new(case_dir: impl Into<PathBuf>, module: ModuleType) -> Self {
        Self {
            case_dir: case_dir.into(),
            solver_dir: None,
            module,
        }
    }

    pub fn with_solver_dir(mut self, solver_dir: impl Into<PathBuf>) -> Self {
        self.solver_dir = Some(solver_dir.into());
        self
    }

    pub fn for_project(project: &Project) -> Self {
        Self::new(project.case_dir(), project.module).with_solver_dir(&project.solver_dir)
    }

    pub fn module(&self) -> ModuleType {
        self.module
    }

    pub fn case_dir(&self) -> &Path {
        &self.case_dir
    }

    /// Schema of `field` within a category, e.g. to interpret user input.
    pub fn field(
        &self,
        category: ParameterCategory,
        region: Option<Region>,
        field: &str,
    ) -> Result<FieldSpec, ParamError> {
        schema::check_region(self.module, category, region)?;
        let (_, spec) = self.locate(category, region, field)?;
        Ok(spec)
    }

    /// Read every field of a category.
    ///
    /// # Panics
    ///
    /// Panics if two files backing the same category define the same field
    /// name; the file layout guarantees they are disjoint.
    #[tracing::instrument(level = Level::DEBUG, skip(self))]
    pub fn load(
        &self,
        category: ParameterCategory,
        region: Option<Region>,
    ) -> Result<FieldMap, ParamError> {
        schema::check_region(self.module, category, region)?;
        self.read_category(category, region, false)
    }

    fn read_category(
        &self,
        category: ParameterCategory,
        region: Option<Region>,
        skip_missing: bool,
    ) -> Result<FieldMap, ParamError> {
        let mut merged = FieldMap::new();
        for (kind, path) in self.files(category, region) {
            let text = match read_file(&path) {
                Err(ParamError::MissingFile { .. }) if skip_missing => {
                    debug!(path = %path.display(), "absent, skipped");
                    continue;
                }
                other => other?,
            };
            let fields = ParameterCodec::new(kind)
                .parse(&text)
                .map_err(|e| ParamError::from_codec(path.clone(), e))?;
            debug!(path = %path.display(), fields = fields.len(), "parsed");
            for (name, value) in fields {
                let previous = merged.insert(name.clone(), value);
                assert!(
                    previous.is_none(),
                    "field `{name}` is defined by more than one {category} file"
                );
            }
        }
        Ok(merged)
    }

    /// Every category that applies to `region`, keyed by category.
    ///
    /// Global categories are always included; region-scoped ones only when a
    /// region is given.
    pub fn load_all(
        &self,
        region: Option<Region>,
    ) -> Result<BTreeMap<ParameterCategory, FieldMap>, ParamError> {
        let mut all = BTreeMap::new();
        for category in ParameterCategory::ALL {
            let region = match schema::scope(category) {
                Scope::Global => None,
                Scope::Region if region.is_none() => continue,
                Scope::Region | Scope::Either => region,
            };
            all.insert(category, self.load(category, region)?);
        }
        Ok(all)
    }

    /// Validate and write `fields`, returning the files that changed.
    ///
    /// Nothing is written unless every value passes validation. Each file is
    /// replaced atomically once all of its fields were applied; when a later
    /// file fails, files already replaced stay replaced.
    ///
    /// Rules spanning several fields see the stored values of the files that
    /// exist; a rule with one side in an absent file is not checked.
    #[tracing::instrument(level = Level::DEBUG, skip(self))]
    pub fn save(
        &self,
        category: ParameterCategory,
        region: Option<Region>,
        fields: &FieldMap,
    ) -> Result<Vec<PathBuf>, ParamError> {
        schema::check_region(self.module, category, region)?;

        let files = self.files(category, region);
        let mut per_file: Vec<Vec<(&str, &ParamValue)>> = vec![Vec::new(); files.len()];
        for (name, value) in fields {
            let (index, spec) = self.locate(category, region, name)?;
            spec.validate(value)?;
            per_file[index].push((name.as_str(), value));
        }
        if matches!(
            category,
            ParameterCategory::Geometry | ParameterCategory::Control
        ) {
            let mut merged = self.read_category(category, region, true)?;
            merged.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            schema::validate_cross_field(category, &merged, fields)?;
        }

        let mut written = Vec::new();
        for ((kind, path), updates) in files.into_iter().zip(per_file) {
            if updates.is_empty() {
                continue;
            }
            let original = read_file(&path)?;
            let codec = ParameterCodec::new(kind);
            let mut text = original.clone();
            for (name, value) in updates {
                text = codec
                    .update(&text, name, value)
                    .map_err(|e| ParamError::from_codec(path.clone(), e))?;
            }
            if text == original {
                debug!(path = %path.display(), "unchanged, not rewritten");
                continue;
            }
            write_atomic(&path, &text)?;
            info!(path = %path.display(), "parameters saved");
            written.push(path);
        }
        Ok(written)
    }

    /// Add a field that the file does not define yet.
    #[tracing::instrument(level = Level::DEBUG, skip(self))]
    pub fn insert(
        &self,
        category: ParameterCategory,
        region: Option<Region>,
        field: &str,
        value: &ParamValue,
    ) -> Result<PathBuf, ParamError> {
        schema::check_region(self.module, category, region)?;
        let (index, spec) = self.locate(category, region, field)?;
        spec.validate(value)?;
        let (kind, path) = self.files(category, region).swap_remove(index);
        let text = read_file(&path)?;
        let text = ParameterCodec::new(kind)
            .insert(&text, field, value)
            .map_err(|e| ParamError::from_codec(path.clone(), e))?;
        write_atomic(&path, &text)?;
        info!(path = %path.display(), field, "parameter inserted");
        Ok(path)
    }

    /// The files behind a category, resolved against the Case or solver
    /// directory. Solver files are left out when no solver directory is known.
    fn files(&self, category: ParameterCategory, region: Option<Region>) -> Vec<(DictKind, PathBuf)> {
        schema::bindings(category, region)
            .into_iter()
            .filter_map(|binding| {
                let root = match binding.root {
                    FileRoot::Case => &self.case_dir,
                    FileRoot::Solver => self.solver_dir.as_ref()?,
                };
                Some((binding.kind, root.join(&binding.path)))
            })
            .collect()
    }

    /// Index of the file owning `field` among the category's files.
    fn locate(
        &self,
        category: ParameterCategory,
        region: Option<Region>,
        field: &str,
    ) -> Result<(usize, FieldSpec), ParamError> {
        self.files(category, region)
            .iter()
            .enumerate()
            .find_map(|(i, (kind, _))| kind.resolve(field).map(|spec| (i, spec)))
            .ok_or_else(|| {
                ParamError::validation(field, format!("not a known {category} parameter"))
            })
    }
}

fn read_file(path: &Path) -> Result<String, ParamError> {
    fs::read_to_string(path).map_err(|source| match source.kind() {
        ErrorKind::NotFound => ParamError::MissingFile {
            path: path.to_path_buf(),
        },
        _ => ParamError::Io {
            path: path.to_path_buf(),
            source,
        },
    })
}

/// Write through a sibling temporary file and rename it over `path`.
fn write_atomic(path: &Path, contents: &str) -> Result<(), ParamError> {
    let io = |source| ParamError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(io)?;
    tmp.write_all(contents.as_bytes()).map_err(io)?;
    if let Ok(meta) = fs::metadata(path) {
        tmp.as_file().set_permissions(meta.permissions()).map_err(io)?;
    }
    tmp.persist(path).map_err(|e| io(e.error))?;
    Ok(())
}
