//! Field schemas and the case layout backing each parameter category.

use crate::error::ParamError;
use crate::model::{FieldMap, ModuleType, ParamValue, ParameterCategory, Region};
use crate::params::dictionary::Dictionary;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Scalar,
    Integer,
    Choice(&'static [&'static str]),
}

impl FieldKind {
    pub fn describe(self) -> &'static str {
        match self {
            FieldKind::Scalar => "a number",
            FieldKind::Integer => "an integer",
            FieldKind::Choice(_) => "a word",
        }
    }
}

/// Where a field's literal lives inside its dictionary.
#[derive(Debug, Clone, PartialEq)]
pub enum Locator {
    /// `keyword [dims] literal;` reached through nested dictionaries.
    Entry(Vec<String>),
    /// The single entry with this keyword anywhere in the file.
    Anywhere(String),
    /// Extent of the vertex list along one axis.
    Extent(Axis),
    /// One component of the `hex` block's cell-count vector.
    Division(Axis),
    /// `convertToMeters`, exposed as a named length unit.
    LengthUnit,
    /// The one `#include "OCV_<model>.H"` line of a group that is not
    /// commented out.
    ActiveInclude,
}

impl Locator {
    fn entry(path: &[&str]) -> Self {
        Locator::Entry(path.iter().map(|s| s.to_string()).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constraint {
    Finite,
    Positive,
    NonNegative,
    /// Strictly between 0 and 1.
    OpenUnit,
    /// `0 <= v < 1`.
    HalfOpenUnit,
    /// `0 < v <= 1`.
    Fraction,
    AtLeast(i64),
}

impl Constraint {
    fn check(self, v: f64) -> Result<(), String> {
        if !v.is_finite() {
            return Err("must be a finite number".into());
        }
        let ok = match self {
            Constraint::Finite => true,
            Constraint::Positive => v > 0.0,
            Constraint::NonNegative => v >= 0.0,
            Constraint::OpenUnit => v > 0.0 && v < 1.0,
            Constraint::HalfOpenUnit => (0.0..1.0).contains(&v),
            Constraint::Fraction => v > 0.0 && v <= 1.0,
            Constraint::AtLeast(min) => v >= min as f64,
        };
        if ok {
            Ok(())
        } else {
            Err(self.to_string())
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Finite => f.write_str("must be a finite number"),
            Constraint::Positive => f.write_str("must be greater than 0"),
            Constraint::NonNegative => f.write_str("must not be negative"),
            Constraint::OpenUnit => f.write_str("must be strictly between 0 and 1"),
            Constraint::HalfOpenUnit => f.write_str("must be at least 0 and less than 1"),
            Constraint::Fraction => f.write_str("must be greater than 0 and at most 1"),
            Constraint::AtLeast(min) => write!(f, "must be at least {min}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub locator: Locator,
    /// Dimension set written when the field is inserted for the first time.
    pub dimensions: Option<&'static str>,
    pub constraint: Constraint,
}

impl FieldSpec {
    fn new(name: &str, kind: FieldKind, locator: Locator, constraint: Constraint) -> Self {
        Self {
            name: name.to_string(),
            kind,
            locator,
            dimensions: None,
            constraint,
        }
    }

    fn with_dimensions(mut self, dims: &'static str) -> Self {
        self.dimensions = Some(dims);
        self
    }

    /// Type and range check for a single value.
    pub fn validate(&self, value: &ParamValue) -> Result<(), ParamError> {
        match (self.kind, value) {
            (FieldKind::Choice(options), ParamValue::Word(w)) => {
                if options.contains(&w.as_str()) {
                    Ok(())
                } else {
                    Err(ParamError::validation(
                        &self.name,
                        format!("must be one of: {}", options.join(", ")),
                    ))
                }
            }
            (FieldKind::Integer, ParamValue::Integer(v)) => self
                .constraint
                .check(*v as f64)
                .map_err(|c| ParamError::validation(&self.name, c)),
            (FieldKind::Scalar, ParamValue::Scalar(_) | ParamValue::Integer(_)) => {
                let v = value.as_f64().unwrap_or(f64::NAN);
                self.constraint
                    .check(v)
                    .map_err(|c| ParamError::validation(&self.name, c))
            }
            (kind, _) => Err(ParamError::validation(
                &self.name,
                format!("expected {}", kind.describe()),
            )),
        }
    }

    /// Interpret user text (e.g. from a command line) according to the field's kind.
    pub fn parse_input(&self, raw: &str) -> Result<ParamValue, ParamError> {
        let raw = raw.trim();
        match self.kind {
            FieldKind::Scalar => raw
                .parse::<f64>()
                .map(ParamValue::Scalar)
                .map_err(|_| ParamError::validation(&self.name, "expected a number")),
            FieldKind::Integer => raw
                .parse::<i64>()
                .map(ParamValue::Integer)
                .map_err(|_| ParamError::validation(&self.name, "expected an integer")),
            FieldKind::Choice(_) => Ok(ParamValue::Word(
                raw.split_whitespace().collect::<Vec<_>>().join(" "),
            )),
        }
    }
}

pub const LENGTH_UNITS: &[(&str, f64)] = &[
    ("micrometer", 1e-6),
    ("millimeter", 1e-3),
    ("meter", 1.0),
];

const LENGTH_UNIT_NAMES: &[&str] = &["micrometer", "millimeter", "meter"];

const DDT_SCHEMES: &[&str] = &["Euler", "backward", "localEuler", "steadyState", "none"];
const GRAD_SCHEMES: &[&str] = &["Gauss linear", "Gauss cubic", "leastSquares", "none"];
const DIV_SCHEMES: &[&str] = &["bounded Gauss upwind", "none"];
const LAPLACIAN_SCHEMES: &[&str] = &[
    "Gauss linear uncorrected",
    "Gauss linear corrected",
    "Gauss linear orthogonal",
    "none",
];
const INTERPOLATION_SCHEMES: &[&str] = &["linear", "cubic", "none"];

/// Material coefficients: keyword, default dimension set, constraint.
const MATERIAL_FIELDS: &[(&str, &str, Constraint)] = &[
    ("Ds_value", "[0 2 -1 0 0 0 0]", Constraint::Positive),
    ("Cs_max", "[0 -3 0 0 1 0 0]", Constraint::Positive),
    ("kReact", "[0 1 -1 0 0 0 0]", Constraint::Positive),
    ("R", "[1 2 -2 -1 -1 0 0]", Constraint::Positive),
    ("F", "[0 0 1 0 -1 1 0]", Constraint::Positive),
    ("Ce", "[0 -3 0 0 1 0 0]", Constraint::NonNegative),
    ("alphaA", "[0 0 0 0 0 0 0]", Constraint::OpenUnit),
    ("alphaC", "[0 0 0 0 0 0 0]", Constraint::OpenUnit),
    ("T_temp", "[0 0 0 1 0 0 0]", Constraint::Positive),
    ("I_app", "[0 -2 0 0 0 1 0]", Constraint::Finite),
];

/// Electrochemical coefficients of an electrode's solid potential boundary.
const ELECTROCHEMISTRY_FIELDS: &[(&str, Constraint)] = &[
    ("j0", Constraint::Positive),
    ("cdl", Constraint::Positive),
    ("amf", Constraint::Fraction),
];

/// Name of the field selecting an electrode's open-circuit-voltage model.
pub const OCV_FIELD: &str = "ocv_model";

/// Open-circuit-voltage models of negative electrodes (graphite, silicon).
pub const ANODE_OCV_MODELS: &[&str] = &["Gr", "Si"];

/// Open-circuit-voltage models of positive electrodes.
pub const CATHODE_OCV_MODELS: &[&str] = &["LFP", "NCA", "LionSimba_cathode"];

/// Header of the solver source that includes the open-circuit-voltage model.
const SOLID_SOURCE: &str = "solid/solveSolid.H";

const TOLERANCE_KEYS: &[(&str, Constraint)] = &[
    ("tolerance", Constraint::Positive),
    ("relTol", Constraint::HalfOpenUnit),
];

/// The dictionary formats understood by [`crate::params::ParameterCodec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictKind {
    BlockMesh,
    TopoSet,
    Material,
    InitialCondition,
    /// Separator electrolyte field whose internal value is the porosity.
    Porosity,
    /// Boundary coefficients of the solid potential `fai_s`.
    Electrochemistry,
    /// Solver source choosing one `OCV_<model>.H` among these models.
    OcvSelection(&'static [&'static str]),
    Schemes,
    Tolerances,
    TimeControl,
}

impl DictKind {
    /// Fields with a fixed name in this file format.
    pub fn fields(self) -> Vec<FieldSpec> {
        use Constraint::*;
        use FieldKind::*;
        match self {
            DictKind::BlockMesh => vec![
                FieldSpec::new("length", Scalar, Locator::Extent(Axis::X), Positive),
                FieldSpec::new("width", Scalar, Locator::Extent(Axis::Y), Positive),
                FieldSpec::new("height", Scalar, Locator::Extent(Axis::Z), Positive),
                FieldSpec::new("x_division", Integer, Locator::Division(Axis::X), AtLeast(1)),
                FieldSpec::new("y_division", Integer, Locator::Division(Axis::Y), AtLeast(1)),
                FieldSpec::new("z_division", Integer, Locator::Division(Axis::Z), AtLeast(1)),
                FieldSpec::new("unit", Choice(LENGTH_UNIT_NAMES), Locator::LengthUnit, Finite),
            ],
            DictKind::TopoSet => vec![FieldSpec::new(
                "radius",
                Scalar,
                Locator::Anywhere("radius".into()),
                Positive,
            )],
            DictKind::Material => MATERIAL_FIELDS
                .iter()
                .map(|(name, dims, constraint)| {
                    FieldSpec::new(name, Scalar, Locator::entry(&[*name]), *constraint)
                        .with_dimensions(*dims)
                })
                .collect(),
            DictKind::InitialCondition => vec![FieldSpec::new(
                "initial_concentration",
                Scalar,
                Locator::entry(&["internalField"]),
                NonNegative,
            )],
            DictKind::Porosity => vec![FieldSpec::new(
                "porosity",
                Scalar,
                Locator::entry(&["internalField"]),
                OpenUnit,
            )],
            DictKind::Electrochemistry => ELECTROCHEMISTRY_FIELDS
                .iter()
                .map(|(name, constraint)| {
                    FieldSpec::new(name, Scalar, Locator::Anywhere(name.to_string()), *constraint)
                })
                .collect(),
            DictKind::OcvSelection(models) => vec![FieldSpec::new(
                OCV_FIELD,
                Choice(models),
                Locator::ActiveInclude,
                Finite,
            )],
            DictKind::Schemes => [
                ("ddtSchemes", DDT_SCHEMES),
                ("gradSchemes", GRAD_SCHEMES),
                ("divSchemes", DIV_SCHEMES),
                ("laplacianSchemes", LAPLACIAN_SCHEMES),
                ("interpolationSchemes", INTERPOLATION_SCHEMES),
            ]
            .into_iter()
            .map(|(block, options)| {
                FieldSpec::new(block, Choice(options), Locator::entry(&[block, "default"]), Finite)
            })
            .collect(),
            DictKind::Tolerances => Vec::new(),
            DictKind::TimeControl => ["endTime", "deltaT", "writeInterval"]
                .into_iter()
                .map(|name| FieldSpec::new(name, Scalar, Locator::entry(&[name]), Positive))
                .collect(),
        }
    }

    /// Look up a field by name, including per-solver tolerance fields
    /// named `<solverField>.tolerance` / `<solverField>.relTol`.
    pub fn resolve(self, name: &str) -> Option<FieldSpec> {
        if self == DictKind::Tolerances {
            let (solver, key) = name.rsplit_once('.')?;
            let (key, constraint) = TOLERANCE_KEYS.iter().find(|(k, _)| *k == key)?;
            if solver.is_empty() {
                return None;
            }
            return Some(FieldSpec::new(
                name,
                FieldKind::Scalar,
                Locator::entry(&["solvers", solver, key]),
                *constraint,
            ));
        }
        self.fields().into_iter().find(|f| f.name == name)
    }

    /// Fields present in a parsed file. Only tolerances vary with content.
    pub fn discover(self, dict: &Dictionary<'_>) -> Vec<FieldSpec> {
        if self != DictKind::Tolerances {
            return self.fields();
        }
        let Some(solvers) = dict.find_path(&["solvers"]).pop().and_then(|e| e.entries()) else {
            return Vec::new();
        };
        solvers
            .iter()
            .filter_map(|solver| solver.entries().map(|children| (solver, children)))
            .flat_map(|(solver, children)| {
                TOLERANCE_KEYS
                    .iter()
                    .filter(|(key, _)| children.iter().any(|c| c.keyword == *key))
                    .filter_map(|(key, _)| self.resolve(&format!("{}.{key}", solver.keyword)))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// Directory a [`FileBinding`] path is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRoot {
    Case,
    /// The solver source directory, the one holding `Make/files`.
    Solver,
}

/// A file backing (part of) a category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBinding {
    pub kind: DictKind,
    pub root: FileRoot,
    pub path: PathBuf,
}

impl FileBinding {
    fn new(kind: DictKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            root: FileRoot::Case,
            path: path.into(),
        }
    }

    fn solver(kind: DictKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            root: FileRoot::Solver,
            path: path.into(),
        }
    }
}

/// Open-circuit-voltage models available to a region's solid, if it has one.
pub fn ocv_models(region: Region) -> Option<&'static [&'static str]> {
    match region {
        Region::SolidPhase | Region::WorkingElectrode | Region::Anode => Some(ANODE_OCV_MODELS),
        Region::Cathode => Some(CATHODE_OCV_MODELS),
        Region::Electrolyte | Region::Separator => None,
    }
}

/// Whether a category is addressed globally, per region, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Region,
    Either,
}

pub fn scope(category: ParameterCategory) -> Scope {
    match category {
        ParameterCategory::Geometry | ParameterCategory::Control => Scope::Global,
        ParameterCategory::Boundary => Scope::Region,
        ParameterCategory::Material | ParameterCategory::Discretization => Scope::Either,
    }
}

/// Resolve the files behind a category/region pair.
///
/// Callers must have checked the region against the module and the category's scope.
pub fn bindings(category: ParameterCategory, region: Option<Region>) -> Vec<FileBinding> {
    match (category, region) {
        (ParameterCategory::Geometry, _) => vec![
            FileBinding::new(DictKind::BlockMesh, "system/blockMeshDict"),
            FileBinding::new(DictKind::TopoSet, "system/topoSetDict"),
        ],
        (ParameterCategory::Material, None) => {
            vec![FileBinding::new(DictKind::Material, "constant/LiProperties")]
        }
        (ParameterCategory::Material, Some(r)) => {
            let mut files = vec![FileBinding::new(
                DictKind::Material,
                PathBuf::from("constant").join(r.dir_name()).join("LiProperties"),
            )];
            if let Some(models) = ocv_models(r) {
                files.push(FileBinding::solver(DictKind::OcvSelection(models), SOLID_SOURCE));
            }
            files
        }
        (ParameterCategory::Boundary, Some(Region::Separator)) => vec![FileBinding::new(
            DictKind::Porosity,
            PathBuf::from("0").join(Region::Separator.dir_name()).join("Ce"),
        )],
        (ParameterCategory::Boundary, Some(r)) => {
            let dir = PathBuf::from("0").join(r.dir_name());
            let mut files = vec![FileBinding::new(
                DictKind::InitialCondition,
                dir.join(r.concentration_field()),
            )];
            if r.is_electrode() {
                files.push(FileBinding::new(DictKind::Electrochemistry, dir.join("fai_s")));
            }
            files
        }
        (ParameterCategory::Discretization, None) => {
            vec![FileBinding::new(DictKind::Schemes, "system/fvSchemes")]
        }
        (ParameterCategory::Discretization, Some(r)) => vec![FileBinding::new(
            DictKind::Schemes,
            PathBuf::from("system").join(r.dir_name()).join("fvSchemes"),
        )],
        (ParameterCategory::Control, _) => vec![
            FileBinding::new(DictKind::TimeControl, "system/controlDict"),
            FileBinding::new(DictKind::Tolerances, "system/fvSolution"),
        ],
        (ParameterCategory::Boundary, None) => Vec::new(),
    }
}

/// Check a region against the module type and the category's scope.
pub fn check_region(
    module: ModuleType,
    category: ParameterCategory,
    region: Option<Region>,
) -> Result<(), ParamError> {
    let invalid = |region: String| ParamError::InvalidRegion {
        region,
        module,
        category,
    };
    match (scope(category), region) {
        (Scope::Global, Some(r)) => Err(invalid(r.to_string())),
        (Scope::Region, None) => Err(invalid("<none>".into())),
        (_, Some(r)) if !module.has_region(r) => Err(invalid(r.to_string())),
        _ => Ok(()),
    }
}

/// Rules spanning several fields of one category. `merged` is the stored
/// state overlaid with the values being saved; only fields in `changed` are
/// reported as offending.
pub fn validate_cross_field(
    category: ParameterCategory,
    merged: &FieldMap,
    changed: &FieldMap,
) -> Result<(), ParamError> {
    let get = |name: &str| merged.get(name).and_then(ParamValue::as_f64);
    match category {
        ParameterCategory::Geometry => {
            let Some(radius) = get("radius") else {
                return Ok(());
            };
            for extent in ["length", "width", "height"] {
                let Some(e) = get(extent) else { continue };
                if radius >= e / 2.0 {
                    let field = if changed.contains_key("radius") {
                        "radius"
                    } else {
                        extent
                    };
                    return Err(ParamError::validation(
                        field,
                        format!(
                            "the radius ({radius}) must be smaller than half of the {extent} ({e})"
                        ),
                    ));
                }
            }
            Ok(())
        }
        ParameterCategory::Control => match (get("deltaT"), get("endTime")) {
            (Some(dt), Some(end)) if dt > end => {
                let field = if changed.contains_key("deltaT") {
                    "deltaT"
                } else {
                    "endTime"
                };
                Err(ParamError::validation(
                    field,
                    format!("the time step ({dt}) must not exceed the end time ({end})"),
                ))
            }
            _ => Ok(()),
        },
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn tolerance_fields_resolve_dynamically() {
        let spec = DictKind::Tolerances.resolve("Cs.relTol").unwrap();
        assert_eq!(
            spec.locator,
            Locator::Entry(vec!["solvers".into(), "Cs".into(), "relTol".into()])
        );
        assert!(DictKind::Tolerances.resolve("Cs.solver").is_none());
        assert!(DictKind::Tolerances.resolve(".tolerance").is_none());
    }

    #[rstest]
    #[case("alphaA", ParamValue::Scalar(0.5), true)]
    #[case("alphaA", ParamValue::Scalar(1.0), false)]
    #[case("Ds_value", ParamValue::Scalar(-1e-14), false)]
    #[case("Ds_value", ParamValue::Integer(1), true)]
    #[case("I_app", ParamValue::Scalar(-3.0), true)]
    #[case("I_app", ParamValue::Scalar(f64::NAN), false)]
    #[case("Ce", ParamValue::Word("high".into()), false)]
    fn material_ranges(#[case] field: &str, #[case] value: ParamValue, #[case] ok: bool) {
        let spec = DictKind::Material.resolve(field).unwrap();
        assert_eq!(spec.validate(&value).is_ok(), ok, "{field} = {value:?}");
    }

    #[test]
    fn scheme_choices_are_enforced() {
        let spec = DictKind::Schemes.resolve("ddtSchemes").unwrap();
        assert!(spec.validate(&ParamValue::Word("backward".into())).is_ok());
        let err = spec.validate(&ParamValue::Word("CrankNicolson".into())).unwrap_err();
        assert!(err.to_string().contains("must be one of"));
    }

    #[test]
    fn region_scope_is_checked() {
        use ParameterCategory::*;
        let spm = ModuleType::SingleParticle;
        assert!(check_region(spm, Material, Some(Region::SolidPhase)).is_ok());
        assert!(check_region(spm, Material, Some(Region::Anode)).is_err());
        assert!(check_region(spm, Material, None).is_ok());
        assert!(check_region(spm, Boundary, None).is_err());
        assert!(check_region(spm, Geometry, Some(Region::SolidPhase)).is_err());
        assert!(check_region(spm, Discretization, None).is_ok());
        assert!(check_region(spm, Discretization, Some(Region::Electrolyte)).is_ok());
    }

    #[test]
    fn boundary_files_follow_the_region() {
        let separator = bindings(ParameterCategory::Boundary, Some(Region::Separator));
        assert_eq!(separator.len(), 1);
        assert_eq!(separator[0].kind, DictKind::Porosity);
        assert_eq!(separator[0].path, PathBuf::from("0/sep/Ce"));

        let electrode = bindings(ParameterCategory::Boundary, Some(Region::WorkingElectrode));
        let paths: Vec<_> = electrode.iter().map(|b| b.path.clone()).collect();
        assert_eq!(paths, [PathBuf::from("0/WE/Cs"), PathBuf::from("0/WE/fai_s")]);

        let particle = bindings(ParameterCategory::Boundary, Some(Region::SolidPhase));
        assert_eq!(particle.len(), 1);
    }

    #[test]
    fn material_files_include_the_solver_source_for_solids() {
        let global = bindings(ParameterCategory::Material, None);
        assert_eq!(global, [FileBinding::new(DictKind::Material, "constant/LiProperties")]);

        let cathode = bindings(ParameterCategory::Material, Some(Region::Cathode));
        assert_eq!(cathode[1].root, FileRoot::Solver);
        assert_eq!(cathode[1].path, PathBuf::from("solid/solveSolid.H"));
        assert_eq!(cathode[1].kind, DictKind::OcvSelection(CATHODE_OCV_MODELS));

        let electrolyte = bindings(ParameterCategory::Material, Some(Region::Electrolyte));
        assert_eq!(electrolyte.len(), 1);
    }

    #[rstest]
    #[case("amf", 1.0, true)]
    #[case("amf", 0.0, false)]
    #[case("j0", -1.0, false)]
    #[case("cdl", 0.2, true)]
    fn electrochemistry_ranges(#[case] field: &str, #[case] value: f64, #[case] ok: bool) {
        let spec = DictKind::Electrochemistry.resolve(field).unwrap();
        assert_eq!(spec.validate(&ParamValue::Scalar(value)).is_ok(), ok);
    }

    #[test]
    fn radius_must_fit_every_extent() {
        let merged: FieldMap = [
            ("length", 10.0),
            ("width", 10.0),
            ("height", 8.0),
            ("radius", 4.0),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), ParamValue::Scalar(v)))
        .collect();
        let changed: FieldMap = [("height".to_string(), ParamValue::Scalar(8.0))].into();
        let err = validate_cross_field(ParameterCategory::Geometry, &merged, &changed).unwrap_err();
        assert!(matches!(err, ParamError::Validation { ref field, .. } if field == "height"));
    }
}
