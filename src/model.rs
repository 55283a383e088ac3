use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Simulation module a project was created from. Fixed for the project's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleType {
    SingleParticle,
    HalfCell,
    FullCell,
}

impl ModuleType {
    pub const ALL: [ModuleType; 3] = [
        ModuleType::SingleParticle,
        ModuleType::HalfCell,
        ModuleType::FullCell,
    ];

    /// Regions of the multi-region case, in mesh order.
    pub fn regions(self) -> &'static [Region] {
        match self {
            ModuleType::SingleParticle => &[Region::Electrolyte, Region::SolidPhase],
            ModuleType::HalfCell => &[Region::WorkingElectrode, Region::Separator],
            ModuleType::FullCell => &[Region::Anode, Region::Separator, Region::Cathode],
        }
    }

    pub fn has_region(self, region: Region) -> bool {
        self.regions().contains(&region)
    }

    /// Solver binary shipped with the module's template.
    pub fn solver_name(self) -> &'static str {
        match self {
            ModuleType::SingleParticle => "SPMFoam_OF6",
            ModuleType::HalfCell => "halfCellFoam_OF6",
            ModuleType::FullCell => "fullCellFoam_OF6",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ModuleType::SingleParticle => "Single Particle Model",
            ModuleType::HalfCell => "P2D Model (Half Cell)",
            ModuleType::FullCell => "P2D Model (Full Cell)",
        }
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModuleType::SingleParticle => "single-particle",
            ModuleType::HalfCell => "half-cell",
            ModuleType::FullCell => "full-cell",
        })
    }
}

impl FromStr for ModuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single-particle" | "spm" | "SPM" => Ok(ModuleType::SingleParticle),
            "half-cell" | "halfCell" => Ok(ModuleType::HalfCell),
            "full-cell" | "fullCell" => Ok(ModuleType::FullCell),
            other => Err(format!(
                "unknown module `{other}` (expected single-particle, half-cell or full-cell)"
            )),
        }
    }
}

/// Named sub-domain of a multi-region case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Region {
    Electrolyte,
    SolidPhase,
    WorkingElectrode,
    Separator,
    Anode,
    Cathode,
}

impl Region {
    /// Directory name used under `constant/`, `system/` and `0/`.
    pub fn dir_name(self) -> &'static str {
        match self {
            Region::Electrolyte => "ele",
            Region::SolidPhase => "solidPhase",
            Region::WorkingElectrode => "WE",
            Region::Separator => "sep",
            Region::Anode => "anode",
            Region::Cathode => "cathode",
        }
    }

    /// Electrode regions carry the solid potential `fai_s` and an
    /// open-circuit-voltage model.
    pub fn is_electrode(self) -> bool {
        matches!(
            self,
            Region::WorkingElectrode | Region::Anode | Region::Cathode
        )
    }

    /// Concentration field solved in this region: lithium in the solid, or in the electrolyte.
    pub fn concentration_field(self) -> &'static str {
        match self {
            Region::Electrolyte | Region::Separator => "Ce",
            Region::SolidPhase | Region::WorkingElectrode | Region::Anode | Region::Cathode => {
                "Cs"
            }
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ele" | "electrolyte" => Ok(Region::Electrolyte),
            "solidPhase" | "solid-phase" => Ok(Region::SolidPhase),
            "WE" | "workingElectrode" | "working-electrode" => Ok(Region::WorkingElectrode),
            "sep" | "separator" => Ok(Region::Separator),
            "anode" => Ok(Region::Anode),
            "cathode" => Ok(Region::Cathode),
            other => Err(format!("unknown region `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterCategory {
    Geometry,
    Material,
    Boundary,
    Discretization,
    Control,
}

impl ParameterCategory {
    pub const ALL: [ParameterCategory; 5] = [
        ParameterCategory::Geometry,
        ParameterCategory::Material,
        ParameterCategory::Boundary,
        ParameterCategory::Discretization,
        ParameterCategory::Control,
    ];
}

impl fmt::Display for ParameterCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParameterCategory::Geometry => "geometry",
            ParameterCategory::Material => "material",
            ParameterCategory::Boundary => "boundary",
            ParameterCategory::Discretization => "discretization",
            ParameterCategory::Control => "control",
        })
    }
}

impl FromStr for ParameterCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ParameterCategory::ALL
            .into_iter()
            .find(|c| c.to_string() == s)
            .ok_or_else(|| format!("unknown parameter category `{s}`"))
    }
}

/// A typed parameter value as read from, or written to, a dictionary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Scalar(f64),
    Word(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Scalar(v) => Some(*v),
            ParamValue::Integer(v) => Some(*v as f64),
            ParamValue::Word(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Integer(v) => write!(f, "{v}"),
            ParamValue::Scalar(v) => write!(f, "{v}"),
            ParamValue::Word(v) => f.write_str(v),
        }
    }
}

/// Field name → value, ordered for stable output.
pub type FieldMap = BTreeMap<String, ParamValue>;

/// Logical channel (one per interface tab) that drives at most one process at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TerminalId(pub String);

impl TerminalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for TerminalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TerminalId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One external command invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Lifecycle of a process session.
///
/// `Idle → Starting → Running → {Completed, Failed, Killed}`; `Starting` may also
/// go straight to `Failed` when the spawn itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Completed,
    Failed,
    Killed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Killed
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Killed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamOrigin {
    Stdout,
    Stderr,
}

/// A captured output line. `seq` is monotonic per session across both streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub seq: u64,
    pub stream: StreamOrigin,
    pub text: String,
}

/// Events published by the process controller to its subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProcessEvent {
    Output {
        terminal: TerminalId,
        session: SessionId,
        line: OutputLine,
    },
    StateChanged {
        terminal: TerminalId,
        session: SessionId,
        command: String,
        state: SessionState,
    },
    SessionEnded {
        terminal: TerminalId,
        session: SessionId,
        state: SessionState,
        exit_code: Option<i32>,
    },
}

impl ProcessEvent {
    pub fn terminal(&self) -> &TerminalId {
        match self {
            ProcessEvent::Output { terminal, .. }
            | ProcessEvent::StateChanged { terminal, .. }
            | ProcessEvent::SessionEnded { terminal, .. } => terminal,
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session: SessionId,
    pub command: String,
    pub state: SessionState,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    pub paused: bool,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    /// Lines evicted from the ring buffer so far.
    pub dropped_lines: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(SessionState::Idle, SessionState::Starting, true)]
    #[case(SessionState::Starting, SessionState::Failed, true)]
    #[case(SessionState::Running, SessionState::Killed, true)]
    #[case(SessionState::Idle, SessionState::Running, false)]
    #[case(SessionState::Completed, SessionState::Running, false)]
    #[case(SessionState::Killed, SessionState::Failed, false)]
    #[case(SessionState::Starting, SessionState::Killed, false)]
    fn lifecycle_transitions(
        #[case] from: SessionState,
        #[case] to: SessionState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn regions_follow_module() {
        assert!(ModuleType::FullCell.has_region(Region::Separator));
        assert!(!ModuleType::SingleParticle.has_region(Region::Anode));
        assert_eq!(ModuleType::HalfCell.regions().len(), 2);
    }

    #[test]
    fn names_round_trip_through_from_str() {
        for module in ModuleType::ALL {
            assert_eq!(module.to_string().parse::<ModuleType>(), Ok(module));
        }
        for category in ParameterCategory::ALL {
            assert_eq!(category.to_string().parse::<ParameterCategory>(), Ok(category));
        }
        assert_eq!("solid-phase".parse::<Region>(), Ok(Region::SolidPhase));
    }

    #[rstest]
    #[case("ele", Region::Electrolyte)]
    #[case("electrolyte", Region::Electrolyte)]
    #[case("WE", Region::WorkingElectrode)]
    #[case("working-electrode", Region::WorkingElectrode)]
    #[case("sep", Region::Separator)]
    #[case("separator", Region::Separator)]
    fn regions_accept_case_and_long_names(#[case] name: &str, #[case] region: Region) {
        assert_eq!(name.parse::<Region>(), Ok(region));
        assert_eq!(region.to_string().parse::<Region>(), Ok(region));
    }

    #[test]
    fn region_directories_follow_the_case_layout() {
        let dirs: Vec<_> = ModuleType::FullCell
            .regions()
            .iter()
            .map(|r| r.dir_name())
            .collect();
        assert_eq!(dirs, ["anode", "sep", "cathode"]);
        assert_eq!(Region::Electrolyte.dir_name(), "ele");
        assert_eq!(Region::WorkingElectrode.dir_name(), "WE");
    }

    #[test]
    fn command_spec_display_joins_args() {
        let cmd = CommandSpec::new("splitMeshRegions", "/tmp").args(["-cellZones", "-overwrite"]);
        assert_eq!(cmd.to_string(), "splitMeshRegions -cellZones -overwrite");
    }
}
