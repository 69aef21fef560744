//! Two-stage external tool pipeline: geometry tool, then aerodynamic solver.
//!
//! A [`Pipeline`] walks an explicit state sequence, one method per
//! transition. Both templates are resolved in memory during
//! `generate_geometry`, so a bad anchor in either of them fails before any
//! process is started.

use crate::cache::{CacheEntry, ResultCache};
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, Flavor};
use crate::geometry::{Case, EXPORT_ANCHOR, EXPORT_FIELD};
use crate::layout::synthesize_rotor_template;
use crate::parser;
use crate::record::ResultRecord;
use crate::runner::{Invocation, ToolRunner};
use crate::template::{Edit, Template, Value};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

pub const DIAGNOSTICS_FILE: &str = "tool_diagnostics.log";
pub const GEOMETRY_TOOL: &str = "geometry_tool";
pub const AERO_SOLVER: &str = "aero_solver";
/// Component id of the main wing in span load files.
pub const WING_COMPONENT: &str = "1";

/// Where the tools live and how they are called.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub geometry_tool: PathBuf,
    pub aero_solver: PathBuf,
    pub resource_dir: PathBuf,
    pub work_dir: Option<PathBuf>,
    pub stability_args: Vec<String>,
    pub rotor_args: Vec<String>,
    pub precision: usize,
}

impl Settings {
    pub fn from_config(cfg: &crate::config::Root) -> Self {
        Self {
            geometry_tool: cfg.toolkit.geometry_tool.clone(),
            aero_solver: cfg.toolkit.aero_solver.clone(),
            resource_dir: cfg.solver.resource_dir.clone(),
            work_dir: cfg.solver.work_dir.clone(),
            stability_args: cfg.solver.stability_args.clone(),
            rotor_args: cfg.solver.rotor_args.clone(),
            precision: cfg.solver.precision,
        }
    }
}

/// Working directory for one pipeline run.
///
/// Temporary directories are removed when this is dropped; persistent ones
/// are left in place.
#[derive(Debug)]
pub enum WorkDir {
    Persistent(PathBuf),
    Temporary(Option<TempDir>, PathBuf),
}

impl WorkDir {
    pub fn create(configured: Option<&Path>) -> Result<Self> {
        match configured {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
                Ok(WorkDir::Persistent(dir.to_path_buf()))
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("aerocache-")
                    .tempdir()
                    .map_err(|e| Error::io(std::env::temp_dir(), e))?;
                let path = dir.path().to_path_buf();
                Ok(WorkDir::Temporary(Some(dir), path))
            }
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            WorkDir::Persistent(path) | WorkDir::Temporary(_, path) => path,
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, WorkDir::Temporary(..))
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let WorkDir::Temporary(dir, path) = self {
            if let Some(dir) = dir.take() {
                match dir.close() {
                    Ok(()) => debug!(path = %path.display(), "working directory removed"),
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to remove working directory"),
                }
            }
        }
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    GeometryGenerated,
    /// Stage number of the tool that last completed
    ToolInvoked(usize),
    InputRewritten,
    OutputAvailable,
    Parsed,
    Cached,
}

/// One external tool step.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStage {
    pub index: usize,
    pub name: &'static str,
    pub template: PathBuf,
    pub generated_input: PathBuf,
    pub required_inputs: Vec<PathBuf>,
    pub expected_outputs: Vec<PathBuf>,
    pub program: PathBuf,
    pub args: Vec<String>,
}

pub struct Pipeline<'a, R: ToolRunner> {
    settings: &'a Settings,
    runner: &'a R,
    case: &'a Case,
    work: WorkDir,
    state: PipelineState,
    solver_input: Option<Template>,
    record: Option<ResultRecord>,
}

impl<'a, R: ToolRunner> Pipeline<'a, R> {
    /// Create the working directory and stage resources into it.
    pub fn new(settings: &'a Settings, runner: &'a R, case: &'a Case) -> Result<Self> {
        let work = WorkDir::create(settings.work_dir.as_deref())?;
        // generated inputs share their names with the templates
        if same_file(work.path(), &settings.resource_dir) {
            return Err(Error::invalid(
                "work_dir",
                format!("{} is also the resource directory", work.path().display()),
            ));
        }
        debug!(dir = %work.path().display(), temporary = work.is_temporary(), "working directory ready");
        let pipeline = Self {
            settings,
            runner,
            case,
            work,
            state: PipelineState::Init,
            solver_input: None,
            record: None,
        };
        pipeline.stage_resources()?;
        Ok(pipeline)
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn work_dir(&self) -> &Path {
        self.work.path()
    }

    fn stem(&self) -> &'static str {
        self.case.flavor.stem()
    }

    fn work_file(&self, suffix: &str) -> PathBuf {
        self.work.path().join(format!("{}{}", self.stem(), suffix))
    }

    fn stage_resources(&self) -> Result<()> {
        let dir = &self.settings.resource_dir;
        let copy_failed = |path: &Path, e: std::io::Error| Error::ResourceCopyFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        let listing = fs::read_dir(dir).map_err(|e| copy_failed(dir.as_path(), e))?;
        let mut sources = Vec::new();
        for item in listing {
            let path = item.map_err(|e| copy_failed(dir.as_path(), e))?.path();
            if path.is_file() {
                sources.push(path);
            }
        }
        sources.extend(self.case.airfoils.iter().cloned());

        let mut copied = 0;
        for source in &sources {
            let Some(name) = source.file_name() else {
                continue;
            };
            let target = self.work.path().join(name);
            // copying a file onto itself truncates it
            if same_file(source, &target) {
                continue;
            }
            fs::copy(source, &target).map_err(|e| copy_failed(source.as_path(), e))?;
            copied += 1;
        }
        debug!(files = copied, "resources staged");
        Ok(())
    }

    fn transition(&mut self, to: PipelineState) {
        debug!(from = ?self.state, to = ?to, "pipeline state");
        self.state = to;
    }

    fn geometry_stage(&self) -> PipelineStage {
        let script = self.work_file("_generated.vspscript");
        let mut required_inputs = vec![script.clone()];
        required_inputs.extend(
            self.case
                .airfoils
                .iter()
                .filter_map(|a| a.file_name())
                .map(|n| self.work.path().join(n)),
        );
        PipelineStage {
            index: 1,
            name: GEOMETRY_TOOL,
            template: self.settings.resource_dir.join(format!("{}.vspscript", self.stem())),
            generated_input: script.clone(),
            required_inputs,
            expected_outputs: vec![self.work_file("_DegenGeom.csv")],
            program: self.settings.geometry_tool.clone(),
            args: vec![
                "-script".to_string(),
                format!("{}_generated.vspscript", self.stem()),
            ],
        }
    }

    fn solver_stage(&self) -> PipelineStage {
        let base = format!("{}_DegenGeom", self.stem());
        let (args, expected_outputs) = match self.case.flavor {
            Flavor::WingRotor => (
                &self.settings.rotor_args,
                vec![self.work_file("_DegenGeom.lod"), self.work_file("_DegenGeom.polar")],
            ),
            _ => (&self.settings.stability_args, vec![self.work_file("_DegenGeom.stab")]),
        };
        let mut args = args.clone();
        args.push(base.clone());
        let input = self.work_file("_DegenGeom.vspaero");
        PipelineStage {
            index: 2,
            name: AERO_SOLVER,
            template: self.settings.resource_dir.join(format!("{}.vspaero", base)),
            generated_input: input.clone(),
            required_inputs: vec![input, self.work_file("_DegenGeom.csv")],
            expected_outputs,
            program: self.settings.aero_solver.clone(),
            args,
        }
    }

    /// Resolve both templates and write the geometry script.
    pub fn generate_geometry(&mut self) -> Result<()> {
        let stage = self.geometry_stage();
        let mut script = Template::load(&stage.template)?;
        script.apply_all(&self.case.geometry_edits)?;
        let export = self.work_file("_DegenGeom.csv");
        script.apply_all(&[
            Edit::Reset,
            Edit::mark(EXPORT_ANCHOR),
            Edit::set(EXPORT_FIELD, Value::path(export)),
        ])?;

        let solver_input = self.resolve_solver_input()?;
        script.write(&stage.generated_input)?;
        self.solver_input = Some(solver_input);
        self.transition(PipelineState::GeometryGenerated);
        Ok(())
    }

    fn resolve_solver_input(&self) -> Result<Template> {
        let template_path = self.solver_stage().template;
        let mut input = match &self.case.layout {
            Some(layout) => {
                let expanded = self.work_file("_rotors.vspaero");
                synthesize_rotor_template(&template_path, layout.len(), &expanded)?;
                let template = Template::load(&expanded)?;
                if let Err(e) = fs::remove_file(&expanded) {
                    warn!(path = %expanded.display(), error = %e, "failed to remove expanded rotor template");
                }
                template
            }
            None => Template::load(&template_path)?,
        };
        input.apply_all(&self.case.solver_edits)?;
        if let Some(layout) = &self.case.layout {
            input.apply_all(&layout.rotor_edits(self.settings.precision))?;
        }
        Ok(input)
    }

    fn run_stage(&self, stage: &PipelineStage) -> Result<()> {
        for input in &stage.required_inputs {
            if !input.is_file() {
                return Err(Error::ResourceCopyFailed {
                    path: input.clone(),
                    reason: format!("required by stage {} but missing", stage.index),
                });
            }
        }
        for output in &stage.expected_outputs {
            if output.exists() {
                fs::remove_file(output).map_err(|e| Error::io(output, e))?;
            }
        }

        let invocation = Invocation {
            stage: stage.index,
            tool: stage.name.to_string(),
            program: stage.program.clone(),
            args: stage.args.clone(),
            work_dir: self.work.path().to_path_buf(),
            diagnostics: self.work.path().join(DIAGNOSTICS_FILE),
            expected_outputs: stage.expected_outputs.clone(),
        };
        let failed = |reason: String| Error::ExternalToolFailed {
            stage: stage.index,
            tool: stage.name.to_string(),
            reason,
        };

        let code = self.runner.run(&invocation)?;
        if code != 0 {
            return Err(failed(format!(
                "exit code {}, see {}",
                code,
                invocation.diagnostics.display()
            )));
        }
        for output in &stage.expected_outputs {
            if !output.is_file() {
                return Err(failed(format!("declared output {} was not produced", output.display())));
            }
        }
        info!(stage = stage.index, tool = stage.name, "stage complete");
        Ok(())
    }

    pub fn run_geometry_tool(&mut self) -> Result<()> {
        let stage = self.geometry_stage();
        self.run_stage(&stage)?;
        self.transition(PipelineState::ToolInvoked(stage.index));
        Ok(())
    }

    /// Write the solver input resolved by [`Pipeline::generate_geometry`].
    pub fn rewrite_input(&mut self) -> Result<()> {
        let stage = self.solver_stage();
        let input = self.solver_input.as_ref().ok_or_else(|| Error::invalid(
            "pipeline",
            format!("solver input requested in state {:?}", self.state),
        ))?;
        input.write(&stage.generated_input)?;
        self.transition(PipelineState::InputRewritten);
        Ok(())
    }

    pub fn run_solver(&mut self) -> Result<()> {
        let stage = self.solver_stage();
        self.run_stage(&stage)?;
        self.transition(PipelineState::ToolInvoked(stage.index));
        self.transition(PipelineState::OutputAvailable);
        Ok(())
    }

    pub fn parse(&mut self) -> Result<&ResultRecord> {
        let record = match self.case.flavor {
            Flavor::WingRotor => {
                let lod = self.work_file("_DegenGeom.lod");
                let record = parser::parse_rotor_outputs(&lod, &self.work_file("_DegenGeom.polar"), WING_COMPONENT)?;
                record
                    .check_series("y")
                    .map_err(|reason| Error::malformed(&lod, 0, reason))?;
                record
            }
            _ => parser::parse_stability(&self.work_file("_DegenGeom.stab"))?.to_record(),
        };
        self.transition(PipelineState::Parsed);
        let record: &ResultRecord = self.record.insert(record);
        Ok(record)
    }

    /// Allocate a cache entry and persist the parsed record into it.
    pub fn store(&mut self, cache: &ResultCache, fingerprint: &Fingerprint) -> Result<CacheEntry> {
        let record = self.record.as_ref().ok_or_else(|| Error::invalid(
            "pipeline",
            format!("nothing to store in state {:?}", self.state),
        ))?;
        let entry = cache.reserve(fingerprint)?;
        cache.store(&entry, record)?;
        self.transition(PipelineState::Cached);
        info!(index = entry.index, "result cached");
        Ok(entry)
    }

    /// Every transition from `Init` to `Cached`.
    pub fn run(mut self, cache: &ResultCache, fingerprint: &Fingerprint) -> Result<(CacheEntry, ResultRecord)> {
        self.generate_geometry()?;
        self.run_geometry_tool()?;
        self.rewrite_input()?;
        self.run_solver()?;
        self.parse()?;
        let entry = self.store(cache, fingerprint)?;
        let record = self.record.take().unwrap_or_default();
        Ok((entry, record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{ParameterBundle, TrailingField};
    use std::cell::RefCell;

    const STAB: &str = "Coef Total Alpha Beta p q r Mach U\nCL 0.31 5.1 0 0 8.4 0 0.12 0.03\nCMm -0.04 -1.2 0 0 -14.5 0 -0.01 0\n";

    /// Writes canned outputs for every declared file and records the calls.
    #[derive(Default)]
    struct FakeRunner {
        calls: RefCell<Vec<Invocation>>,
        fail_stage: Option<usize>,
        skip_outputs: bool,
    }

    impl ToolRunner for FakeRunner {
        fn run(&self, inv: &Invocation) -> Result<i32> {
            self.calls.borrow_mut().push(inv.clone());
            if self.fail_stage == Some(inv.stage) {
                return Ok(2);
            }
            if !self.skip_outputs {
                for out in &inv.expected_outputs {
                    fs::write(out, STAB).unwrap();
                }
            }
            Ok(0)
        }
    }

    fn resources(dir: &Path, solver_template: &str) -> PathBuf {
        let res = dir.join("resources");
        fs::create_dir_all(&res).unwrap();
        fs::write(res.join("aircraft.vspscript"), "// @wing\nSetParmVal( w, \"Aspect\", \"XSec_1\", 0.0 );\nSetComputationFileName( DEGEN_GEOM_CSV_TYPE, \"x.csv\" );\n").unwrap();
        fs::write(res.join("aircraft_DegenGeom.vspaero"), solver_template).unwrap();
        fs::write(res.join("foil.af"), "AIRFOIL FILE\n").unwrap();
        res
    }

    fn case(res: &Path) -> Case {
        let mut bundle = ParameterBundle::new();
        for name in Flavor::Aircraft.fields() {
            bundle.push(*name, 1.0);
        }
        Case {
            flavor: Flavor::Aircraft,
            bundle,
            trailing_field: TrailingField::ReuseUnscaled,
            geometry_edits: vec![
                Edit::mark("\"Aspect\""),
                Edit::set(4, Value::number(7.5, 3)),
            ],
            solver_edits: Edit::keyed("Mach =", 2, Value::number(0.2, 6)).to_vec(),
            airfoils: vec![res.join("foil.af")],
            layout: None,
        }
    }

    fn settings(res: &Path, work_dir: Option<PathBuf>) -> Settings {
        Settings {
            geometry_tool: PathBuf::from("vspscript"),
            aero_solver: PathBuf::from("vspaero"),
            resource_dir: res.to_path_buf(),
            work_dir,
            stability_args: vec!["-stab".to_string()],
            rotor_args: Vec::new(),
            precision: 6,
        }
    }

    #[test]
    fn test_full_run_caches_and_removes_temp_dir() {
        let dir = TempDir::new().unwrap();
        let res = resources(dir.path(), "Mach = 0.000000\n");
        let cache = ResultCache::open(dir.path().join("cache")).unwrap();
        let case = case(&res);
        let settings = settings(&res, None);
        let runner = FakeRunner::default();

        let pipeline = Pipeline::new(&settings, &runner, &case).unwrap();
        let work = pipeline.work_dir().to_path_buf();
        assert!(work.join("foil.af").is_file());
        assert!(work.join("aircraft.vspscript").is_file());

        let fp = case.fingerprint().unwrap();
        let (entry, record) = pipeline.run(&cache, &fp).unwrap();
        assert_eq!(entry.index, 0);
        assert_eq!(record.scalar("CL_alpha"), Some(5.1));
        assert!(!work.exists());

        let calls = runner.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args, vec!["-script", "aircraft_generated.vspscript"]);
        assert_eq!(calls[1].args, vec!["-stab", "aircraft_DegenGeom"]);
    }

    #[test]
    fn test_persistent_dir_keeps_generated_files() {
        let dir = TempDir::new().unwrap();
        let res = resources(dir.path(), "Mach = 0.000000\n");
        let work = dir.path().join("work");
        let cache = ResultCache::open(dir.path().join("cache")).unwrap();
        let case = case(&res);
        let settings = settings(&res, Some(work.clone()));
        let runner = FakeRunner::default();

        let fp = case.fingerprint().unwrap();
        Pipeline::new(&settings, &runner, &case).unwrap().run(&cache, &fp).unwrap();

        let script = fs::read_to_string(work.join("aircraft_generated.vspscript")).unwrap();
        assert!(script.contains("7.500"));
        assert!(script.contains("aircraft_DegenGeom.csv\""));
        let input = fs::read_to_string(work.join("aircraft_DegenGeom.vspaero")).unwrap();
        assert_eq!(input, "Mach = 0.200000\n");
    }

    #[test]
    fn test_work_dir_equal_to_resource_dir_is_rejected() {
        let dir = TempDir::new().unwrap();
        let res = resources(dir.path(), "Mach = 0.000000\n");
        let script = fs::read_to_string(res.join("aircraft.vspscript")).unwrap();
        let case = case(&res);
        let settings = settings(&res, Some(res.join(".")));
        let runner = FakeRunner::default();

        let err = Pipeline::new(&settings, &runner, &case).err().unwrap();
        assert!(matches!(err, Error::InvalidParameter { ref name, .. } if name == "work_dir"));
        assert_eq!(fs::read_to_string(res.join("aircraft.vspscript")).unwrap(), script);
        assert_eq!(
            fs::read_to_string(res.join("aircraft_DegenGeom.vspaero")).unwrap(),
            "Mach = 0.000000\n"
        );
        assert!(runner.calls.borrow().is_empty());
    }

    #[test]
    fn test_airfoil_already_in_work_dir_is_not_truncated() {
        let dir = TempDir::new().unwrap();
        let res = resources(dir.path(), "Mach = 0.000000\n");
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        fs::write(work.join("local.af"), "LOCAL AIRFOIL\n").unwrap();
        let mut case = case(&res);
        case.airfoils = vec![work.join("local.af")];
        let settings = settings(&res, Some(work.clone()));
        let runner = FakeRunner::default();

        let pipeline = Pipeline::new(&settings, &runner, &case).unwrap();
        assert_eq!(fs::read_to_string(work.join("local.af")).unwrap(), "LOCAL AIRFOIL\n");
        assert!(pipeline.work_dir().join("aircraft.vspscript").is_file());
    }

    #[test]
    fn test_missing_solver_anchor_spawns_nothing() {
        let dir = TempDir::new().unwrap();
        let res = resources(dir.path(), "Ma = 0.000000\n");
        let case = case(&res);
        let settings = settings(&res, None);
        let runner = FakeRunner::default();

        let mut pipeline = Pipeline::new(&settings, &runner, &case).unwrap();
        let work = pipeline.work_dir().to_path_buf();
        let err = pipeline.generate_geometry().unwrap_err();
        assert!(matches!(err, Error::TemplateAnchorNotFound { ref anchor, .. } if anchor == "Mach ="));
        assert_eq!(pipeline.state(), PipelineState::Init);
        assert!(!work.join("aircraft_generated.vspscript").exists());
        drop(pipeline);

        assert!(runner.calls.borrow().is_empty());
        assert!(!work.exists());
    }

    #[test]
    fn test_nonzero_exit_names_the_stage() {
        let dir = TempDir::new().unwrap();
        let res = resources(dir.path(), "Mach = 0.000000\n");
        let cache = ResultCache::open(dir.path().join("cache")).unwrap();
        let case = case(&res);
        let settings = settings(&res, None);
        let runner = FakeRunner {
            fail_stage: Some(2),
            ..Default::default()
        };

        let fp = case.fingerprint().unwrap();
        let err = Pipeline::new(&settings, &runner, &case).unwrap().run(&cache, &fp).unwrap_err();
        assert_eq!(err.stage(), Some(2));
        assert!(cache.entries().is_empty());
    }

    #[test]
    fn test_missing_declared_output() {
        let dir = TempDir::new().unwrap();
        let res = resources(dir.path(), "Mach = 0.000000\n");
        let case = case(&res);
        let settings = settings(&res, None);
        let runner = FakeRunner {
            skip_outputs: true,
            ..Default::default()
        };

        let mut pipeline = Pipeline::new(&settings, &runner, &case).unwrap();
        pipeline.generate_geometry().unwrap();
        let err = pipeline.run_geometry_tool().unwrap_err();
        assert!(matches!(err, Error::ExternalToolFailed { stage: 1, .. }));
    }

    #[test]
    fn test_missing_resource_dir() {
        let dir = TempDir::new().unwrap();
        let res = dir.path().join("absent");
        let case = case(&res);
        let settings = settings(&res, None);
        let runner = FakeRunner::default();
        let err = Pipeline::new(&settings, &runner, &case).err().unwrap();
        assert!(matches!(err, Error::ResourceCopyFailed { .. }));
    }
}
