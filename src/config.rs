use crate::fingerprint::{Flavor, TrailingField, MAX_ENGINE_PAIRS};
use crate::layout::Mounting;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Root {
    pub toolkit: Toolkit,
    #[serde(default)]
    pub solver: Solver,
    #[serde(default)]
    pub cache: Cache,
    pub run: Run,
    pub flow: Flow,
    pub wing: Wing,
    pub htp: Option<Tail>,
    pub vtp: Option<Tail>,
    pub fuselage: Option<Fuselage>,
    pub engines: Option<Engines>,
    pub sweep: Option<Sweep>,
}

/// External executables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Toolkit {
    pub geometry_tool: PathBuf,
    pub aero_solver: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Solver {
    /// Templates and support files copied into every working directory
    #[serde(default = "default_resource_dir")]
    pub resource_dir: PathBuf,
    /// Kept after the run when set; a fresh temporary directory otherwise
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_stability_args")]
    pub stability_args: Vec<String>,
    #[serde(default)]
    pub rotor_args: Vec<String>,
    /// Decimals written into template fields
    #[serde(default = "default_precision")]
    pub precision: usize,
}

fn default_resource_dir() -> PathBuf {
    PathBuf::from("resources")
}
fn default_stability_args() -> Vec<String> {
    vec!["-stab".to_string()]
}
fn default_precision() -> usize { 6 }

impl Default for Solver {
    fn default() -> Self {
        Self {
            resource_dir: default_resource_dir(),
            work_dir: None,
            stability_args: default_stability_args(),
            rotor_args: Vec::new(),
            precision: default_precision(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Cache {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Take the single-writer lock on the miss path
    #[serde(default = "default_true")]
    pub lock: bool,
    #[serde(default)]
    pub trailing_field: TrailingField,
    /// Seconds to wait for a lock held by a live writer
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,
    /// Age after which a lock counts as abandoned
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}
fn default_true() -> bool { true }
fn default_lock_wait_secs() -> u64 { 30 }
fn default_lock_stale_secs() -> u64 { 6 * 3600 }

impl Default for Cache {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            lock: true,
            trailing_field: TrailingField::default(),
            lock_wait_secs: default_lock_wait_secs(),
            lock_stale_secs: default_lock_stale_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Run {
    pub flavor: Flavor,
    /// Airfoil files relative to `solver.resource_dir`: one for every section or root, kink, tip
    #[serde(default = "default_airfoils")]
    pub airfoils: Vec<PathBuf>,
}

fn default_airfoils() -> Vec<PathBuf> {
    vec![PathBuf::from("airfoils/naca23012.af")]
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Flow {
    pub mach: f64,
    /// Angle of attack [deg]
    pub alpha: f64,
    /// Freestream speed [m/s]
    pub velocity: f64,
    /// Density [kg/m^3]
    #[serde(default = "default_density")]
    pub density: f64,
    /// Reynolds number on the reference chord
    pub reynolds: f64,
    pub x_cg: f64,
    #[serde(default)]
    pub z_cg: f64,
}

fn default_density() -> f64 { 1.225 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Wing {
    pub area: f64,
    pub aspect_ratio: f64,
    /// Quarter-chord sweep [deg]
    pub sweep_25: f64,
    pub taper_ratio: f64,
    #[serde(default)]
    pub dihedral: f64,
    #[serde(default)]
    pub twist: f64,
    /// Half-width of the untapered centre section
    #[serde(default)]
    pub root_y: f64,
    #[serde(default)]
    pub root_le_x: f64,
    #[serde(default)]
    pub height: f64,
}

/// Horizontal or vertical tail planform.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tail {
    pub area: f64,
    pub aspect_ratio: f64,
    pub sweep_25: f64,
    pub taper_ratio: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Fuselage {
    pub length: f64,
    pub max_width: f64,
    pub max_height: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Engines {
    pub mounting: Mounting,
    pub count: usize,
    /// Span station of each wing pair as a fraction of the semi-span
    #[serde(default)]
    pub span_ratios: Vec<f64>,
    pub rpm: f64,
    pub propeller_radius: f64,
    #[serde(default)]
    pub hub_radius: f64,
    pub thrust_coefficient: f64,
    pub power_coefficient: f64,
    /// Disc distance ahead of the local leading edge
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub nose_x: f64,
    #[serde(default)]
    pub nose_z: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Sweep {
    pub mach_min: f64,
    pub mach_max: f64,
    pub mach_n: usize,
}

impl Sweep {
    pub fn points(&self) -> Vec<f64> {
        if self.mach_n == 1 {
            return vec![self.mach_min];
        }
        let step = (self.mach_max - self.mach_min) / (self.mach_n - 1) as f64;
        (0..self.mach_n).map(|i| self.mach_min + step * i as f64).collect()
    }
}

impl Root {
    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_text(path).map(|(cfg, _)| cfg)
    }

    /// Like [`Root::load`], also returning the text that was parsed.
    pub fn load_with_text(path: &Path) -> Result<(Self, String)> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let cfg: Root = toml::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        cfg.validate()?;
        Ok((cfg, text))
    }

    pub fn validate(&self) -> Result<()> {
        if self.solver.precision == 0 || self.solver.precision > 12 {
            bail!("solver.precision must be in [1, 12]");
        }
        if let Some(work) = &self.solver.work_dir {
            let canonical = |p: &Path| fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
            if canonical(work) == canonical(&self.solver.resource_dir) {
                bail!("solver.work_dir must differ from solver.resource_dir");
            }
        }
        if !(0.0..1.0).contains(&self.flow.mach) {
            bail!("flow.mach must be in [0, 1)");
        }
        if !(-30.0..=30.0).contains(&self.flow.alpha) {
            bail!("flow.alpha must be in [-30, 30] deg");
        }
        if self.flow.velocity <= 0.0 || self.flow.density <= 0.0 || self.flow.reynolds <= 0.0 {
            bail!("flow.velocity, flow.density and flow.reynolds must be positive");
        }

        let wing = &self.wing;
        if wing.area <= 0.0 || wing.aspect_ratio <= 0.0 {
            bail!("wing.area and wing.aspect_ratio must be positive");
        }
        if !(0.0 < wing.taper_ratio && wing.taper_ratio <= 1.0) {
            bail!("wing.taper_ratio must be in (0, 1]");
        }
        if !(-60.0..=60.0).contains(&wing.sweep_25) {
            bail!("wing.sweep_25 must be in [-60, 60] deg");
        }
        if wing.root_y < 0.0 || wing.root_y >= (wing.area * wing.aspect_ratio).sqrt() / 2.0 {
            bail!("wing.root_y must be in [0, semi-span)");
        }
        if self.run.airfoils.len() != 1 && self.run.airfoils.len() != 3 {
            bail!("run.airfoils must list 1 or 3 files");
        }

        match self.run.flavor {
            Flavor::Aircraft | Flavor::AircraftWithFuselage => {
                let (Some(htp), Some(vtp)) = (&self.htp, &self.vtp) else {
                    bail!("[htp] and [vtp] are required for flavor {:?}", self.run.flavor);
                };
                for (name, tail) in [("htp", htp), ("vtp", vtp)] {
                    if tail.area <= 0.0 || tail.aspect_ratio <= 0.0 {
                        bail!("{}.area and {}.aspect_ratio must be positive", name, name);
                    }
                    if !(0.0 < tail.taper_ratio && tail.taper_ratio <= 1.0) {
                        bail!("{}.taper_ratio must be in (0, 1]", name);
                    }
                }
            }
            Flavor::WingRotor => {}
        }

        if self.run.flavor == Flavor::AircraftWithFuselage {
            let Some(fus) = &self.fuselage else {
                bail!("[fuselage] is required for flavor aircraft_with_fuselage");
            };
            if fus.length <= 0.0 || fus.max_width <= 0.0 || fus.max_height <= 0.0 {
                bail!("fuselage dimensions must be positive");
            }
        }

        if self.run.flavor == Flavor::WingRotor {
            let Some(eng) = &self.engines else {
                bail!("[engines] is required for flavor wing_rotor");
            };
            if eng.count == 0 || eng.count > 2 * MAX_ENGINE_PAIRS + 1 {
                bail!("engines.count must be in [1, {}]", 2 * MAX_ENGINE_PAIRS + 1);
            }
            if eng.propeller_radius <= 0.0 {
                bail!("engines.propeller_radius must be positive");
            }
            if !(0.0..eng.propeller_radius).contains(&eng.hub_radius) {
                bail!("engines.hub_radius must be in [0, propeller_radius)");
            }
            if eng.rpm <= 0.0 {
                bail!("engines.rpm must be positive");
            }
        }

        if let Some(ref sweep) = self.sweep {
            if sweep.mach_n == 0 {
                bail!("sweep.mach_n must be >= 1");
            }
            if sweep.mach_min > sweep.mach_max {
                bail!("sweep.mach_min must be <= sweep.mach_max");
            }
            if !(0.0..1.0).contains(&sweep.mach_min) || !(0.0..1.0).contains(&sweep.mach_max) {
                bail!("sweep Mach range must lie in [0, 1)");
            }
        }

        Ok(())
    }
}
