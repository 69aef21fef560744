//! Turns a validated configuration into an evaluation [`Case`]: the ordered
//! parameter bundle that keys the cache, plus the edit scripts that write the
//! same parameters into the geometry script and the solver input.

use crate::config;
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, Flavor, ParameterBundle, TrailingField, MAX_ENGINE_PAIRS};
use crate::layout::{EngineLayout, Propeller, WingPlanform};
use crate::template::{Edit, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;

/// Line of the geometry script that names the exported geometry file.
pub const EXPORT_ANCHOR: &str = "SetComputationFileName";
pub const EXPORT_FIELD: usize = 2;

const PARM_VALUE_FIELD: usize = 4;
const AIRFOIL_ANCHOR: &str = "ReadFileAirfoil";
const AIRFOIL_FIELD: usize = 2;
const AIRFOIL_SECTIONS: usize = 3;
const SOLVER_VALUE_FIELD: usize = 2;

/// One evaluation request.
#[derive(Debug, Clone)]
pub struct Case {
    pub flavor: Flavor,
    pub bundle: ParameterBundle,
    pub trailing_field: TrailingField,
    pub geometry_edits: Vec<Edit>,
    pub solver_edits: Vec<Edit>,
    /// Source paths of the airfoil files staged next to the geometry script
    pub airfoils: Vec<PathBuf>,
    pub layout: Option<EngineLayout>,
}

impl Case {
    pub fn from_config(cfg: &config::Root) -> Result<Self> {
        let flavor = cfg.run.flavor;
        let precision = cfg.solver.precision;
        let num = |v: f64| Value::number(v, precision);
        let wing = &cfg.wing;
        let flow = &cfg.flow;

        let mut bundle = ParameterBundle::new()
            .with("wing_area", wing.area)
            .with("wing_aspect_ratio", wing.aspect_ratio)
            .with("wing_sweep_25", wing.sweep_25)
            .with("mach", flow.mach)
            .with("alpha", flow.alpha)
            .with("wing_taper_ratio", wing.taper_ratio)
            .with("wing_dihedral", wing.dihedral)
            .with("wing_twist", wing.twist)
            .with("wing_root_y", wing.root_y);
        if flavor == Flavor::WingRotor {
            bundle.push("wing_root_le_x", wing.root_le_x);
            bundle.push("wing_height", wing.height);
        }
        bundle.push("x_cg", flow.x_cg);
        bundle.push("z_cg", flow.z_cg);
        bundle.push("velocity", flow.velocity);
        bundle.push("density", flow.density);
        bundle.push("reynolds", flow.reynolds);

        let mut geometry_edits = Vec::new();
        surface(&mut geometry_edits, "wing", wing.area, wing.aspect_ratio, wing.taper_ratio, wing.sweep_25, precision);
        geometry_edits.extend(parm("wing", "Dihedral", num(wing.dihedral)));
        geometry_edits.extend(parm("wing", "Twist", num(wing.twist)));

        let airfoils = airfoil_sources(cfg);
        bundle.push("airfoil_digest", airfoil_digest(&airfoils)?);
        geometry_edits.push(Edit::Reset);
        geometry_edits.push(Edit::mark("// @wing"));
        for section in 0..AIRFOIL_SECTIONS {
            let source = &airfoils[section.min(airfoils.len() - 1)];
            let name = source
                .file_name()
                .ok_or_else(|| Error::invalid("airfoils", format!("{} has no file name", source.display())))?;
            geometry_edits.push(Edit::mark(AIRFOIL_ANCHOR));
            geometry_edits.push(Edit::set(AIRFOIL_FIELD, Value::Quoted(name.to_string_lossy().into_owned())));
        }

        let mut layout = None;
        match flavor {
            Flavor::Aircraft | Flavor::AircraftWithFuselage => {
                let htp = require(&cfg.htp, "htp")?;
                let vtp = require(&cfg.vtp, "vtp")?;
                for (name, tail) in [("htp", htp), ("vtp", vtp)] {
                    bundle.push(format!("{}_sweep_25", name), tail.sweep_25);
                    bundle.push(format!("{}_aspect_ratio", name), tail.aspect_ratio);
                    bundle.push(format!("{}_taper_ratio", name), tail.taper_ratio);
                    surface(&mut geometry_edits, name, tail.area, tail.aspect_ratio, tail.taper_ratio, tail.sweep_25, precision);
                }
                if flavor == Flavor::AircraftWithFuselage {
                    let fus = require(&cfg.fuselage, "fuselage")?;
                    bundle.push("fuselage_length", fus.length);
                    bundle.push("fuselage_max_width", fus.max_width);
                    bundle.push("fuselage_max_height", fus.max_height);
                    geometry_edits.extend(parm("fuselage", "Length", num(fus.length)));
                    geometry_edits.extend(parm("fuselage", "Ellipse_Width", num(fus.max_width)));
                    geometry_edits.extend(parm("fuselage", "Ellipse_Height", num(fus.max_height)));
                }
                bundle.push("area_ratio_htp", htp.area / wing.area);
                bundle.push("area_ratio_vtp", vtp.area / wing.area);
            }
            Flavor::WingRotor => {
                let eng = require(&cfg.engines, "engines")?;
                if eng.span_ratios.len() > MAX_ENGINE_PAIRS {
                    return Err(Error::invalid(
                        "engine_span_ratios",
                        format!("at most {} wing pairs, got {}", MAX_ENGINE_PAIRS, eng.span_ratios.len()),
                    ));
                }
                bundle.push("engine_layout", eng.mounting.code());
                bundle.push("engine_count", eng.count as f64);
                for i in 0..MAX_ENGINE_PAIRS {
                    bundle.push(
                        format!("engine_span_ratio_{}", i),
                        eng.span_ratios.get(i).copied().unwrap_or(0.0),
                    );
                }
                bundle.push("engine_offset", eng.offset);
                bundle.push("engine_nose_x", eng.nose_x);
                bundle.push("engine_nose_z", eng.nose_z);
                bundle.push("rpm", eng.rpm);
                bundle.push("propeller_radius", eng.propeller_radius);
                bundle.push("hub_radius", eng.hub_radius);
                bundle.push("power_coefficient", eng.power_coefficient);
                bundle.push("thrust_coefficient", eng.thrust_coefficient);

                let propeller = Propeller {
                    rpm: eng.rpm,
                    radius: eng.propeller_radius,
                    hub_radius: eng.hub_radius,
                    thrust_coefficient: eng.thrust_coefficient,
                    power_coefficient: eng.power_coefficient,
                    offset: eng.offset,
                    nose_x: eng.nose_x,
                    nose_z: eng.nose_z,
                };
                layout = Some(EngineLayout::derive(
                    eng.mounting,
                    eng.count,
                    &eng.span_ratios,
                    &planform(wing),
                    &propeller,
                )?);
            }
        }

        let plan = planform(wing);
        let solver_edits = [
            ("Sref =", wing.area),
            ("Cref =", plan.mean_aerodynamic_chord()),
            ("Bref =", plan.span()),
            ("X_cg =", flow.x_cg),
            ("Z_cg =", flow.z_cg),
            ("Mach =", flow.mach),
            ("AoA =", flow.alpha),
            ("Vinf =", flow.velocity),
            ("Rho =", flow.density),
            ("ReCref =", flow.reynolds),
        ]
        .into_iter()
        .flat_map(|(anchor, v)| Edit::keyed(anchor, SOLVER_VALUE_FIELD, num(v)))
        .collect();

        Ok(Self {
            flavor,
            bundle,
            trailing_field: cfg.cache.trailing_field,
            geometry_edits,
            solver_edits,
            airfoils,
            layout,
        })
    }

    pub fn fingerprint(&self) -> Result<Fingerprint> {
        Fingerprint::for_flavor(self.flavor, &self.bundle, self.trailing_field)
    }
}

fn require<'a, T>(section: &'a Option<T>, name: &str) -> Result<&'a T> {
    section
        .as_ref()
        .ok_or_else(|| Error::invalid(name, format!("[{}] section is missing", name)))
}

fn planform(wing: &config::Wing) -> WingPlanform {
    WingPlanform::new(
        wing.area,
        wing.aspect_ratio,
        wing.taper_ratio,
        wing.sweep_25,
        wing.root_y,
        wing.root_le_x,
        wing.height,
    )
}

fn airfoil_sources(cfg: &config::Root) -> Vec<PathBuf> {
    let listed = if cfg.run.airfoils.is_empty() {
        vec![PathBuf::from("airfoils/naca23012.af")]
    } else {
        cfg.run.airfoils.clone()
    };
    listed
        .into_iter()
        .map(|p| if p.is_absolute() { p } else { cfg.solver.resource_dir.join(p) })
        .collect()
}

/// Integer key over the airfoil file names and contents, in section order.
///
/// Four bytes of SHA-256 keep the value exact through 6-decimal rounding.
fn airfoil_digest(sources: &[PathBuf]) -> Result<f64> {
    let mut hasher = Sha256::new();
    for source in sources {
        let bytes = fs::read(source).map_err(|e| Error::ResourceCopyFailed {
            path: source.clone(),
            reason: e.to_string(),
        })?;
        if let Some(name) = source.file_name() {
            hasher.update(name.to_string_lossy().as_bytes());
        }
        hasher.update([0u8]);
        hasher.update(&bytes);
    }
    let digest = hasher.finalize();
    Ok(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as f64)
}

/// Set one `SetParmVal` value inside a `// @section` block, independent of order.
fn parm(section: &str, name: &str, value: Value) -> [Edit; 4] {
    [
        Edit::Reset,
        Edit::mark(format!("// @{}", section)),
        Edit::mark(format!("\"{}\"", name)),
        Edit::set(PARM_VALUE_FIELD, value),
    ]
}

fn surface(
    edits: &mut Vec<Edit>,
    section: &str,
    area: f64,
    aspect_ratio: f64,
    taper_ratio: f64,
    sweep_25: f64,
    precision: usize,
) {
    for (name, v) in [
        ("TotalArea", area),
        ("Aspect", aspect_ratio),
        ("Taper", taper_ratio),
        ("Sweep", sweep_25),
    ] {
        edits.extend(parm(section, name, Value::number(v, precision)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{synthesize_rotor_template, LayoutKind};
    use crate::template::Template;
    use std::path::Path;
    use tempfile::TempDir;

    fn resources() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("resources")
    }

    fn config(flavor: &str) -> config::Root {
        let text = format!(
            r#"
[toolkit]
geometry_tool = "vspscript"
aero_solver = "vspaero"

[solver]
resource_dir = "{}"

[run]
flavor = "{}"

[flow]
mach = 0.2
alpha = 2.0
velocity = 68.0
reynolds = 6.0e6
x_cg = 3.1

[wing]
area = 16.2
aspect_ratio = 7.32
sweep_25 = 2.0
taper_ratio = 0.67
dihedral = 3.0
root_le_x = 2.5

[htp]
area = 3.0
aspect_ratio = 4.5
sweep_25 = 5.0
taper_ratio = 0.6

[vtp]
area = 1.782
aspect_ratio = 1.5
sweep_25 = 35.0
taper_ratio = 0.5

[fuselage]
length = 8.2
max_width = 1.2
max_height = 1.4

[engines]
mounting = "wing"
count = 3
span_ratios = [0.4]
rpm = 2400.0
propeller_radius = 0.9
hub_radius = 0.1
thrust_coefficient = 0.12
power_coefficient = 0.08
offset = 0.5
"#,
            resources().display(),
            flavor
        );
        let cfg: config::Root = toml::from_str(&text).unwrap();
        cfg.validate().unwrap();
        cfg
    }

    #[test]
    fn test_bundle_follows_flavor_order() {
        for (name, flavor) in [
            ("aircraft", Flavor::Aircraft),
            ("aircraft_with_fuselage", Flavor::AircraftWithFuselage),
            ("wing_rotor", Flavor::WingRotor),
        ] {
            let case = Case::from_config(&config(name)).unwrap();
            let names: Vec<&str> = case.bundle.iter().map(|(n, _)| n).collect();
            assert_eq!(names, flavor.fields());
            assert!(case.fingerprint().is_ok());
        }
    }

    #[test]
    fn test_area_ratios_and_excluded_field() {
        let case = Case::from_config(&config("aircraft")).unwrap();
        assert!((case.bundle.get("area_ratio_vtp").unwrap() - 0.11).abs() < 1e-12);
        let fp = case.fingerprint().unwrap();
        assert_eq!(fp.excluded(), 1);
        assert_eq!(fp.compared().last().map(|(n, _)| n.as_str()), Some("area_ratio_htp"));
    }

    #[test]
    fn test_every_solver_input_changes_the_key() {
        let base = config("aircraft");
        let stored = Case::from_config(&base).unwrap().fingerprint().unwrap();
        let variants: [fn(&mut config::Root); 5] = [
            |c| c.flow.reynolds *= 3.0,
            |c| c.flow.velocity *= 3.0,
            |c| c.flow.density = 0.9,
            |c| c.flow.z_cg += 1.0,
            |c| c.wing.root_y = 0.6,
        ];
        for change in variants {
            let mut cfg = base.clone();
            change(&mut cfg);
            let query = Case::from_config(&cfg).unwrap().fingerprint().unwrap();
            assert!(!query.matches(&stored), "{:?}", query.fields());
        }
    }

    #[test]
    fn test_rotor_placement_changes_the_key() {
        let base = config("wing_rotor");
        let stored = Case::from_config(&base).unwrap().fingerprint().unwrap();
        let variants: [fn(&mut config::Root); 5] = [
            |c| c.wing.root_le_x += 0.3,
            |c| c.wing.height = 0.4,
            |c| c.engines.as_mut().unwrap().offset = 0.8,
            |c| c.engines.as_mut().unwrap().hub_radius = 0.2,
            |c| c.engines.as_mut().unwrap().nose_x = -0.5,
        ];
        for change in variants {
            let mut cfg = base.clone();
            change(&mut cfg);
            let query = Case::from_config(&cfg).unwrap().fingerprint().unwrap();
            assert!(!query.matches(&stored), "{:?}", query.fields());
        }
    }

    #[test]
    fn test_airfoil_contents_change_the_key() {
        let dir = TempDir::new().unwrap();
        let airfoil = dir.path().join("naca23012.af");
        fs::copy(resources().join("airfoils/naca23012.af"), &airfoil).unwrap();

        let mut cfg = config("aircraft");
        cfg.run.airfoils = vec![airfoil.clone()];
        let before = Case::from_config(&cfg).unwrap();
        assert_eq!(before.bundle.get("airfoil_digest"), Case::from_config(&cfg).unwrap().bundle.get("airfoil_digest"));

        fs::write(&airfoil, "NACA 0012\n1.0 0.0\n0.0 0.0\n1.0 0.0\n").unwrap();
        let after = Case::from_config(&cfg).unwrap();
        assert_ne!(before.bundle.get("airfoil_digest"), after.bundle.get("airfoil_digest"));

        fs::remove_file(&airfoil).unwrap();
        assert!(matches!(Case::from_config(&cfg), Err(Error::ResourceCopyFailed { .. })));
    }

    #[test]
    fn test_rotor_case_pads_span_ratios() {
        let case = Case::from_config(&config("wing_rotor")).unwrap();
        assert_eq!(case.bundle.get("engine_span_ratio_0"), Some(0.4));
        assert_eq!(case.bundle.get("engine_span_ratio_3"), Some(0.0));
        let layout = case.layout.expect("layout");
        assert_eq!(layout.kind, LayoutKind::WingSymmetricPlusNose);
        assert_eq!(layout.len(), 3);
    }

    #[test]
    fn test_shipped_geometry_scripts_accept_edits() {
        for name in ["aircraft", "aircraft_with_fuselage", "wing_rotor"] {
            let case = Case::from_config(&config(name)).unwrap();
            let path = resources().join(format!("{}.vspscript", case.flavor.stem()));
            let mut script = Template::load(&path).unwrap();
            script.apply_all(&case.geometry_edits).unwrap();
            script
                .apply_all(&[Edit::Reset, Edit::mark(EXPORT_ANCHOR), Edit::set(EXPORT_FIELD, Value::path("out.csv"))])
                .unwrap();

            let out = script.render();
            assert!(out.contains("\"TotalArea\", \"WingGeom\", 16.200000 );"), "{}", name);
            assert_eq!(out.matches("\"naca23012.af\"").count(), AIRFOIL_SECTIONS);
            assert!(out.contains("\"out.csv\""));
        }
    }

    #[test]
    fn test_shipped_solver_templates_accept_edits() {
        for name in ["aircraft", "aircraft_with_fuselage"] {
            let case = Case::from_config(&config(name)).unwrap();
            let path = resources().join(format!("{}_DegenGeom.vspaero", case.flavor.stem()));
            let mut input = Template::load(&path).unwrap();
            input.apply_all(&case.solver_edits).unwrap();
            let out = input.render();
            assert!(out.contains("Mach = 0.200000"));
            assert!(out.contains("Sref = 16.200000"));
            assert!(out.contains("ReCref = 6000000.000000"));
        }
    }

    #[test]
    fn test_shipped_rotor_template_expands() {
        let dir = TempDir::new().unwrap();
        let case = Case::from_config(&config("wing_rotor")).unwrap();
        let layout = case.layout.as_ref().unwrap();
        let expanded = dir.path().join("rotors.vspaero");
        synthesize_rotor_template(&resources().join("wing_rotor_DegenGeom.vspaero"), layout.len(), &expanded).unwrap();

        let mut input = Template::load(&expanded).unwrap();
        input.apply_all(&case.solver_edits).unwrap();
        input.apply_all(&layout.rotor_edits(6)).unwrap();
        let out = input.render();
        assert!(out.contains("NumberOfRotors = 3"));
        assert!(out.contains("PropElement_3"));
        assert!(out.contains("-2400.000000"));
    }
}
