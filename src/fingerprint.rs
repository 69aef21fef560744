//! Canonical cache keys derived from geometry and flow-condition parameters.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Decimal digits every fingerprint field is rounded to.
pub const FINGERPRINT_DECIMALS: i32 = 6;

/// Wing-mounted engine pairs representable in a rotor fingerprint.
pub const MAX_ENGINE_PAIRS: usize = 4;

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    let rounded = (value * scale).round() / scale;
    // fold -0.0 into 0.0 so both serialize the same way
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Which pipeline variant, and therefore which ordered field list, applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flavor {
    Aircraft,
    AircraftWithFuselage,
    WingRotor,
}

const AIRCRAFT_FIELDS: &[&str] = &[
    "wing_area",
    "wing_aspect_ratio",
    "wing_sweep_25",
    "mach",
    "alpha",
    "wing_taper_ratio",
    "wing_dihedral",
    "wing_twist",
    "wing_root_y",
    "x_cg",
    "z_cg",
    "velocity",
    "density",
    "reynolds",
    "airfoil_digest",
    "htp_sweep_25",
    "htp_aspect_ratio",
    "htp_taper_ratio",
    "vtp_sweep_25",
    "vtp_aspect_ratio",
    "vtp_taper_ratio",
    "area_ratio_htp",
    "area_ratio_vtp",
];

const AIRCRAFT_FUSELAGE_FIELDS: &[&str] = &[
    "wing_area",
    "wing_aspect_ratio",
    "wing_sweep_25",
    "mach",
    "alpha",
    "wing_taper_ratio",
    "wing_dihedral",
    "wing_twist",
    "wing_root_y",
    "x_cg",
    "z_cg",
    "velocity",
    "density",
    "reynolds",
    "airfoil_digest",
    "htp_sweep_25",
    "htp_aspect_ratio",
    "htp_taper_ratio",
    "vtp_sweep_25",
    "vtp_aspect_ratio",
    "vtp_taper_ratio",
    "fuselage_length",
    "fuselage_max_width",
    "fuselage_max_height",
    "area_ratio_htp",
    "area_ratio_vtp",
];

const WING_ROTOR_FIELDS: &[&str] = &[
    "wing_area",
    "wing_aspect_ratio",
    "wing_sweep_25",
    "mach",
    "alpha",
    "wing_taper_ratio",
    "wing_dihedral",
    "wing_twist",
    "wing_root_y",
    "wing_root_le_x",
    "wing_height",
    "x_cg",
    "z_cg",
    "velocity",
    "density",
    "reynolds",
    "airfoil_digest",
    "engine_layout",
    "engine_count",
    "engine_span_ratio_0",
    "engine_span_ratio_1",
    "engine_span_ratio_2",
    "engine_span_ratio_3",
    "engine_offset",
    "engine_nose_x",
    "engine_nose_z",
    "rpm",
    "propeller_radius",
    "hub_radius",
    "power_coefficient",
    "thrust_coefficient",
];

impl Flavor {
    /// Ordered fingerprint fields; the last one is the excludable trailing field.
    pub fn fields(self) -> &'static [&'static str] {
        match self {
            Flavor::Aircraft => AIRCRAFT_FIELDS,
            Flavor::AircraftWithFuselage => AIRCRAFT_FUSELAGE_FIELDS,
            Flavor::WingRotor => WING_ROTOR_FIELDS,
        }
    }

    /// File stem shared by this flavor's templates and tool outputs.
    pub fn stem(self) -> &'static str {
        match self {
            Flavor::Aircraft => "aircraft",
            Flavor::AircraftWithFuselage => "aircraft_fuselage",
            Flavor::WingRotor => "wing_rotor",
        }
    }
}

/// How the trailing field of a flavor takes part in cache equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingField {
    /// Ignore the trailing field at lookup; stored coefficients are reused unscaled.
    #[default]
    ReuseUnscaled,
    /// Key on every field.
    Match,
}

impl TrailingField {
    pub fn excluded(self) -> usize {
        match self {
            TrailingField::ReuseUnscaled => 1,
            TrailingField::Match => 0,
        }
    }
}

/// Ordered name → value parameters for one evaluation request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterBundle {
    params: Vec<(String, f64)>,
}

impl ParameterBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: f64) {
        self.params.push((name.into(), value));
    }

    /// Replace the value of an existing parameter; returns false if absent.
    pub fn set(&mut self, name: &str, value: f64) -> bool {
        match self.params.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => {
                slot.1 = value;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.params.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Rounded cache key with a count of trailing fields left out of equality.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    fields: Vec<(String, f64)>,
    excluded: usize,
}

impl Fingerprint {
    /// Round every field; fails on the first non-finite value.
    pub fn build(bundle: &ParameterBundle, excluded_trailing: usize) -> Result<Self> {
        let mut fields = Vec::with_capacity(bundle.len());
        for (name, value) in bundle.iter() {
            if !value.is_finite() {
                return Err(Error::invalid(name, format!("value {} is not finite", value)));
            }
            fields.push((name.to_string(), round_to(value, FINGERPRINT_DECIMALS)));
        }
        Ok(Self {
            excluded: excluded_trailing.min(fields.len()),
            fields,
        })
    }

    /// Build after checking the bundle carries exactly the flavor's fields, in order.
    pub fn for_flavor(flavor: Flavor, bundle: &ParameterBundle, policy: TrailingField) -> Result<Self> {
        let expected = flavor.fields();
        for (i, name) in expected.iter().enumerate() {
            match bundle.params.get(i) {
                Some((n, _)) if n == name => {}
                Some((n, _)) => {
                    return Err(Error::invalid(
                        *name,
                        format!("expected at position {} but found '{}'", i, n),
                    ))
                }
                None => return Err(Error::invalid(*name, "missing from parameter bundle")),
            }
        }
        if let Some((extra, _)) = bundle.params.get(expected.len()) {
            return Err(Error::invalid(
                extra.as_str(),
                format!("not a {:?} fingerprint field", flavor),
            ));
        }
        Self::build(bundle, policy.excluded())
    }

    /// Fingerprint as read from disk; stored keys carry no exclusion.
    pub fn from_stored(fields: Vec<(String, f64)>) -> Self {
        Self {
            fields: fields
                .into_iter()
                .map(|(n, v)| (n, round_to(v, FINGERPRINT_DECIMALS)))
                .collect(),
            excluded: 0,
        }
    }

    pub fn fields(&self) -> &[(String, f64)] {
        &self.fields
    }

    pub fn excluded(&self) -> usize {
        self.excluded
    }

    /// Fields that take part in the equality test.
    pub fn compared(&self) -> &[(String, f64)] {
        &self.fields[..self.fields.len() - self.excluded]
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    /// Cache-equivalence against a stored key, honoring this key's exclusion.
    pub fn matches(&self, stored: &Fingerprint) -> bool {
        if stored.fields.len() != self.fields.len() {
            return false;
        }
        let names_match = self
            .fields
            .iter()
            .zip(&stored.fields)
            .all(|((a, _), (b, _))| a == b);
        names_match
            && self
                .compared()
                .iter()
                .zip(&stored.fields)
                .all(|((_, a), (_, b))| a == b)
    }
}
