//! Propeller placement for the slipstream (wing + rotor) pipeline.
//!
//! An engine layout is resolved from a mounting code and an engine count
//! into one of three shapes, then every engine gets a position, a signed
//! rotation rate and its actuator-disc coefficients. The same module expands
//! a single-rotor solver template into an N-rotor one.

use crate::error::{Error, Result};
use crate::template::{token_spans, Edit, Value};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Marker line holding the rotor count in the solver template.
pub const ROTOR_COUNT_MARKER: &str = "NumberOfRotors";
/// Name prefix of a rotor block; blocks are numbered from 1.
pub const ROTOR_NAME_PREFIX: &str = "PropElement_";
/// Lines per rotor block: name, disc id, position, normal, radius, hub radius, rpm, CT, CP.
pub const ROTOR_BLOCK_LINES: usize = 9;

/// Disc normal shared by every propeller (pointing upstream).
const DISC_NORMAL: [f64; 3] = [-1.0, 0.0, 0.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mounting {
    Wing,
    Nose,
}

impl Mounting {
    /// Numeric layout code used by the sizing tools: 1 = wing, 3 = nose.
    pub fn from_code(code: f64) -> Result<Self> {
        match code {
            c if c == 1.0 => Ok(Mounting::Wing),
            c if c == 3.0 => Ok(Mounting::Nose),
            other => Err(Error::invalid(
                "engine_layout",
                format!("unsupported layout code {}", other),
            )),
        }
    }

    pub fn code(self) -> f64 {
        match self {
            Mounting::Wing => 1.0,
            Mounting::Nose => 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    NoseOnly,
    WingSymmetric,
    WingSymmetricPlusNose,
}

impl LayoutKind {
    pub fn resolve(mounting: Mounting, count: usize) -> Result<Self> {
        match (mounting, count) {
            (_, 0) => Err(Error::invalid("engine_count", "at least one engine is required")),
            (_, 1) => Ok(LayoutKind::NoseOnly),
            (Mounting::Nose, n) => Err(Error::invalid(
                "engine_count",
                format!("nose mounting carries a single engine, got {}", n),
            )),
            (Mounting::Wing, n) if n % 2 == 0 => Ok(LayoutKind::WingSymmetric),
            (Mounting::Wing, _) => Ok(LayoutKind::WingSymmetricPlusNose),
        }
    }

    pub fn has_nose_engine(self) -> bool {
        matches!(self, LayoutKind::NoseOnly | LayoutKind::WingSymmetricPlusNose)
    }

    /// Number of symmetric wing pairs for `count` engines.
    pub fn pairs(self, count: usize) -> usize {
        match self {
            LayoutKind::NoseOnly => 0,
            LayoutKind::WingSymmetric => count / 2,
            LayoutKind::WingSymmetricPlusNose => (count - 1) / 2,
        }
    }
}

/// Trapezoidal wing with an optional straight (untapered) inner part.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WingPlanform {
    pub semi_span: f64,
    /// Span station where the straight part ends
    pub root_y: f64,
    pub root_chord: f64,
    pub tip_chord: f64,
    /// Quarter-chord sweep in degrees
    pub sweep_25: f64,
    /// Leading edge x of the root chord
    pub root_le_x: f64,
    /// Wing reference height
    pub height: f64,
}

impl WingPlanform {
    /// `root_y` is held to `[0, semi_span]`; at `semi_span` the wing has no
    /// tapered panel and is a plain rectangle.
    pub fn new(
        area: f64,
        aspect_ratio: f64,
        taper_ratio: f64,
        sweep_25: f64,
        root_y: f64,
        root_le_x: f64,
        height: f64,
    ) -> Self {
        let semi_span = (area * aspect_ratio).sqrt() / 2.0;
        let root_y = root_y.max(0.0).min(semi_span);
        let root_chord = area / (2.0 * root_y + (semi_span - root_y) * (1.0 + taper_ratio));
        Self {
            semi_span,
            root_y,
            root_chord,
            tip_chord: root_chord * taper_ratio,
            sweep_25,
            root_le_x,
            height,
        }
    }

    pub fn span(&self) -> f64 {
        2.0 * self.semi_span
    }

    fn tapered_length(&self) -> f64 {
        self.semi_span - self.root_y
    }

    pub fn leading_edge_sweep(&self) -> f64 {
        let tan_25 = self.sweep_25.to_radians().tan();
        if self.tapered_length() <= 0.0 {
            return self.sweep_25.to_radians();
        }
        (tan_25 + 0.25 * (self.root_chord - self.tip_chord) / self.tapered_length()).atan()
    }

    pub fn leading_edge_x(&self, y: f64) -> f64 {
        let y = y.abs();
        if y <= self.root_y {
            self.root_le_x
        } else {
            self.root_le_x + (y - self.root_y) * self.leading_edge_sweep().tan()
        }
    }

    pub fn chord_at(&self, y: f64) -> f64 {
        let y = y.abs();
        if y <= self.root_y || self.tapered_length() <= 0.0 {
            self.root_chord
        } else {
            let t = ((y - self.root_y) / self.tapered_length()).min(1.0);
            self.root_chord + t * (self.tip_chord - self.root_chord)
        }
    }

    pub fn mean_aerodynamic_chord(&self) -> f64 {
        let (cr, ct) = (self.root_chord, self.tip_chord);
        let area = 2.0 * (cr * self.root_y + self.tapered_length() * (cr + ct) / 2.0);
        let moment = cr * cr * self.root_y + self.tapered_length() * (cr * cr + cr * ct + ct * ct) / 3.0;
        2.0 * moment / area
    }
}

/// Actuator-disc settings shared by every propeller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Propeller {
    pub rpm: f64,
    pub radius: f64,
    pub hub_radius: f64,
    pub thrust_coefficient: f64,
    pub power_coefficient: f64,
    /// Distance of the disc ahead of the local leading edge
    pub offset: f64,
    pub nose_x: f64,
    pub nose_z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineSite {
    Nose,
    WingLeft,
    WingRight,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Engine {
    pub index: usize,
    pub site: EngineSite,
    pub position: [f64; 3],
    /// Signed rotation rate; the sign alternates from one engine to the next
    pub rpm: f64,
    pub radius: f64,
    pub hub_radius: f64,
    pub thrust_coefficient: f64,
    pub power_coefficient: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineLayout {
    pub kind: LayoutKind,
    pub engines: Vec<Engine>,
}

impl EngineLayout {
    pub fn derive(
        mounting: Mounting,
        count: usize,
        span_ratios: &[f64],
        wing: &WingPlanform,
        propeller: &Propeller,
    ) -> Result<Self> {
        let kind = LayoutKind::resolve(mounting, count)?;
        let pairs = kind.pairs(count);
        if span_ratios.len() != pairs {
            return Err(Error::invalid(
                "engine_span_ratios",
                format!("{} engines need {} span ratios, got {}", count, pairs, span_ratios.len()),
            ));
        }
        if let Some(bad) = span_ratios.iter().find(|r| !(r.is_finite() && **r > 0.0 && **r <= 1.0)) {
            return Err(Error::invalid(
                "engine_span_ratios",
                format!("ratio {} outside (0, 1]", bad),
            ));
        }

        let mut sites = Vec::with_capacity(count);
        if kind.has_nose_engine() {
            sites.push((EngineSite::Nose, [propeller.nose_x, 0.0, propeller.nose_z]));
        }
        for ratio in span_ratios {
            let y = ratio * wing.semi_span;
            let x = wing.leading_edge_x(y) - propeller.offset;
            sites.push((EngineSite::WingLeft, [x, -y, wing.height]));
            sites.push((EngineSite::WingRight, [x, y, wing.height]));
        }

        let engines = sites
            .into_iter()
            .enumerate()
            .map(|(index, (site, position))| Engine {
                index,
                site,
                position,
                rpm: if index % 2 == 0 { propeller.rpm } else { -propeller.rpm },
                radius: propeller.radius,
                hub_radius: propeller.hub_radius,
                thrust_coefficient: propeller.thrust_coefficient,
                power_coefficient: propeller.power_coefficient,
            })
            .collect();

        Ok(Self { kind, engines })
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Edits filling the rotor blocks of a synthesized template.
    pub fn rotor_edits(&self, precision: usize) -> Vec<Edit> {
        let num = |v: f64| Value::number(v, precision);
        let mut edits = vec![Edit::Reset];
        for engine in &self.engines {
            edits.push(Edit::mark(format!("{}{}", ROTOR_NAME_PREFIX, engine.index + 1)));
            for (field, v) in engine.position.iter().enumerate() {
                edits.push(Edit::set_row(2, field, num(*v)));
            }
            for (field, v) in DISC_NORMAL.iter().enumerate() {
                edits.push(Edit::set_row(3, field, num(*v)));
            }
            edits.push(Edit::set_row(4, 0, num(engine.radius)));
            edits.push(Edit::set_row(5, 0, num(engine.hub_radius)));
            edits.push(Edit::set_row(6, 0, num(engine.rpm)));
            edits.push(Edit::set_row(7, 0, num(engine.thrust_coefficient)));
            edits.push(Edit::set_row(8, 0, num(engine.power_coefficient)));
        }
        edits
    }
}

/// Expand the single rotor block of `single` into `count` blocks at `output`.
pub fn synthesize_rotor_template(single: &Path, count: usize, output: &Path) -> Result<()> {
    let text = fs::read_to_string(single).map_err(|e| Error::io(single, e))?;
    let lines: Vec<&str> = text.lines().collect();

    let marker = lines
        .iter()
        .position(|l| l.trim_start().starts_with(ROTOR_COUNT_MARKER))
        .ok_or_else(|| Error::TemplateAnchorNotFound {
            path: single.to_path_buf(),
            anchor: ROTOR_COUNT_MARKER.to_string(),
        })?;
    let block_end = marker + 1 + ROTOR_BLOCK_LINES;
    if block_end > lines.len() {
        return Err(Error::TemplateFieldOutOfRange {
            path: single.to_path_buf(),
            line: lines.len() + 1,
            field: 0,
            available: 0,
        });
    }

    let marker_line = lines[marker];
    let count_span = token_spans(marker_line)
        .pop()
        .ok_or_else(|| Error::TemplateFieldOutOfRange {
            path: single.to_path_buf(),
            line: marker + 1,
            field: 0,
            available: 0,
        })?;

    let mut out: Vec<String> = lines[..marker].iter().map(|l| l.to_string()).collect();
    let mut count_line = marker_line.to_string();
    count_line.replace_range(count_span, &count.to_string());
    out.push(count_line);

    let block = &lines[marker + 1..block_end];
    for i in 0..count {
        out.push(format!("{}{}", ROTOR_NAME_PREFIX, i + 1));
        out.push((i + 1).to_string());
        out.extend(block[2..].iter().map(|l| l.to_string()));
    }
    out.extend(lines[block_end..].iter().map(|l| l.to_string()));

    let mut rendered = out.join("\n");
    rendered.push('\n');
    fs::write(output, rendered).map_err(|e| Error::io(output, e))
}
