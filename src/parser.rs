//! Readers for the aerodynamic solver's text outputs.
//!
//! Stability tables are bound by header name: every `Coef` row redefines the
//! column → variable map for the rows that follow it, and the `Mach` column
//! is dropped. Nothing downstream depends on the column order the solver
//! happened to use.

use crate::error::{Error, Result};
use crate::record::ResultRecord;
use indexmap::IndexMap;
use std::fs;
use std::path::Path;

pub const COEFFICIENT_HEADER: &str = "Coef";
pub const COMPONENT_SUMMARY: &str = "Comp";
pub const SPAN_EFFICIENCY_COLUMN: &str = "E";

/// Coefficient family of a stability row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Lift,
    Drag,
    SideForce,
    Rolling,
    Pitching,
    Yawing,
}

impl Family {
    pub const ALL: [Family; 6] = [
        Family::Lift,
        Family::Drag,
        Family::SideForce,
        Family::Rolling,
        Family::Pitching,
        Family::Yawing,
    ];

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "CL" => Some(Family::Lift),
            "CD" => Some(Family::Drag),
            "CS" => Some(Family::SideForce),
            "CMl" => Some(Family::Rolling),
            "CMm" => Some(Family::Pitching),
            "CMn" => Some(Family::Yawing),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Family::Lift => "CL",
            Family::Drag => "CD",
            Family::SideForce => "CS",
            Family::Rolling => "CMl",
            Family::Pitching => "CMm",
            Family::Yawing => "CMn",
        }
    }
}

/// Input variable a stability column is differentiated against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Variable {
    /// Coefficient value itself
    Total,
    Alpha,
    Beta,
    RollRate,
    PitchRate,
    YawRate,
    Speed,
    /// Control-surface deflection group, named as in the header
    Control(String),
}

/// Order legacy consumers index derivative vectors by.
pub const CANONICAL_ORDER: [Variable; 7] = [
    Variable::Total,
    Variable::Alpha,
    Variable::Beta,
    Variable::RollRate,
    Variable::PitchRate,
    Variable::YawRate,
    Variable::Speed,
];

impl Variable {
    /// `None` for columns that are read past (Mach).
    pub fn from_header(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "total" => Some(Variable::Total),
            "alpha" => Some(Variable::Alpha),
            "beta" => Some(Variable::Beta),
            "p" => Some(Variable::RollRate),
            "q" => Some(Variable::PitchRate),
            "r" => Some(Variable::YawRate),
            "u" => Some(Variable::Speed),
            "mach" => None,
            _ => Some(Variable::Control(token.to_string())),
        }
    }

    pub fn suffix(&self) -> &str {
        match self {
            Variable::Total => "",
            Variable::Alpha => "alpha",
            Variable::Beta => "beta",
            Variable::RollRate => "p",
            Variable::PitchRate => "q",
            Variable::YawRate => "r",
            Variable::Speed => "u",
            Variable::Control(name) => name,
        }
    }

    /// `CL` for the total, `CL_alpha`, `CMm_q`, ... otherwise.
    pub fn record_name(&self, family: Family) -> String {
        match self {
            Variable::Total => family.tag().to_string(),
            other => format!("{}_{}", family.tag(), other.suffix()),
        }
    }
}

/// Stability derivatives bound by (family, variable).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StabilityDerivatives {
    values: IndexMap<(Family, Variable), f64>,
    order: Vec<Variable>,
}

impl StabilityDerivatives {
    pub fn get(&self, family: Family, variable: &Variable) -> Option<f64> {
        self.values.get(&(family, variable.clone())).copied()
    }

    /// Variables in the column order of the last header, Mach excluded.
    pub fn variable_order(&self) -> &[Variable] {
        &self.order
    }

    /// Whether the file listed its variables in [`CANONICAL_ORDER`].
    pub fn has_canonical_order(&self) -> bool {
        self.order.len() >= CANONICAL_ORDER.len() && self.order[..CANONICAL_ORDER.len()] == CANONICAL_ORDER
    }

    /// Values of one family in canonical order, looked up by name.
    pub fn positional(&self, family: Family) -> Option<Vec<f64>> {
        CANONICAL_ORDER.iter().map(|v| self.get(family, v)).collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_record(&self) -> ResultRecord {
        let mut record = ResultRecord::new();
        for ((family, variable), value) in &self.values {
            record.insert_scalar(variable.record_name(*family), *value);
        }
        record
    }
}

pub fn parse_stability(path: &Path) -> Result<StabilityDerivatives> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    parse_stability_str(path, &text)
}

pub fn parse_stability_str(path: &Path, text: &str) -> Result<StabilityDerivatives> {
    let mut columns: Option<Vec<Option<Variable>>> = None;
    let mut out = StabilityDerivatives::default();

    for (i, line) in text.lines().enumerate() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = tokens.first() else {
            continue;
        };
        if first.starts_with('#') {
            continue;
        }
        if *first == COEFFICIENT_HEADER {
            let header: Vec<Option<Variable>> =
                tokens[1..].iter().map(|t| Variable::from_header(t)).collect();
            out.order = header.iter().flatten().cloned().collect();
            columns = Some(header);
            continue;
        }
        let Some(family) = Family::from_tag(first) else {
            continue;
        };
        let Some(header) = columns.as_ref() else {
            return Err(Error::malformed(
                path,
                i + 1,
                format!("'{}' row before any '{}' header", first, COEFFICIENT_HEADER),
            ));
        };
        if tokens.len() - 1 != header.len() {
            return Err(Error::malformed(
                path,
                i + 1,
                format!("{} values for {} header columns", tokens.len() - 1, header.len()),
            ));
        }
        for (variable, token) in header.iter().zip(&tokens[1..]) {
            let Some(variable) = variable else {
                continue;
            };
            let value = token.parse::<f64>().map_err(|_| {
                Error::malformed(path, i + 1, format!("'{}' is not a number", token))
            })?;
            out.values.insert((family, variable.clone()), value);
        }
    }

    if columns.is_none() {
        return Err(Error::malformed(
            path,
            text.lines().count(),
            format!("no '{}' header found", COEFFICIENT_HEADER),
        ));
    }
    if out.values.is_empty() {
        return Err(Error::malformed(
            path,
            text.lines().count(),
            "no coefficient rows after the header",
        ));
    }
    Ok(out)
}

/// Span-wise loads of one lifting surface plus its integrated coefficients.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpanLoading {
    pub y: Vec<f64>,
    pub chord: Vec<f64>,
    pub cl: Vec<f64>,
    pub cd: Vec<f64>,
    pub lift_coefficient: f64,
    pub induced_drag_coefficient: f64,
}

impl SpanLoading {
    pub fn to_record(&self) -> ResultRecord {
        let mut record = ResultRecord::new();
        record.insert_series("y", self.y.clone());
        record.insert_series("chord", self.chord.clone());
        record.insert_series("cl", self.cl.clone());
        record.insert_series("cd", self.cd.clone());
        record.insert_scalar("CL", self.lift_coefficient);
        record.insert_scalar("CDi", self.induced_drag_coefficient);
        record
    }
}

fn column(header: &[&str], name: &str, path: &Path, line: usize) -> Result<usize> {
    header
        .iter()
        .position(|h| *h == name)
        .ok_or_else(|| Error::malformed(path, line, format!("header has no '{}' column", name)))
}

fn number(token: &str, path: &Path, line: usize) -> Result<f64> {
    token
        .parse::<f64>()
        .map_err(|_| Error::malformed(path, line, format!("'{}' is not a number", token)))
}

pub fn parse_load_distribution(path: &Path, component: &str) -> Result<SpanLoading> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    parse_load_distribution_str(path, &text, component)
}

/// Rows whose first token is `component` are accumulated after the station
/// header; the `Comp` row closes the distribution and the two rows after it
/// (left and right half) are summed.
pub fn parse_load_distribution_str(path: &Path, text: &str, component: &str) -> Result<SpanLoading> {
    let lines: Vec<(usize, Vec<&str>)> = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.split_whitespace().collect::<Vec<_>>()))
        .filter(|(_, t)| !t.is_empty())
        .collect();

    let mut loading = SpanLoading::default();
    let mut stations: Option<(usize, [usize; 4])> = None;
    let mut summary = None;

    for (pos, (line, tokens)) in lines.iter().enumerate() {
        if tokens[0] == COMPONENT_SUMMARY {
            summary = Some(pos);
            break;
        }
        if tokens.contains(&"Yavg") && tokens.contains(&"Chord") {
            let cols = [
                column(tokens, "Yavg", path, *line)?,
                column(tokens, "Chord", path, *line)?,
                column(tokens, "Cl", path, *line)?,
                column(tokens, "Cd", path, *line)?,
            ];
            stations = Some((tokens.len(), cols));
            continue;
        }
        let Some((width, [y, chord, cl, cd])) = stations else {
            continue;
        };
        if tokens[0] != component {
            continue;
        }
        if tokens.len() != width {
            return Err(Error::malformed(
                path,
                *line,
                format!("{} columns for a {}-column station header", tokens.len(), width),
            ));
        }
        loading.y.push(number(tokens[y], path, *line)?);
        loading.chord.push(number(tokens[chord], path, *line)?);
        loading.cl.push(number(tokens[cl], path, *line)?);
        loading.cd.push(number(tokens[cd], path, *line)?);
    }

    if stations.is_none() {
        return Err(Error::malformed(path, 0, "no station header with 'Yavg' and 'Chord'"));
    }
    if loading.y.is_empty() {
        return Err(Error::malformed(
            path,
            0,
            format!("no stations for component '{}'", component),
        ));
    }
    let Some(pos) = summary else {
        return Err(Error::malformed(
            path,
            0,
            format!("missing '{}' summary block", COMPONENT_SUMMARY),
        ));
    };

    let (header_line, header) = &lines[pos];
    let cl_col = column(header, "CL", path, *header_line)?;
    let cdi_col = column(header, "CDi", path, *header_line)?;
    let halves = &lines[pos + 1..];
    if halves.len() < 2 {
        return Err(Error::malformed(
            path,
            *header_line,
            "summary block needs a left and a right half row",
        ));
    }
    for (line, tokens) in &halves[..2] {
        if tokens.len() != header.len() {
            return Err(Error::malformed(
                path,
                *line,
                format!("{} columns for a {}-column summary header", tokens.len(), header.len()),
            ));
        }
        loading.lift_coefficient += number(tokens[cl_col], path, *line)?;
        loading.induced_drag_coefficient += number(tokens[cdi_col], path, *line)?;
    }
    Ok(loading)
}

/// Value of `column` on the second non-blank line of a polar file.
pub fn parse_polar(path: &Path, column_name: &str) -> Result<f64> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    parse_polar_str(path, &text, column_name)
}

pub fn parse_polar_str(path: &Path, text: &str, column_name: &str) -> Result<f64> {
    let mut rows = text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| (i + 1, l.split_whitespace().collect::<Vec<_>>()));

    let (header_line, header) = rows
        .next()
        .ok_or_else(|| Error::malformed(path, 0, "empty polar file"))?;
    let col = column(&header, column_name, path, header_line)?;
    let (line, values) = rows
        .next()
        .ok_or_else(|| Error::malformed(path, header_line, "polar file has no data row"))?;
    let token = values.get(col).ok_or_else(|| {
        Error::malformed(path, line, format!("data row has no column {}", col + 1))
    })?;
    number(token, path, line)
}

/// Record of a wing/rotor run: span loads, integrated coefficients, span efficiency.
pub fn parse_rotor_outputs(lod: &Path, polar: &Path, component: &str) -> Result<ResultRecord> {
    let mut record = parse_load_distribution(lod, component)?.to_record();
    record.insert_scalar("span_efficiency", parse_polar(polar, SPAN_EFFICIENCY_COLUMN)?);
    Ok(record)
}
