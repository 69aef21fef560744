//! Anchor-driven substitution into plain-text tool input templates.
//!
//! A template is edited through a cursor: [`Edit::Mark`] moves it to a line
//! holding an anchor, [`Edit::Set`] overwrites one whitespace-delimited token
//! on a line relative to that anchor, and [`Edit::Reset`] rewinds it to the
//! top of the file.

use crate::error::{Error, Result};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

/// A value rendered into a template token.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Fixed-point number with `precision` decimals.
    Number { value: f64, precision: usize },
    Integer(i64),
    /// Written verbatim.
    Text(String),
    /// Written between double quotes.
    Quoted(String),
    /// Written between double quotes with `/` separators.
    Path(PathBuf),
}

impl Value {
    pub fn number(value: f64, precision: usize) -> Self {
        Value::Number { value, precision }
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Value::Path(path.into())
    }

    pub fn render(&self) -> String {
        match self {
            Value::Number { value, precision } => format!("{:.*}", precision, value),
            Value::Integer(v) => v.to_string(),
            Value::Text(s) => s.clone(),
            Value::Quoted(s) => format!("\"{}\"", s),
            Value::Path(p) => format!("\"{}\"", p.to_string_lossy().replace('\\', "/")),
        }
    }
}

/// One step of a template edit script.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    /// Move to the line holding `anchor`, skipping `skip` further occurrences.
    Mark { anchor: String, skip: usize },
    /// Overwrite token `field` on the line `row` lines below the anchor.
    Set { row: usize, field: usize, value: Value },
    /// Rewind so the next mark searches from the top.
    Reset,
}

impl Edit {
    pub fn mark(anchor: impl Into<String>) -> Self {
        Edit::Mark {
            anchor: anchor.into(),
            skip: 0,
        }
    }

    pub fn mark_skip(anchor: impl Into<String>, skip: usize) -> Self {
        Edit::Mark {
            anchor: anchor.into(),
            skip,
        }
    }

    pub fn set(field: usize, value: Value) -> Self {
        Edit::Set { row: 0, field, value }
    }

    pub fn set_row(row: usize, field: usize, value: Value) -> Self {
        Edit::Set { row, field, value }
    }

    /// Order-independent `reset, mark, set` for a single keyed line.
    pub fn keyed(anchor: impl Into<String>, field: usize, value: Value) -> [Edit; 3] {
        [Edit::Reset, Edit::mark(anchor), Edit::set(field, value)]
    }
}

/// An in-memory template being edited.
#[derive(Debug, Clone)]
pub struct Template {
    source: PathBuf,
    lines: Vec<String>,
    trailing_newline: bool,
    anchor: Option<usize>,
}

impl Template {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(Self::from_text(path, &text))
    }

    /// `source` names the template in error messages.
    pub fn from_text(source: impl Into<PathBuf>, text: &str) -> Self {
        Self {
            source: source.into(),
            lines: text.lines().map(str::to_string).collect(),
            trailing_newline: text.ends_with('\n'),
            anchor: None,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn apply(&mut self, edit: &Edit) -> Result<()> {
        match edit {
            Edit::Mark { anchor, skip } => self.mark(anchor, *skip),
            Edit::Set { row, field, value } => self.set(*row, *field, value),
            Edit::Reset => {
                self.anchor = None;
                Ok(())
            }
        }
    }

    pub fn apply_all<'a>(&mut self, edits: impl IntoIterator<Item = &'a Edit>) -> Result<()> {
        edits.into_iter().try_for_each(|e| self.apply(e))
    }

    fn mark(&mut self, anchor: &str, skip: usize) -> Result<()> {
        let start = self.anchor.map_or(0, |line| line + 1);
        let found = self
            .lines
            .iter()
            .enumerate()
            .skip(start)
            .filter(|(_, l)| l.contains(anchor))
            .nth(skip)
            .map(|(i, _)| i);
        match found {
            Some(line) => {
                self.anchor = Some(line);
                Ok(())
            }
            None => Err(Error::TemplateAnchorNotFound {
                path: self.source.clone(),
                anchor: anchor.to_string(),
            }),
        }
    }

    fn target(&self, row: usize, field: usize) -> Result<(usize, Range<usize>)> {
        let line = self.anchor.unwrap_or(0) + row;
        let out_of_range = |available| Error::TemplateFieldOutOfRange {
            path: self.source.clone(),
            line: line + 1,
            field,
            available,
        };
        let text = self.lines.get(line).ok_or_else(|| out_of_range(0))?;
        let spans = token_spans(text);
        let span = spans.get(field).cloned().ok_or_else(|| out_of_range(spans.len()))?;
        Ok((line, span))
    }

    fn set(&mut self, row: usize, field: usize, value: &Value) -> Result<()> {
        let (line, span) = self.target(row, field)?;
        self.lines[line].replace_range(span, &value.render());
        Ok(())
    }

    /// Token `field` on the line `row` lines below the current anchor.
    pub fn token(&self, row: usize, field: usize) -> Result<&str> {
        let (line, span) = self.target(row, field)?;
        Ok(&self.lines[line][span])
    }

    pub fn render(&self) -> String {
        let mut text = self.lines.join("\n");
        if self.trailing_newline {
            text.push('\n');
        }
        text
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render()).map_err(|e| Error::io(path, e))
    }
}

/// Byte ranges of the whitespace-delimited tokens of `line`.
pub(crate) fn token_spans(line: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in line.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                spans.push(s..i);
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push(s..line.len());
    }
    spans
}

/// Load `template_path`, apply `edits` in order and write `output_path`.
///
/// Nothing is written unless every edit succeeds.
pub fn instantiate(template_path: &Path, output_path: &Path, edits: &[Edit]) -> Result<()> {
    let mut template = Template::load(template_path)?;
    template.apply_all(edits)?;
    template.write(output_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SOLVER: &str = "\
Sref = 0.000000
Cref = 0.000000
Mach = 0.000000
AoA = 0.000000
";

    const SCRIPT: &str = "\
// @wing
    SetParmVal( wing, \"Span\", \"XSec_1\", 0.0 );
    ReadFileAirfoil( wing_xsec, \"root.af\" );
    ReadFileAirfoil( wing_xsec, \"kink.af\" );
    ReadFileAirfoil( wing_xsec, \"tip.af\" );
";

    #[test]
    fn test_token_spans() {
        assert_eq!(token_spans("  a bb\tccc "), vec![2..3, 4..6, 7..10]);
        assert!(token_spans("   ").is_empty());
    }

    #[test]
    fn test_keyed_edits_out_of_order() {
        let mut t = Template::from_text("solver.vspaero", SOLVER);
        let edits: Vec<Edit> = [
            Edit::keyed("Mach", 2, Value::number(0.2, 4)),
            Edit::keyed("Sref", 2, Value::number(16.2, 2)),
        ]
        .concat();
        t.apply_all(&edits).unwrap();

        let out = t.render();
        assert!(out.contains("Mach = 0.2000\n"));
        assert!(out.starts_with("Sref = 16.20\n"));
        assert!(out.ends_with("AoA = 0.000000\n"));
    }

    #[test]
    fn test_repeated_anchor_fills_successive_lines() {
        let mut t = Template::from_text("wing.vspscript", SCRIPT);
        for _ in 0..3 {
            t.apply(&Edit::mark("ReadFileAirfoil")).unwrap();
            t.apply(&Edit::set(2, Value::path(r"airfoils\naca23012.af"))).unwrap();
        }
        let out = t.render();
        assert_eq!(out.matches("\"airfoils/naca23012.af\"").count(), 3);
        assert!(!out.contains("root.af"));
    }

    #[test]
    fn test_fourth_occurrence_is_missing() {
        let mut t = Template::from_text("wing.vspscript", SCRIPT);
        t.apply(&Edit::mark_skip("ReadFileAirfoil", 2)).unwrap();
        let err = t.apply(&Edit::mark("ReadFileAirfoil")).unwrap_err();
        assert!(matches!(err, Error::TemplateAnchorNotFound { ref anchor, .. } if anchor == "ReadFileAirfoil"));

        t.apply(&Edit::Reset).unwrap();
        assert!(t.apply(&Edit::mark("ReadFileAirfoil")).is_ok());
    }

    #[test]
    fn test_row_offset_and_line_preserved() {
        let mut t = Template::from_text("wing.vspscript", SCRIPT);
        t.apply(&Edit::mark("@wing")).unwrap();
        t.apply(&Edit::set_row(1, 4, Value::number(5.5, 3))).unwrap();
        assert_eq!(
            t.lines()[1],
            "    SetParmVal( wing, \"Span\", \"XSec_1\", 5.500 );"
        );
    }

    #[test]
    fn test_field_out_of_range() {
        let mut t = Template::from_text("solver.vspaero", SOLVER);
        t.apply(&Edit::mark("Mach")).unwrap();
        let err = t.apply(&Edit::set(3, Value::Integer(1))).unwrap_err();
        assert!(matches!(
            err,
            Error::TemplateFieldOutOfRange { line: 3, field: 3, available: 3, .. }
        ));

        let err = t.apply(&Edit::set_row(10, 0, Value::Integer(1))).unwrap_err();
        assert!(matches!(err, Error::TemplateFieldOutOfRange { available: 0, .. }));
    }

    #[test]
    fn test_missing_anchor_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let template = dir.path().join("solver.vspaero");
        let output = dir.path().join("out.vspaero");
        fs::write(&template, SOLVER.replace("Mach", "Ma")).unwrap();

        let edits = Edit::keyed("Mach", 2, Value::number(0.2, 6));
        let err = instantiate(&template, &output, &edits).unwrap_err();
        assert!(matches!(err, Error::TemplateAnchorNotFound { .. }));
        assert!(!output.exists());
    }

    #[test]
    fn test_numeric_edits_are_recoverable() {
        let dir = TempDir::new().unwrap();
        let template = dir.path().join("solver.vspaero");
        let output = dir.path().join("out.vspaero");
        fs::write(&template, SOLVER).unwrap();

        let values = [("Sref", 16.2), ("Cref", 1.478_123), ("Mach", 0.2), ("AoA", -2.5)];
        let edits: Vec<Edit> = values
            .iter()
            .flat_map(|(a, v)| Edit::keyed(*a, 2, Value::number(*v, 6)))
            .collect();
        instantiate(&template, &output, &edits).unwrap();

        let mut generated = Template::load(&output).unwrap();
        for (anchor, value) in values {
            generated.apply_all(&[Edit::Reset, Edit::mark(anchor)]).unwrap();
            let read: f64 = generated.token(0, 2).unwrap().parse().unwrap();
            assert!((read - value).abs() < 1e-9, "{} read back as {}", anchor, read);
        }
        assert!(!generated.render().contains("0.000000"));
    }
}
