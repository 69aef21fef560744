use indexmap::IndexMap;
use serde::Serialize;

/// A single named coefficient: a scalar, or a span-wise series.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Coefficient {
    Scalar(f64),
    Series(Vec<f64>),
}

impl Coefficient {
    pub fn kind(&self) -> &'static str {
        match self {
            Coefficient::Scalar(_) => "scalar",
            Coefficient::Series(_) => "series",
        }
    }

    pub fn values(&self) -> &[f64] {
        match self {
            Coefficient::Scalar(v) => std::slice::from_ref(v),
            Coefficient::Series(v) => v,
        }
    }
}

/// Named coefficients produced by the parser or read back from the cache.
///
/// Insertion order is kept so stored files list coefficients the way the
/// parser discovered them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultRecord {
    entries: IndexMap<String, Coefficient>,
}

impl ResultRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_scalar(&mut self, name: impl Into<String>, value: f64) {
        self.entries.insert(name.into(), Coefficient::Scalar(value));
    }

    pub fn insert_series(&mut self, name: impl Into<String>, values: Vec<f64>) {
        self.entries.insert(name.into(), Coefficient::Series(values));
    }

    pub fn insert(&mut self, name: impl Into<String>, coefficient: Coefficient) {
        self.entries.insert(name.into(), coefficient);
    }

    pub fn get(&self, name: &str) -> Option<&Coefficient> {
        self.entries.get(name)
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        match self.entries.get(name)? {
            Coefficient::Scalar(v) => Some(*v),
            Coefficient::Series(_) => None,
        }
    }

    pub fn series(&self, name: &str) -> Option<&[f64]> {
        match self.entries.get(name)? {
            Coefficient::Series(v) => Some(v),
            Coefficient::Scalar(_) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Coefficient)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge another record into this one, overwriting duplicate names.
    pub fn extend(&mut self, other: ResultRecord) {
        self.entries.extend(other.entries);
    }

    /// Check that every series has the same length as `coordinate`.
    ///
    /// Returns the name of the first offending series.
    pub fn check_series(&self, coordinate: &str) -> Result<(), String> {
        let Some(expected) = self.series(coordinate).map(<[f64]>::len) else {
            return Err(coordinate.to_string());
        };
        for (name, coefficient) in self.iter() {
            if let Coefficient::Series(values) = coefficient {
                if values.len() != expected {
                    return Err(name.to_string());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_and_series_accessors() {
        let mut record = ResultRecord::new();
        record.insert_scalar("CL_alpha", 5.1);
        record.insert_series("y", vec![0.5, 1.5]);

        assert_eq!(record.scalar("CL_alpha"), Some(5.1));
        assert_eq!(record.series("y"), Some(&[0.5, 1.5][..]));
        assert_eq!(record.scalar("y"), None);
        assert_eq!(record.len(), 2);
    }

    #[test]
    fn test_check_series_lengths() {
        let mut record = ResultRecord::new();
        record.insert_series("y", vec![0.1, 0.2, 0.3]);
        record.insert_series("cl", vec![0.4, 0.5, 0.6]);
        assert!(record.check_series("y").is_ok());

        record.insert_series("chord", vec![1.0]);
        assert_eq!(record.check_series("y"), Err("chord".to_string()));
        assert_eq!(record.check_series("x"), Err("x".to_string()));
    }
}
