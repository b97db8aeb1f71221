//! Factor catalogue: names, level names and numeric level values.
//!
//! Every factor of an experiment has a small number of discrete levels.
//! A [`FactorCatalog`] records, per factor, a display name, one name per
//! level and, for numeric factors, one numeric value per level. Numeric
//! values are what constraint predicates evaluate against.
//!
//! The catalogue is loaded from a factor-data TSV, or synthesized
//! (`F0`, `F1`, ... with levels `L0`, `L1`, ...) when no file is given.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// A single factor: its name, levels and optional numeric level values.
#[derive(Debug, Clone)]
pub struct Factor {
    /// Display name of the factor.
    pub name: String,
    /// Number of levels.
    pub levels: u8,
    /// Whether the levels carry numeric values.
    pub numeric: bool,
    /// Display name of each level.
    pub level_names: Vec<String>,
    /// Numeric value of each level; empty unless `numeric`.
    pub level_values: Vec<f64>,
}

impl Factor {
    /// Create a numeric factor whose level values equal the level indices.
    ///
    /// Convenient for constraint predicates over plain level indices.
    #[must_use]
    pub fn indexed(name: impl Into<String>, levels: u8) -> Self {
        Self {
            name: name.into(),
            levels,
            numeric: true,
            level_names: (0..levels).map(|l| format!("L{l}")).collect(),
            level_values: (0..levels).map(f64::from).collect(),
        }
    }
}

/// The catalogue of all factors in an experiment.
#[derive(Debug, Clone)]
pub struct FactorCatalog {
    factors: Vec<Factor>,
}

impl FactorCatalog {
    /// Build a catalogue from explicit factors.
    #[must_use]
    pub fn new(factors: Vec<Factor>) -> Self {
        Self { factors }
    }

    /// Synthesize a catalogue from per-factor level counts.
    ///
    /// Factors are named `F0`, `F1`, ... with levels `L0`, `L1`, ...;
    /// none of them is numeric.
    #[must_use]
    pub fn synthesized(level_counts: &[u8]) -> Self {
        let factors = level_counts
            .iter()
            .enumerate()
            .map(|(factor_i, &levels)| Factor {
                name: format!("F{factor_i}"),
                levels,
                numeric: false,
                level_names: (0..levels).map(|l| format!("L{l}")).collect(),
                level_values: Vec::new(),
            })
            .collect();
        Self { factors }
    }

    /// Load a catalogue from a factor-data TSV file.
    ///
    /// Line 1 holds the factor count; each following line holds
    /// `name levels numeric level_name x levels [level_value x levels]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] on any malformed line or arity mismatch.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let contents = fs::read_to_string(path)?;
        let mut lines = contents.lines().enumerate();

        let (_, first) = lines
            .next()
            .ok_or_else(|| Error::parse(&display, 1, "empty factor data file"))?;
        let count: usize = first
            .trim()
            .parse()
            .map_err(|_| Error::parse(&display, 1, "expected factor count"))?;

        let mut factors = Vec::with_capacity(count);
        for _ in 0..count {
            let (line_i, line) = lines
                .next()
                .ok_or_else(|| Error::parse(&display, count + 1, "missing factor line"))?;
            let line_no = line_i + 1;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return Err(Error::parse(&display, line_no, "expected name, levels, numeric"));
            }

            let name = fields[0].to_string();
            let levels: u8 = fields[1]
                .parse()
                .map_err(|_| Error::parse(&display, line_no, "bad level count"))?;
            if levels < 2 {
                return Err(Error::parse(&display, line_no, "factors need at least 2 levels"));
            }
            let numeric = parse_flag(fields[2])
                .ok_or_else(|| Error::parse(&display, line_no, "bad numeric flag"))?;

            let expected = 3 + usize::from(levels) * if numeric { 2 } else { 1 };
            if fields.len() < expected {
                return Err(Error::parse(
                    &display,
                    line_no,
                    format!("expected {expected} fields, found {}", fields.len()),
                ));
            }

            let level_names: Vec<String> = fields[3..3 + usize::from(levels)]
                .iter()
                .map(|s| (*s).to_string())
                .collect();
            let level_values = if numeric {
                fields[3 + usize::from(levels)..3 + 2 * usize::from(levels)]
                    .iter()
                    .map(|s| {
                        s.parse::<f64>()
                            .map_err(|_| Error::parse(&display, line_no, "bad level value"))
                    })
                    .collect::<Result<Vec<f64>>>()?
            } else {
                Vec::new()
            };

            factors.push(Factor {
                name,
                levels,
                numeric,
                level_names,
                level_values,
            });
        }

        Ok(Self { factors })
    }

    /// Number of factors in the catalogue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factors.len()
    }

    /// Whether the catalogue holds no factors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    /// The factor at `factor_i`.
    #[must_use]
    pub fn factor(&self, factor_i: usize) -> &Factor {
        &self.factors[factor_i]
    }

    /// Display name of a factor.
    #[must_use]
    pub fn factor_name(&self, factor_i: usize) -> &str {
        &self.factors[factor_i].name
    }

    /// Display name of a factor level.
    #[must_use]
    pub fn level_name(&self, factor_i: usize, level_i: u8) -> &str {
        &self.factors[factor_i].level_names[usize::from(level_i)]
    }

    /// Numeric value of a factor level; `0.0` for non-numeric factors.
    #[must_use]
    pub fn numeric_level(&self, factor_i: usize, level_i: u8) -> f64 {
        let factor = &self.factors[factor_i];
        if factor.numeric {
            factor.level_values[usize::from(level_i)]
        } else {
            0.0
        }
    }
}

/// Parse a boolean flag written as `0`/`1` or `false`/`true`.
pub(crate) fn parse_flag(field: &str) -> Option<bool> {
    match field {
        "0" | "false" => Some(false),
        "1" | "true" => Some(true),
        _ => None,
    }
}
