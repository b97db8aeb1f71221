//! Locating array core type and its TSV format.
//!
//! A [`LocatingArray`] is a `tests x factors` matrix of level indices
//! together with per-factor grouping metadata and an ordered list of
//! [`ConstraintGroup`]s. Rows are appended and removed only by the
//! repair engines; everything else treats the level matrix as read-only.
//!
//! ## File format (`v2.0`)
//!
//! Line 1: version. Line 2: `tests<TAB>factors`. Line 3: per-factor
//! level counts. Next `factors` lines: `grouped_flag [level_group x
//! levels]`. Then the constraint-group count followed by two lines per
//! group (factor list, then predicate count and prefix-notation
//! predicate tokens). The remaining `tests` lines are tab-separated
//! level indices.

use std::fs;
use std::io::Write;
use std::path::Path;

use rand::Rng;

use crate::constraint::{ConstraintGroup, Expr};
use crate::error::{Error, Result};
use crate::factor::{parse_flag, FactorCatalog};

/// Version string accepted at the head of a locating-array file.
pub const LA_VERSION: &str = "v2.0";

/// Per-factor grouping and constraint metadata.
#[derive(Debug, Clone)]
pub struct GroupingInfo {
    /// Level count for this factor.
    pub levels: u8,
    /// Whether consecutive levels are rolled up into groups during
    /// interaction enumeration.
    pub grouped: bool,
    /// Group id per level; `None` unless `grouped`. Group ids must tile
    /// the levels in contiguous runs.
    pub level_groups: Option<Vec<u8>>,
    /// Constraint group this factor belongs to, if any.
    pub con_group: Option<usize>,
    /// This factor's position inside that constraint group.
    pub con_group_index: usize,
}

impl GroupingInfo {
    fn ungrouped(levels: u8) -> Self {
        Self {
            levels,
            grouped: false,
            level_groups: None,
            con_group: None,
            con_group_index: 0,
        }
    }
}

/// The locating array: level matrix, grouping metadata, constraints.
#[derive(Debug, Clone)]
pub struct LocatingArray {
    grouping: Vec<GroupingInfo>,
    levels: Vec<Vec<u8>>,
    factors: usize,
    t: usize,
    con_groups: Vec<ConstraintGroup>,
    catalog: FactorCatalog,
}

impl LocatingArray {
    /// Create an empty array (no rows) with a synthesized catalogue and
    /// the default interaction strength `t = 2`.
    #[must_use]
    pub fn new(level_counts: &[u8]) -> Self {
        Self::with_catalog(level_counts, FactorCatalog::synthesized(level_counts))
    }

    /// Create an empty array with an explicit factor catalogue.
    ///
    /// # Panics
    ///
    /// Panics if the catalogue width disagrees with `level_counts`.
    #[must_use]
    pub fn with_catalog(level_counts: &[u8], catalog: FactorCatalog) -> Self {
        assert_eq!(
            catalog.len(),
            level_counts.len(),
            "catalogue width {} must match factor count {}",
            catalog.len(),
            level_counts.len()
        );
        Self {
            grouping: level_counts
                .iter()
                .map(|&l| GroupingInfo::ungrouped(l))
                .collect(),
            levels: Vec::new(),
            factors: level_counts.len(),
            t: 2,
            con_groups: Vec::new(),
            catalog,
        }
    }

    /// Set the interaction strength target.
    pub fn set_t(&mut self, t: usize) {
        assert!(t >= 1, "interaction strength must be at least 1");
        self.t = t;
    }

    /// Mark a factor as grouped with the given per-level group ids.
    ///
    /// # Panics
    ///
    /// Panics if the id vector length disagrees with the factor's level
    /// count.
    pub fn set_level_groups(&mut self, factor_i: usize, level_groups: Vec<u8>) {
        let info = &mut self.grouping[factor_i];
        assert_eq!(level_groups.len(), usize::from(info.levels));
        info.grouped = true;
        info.level_groups = Some(level_groups);
    }

    /// Append a constraint group over `factor_indices` with the given
    /// predicates, linking the factors back to the group.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConstraintUnsatisfiable`] when the predicates
    /// admit no level combination.
    pub fn add_constraint_group(
        &mut self,
        factor_indices: Vec<usize>,
        exprs: Vec<Expr>,
    ) -> Result<()> {
        let group_i = self.con_groups.len();
        let level_counts: Vec<u8> = factor_indices
            .iter()
            .map(|&f| self.grouping[f].levels)
            .collect();
        let group = ConstraintGroup::build(
            group_i,
            factor_indices,
            exprs,
            &level_counts,
            self.factors,
            &self.catalog,
        )?;
        for (pos, &factor_i) in group.factor_indices().iter().enumerate() {
            self.grouping[factor_i].con_group = Some(group_i);
            self.grouping[factor_i].con_group_index = pos;
        }
        self.con_groups.push(group);
        Ok(())
    }

    /// Number of factors.
    #[must_use]
    pub fn factors(&self) -> usize {
        self.factors
    }

    /// Number of rows (tests).
    #[must_use]
    pub fn rows(&self) -> usize {
        self.levels.len()
    }

    /// Interaction strength target.
    #[must_use]
    pub fn t(&self) -> usize {
        self.t
    }

    /// Grouping metadata of a factor.
    #[must_use]
    pub fn grouping(&self, factor_i: usize) -> &GroupingInfo {
        &self.grouping[factor_i]
    }

    /// The constraint groups, in file order.
    #[must_use]
    pub fn con_groups(&self) -> &[ConstraintGroup] {
        &self.con_groups
    }

    /// The factor catalogue.
    #[must_use]
    pub fn catalog(&self) -> &FactorCatalog {
        &self.catalog
    }

    /// Level of `factor_i` in row `row_i`.
    #[must_use]
    pub fn level(&self, row_i: usize, factor_i: usize) -> u8 {
        self.levels[row_i][factor_i]
    }

    /// Overwrite the level of `factor_i` in row `row_i`.
    pub fn set_level(&mut self, row_i: usize, factor_i: usize, level: u8) {
        debug_assert!(level < self.grouping[factor_i].levels);
        self.levels[row_i][factor_i] = level;
    }

    /// The full level row at `row_i`.
    #[must_use]
    pub fn row(&self, row_i: usize) -> &[u8] {
        &self.levels[row_i]
    }

    /// Swap two rows of the level matrix.
    pub fn swap_rows(&mut self, row_i1: usize, row_i2: usize) {
        self.levels.swap(row_i1, row_i2);
    }

    /// Append a level row.
    ///
    /// # Panics
    ///
    /// Panics if the row width disagrees with the factor count.
    pub fn add_row(&mut self, level_row: Vec<u8>) {
        assert_eq!(level_row.len(), self.factors);
        self.levels.push(level_row);
    }

    /// Remove and return the last level row.
    ///
    /// # Panics
    ///
    /// Panics if the array has no rows.
    pub fn remove_last_row(&mut self) -> Vec<u8> {
        self.levels.pop().expect("no rows to remove")
    }

    /// Draw a satisfying assignment of constraint group `group_i` into
    /// row `row_i`.
    pub fn sample_group_into_row<R: Rng + ?Sized>(
        &mut self,
        group_i: usize,
        rng: &mut R,
        row_i: usize,
    ) {
        let Self {
            con_groups, levels, ..
        } = self;
        con_groups[group_i].sample_into(rng, &mut levels[row_i]);
    }

    /// Generate one random level row: uniform per factor, then every
    /// constraint group overwrites its factors with a sampled
    /// satisfying assignment.
    #[must_use]
    pub fn random_row<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<u8> {
        let mut row: Vec<u8> = (0..self.factors)
            .map(|f| rng.gen_range(0..self.grouping[f].levels))
            .collect();
        for group in &self.con_groups {
            group.sample_into(rng, &mut row);
        }
        row
    }

    /// Load a locating array, and optionally its factor catalogue, from
    /// TSV files. Without a factor-data file the catalogue is
    /// synthesized from the level counts.
    ///
    /// # Errors
    ///
    /// Returns a parse error on any malformed line, a version error on
    /// a non-`v2.0` file, or [`Error::ConstraintUnsatisfiable`] when a
    /// constraint group admits no combination.
    pub fn from_file(
        la_path: impl AsRef<Path>,
        factor_data_path: Option<&Path>,
    ) -> Result<Self> {
        let la_path = la_path.as_ref();
        let display = la_path.display().to_string();
        let contents = fs::read_to_string(la_path)?;
        let mut cursor = LineCursor::new(&display, &contents);

        let version = cursor.next_line()?.trim();
        if version != LA_VERSION {
            return Err(Error::UnsupportedVersion {
                expected: LA_VERSION,
                found: version.to_string(),
            });
        }

        let header = cursor.fields()?;
        if header.len() < 2 {
            return Err(cursor.error("expected tests and factors"));
        }
        let tests: usize = cursor.parse_field(header[0])?;
        let factors: usize = cursor.parse_field(header[1])?;

        let count_fields = cursor.fields()?;
        if count_fields.len() < factors {
            return Err(cursor.error("too few level counts"));
        }
        let mut level_counts = Vec::with_capacity(factors);
        for field in count_fields[..factors].iter().copied() {
            let levels: u8 = cursor.parse_field(field)?;
            if levels < 2 {
                return Err(cursor.error("factors need at least 2 levels"));
            }
            level_counts.push(levels);
        }

        let catalog = match factor_data_path {
            Some(path) => FactorCatalog::from_file(path)?,
            None => FactorCatalog::synthesized(&level_counts),
        };
        if catalog.len() != factors {
            return Err(Error::dimension(
                format!("{factors} factors"),
                format!("{} catalogue entries", catalog.len()),
            ));
        }
        let mut array = Self::with_catalog(&level_counts, catalog);

        // grouping lines
        for factor_i in 0..factors {
            let fields = cursor.fields()?;
            if fields.is_empty() {
                return Err(cursor.error("missing grouping line"));
            }
            let grouped = parse_flag(fields[0])
                .ok_or_else(|| cursor.error("bad grouped flag"))?;
            if grouped {
                let levels = usize::from(level_counts[factor_i]);
                if fields.len() < 1 + levels {
                    return Err(cursor.error("too few level group ids"));
                }
                let mut groups = Vec::with_capacity(levels);
                for field in fields[1..=levels].iter().copied() {
                    groups.push(cursor.parse_field::<u8>(field)?);
                }
                array.set_level_groups(factor_i, groups);
            }
        }

        // constraint groups
        let group_count_line = cursor.next_line()?.trim();
        let n_con_groups: usize = cursor.parse_field(group_count_line)?;
        for _ in 0..n_con_groups {
            let factor_fields = cursor.fields()?;
            if factor_fields.is_empty() {
                return Err(cursor.error("missing constraint group factors"));
            }
            let group_factors: usize = cursor.parse_field(factor_fields[0])?;
            if factor_fields.len() < 1 + group_factors {
                return Err(cursor.error("too few constraint group factor indices"));
            }
            let mut factor_indices = Vec::with_capacity(group_factors);
            for field in factor_fields[1..=group_factors].iter().copied() {
                let factor_i: usize = cursor.parse_field(field)?;
                if factor_i >= factors {
                    return Err(cursor.error("constraint factor index out of range"));
                }
                factor_indices.push(factor_i);
            }

            let expr_fields = cursor.fields()?;
            if expr_fields.is_empty() {
                return Err(cursor.error("missing constraint list"));
            }
            let n_constraints: usize = cursor.parse_field(expr_fields[0])?;
            let tokens = &expr_fields[1..];
            let mut pos = 0;
            let mut exprs = Vec::with_capacity(n_constraints);
            for _ in 0..n_constraints {
                exprs.push(Expr::parse(tokens, &mut pos).map_err(|e| {
                    cursor.error(format!("bad constraint expression: {e}"))
                })?);
            }
            array.add_constraint_group(factor_indices, exprs)?;
        }

        // level rows
        for _ in 0..tests {
            let fields = cursor.fields()?;
            if fields.len() < factors {
                return Err(cursor.error("too few levels in test row"));
            }
            let mut row = Vec::with_capacity(factors);
            for (factor_i, field) in fields[..factors].iter().copied().enumerate() {
                let level: u8 = cursor.parse_field(field)?;
                if level >= level_counts[factor_i] {
                    return Err(cursor.error(format!(
                        "level {level} out of range for factor {factor_i}"
                    )));
                }
                row.push(level);
            }
            array.add_row(row);
        }

        Ok(array)
    }

    /// Write the array back out in the `v2.0` TSV format.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be written.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut out = Vec::new();
        writeln!(out, "{LA_VERSION}")?;
        writeln!(out, "{}\t{}", self.rows(), self.factors)?;

        let counts: Vec<String> = self
            .grouping
            .iter()
            .map(|g| g.levels.to_string())
            .collect();
        writeln!(out, "{}", counts.join("\t"))?;

        for info in &self.grouping {
            let mut fields = vec![u8::from(info.grouped).to_string()];
            if let Some(groups) = &info.level_groups {
                fields.extend(groups.iter().map(ToString::to_string));
            }
            writeln!(out, "{}", fields.join("\t"))?;
        }

        writeln!(out, "{}", self.con_groups.len())?;
        for group in &self.con_groups {
            let mut fields = vec![group.factor_indices().len().to_string()];
            fields.extend(group.factor_indices().iter().map(ToString::to_string));
            writeln!(out, "{}", fields.join("\t"))?;

            let mut fields = vec![group.exprs().len().to_string()];
            for expr in group.exprs() {
                expr.push_tokens(&mut fields);
            }
            writeln!(out, "{}", fields.join("\t"))?;
        }

        for row in &self.levels {
            let fields: Vec<String> = row.iter().map(ToString::to_string).collect();
            writeln!(out, "{}", fields.join("\t"))?;
        }

        fs::write(path, out)?;
        Ok(())
    }
}

/// Line-oriented parse cursor carrying path and line number for errors.
struct LineCursor<'a> {
    path: &'a str,
    lines: std::str::Lines<'a>,
    line_no: usize,
}

impl<'a> LineCursor<'a> {
    fn new(path: &'a str, contents: &'a str) -> Self {
        Self {
            path,
            lines: contents.lines(),
            line_no: 0,
        }
    }

    fn next_line(&mut self) -> Result<&'a str> {
        self.line_no += 1;
        self.lines
            .next()
            .ok_or_else(|| Error::parse(self.path, self.line_no, "unexpected end of file"))
    }

    fn fields(&mut self) -> Result<Vec<&'a str>> {
        Ok(self.next_line()?.split_whitespace().collect())
    }

    fn parse_field<T: std::str::FromStr>(&self, field: &str) -> Result<T> {
        field
            .parse()
            .map_err(|_| Error::parse(self.path, self.line_no, format!("bad value {field:?}")))
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::parse(self.path, self.line_no, message)
    }
}
