//! Compressive-sensing matrix over a locating array.
//!
//! The CS matrix has one row per test of the locating array and one
//! column per candidate interaction: the intercept, every (factor,
//! level) main effect, and every interaction of up to `t` factors with
//! strictly decreasing factor indices. An entry is `+1` when the test
//! realizes the column's interaction and `-1` otherwise.
//!
//! Columns are owned here in a contiguous vector and never reordered;
//! the checker and repair engines permute a parallel array of column
//! indices instead. A mapping trie (an arena of nodes with integer
//! child tables keyed by flattened (factor, level) indices) resolves an
//! interaction's settings to its column. Grouped factors share one trie
//! node across every level of a group, so any level inside the group
//! resolves to the same column.

pub mod check;
pub mod path;

use std::fs;
use std::io::Write;
use std::path::Path;

use rand::Rng;

use crate::error::{Error, Result};
use crate::la::LocatingArray;

/// Matrix entry for a test that realizes the column's interaction.
pub const ENTRY_A: f64 = 1.0;
/// Matrix entry for a test that does not realize it.
pub const ENTRY_B: f64 = -1.0;

/// One (factor, level-range) component of an interaction column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactorSetting {
    /// Whether the factor's levels are rolled up into groups.
    pub grouped: bool,
    /// Factor index.
    pub factor: usize,
    /// Level index; first level of the group when `grouped`.
    pub index: u8,
    /// Number of levels covered; 1 unless `grouped`.
    pub levels_in_group: u8,
}

impl FactorSetting {
    /// Whether `level` of this setting's factor lies in the covered range.
    #[must_use]
    pub fn covers(&self, level: u8) -> bool {
        let level = usize::from(level);
        level >= usize::from(self.index)
            && level < usize::from(self.index) + usize::from(self.levels_in_group)
    }
}

/// One column of the CS matrix.
#[derive(Debug, Clone)]
pub struct CsCol {
    /// The interaction's settings, factor indices strictly decreasing.
    /// Empty for the intercept.
    pub settings: Vec<FactorSetting>,
    /// Row entries, `ENTRY_A`/`ENTRY_B`.
    pub data: Vec<f64>,
    /// Whether the interaction is achievable under every constraint group.
    pub coverable: bool,
}

impl CsCol {
    /// Number of contributing factors (0 for the intercept).
    #[must_use]
    pub fn factors(&self) -> usize {
        self.settings.len()
    }
}

const NO_TABLE: u32 = u32::MAX;

#[derive(Debug, Clone)]
struct MapNode {
    mapped_to: usize,
    table: u32,
}

/// Arena trie mapping setting sequences to column indices.
#[derive(Debug, Clone, Default)]
struct Mapping {
    nodes: Vec<MapNode>,
    tables: Vec<Vec<Option<u32>>>,
}

impl Mapping {
    fn push_table(&mut self, size: usize) -> u32 {
        self.tables.push(vec![None; size]);
        u32::try_from(self.tables.len() - 1).expect("mapping table overflow")
    }

    fn push_node(&mut self, mapped_to: usize, table: u32) -> u32 {
        self.nodes.push(MapNode { mapped_to, table });
        u32::try_from(self.nodes.len() - 1).expect("mapping node overflow")
    }

    fn mapped_to(&self, node: u32) -> usize {
        self.nodes[node as usize].mapped_to
    }

    fn set_child(&mut self, table: u32, slot: usize, child: u32) {
        self.tables[table as usize][slot] = Some(child);
    }

    fn child(&self, node: u32, slot: usize) -> Option<u32> {
        let table = self.nodes[node as usize].table;
        if table == NO_TABLE {
            return None;
        }
        self.tables[table as usize].get(slot).copied().flatten()
    }
}

/// The compressive-sensing matrix: owned columns plus the mapping trie.
#[derive(Debug, Clone)]
pub struct CsMatrix {
    pub(crate) array: LocatingArray,
    pub(crate) columns: Vec<CsCol>,
    /// Flattened (factor, level) -> one-way slot index.
    factor_level_map: Vec<Vec<usize>>,
    mapping: Mapping,
}

/// Root node id of the mapping trie.
const ROOT_NODE: u32 = 0;

impl CsMatrix {
    /// Build the CS matrix for a locating array, taking ownership of it.
    ///
    /// Enumerates the intercept, all main effects in factor-major
    /// order, and all interactions of 2..=t factors in the order of the
    /// depth-first enumerator, then flags each column's coverability
    /// against the array's constraint groups.
    #[must_use]
    pub fn new(array: LocatingArray) -> Self {
        let factors = array.factors();
        let rows = array.rows();
        let t = array.t();

        let mut factor_level_map = Vec::with_capacity(factors);
        let mut flat = 0usize;
        for f in 0..factors {
            let levels = usize::from(array.grouping(f).levels);
            factor_level_map.push((flat..flat + levels).collect::<Vec<usize>>());
            flat += levels;
        }
        let n_one_way = flat;

        let mut columns: Vec<CsCol> = Vec::with_capacity(1 + n_one_way);
        columns.push(CsCol {
            settings: Vec::new(),
            data: vec![ENTRY_A; rows],
            coverable: true,
        });
        for f in 0..factors {
            for level in 0..array.grouping(f).levels {
                let data = (0..rows)
                    .map(|r| if array.level(r, f) == level { ENTRY_A } else { ENTRY_B })
                    .collect();
                columns.push(CsCol {
                    settings: vec![FactorSetting {
                        grouped: false,
                        factor: f,
                        index: level,
                        levels_in_group: 1,
                    }],
                    data,
                    coverable: true,
                });
            }
        }

        let mut mapping = Mapping::default();
        let root_table = mapping.push_table(n_one_way);
        let root = mapping.push_node(0, root_table);
        debug_assert_eq!(root, ROOT_NODE);

        Self::add_t_way_interactions(&array, &mut columns, &mut mapping, root_table, &[], n_one_way, t);

        let mut matrix = Self {
            array,
            columns,
            factor_level_map,
            mapping,
        };
        for col_i in 0..matrix.columns.len() {
            let coverable = {
                let settings = &matrix.columns[col_i].settings;
                matrix.settings_coverable(settings)
            };
            matrix.columns[col_i].coverable = coverable;
        }
        matrix
    }

    /// Depth-first enumeration of interaction columns.
    ///
    /// `base` holds the settings accumulated so far (factor indices
    /// strictly decreasing); `col_b_max` bounds the one-way slots that
    /// may extend it, which keeps factor indices decreasing and avoids
    /// duplicate interactions.
    fn add_t_way_interactions(
        array: &LocatingArray,
        columns: &mut Vec<CsCol>,
        mapping: &mut Mapping,
        parent_table: u32,
        base: &[FactorSetting],
        col_b_max: usize,
        t: usize,
    ) {
        let rows = array.rows();
        let mut col_c_max = 0usize;
        let mut col_b = 0usize;
        while col_b < col_b_max {
            let factor_b = columns[col_b + 1].settings[0].factor;
            // first one-way slot of factor_b bounds the next extension
            if factor_b > columns[col_c_max + 1].settings[0].factor {
                col_c_max = col_b;
            }
            let level_b = columns[col_b + 1].settings[0].index;

            let table = if t > 1 { mapping.push_table(col_c_max) } else { NO_TABLE };
            let mapped_to = if base.is_empty() { col_b + 1 } else { columns.len() };
            let node = mapping.push_node(mapped_to, table);
            mapping.set_child(parent_table, col_b, node);

            let info = array.grouping(factor_b);
            let mut levels_in_group = 1u8;
            if info.grouped {
                let groups = info
                    .level_groups
                    .as_ref()
                    .expect("grouped factor without level groups");
                let group_id = groups[usize::from(level_b)];
                while usize::from(level_b) + usize::from(levels_in_group) < usize::from(info.levels)
                    && groups[usize::from(level_b) + usize::from(levels_in_group)] == group_id
                {
                    levels_in_group += 1;
                    col_b += 1;
                    if base.is_empty() {
                        // main effects stay one column per level but
                        // share the child table across the group
                        let alias = mapping.push_node(col_b + 1, table);
                        mapping.set_child(parent_table, col_b, alias);
                    } else {
                        mapping.set_child(parent_table, col_b, node);
                    }
                }
            }

            let mut settings = Vec::with_capacity(base.len() + 1);
            settings.extend_from_slice(base);
            settings.push(FactorSetting {
                grouped: info.grouped,
                factor: factor_b,
                index: level_b,
                levels_in_group,
            });

            if settings.len() > 1 {
                let mut col = CsCol {
                    settings: settings.clone(),
                    data: vec![0.0; rows],
                    coverable: true,
                };
                populate_column(&mut col, array, 0, rows);
                columns.push(col);
            }

            if t > 1 {
                Self::add_t_way_interactions(
                    array, columns, mapping, table, &settings, col_c_max, t - 1,
                );
            }

            col_b += 1;
        }
    }

    /// Number of rows (tests).
    #[must_use]
    pub fn rows(&self) -> usize {
        self.array.rows()
    }

    /// Number of columns (candidate interactions, intercept included).
    #[must_use]
    pub fn cols(&self) -> usize {
        self.columns.len()
    }

    /// The column at `col_i`.
    #[must_use]
    pub fn col(&self, col_i: usize) -> &CsCol {
        &self.columns[col_i]
    }

    /// The underlying locating array.
    #[must_use]
    pub fn array(&self) -> &LocatingArray {
        &self.array
    }

    /// Resolve an interaction's settings to its column index.
    ///
    /// Settings must list factor indices in strictly decreasing order.
    /// Any level inside a level group resolves to the group's shared
    /// column. Returns `None` for settings no enumerated column has.
    #[must_use]
    pub fn col_index(&self, settings: &[FactorSetting]) -> Option<usize> {
        let mut node = ROOT_NODE;
        for s in settings {
            let slot = *self.factor_level_map.get(s.factor)?.get(usize::from(s.index))?;
            node = self.mapping.child(node, slot)?;
        }
        Some(self.mapping.mapped_to(node))
    }

    /// Verify the trie: every column's settings resolve back to it.
    #[must_use]
    pub fn verify_mapping(&self) -> bool {
        self.columns
            .iter()
            .enumerate()
            .all(|(col_i, col)| self.col_index(&col.settings) == Some(col_i))
    }

    /// Recompute rows `[row_top, row_top + row_len)` of every column
    /// whose settings involve `(set_factor, set_level)`.
    ///
    /// Walks the mapping trie so that exactly the affected columns are
    /// visited; aliased group nodes are visited consecutively and
    /// deduplicated.
    pub fn repopulate(&mut self, set_factor: usize, set_level: u8, row_top: usize, row_len: usize) {
        let Self {
            array,
            columns,
            factor_level_map,
            mapping,
        } = self;
        let max_factor = isize::try_from(array.factors()).unwrap() - 1;
        let mut last_col = usize::MAX;
        Self::repopulate_walk(
            array,
            columns,
            mapping,
            factor_level_map,
            isize::try_from(set_factor).unwrap(),
            set_level,
            max_factor,
            array.t(),
            ROOT_NODE,
            &mut last_col,
            row_top,
            row_len,
        );
    }

    /// Recompute the affected rows for `factor` at every level.
    ///
    /// This is the form repair uses after resampling a factor: the
    /// changed rows perturb the columns of every level of the factor.
    pub fn repopulate_factor(&mut self, factor: usize, row_top: usize, row_len: usize) {
        for level in 0..self.array.grouping(factor).levels {
            self.repopulate(factor, level, row_top, row_len);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn repopulate_walk(
        array: &LocatingArray,
        columns: &mut [CsCol],
        mapping: &Mapping,
        flm: &[Vec<usize>],
        set_factor: isize,
        set_level: u8,
        mut max_factor: isize,
        t: usize,
        node: u32,
        last_col: &mut usize,
        row_top: usize,
        row_len: usize,
    ) {
        if set_factor > max_factor {
            // the set factor is part of the prefix: this node's column
            // is affected
            let mapped = mapping.mapped_to(node);
            if mapped != *last_col {
                populate_column(&mut columns[mapped], array, row_top, row_len);
                *last_col = mapped;
            }
        }
        if t == 0 {
            return;
        }

        let min_factor = if set_factor > max_factor {
            // must leave room for t - 1 deeper factors
            isize::try_from(t).unwrap() - 1
        } else {
            // the set factor still has to appear
            if t == 1 {
                max_factor = set_factor;
            }
            set_factor
        };

        let mut factor_i = min_factor;
        while factor_i <= max_factor {
            let f = usize::try_from(factor_i).unwrap();
            if factor_i == set_factor {
                if let Some(child) = mapping.child(node, flm[f][usize::from(set_level)]) {
                    Self::repopulate_walk(
                        array, columns, mapping, flm, set_factor, set_level,
                        factor_i - 1, t - 1, child, last_col, row_top, row_len,
                    );
                }
            } else {
                for level in 0..array.grouping(f).levels {
                    if let Some(child) = mapping.child(node, flm[f][usize::from(level)]) {
                        Self::repopulate_walk(
                            array, columns, mapping, flm, set_factor, set_level,
                            factor_i - 1, t - 1, child, last_col, row_top, row_len,
                        );
                    }
                }
            }
            factor_i += 1;
        }
    }

    /// Whether a column's interaction can hold in some row satisfying
    /// every constraint group.
    fn settings_coverable(&self, settings: &[FactorSetting]) -> bool {
        let factors = self.array.factors();
        let mut require: Vec<Option<u8>> = vec![None; factors];
        let avoid: Vec<Option<u8>> = vec![None; factors];
        for s in settings {
            require[s.factor] = Some(s.index);
        }
        self.array
            .con_groups()
            .iter()
            .all(|g| g.satisfiable(&require, &avoid))
    }

    /// Whether some achievable row realizes one column but not the other.
    #[must_use]
    pub fn check_distinguishable(&self, col_i1: usize, col_i2: usize) -> bool {
        self.one_way_distinguishable(col_i1, col_i2)
            || self.one_way_distinguishable(col_i2, col_i1)
    }

    /// Whether a row can require every setting of `col_i1` while
    /// avoiding at least one setting of `col_i2`.
    fn one_way_distinguishable(&self, col_i1: usize, col_i2: usize) -> bool {
        let factors = self.array.factors();
        let mut require: Vec<Option<u8>> = vec![None; factors];
        let mut avoid: Vec<Option<u8>> = vec![None; factors];
        for s in &self.columns[col_i1].settings {
            require[s.factor] = Some(s.index);
        }

        for s in &self.columns[col_i2].settings {
            // cannot avoid a setting we require
            if require[s.factor] == Some(s.index) {
                continue;
            }
            avoid[s.factor] = Some(s.index);
            if self
                .array
                .con_groups()
                .iter()
                .all(|g| g.satisfiable(&require, &avoid))
            {
                return true;
            }
            avoid[s.factor] = None;
        }
        false
    }

    /// Append a level row, extending and populating every column.
    pub fn add_row(&mut self, level_row: Vec<u8>) {
        self.array.add_row(level_row);
        let rows = self.array.rows();
        let Self { array, columns, .. } = self;
        for col in columns.iter_mut() {
            col.data.push(0.0);
            populate_column(col, array, rows - 1, 1);
        }
    }

    /// Drop the last row from the array and every column.
    pub fn remove_last_row(&mut self) {
        self.array.remove_last_row();
        for col in &mut self.columns {
            col.data.pop();
        }
    }

    /// Grow or shrink to `new_rows`. Added rows are random and satisfy
    /// every constraint group; shrinking never drops below one row.
    pub fn resize<R: Rng + ?Sized>(&mut self, rng: &mut R, new_rows: usize) {
        while new_rows > self.rows() {
            let row = self.array.random_row(rng);
            self.add_row(row);
        }
        while new_rows < self.rows() && self.rows() > 1 {
            self.remove_last_row();
        }
    }

    /// Resample every row of the array and rebuild all column data.
    pub fn randomize<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let rows = self.rows();
        for row_i in 0..rows {
            let row = self.array.random_row(rng);
            for (factor_i, level) in row.into_iter().enumerate() {
                self.array.set_level(row_i, factor_i, level);
            }
        }
        let Self { array, columns, .. } = self;
        for col in columns.iter_mut() {
            populate_column(col, array, 0, rows);
        }
    }

    /// Swap two rows in every column and in the locating array.
    pub fn swap_rows(&mut self, row_i1: usize, row_i2: usize) {
        for col in &mut self.columns {
            col.data.swap(row_i1, row_i2);
        }
        self.array.swap_rows(row_i1, row_i2);
    }

    /// `|column . residuals|` for greedy term selection.
    #[must_use]
    pub fn product_with_col(&self, col_i: usize, residuals: &[f64]) -> f64 {
        self.columns[col_i]
            .data
            .iter()
            .zip(residuals)
            .map(|(a, b)| a * b)
            .sum::<f64>()
            .abs()
    }

    /// Human-readable name of a column.
    #[must_use]
    pub fn col_name(&self, col_i: usize) -> String {
        let col = &self.columns[col_i];
        if col.settings.is_empty() {
            return "INTERCEPT".to_string();
        }
        col.settings
            .iter()
            .map(|s| self.factor_string(s))
            .collect::<Vec<_>>()
            .join(" & ")
    }

    fn factor_string(&self, s: &FactorSetting) -> String {
        let catalog = self.array.catalog();
        let mut out = format!("{}=", catalog.factor_name(s.factor));
        if s.grouped {
            out.push_str("GROUP(");
        }
        for level in s.index..s.index + s.levels_in_group {
            if level != s.index {
                out.push('|');
            }
            out.push_str(catalog.level_name(s.factor, level));
        }
        if s.grouped {
            out.push(')');
        }
        out
    }

    /// Render the full matrix (column names, then one line per row).
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        let names: Vec<String> = (0..self.cols()).map(|c| self.col_name(c)).collect();
        out.push_str(&names.join("\t"));
        out.push('\n');
        for row_i in 0..self.rows() {
            let entries: Vec<String> = self
                .columns
                .iter()
                .map(|c| format!("{:+.0}", c.data[row_i]))
                .collect();
            out.push_str(&entries.join("\t"));
            out.push('\n');
        }
        out
    }

    /// Write a synthetic response `sum(coefficient * column)` to
    /// `dir/Response.tsv` in the response-file format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParams`] on an out-of-range column index
    /// or an I/O error if the file cannot be written.
    pub fn write_response(
        &self,
        dir: impl AsRef<Path>,
        column: &str,
        terms: &[(f64, usize)],
    ) -> Result<()> {
        let rows = self.rows();
        let mut responses = vec![0.0; rows];
        for &(coefficient, col_i) in terms {
            if col_i >= self.cols() {
                return Err(Error::invalid_params(format!(
                    "term column {col_i} out of range for {} columns",
                    self.cols()
                )));
            }
            for (row_i, response) in responses.iter_mut().enumerate() {
                *response += coefficient * self.columns[col_i].data[row_i];
            }
        }

        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let mut out = Vec::new();
        writeln!(out, "{rows}")?;
        writeln!(out, "{column}")?;
        for response in &responses {
            writeln!(out, "{response}")?;
        }
        fs::write(dir.join("Response.tsv"), out)?;
        Ok(())
    }
}

/// Recompute rows `[row_top, row_top + row_len)` of one column from the
/// level matrix: `ENTRY_A` iff every setting holds in the row.
pub(crate) fn populate_column(
    col: &mut CsCol,
    array: &LocatingArray,
    row_top: usize,
    row_len: usize,
) {
    for row_i in row_top..row_top + row_len {
        let covered = col
            .settings
            .iter()
            .all(|s| s.covers(array.level(row_i, s.factor)));
        col.data[row_i] = if covered { ENTRY_A } else { ENTRY_B };
    }
}
