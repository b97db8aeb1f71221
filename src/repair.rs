//! Repair engines: drive a locating array's checker score to zero.
//!
//! Three families, all mutating the CS matrix's owned array in place:
//!
//! - [`CsMatrix::exact_fix`] appends rows one at a time, greedily
//!   finalizing the new row's factors against duplicate columns
//!   (constraint-free arrays only).
//! - [`CsMatrix::random_fix`], [`CsMatrix::systematic_random_fix`] and
//!   [`CsMatrix::auto_find_rows`] run the random-walk resampler: the
//!   checker nominates a (factor, level) setting, the rows in scope are
//!   resampled for that factor (or for its whole constraint group), and
//!   the move is kept only when the score does not worsen.
//! - [`CsMatrix::reorder_rows`] permutes rows into non-increasing
//!   checker-contribution order.
//!
//! A repair loop ends cleanly when the checker stops nominating a
//! setting; the residual score is surfaced in the outcome.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::cs::path::{
    array_score, compare_cols, path_sort, smart_sort, sort_by_coverable, sort_by_t_way, PathNode,
};
use crate::cs::{CsMatrix, FactorSetting, ENTRY_A};
use crate::error::{Error, Result};

/// Iteration budget of one resample loop.
const RESAMPLE_ITERS: usize = 1000;

/// Attempts per row count during the [`CsMatrix::auto_find_rows`]
/// bisection.
const AUTO_FIND_ATTEMPTS: usize = 5;

/// A bisection attempt scoring above this abandons the remaining
/// attempts at that row count.
const AUTO_FIND_ABANDON_SCORE: i64 = 100;

/// Wall-clock budget of one greedy finalization sweep in
/// [`CsMatrix::exact_fix`].
const SWEEP_BUDGET: Duration = Duration::from_secs(2);

/// Bound on full reorder passes in [`CsMatrix::reorder_rows`].
const REORDER_MAX_PASSES: usize = 64;

/// Result of a resampling repair run.
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    /// Final checker score; zero means the targets are met.
    pub score: i64,
    /// Setting the checker still nominates, `None` when the score is
    /// zero or no indistinguishable pair can be fixed.
    pub resample: Option<FactorSetting>,
    /// Resample iterations spent.
    pub iterations: usize,
    /// Score after each accepted move, non-increasing.
    pub accepted: Vec<i64>,
}

impl RepairOutcome {
    /// Whether the separation and coverage targets were met.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.score == 0
    }
}

/// Result of the row-count bisection.
#[derive(Debug, Clone, Copy)]
pub struct AutoFindReport {
    /// Largest row count known to fail (plus one).
    pub lower_bound: usize,
    /// Smallest row count known to succeed.
    pub upper_bound: usize,
}

impl CsMatrix {
    /// Append-and-finalize repair for constraint-free arrays.
    ///
    /// Sorts the working array over full columns and scores duplicate
    /// streaks; while duplicates remain, appends a random row and
    /// greedily retunes its factors to break the longest-lived
    /// duplicates. Returns the final streak score (zero on success).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParams`] when the array carries
    /// constraint groups; resampling a single factor cannot respect
    /// them here.
    pub fn exact_fix<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<i64> {
        if !self.array.con_groups().is_empty() {
            return Err(Error::invalid_params(
                "exact fix requires an array without constraint groups",
            ));
        }

        let mut work: Vec<usize> = (0..self.cols()).collect();
        smart_sort(&self.columns, &mut work, 0, self.rows());
        let mut score = array_score(&self.columns, &work, self.rows());

        while score > 0 {
            self.add_row_fix(rng, &mut work, &mut score);
        }
        Ok(score)
    }

    /// Append one random row, then greedily finalize its factors.
    ///
    /// For each duplicate column whose new-row entry is `-1`, try
    /// forcing the entry to `+1` by moving the row's levels into the
    /// column's setting ranges; keep the single best-scoring change per
    /// sweep and finalize its factors. Sweeps repeat while the score
    /// improves, each bounded by a wall-clock budget.
    fn add_row_fix<R: Rng + ?Sized>(&mut self, rng: &mut R, work: &mut Vec<usize>, score: &mut i64) {
        let factors = self.array.factors();
        let mut finalized = vec![false; factors];

        let level_row: Vec<u8> = (0..factors)
            .map(|f| rng.gen_range(0..self.array.grouping(f).levels))
            .collect();
        self.add_row(level_row);
        let rows = self.rows();
        let last_row = rows - 1;

        smart_sort(&self.columns, work, last_row, rows);
        *score = array_score(&self.columns, work, rows);

        loop {
            let mut best_score = *score;
            let mut best_col: Option<usize> = None;
            let mut best_changes: Vec<(usize, u8)> = Vec::new();
            let backup = work.clone();
            let sweep_start = Instant::now();
            let mut last_pair_matched = false;

            for pos in 0..work.len().saturating_sub(1) {
                if sweep_start.elapsed() > SWEEP_BUDGET {
                    break;
                }

                let cmp = compare_cols(
                    &self.columns[work[pos]],
                    &self.columns[work[pos + 1]],
                    0,
                    rows,
                );
                let duplicate = if cmp != Ordering::Less {
                    last_pair_matched = true;
                    true
                } else if last_pair_matched {
                    last_pair_matched = false;
                    true
                } else {
                    false
                };

                let col_i = work[pos];
                let col = &self.columns[col_i];
                if !(duplicate && col.data[last_row] != ENTRY_A && !col.settings.is_empty()) {
                    continue;
                }

                // pick target levels for the column's factors; factors
                // already finalized must happen to fit the range
                let mut change_allowed = true;
                let mut changes: Vec<(usize, u8)> = Vec::new();
                for s in &col.settings {
                    if finalized[s.factor] {
                        change_allowed &= s.covers(self.array.level(last_row, s.factor));
                    } else {
                        let level = s.index + rng.gen_range(0..s.levels_in_group);
                        changes.push((s.factor, level));
                    }
                }
                if !change_allowed {
                    continue;
                }

                // try the change; `work` is reordered by the sort, so
                // only `col_i` (the owned index) stays meaningful
                let applied = self.apply_row_levels(last_row, &changes);
                smart_sort(&self.columns, work, last_row, rows);
                let new_score = array_score(&self.columns, work, rows);

                if new_score < best_score {
                    best_score = new_score;
                    best_col = Some(col_i);
                    best_changes = changes;
                }

                self.apply_row_levels(last_row, &applied);
                work.copy_from_slice(&backup);
            }

            if best_score < *score {
                let Some(best_col) = best_col else { break };
                self.apply_row_levels(last_row, &best_changes);
                let settings = self.columns[best_col].settings.clone();
                for s in &settings {
                    finalized[s.factor] = true;
                }
                smart_sort(&self.columns, work, last_row, rows);
                *score = array_score(&self.columns, work, rows);
            } else {
                break;
            }
        }
    }

    /// Set levels in one row, repopulating the touched columns.
    /// Returns the previous levels for rollback.
    fn apply_row_levels(&mut self, row_i: usize, changes: &[(usize, u8)]) -> Vec<(usize, u8)> {
        let mut previous = Vec::with_capacity(changes.len());
        for &(factor_i, level) in changes {
            let old = self.array.level(row_i, factor_i);
            previous.push((factor_i, old));
            if old != level {
                self.array.set_level(row_i, factor_i, level);
                self.repopulate(factor_i, old, row_i, 1);
                self.repopulate(factor_i, level, row_i, 1);
            }
        }
        previous
    }

    /// Size the array to `total_rows` and run the resample loop once.
    pub fn random_fix<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        k: usize,
        c: usize,
        total_rows: usize,
    ) -> RepairOutcome {
        let mut work: Vec<usize> = (0..self.cols()).collect();
        let coverable_min = sort_by_coverable(&self.columns, &mut work);
        let _t_way_min = sort_by_t_way(&self.columns, &mut work, coverable_min, self.array.t());
        let mut path = PathNode::new(coverable_min, self.cols() - 1);

        self.resize(rng, total_rows);
        self.randomize_paths(rng, &mut work, &mut path, 0, k, c, RESAMPLE_ITERS)
    }

    /// Grow the array in halving chunks, resampling only the rows of
    /// the newest chunk, until the checker stops nominating settings.
    pub fn systematic_random_fix<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        k: usize,
        c: usize,
        initial_rows: usize,
        min_chunk: usize,
    ) -> RepairOutcome {
        let min_chunk = min_chunk.max(1);
        let mut chunk = initial_rows.max(min_chunk);
        let mut finalized_rows = self.rows();
        let mut total_rows = finalized_rows + chunk;

        let mut work: Vec<usize> = (0..self.cols()).collect();
        let coverable_min = sort_by_coverable(&self.columns, &mut work);
        let _t_way_min = sort_by_t_way(&self.columns, &mut work, coverable_min, self.array.t());
        let mut path = PathNode::new(coverable_min, self.cols() - 1);

        path_sort(&self.columns, &mut work, &mut path, 0, 0, self.rows());
        let (mut score, mut resample) = self.run_checker(&work, &path, k, c, rng, None);
        let mut iterations = 0;
        let mut accepted = Vec::new();

        while resample.is_some() {
            self.resize(rng, total_rows);
            let outcome =
                self.randomize_paths(rng, &mut work, &mut path, finalized_rows, k, c, RESAMPLE_ITERS);
            score = outcome.score;
            resample = outcome.resample;
            iterations += outcome.iterations;
            accepted.extend(outcome.accepted);

            finalized_rows = self.rows();
            chunk -= chunk / 2;
            if chunk < min_chunk {
                chunk = min_chunk;
            }
            total_rows += chunk;
        }

        RepairOutcome {
            score,
            resample,
            iterations,
            accepted,
        }
    }

    /// Bisect the row count: at each candidate size, give the resample
    /// loop several attempts from fresh random arrays; success lowers
    /// the upper bound, failure raises the lower bound.
    pub fn auto_find_rows<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        k: usize,
        c: usize,
        start_rows: usize,
    ) -> AutoFindReport {
        let mut upper_bound = start_rows.max(1);
        let mut lower_bound = 1usize;

        let mut work: Vec<usize> = (0..self.cols()).collect();
        let coverable_min = sort_by_coverable(&self.columns, &mut work);
        let _t_way_min = sort_by_t_way(&self.columns, &mut work, coverable_min, self.array.t());
        let mut path = PathNode::new(coverable_min, self.cols() - 1);

        self.resize(rng, upper_bound);

        loop {
            let mut passed = false;
            for _ in 0..AUTO_FIND_ATTEMPTS {
                self.randomize(rng);
                let outcome =
                    self.randomize_paths(rng, &mut work, &mut path, 0, k, c, RESAMPLE_ITERS);
                if outcome.score == 0 {
                    passed = true;
                    break;
                }
                if outcome.score > AUTO_FIND_ABANDON_SCORE {
                    break;
                }
            }

            let rows = self.rows();
            if passed {
                upper_bound = rows;
            } else {
                lower_bound = rows + 1;
            }
            if upper_bound <= lower_bound {
                break;
            }

            let median = (lower_bound + upper_bound) / 2;
            self.resize(rng, median);
        }

        AutoFindReport {
            lower_bound,
            upper_bound,
        }
    }

    /// Swap rows until checker contributions are non-increasing.
    /// Returns the final per-row contribution profile.
    pub fn reorder_rows<R: Rng + ?Sized>(&mut self, rng: &mut R, k: usize, c: usize) -> Vec<i64> {
        let mut work: Vec<usize> = (0..self.cols()).collect();
        let coverable_min = sort_by_coverable(&self.columns, &mut work);
        let _t_way_min = sort_by_t_way(&self.columns, &mut work, coverable_min, self.array.t());
        let mut path = PathNode::new(coverable_min, self.cols() - 1);

        for _pass in 0..REORDER_MAX_PASSES {
            let rows = self.rows();
            path_sort(&self.columns, &mut work, &mut path, 0, 0, rows);
            let mut contributions = vec![0i64; rows];
            let (_score, _resample) =
                self.run_checker(&work, &path, k, c, rng, Some(&mut contributions));

            let mut swaps = 0usize;
            loop {
                // earliest row whose contribution exceeds its predecessor
                let Some(out_of_order) =
                    (1..rows).find(|&r| contributions[r - 1] < contributions[r])
                else {
                    break;
                };

                // latest maximal contribution from there on
                let mut row_i2 = out_of_order;
                for row_i in row_i2 + 1..rows {
                    if contributions[row_i] >= contributions[row_i2] {
                        row_i2 = row_i;
                    }
                }
                // earliest row it should displace
                let row_i1 = (0..rows)
                    .find(|&r| contributions[row_i2] > contributions[r])
                    .expect("an out-of-order row implies a displacement target");

                self.swap_rows(row_i1, row_i2);
                contributions.swap(row_i1, row_i2);
                swaps += 1;
            }

            if swaps == 0 {
                return contributions;
            }
        }

        // contribution profile of the order we settled on
        let rows = self.rows();
        path_sort(&self.columns, &mut work, &mut path, 0, 0, rows);
        let mut contributions = vec![0i64; rows];
        let (_score, _resample) =
            self.run_checker(&work, &path, k, c, rng, Some(&mut contributions));
        contributions
    }

    /// The accept/reject resample loop shared by the random repair
    /// engines. Only rows `>= row_top` are ever touched.
    fn randomize_paths<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        work: &mut [usize],
        path: &mut PathNode,
        row_top: usize,
        k: usize,
        c: usize,
        iters: usize,
    ) -> RepairOutcome {
        let rows = self.rows();
        path_sort(&self.columns, work, path, 0, row_top, rows);
        let (mut score, mut resample) = self.run_checker(work, path, k, c, rng, None);

        let mut iterations = 0;
        let mut accepted = Vec::new();
        for _ in 0..iters {
            if score <= 0 {
                break;
            }
            let Some(setting) = resample else {
                // every remaining pair is indistinguishable in principle
                break;
            };
            iterations += 1;

            let con_group = self.array.grouping(setting.factor).con_group;
            let affected: Vec<usize> = match con_group {
                Some(group_i) => self.array.con_groups()[group_i].factor_indices().to_vec(),
                None => vec![setting.factor],
            };

            let snapshot: Vec<Vec<u8>> = affected
                .iter()
                .map(|&f| (row_top..rows).map(|r| self.array.level(r, f)).collect())
                .collect();

            match con_group {
                None => {
                    let factor_i = setting.factor;
                    let levels = self.array.grouping(factor_i).levels;
                    for row_i in row_top..rows {
                        let level = rng.gen_range(0..levels);
                        self.array.set_level(row_i, factor_i, level);
                    }
                }
                Some(group_i) => {
                    for row_i in row_top..rows {
                        self.array.sample_group_into_row(group_i, rng, row_i);
                    }
                }
            }
            for &factor_i in &affected {
                self.repopulate_factor(factor_i, row_top, rows - row_top);
            }

            path_sort(&self.columns, work, path, 0, row_top, rows);
            let (new_score, new_resample) = self.run_checker(work, path, k, c, rng, None);

            if new_score <= score {
                score = new_score;
                resample = new_resample;
                accepted.push(new_score);
            } else {
                // roll back; the stale partition is re-sorted on the
                // next iteration or by the final pass below
                for (pos, &factor_i) in affected.iter().enumerate() {
                    for (offset, row_i) in (row_top..rows).enumerate() {
                        self.array.set_level(row_i, factor_i, snapshot[pos][offset]);
                    }
                }
                for &factor_i in &affected {
                    self.repopulate_factor(factor_i, row_top, rows - row_top);
                }
            }
        }

        path_sort(&self.columns, work, path, 0, row_top, rows);
        let (score, resample) = self.run_checker(work, path, k, c, rng, None);
        RepairOutcome {
            score,
            resample,
            iterations,
            accepted,
        }
    }
}
