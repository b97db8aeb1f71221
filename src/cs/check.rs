//! Locating-array checker: distinguishability scoring over path trees.
//!
//! The score counts, over every pair of distinct coverable columns, how
//! many row-differences are still missing toward the separation target
//! `k`, plus how far each coverable column falls short of the minimum
//! count `c` of realizing rows. A zero score means the array is
//! `(k, t)`-locating and `c`-covering.
//!
//! The paired traversal of [`la_checker`] walks two path-tree ranges in
//! lockstep. Descending into equal-entry children keeps the remaining
//! budget `k`; descending into opposite-entry children spends one
//! difference and continues with `k - 1`. Ranges that survive to the
//! last row contribute `k * |A| * |B|` undistinguished pairs, and the
//! first such range pair nominates a (factor, level) setting for repair
//! to resample. When no surviving pair is distinguishable in principle
//! the checker leaves the nomination empty, which ends repair cleanly.

use rand::Rng;

use super::path::{path_sort, sort_by_coverable, sort_by_t_way, PathNode};
use super::{CsMatrix, FactorSetting, ENTRY_A};

/// A row that violates one of the array's constraint groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstraintViolation {
    /// Index of the violated constraint group.
    pub group: usize,
    /// Offending row.
    pub row: usize,
}

/// Result of running the checker over a locating array.
#[derive(Debug, Clone)]
pub struct CheckReport {
    /// Path-tree checker score plus min-count deficit.
    pub score: i64,
    /// Brute-force score plus min-count deficit; equals `score` unless
    /// something is wrong.
    pub brute_force_score: i64,
    /// Coverable column pairs that no achievable row can separate.
    pub indistinguishable_pairs: usize,
    /// Setting nominated for resampling, when one exists.
    pub resample: Option<FactorSetting>,
    /// Rows that violate constraint groups.
    pub violations: Vec<ConstraintViolation>,
}

impl CheckReport {
    /// Whether the array meets the separation and coverage targets and
    /// violates no constraints.
    #[must_use]
    pub fn is_locating(&self) -> bool {
        self.score == 0 && self.violations.is_empty()
    }
}

impl CsMatrix {
    /// Score the array against separation `k` and minimum count `c`,
    /// cross-checking the path score against the brute-force oracle and
    /// listing constraint violations.
    pub fn check<R: Rng + ?Sized>(&self, rng: &mut R, k: usize, c: usize) -> CheckReport {
        let mut work: Vec<usize> = (0..self.cols()).collect();
        let coverable_min = sort_by_coverable(&self.columns, &mut work);
        let _t_way_min = sort_by_t_way(&self.columns, &mut work, coverable_min, self.array.t());

        let mut path = PathNode::new(coverable_min, self.cols() - 1);
        path_sort(&self.columns, &mut work, &mut path, 0, 0, self.rows());

        let (score, resample) = self.run_checker(&work, &path, k, c, rng, None);

        let (mut brute_force_score, indistinguishable_pairs) =
            brute_force_score(self, &work, i64::try_from(k).unwrap());
        let mut brute_resample = None;
        min_count_check(
            self,
            &work,
            c,
            rng,
            &mut brute_force_score,
            &mut brute_resample,
            None,
        );

        let mut violations = Vec::new();
        for row_i in 0..self.rows() {
            for group_i in 0..self.array.con_groups().len() {
                let group = &self.array.con_groups()[group_i];
                if !group.is_satisfied(self.array.catalog(), self.array.row(row_i)) {
                    violations.push(ConstraintViolation {
                        group: group_i,
                        row: row_i,
                    });
                }
            }
        }

        CheckReport {
            score,
            brute_force_score,
            indistinguishable_pairs,
            resample,
            violations,
        }
    }

    /// Path checker plus min-count check over an already-sorted path.
    pub(crate) fn run_checker<R: Rng + ?Sized>(
        &self,
        work: &[usize],
        path: &PathNode,
        k: usize,
        c: usize,
        rng: &mut R,
        mut contributions: Option<&mut [i64]>,
    ) -> (i64, Option<FactorSetting>) {
        let mut score = 0i64;
        let mut resample = None;
        la_checker(
            self,
            work,
            Some(path),
            Some(path),
            0,
            i64::try_from(k).unwrap(),
            rng,
            &mut score,
            &mut resample,
            contributions.as_deref_mut(),
        );
        min_count_check(self, work, c, rng, &mut score, &mut resample, contributions);
        (score, resample)
    }
}

/// Resolve a node's children at `row`; a singleton acts as its own
/// child on whichever side its entry lies.
fn split<'n>(
    matrix: &CsMatrix,
    work: &[usize],
    node: &'n PathNode,
    row: usize,
) -> (Option<&'n PathNode>, Option<&'n PathNode>) {
    if node.min == node.max {
        if matrix.col(work[node.min]).data[row] == ENTRY_A {
            (Some(node), None)
        } else {
            (None, Some(node))
        }
    } else {
        (node.entry_a.as_deref(), node.entry_b.as_deref())
    }
}

/// Paired-path traversal accumulating the separation score.
#[allow(clippy::too_many_arguments)]
pub(crate) fn la_checker<R: Rng + ?Sized>(
    matrix: &CsMatrix,
    work: &[usize],
    a: Option<&PathNode>,
    b: Option<&PathNode>,
    row: usize,
    k: i64,
    rng: &mut R,
    score: &mut i64,
    resample: &mut Option<FactorSetting>,
    mut contributions: Option<&mut [i64]>,
) {
    let (Some(a), Some(b)) = (a, b) else { return };
    if k == 0 || a.min == b.max {
        return;
    }
    let same = std::ptr::eq(a, b);

    if row == matrix.rows() {
        let span_a = a.span() as i64;
        let span_b = b.span() as i64;
        *score += if same {
            k * span_a * (span_a - 1) / 2
        } else {
            k * span_a * span_b
        };

        if resample.is_none() {
            // nominate a setting from the first pair that is
            // distinguishable in principle
            let mut chosen: Option<usize> = None;
            'outer: for i_a in a.min..=a.max {
                let i_b_start = if same { i_a + 1 } else { b.min };
                for i_b in i_b_start..=b.max {
                    if matrix.check_distinguishable(work[i_a], work[i_b]) {
                        if rng.gen_bool(0.5) && matrix.col(work[i_a]).factors() > 0 {
                            chosen = Some(work[i_a]);
                        } else if matrix.col(work[i_b]).factors() > 0 {
                            chosen = Some(work[i_b]);
                        }
                        if chosen.is_some() {
                            break 'outer;
                        }
                    }
                }
            }
            if let Some(col_i) = chosen {
                let settings = &matrix.col(col_i).settings;
                *resample = Some(settings[rng.gen_range(0..settings.len())]);
            }
        }
        return;
    }

    let (a_entry_a, a_entry_b) = split(matrix, work, a, row);
    let (b_entry_a, b_entry_b) = split(matrix, work, b, row);

    la_checker(
        matrix, work, a_entry_a, b_entry_a, row + 1, k, rng, score, resample,
        contributions.as_deref_mut(),
    );
    la_checker(
        matrix, work, a_entry_b, b_entry_b, row + 1, k, rng, score, resample,
        contributions.as_deref_mut(),
    );
    la_checker(
        matrix, work, a_entry_a, b_entry_b, row + 1, k - 1, rng, score, resample,
        contributions.as_deref_mut(),
    );
    if let (Some(x), Some(y)) = (a_entry_a, b_entry_b) {
        if let Some(contrib) = contributions.as_deref_mut() {
            contrib[row] += (x.span() * y.span()) as i64;
        }
    }

    if !same {
        la_checker(
            matrix, work, a_entry_b, b_entry_a, row + 1, k - 1, rng, score, resample,
            contributions.as_deref_mut(),
        );
        if let (Some(x), Some(y)) = (a_entry_b, b_entry_a) {
            if let Some(contrib) = contributions.as_deref_mut() {
                contrib[row] += (x.span() * y.span()) as i64;
            }
        }
    }
}

/// Add `c - count` per coverable column realized in fewer than `c`
/// rows, nominating a resample setting when none is set yet.
pub(crate) fn min_count_check<R: Rng + ?Sized>(
    matrix: &CsMatrix,
    work: &[usize],
    c: usize,
    rng: &mut R,
    score: &mut i64,
    resample: &mut Option<FactorSetting>,
    mut contributions: Option<&mut [i64]>,
) {
    let rows = matrix.rows();
    for &col_i in work {
        let col = matrix.col(col_i);
        if !col.coverable {
            continue;
        }
        let mut count = 0usize;
        for row_i in 0..rows {
            if count >= c {
                break;
            }
            if col.data[row_i] == ENTRY_A {
                count += 1;
                if let Some(contrib) = contributions.as_deref_mut() {
                    contrib[row_i] += 1;
                }
            }
        }
        if count < c {
            *score += i64::try_from(c - count).unwrap();
            if resample.is_none() && !col.settings.is_empty() {
                *resample = Some(col.settings[rng.gen_range(0..col.settings.len())]);
            }
        }
    }
}

/// Brute-force score over all coverable column pairs:
/// `sum(max(0, k - hamming))`. Returns the score and the number of
/// pairs no achievable row can separate.
pub(crate) fn brute_force_score(matrix: &CsMatrix, work: &[usize], k: i64) -> (i64, usize) {
    let rows = matrix.rows();
    let mut score = 0i64;
    let mut indistinguishable = 0usize;
    for i in 0..work.len() {
        for j in i + 1..work.len() {
            let col1 = matrix.col(work[i]);
            let col2 = matrix.col(work[j]);
            if !(col1.coverable && col2.coverable) {
                continue;
            }
            if !matrix.check_distinguishable(work[i], work[j]) {
                indistinguishable += 1;
            }
            let differences =
                (0..rows).filter(|&r| col1.data[r] != col2.data[r]).count();
            let differences = i64::try_from(differences).unwrap();
            if differences < k {
                score += k - differences;
            }
        }
    }
    (score, indistinguishable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::la::LocatingArray;
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn random_matrix(level_counts: &[u8], rows: usize, t: usize, seed: u64) -> CsMatrix {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let mut array = LocatingArray::new(level_counts);
        array.set_t(t);
        for _ in 0..rows {
            let row = (0..level_counts.len())
                .map(|f| rng.gen_range(0..level_counts[f]))
                .collect();
            array.add_row(row);
        }
        CsMatrix::new(array)
    }

    #[test]
    fn test_full_factorial_is_locating() {
        let mut array = LocatingArray::new(&[2, 2]);
        array.set_t(1);
        for a in 0..2u8 {
            for b in 0..2u8 {
                array.add_row(vec![a, b]);
            }
        }
        let matrix = CsMatrix::new(array);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let report = matrix.check(&mut rng, 1, 1);
        assert_eq!(report.score, 0);
        assert_eq!(report.brute_force_score, 0);
        assert!(report.is_locating());
        assert!(report.resample.is_none());
    }

    #[test]
    fn test_checker_matches_brute_force() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(99);
        for seed in 0..12 {
            let matrix = random_matrix(&[2, 3, 2], 6, 2, seed);
            for k in 1..=3usize {
                let report = matrix.check(&mut rng, k, 1);
                assert_eq!(
                    report.score, report.brute_force_score,
                    "path and brute-force scores diverge at k = {k}, seed = {seed}"
                );
            }
        }
    }

    #[test]
    fn test_checker_matches_brute_force_grouped() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
        let mut array = LocatingArray::new(&[4, 2, 3]);
        array.set_level_groups(0, vec![0, 0, 1, 1]);
        for _ in 0..7 {
            let row = vec![
                rng.gen_range(0..4u8),
                rng.gen_range(0..2u8),
                rng.gen_range(0..3u8),
            ];
            array.add_row(row);
        }
        let matrix = CsMatrix::new(array);
        for k in 1..=2usize {
            let report = matrix.check(&mut rng, k, 1);
            assert_eq!(report.score, report.brute_force_score);
        }
    }

    #[test]
    fn test_under_replicated_rows_flagged() {
        // factor 0 never takes level 1: its main-effect column has no
        // realizing row, so the min-count check must flag it
        let mut array = LocatingArray::new(&[2, 2, 2]);
        array.add_row(vec![0, 0, 0]);
        array.add_row(vec![0, 0, 1]);
        array.add_row(vec![0, 1, 0]);
        let matrix = CsMatrix::new(array);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let report = matrix.check(&mut rng, 1, 1);

        assert!(report.score > 0);
        assert!(report.resample.is_some());
        assert_eq!(report.score, report.brute_force_score);
    }

    #[test]
    fn test_min_count_deficit() {
        let mut array = LocatingArray::new(&[2, 2]);
        array.set_t(1);
        array.add_row(vec![0, 0]);
        array.add_row(vec![0, 1]);
        array.add_row(vec![1, 0]);
        array.add_row(vec![1, 1]);
        let matrix = CsMatrix::new(array);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(4);

        // every main effect appears exactly twice; c = 3 leaves each of
        // the four main-effect columns one row short
        let work: Vec<usize> = (0..matrix.cols()).collect();
        let mut score = 0i64;
        let mut resample = None;
        min_count_check(&matrix, &work, 3, &mut rng, &mut score, &mut resample, None);
        assert_eq!(score, 4);
        assert!(resample.is_some());
    }

    #[test]
    fn test_constraint_violations_reported() {
        use crate::constraint::Expr;
        use crate::factor::{Factor, FactorCatalog};

        let catalog = FactorCatalog::new(vec![
            Factor::indexed("A", 4),
            Factor::indexed("B", 4),
        ]);
        let mut array = LocatingArray::with_catalog(&[4, 4], catalog);
        let tokens = ["==", "+", "F", "0", "F", "1", "C", "3"];
        let mut pos = 0;
        array
            .add_constraint_group(vec![0, 1], vec![Expr::parse(&tokens, &mut pos).unwrap()])
            .unwrap();
        array.add_row(vec![1, 2]); // satisfies
        array.add_row(vec![2, 2]); // violates
        let matrix = CsMatrix::new(array);

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(8);
        let report = matrix.check(&mut rng, 1, 1);
        assert_eq!(
            report.violations,
            vec![ConstraintViolation { group: 0, row: 1 }]
        );
        assert!(!report.is_locating());
    }

    #[test]
    fn test_row_contributions_accumulate() {
        let matrix = random_matrix(&[2, 2, 2], 5, 2, 21);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(2);
        let mut work: Vec<usize> = (0..matrix.cols()).collect();
        let coverable_min = sort_by_coverable(&matrix.columns, &mut work);
        let mut path = PathNode::new(coverable_min, matrix.cols() - 1);
        path_sort(&matrix.columns, &mut work, &mut path, 0, 0, matrix.rows());

        let mut contributions = vec![0i64; matrix.rows()];
        let (_score, _resample) =
            matrix.run_checker(&work, &path, 1, 1, &mut rng, Some(&mut contributions));
        // the min-count pass alone credits every counted realizing row
        assert!(contributions.iter().any(|&c| c > 0));
    }
}
