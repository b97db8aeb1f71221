//! Radix-partition path tree and the column partition sorts.
//!
//! The checker and repair engines never reorder the owned columns of
//! the CS matrix; they permute a working array of column indices. The
//! [`PathNode`] tree records, per depth `d`, the contiguous ranges of
//! working-array positions whose columns agree on the first `d` rows:
//! `entry_a` children hold the columns that are `+1` in row `d`,
//! `entry_b` those that are `-1`.
//!
//! [`path_sort`] maintains that invariant with an in-place two-pointer
//! partition per row. The tree skeleton is reused across resample
//! iterations: when rows below `row_top` are known unchanged, an
//! existing split is descended without rescanning. Siblings that become
//! empty are pruned.

use std::cmp::Ordering;

use super::{CsCol, ENTRY_A, ENTRY_B};

/// One node of the radix-partition tree: a contiguous range
/// `[min, max]` of working-array positions.
#[derive(Debug)]
pub struct PathNode {
    /// First working-array position of the range.
    pub min: usize,
    /// Last working-array position of the range (inclusive).
    pub max: usize,
    /// Columns of the range that are `+1` at this node's row.
    pub entry_a: Option<Box<PathNode>>,
    /// Columns of the range that are `-1` at this node's row.
    pub entry_b: Option<Box<PathNode>>,
}

impl PathNode {
    /// Create a leaf covering `[min, max]`.
    #[must_use]
    pub fn new(min: usize, max: usize) -> Self {
        Self {
            min,
            max,
            entry_a: None,
            entry_b: None,
        }
    }

    /// Number of columns in the range.
    #[must_use]
    pub fn span(&self) -> usize {
        self.max - self.min + 1
    }
}

/// Radix-partition `work[node.min..=node.max]` by rows `row..rows`.
///
/// Rows below `row_top` are assumed unchanged since the previous sort;
/// an existing split at such a row is reused without rescanning, which
/// is what makes repeated resample iterations cheap.
pub(crate) fn path_sort(
    columns: &[CsCol],
    work: &mut [usize],
    node: &mut PathNode,
    row: usize,
    row_top: usize,
    rows: usize,
) {
    if node.min == node.max {
        node.entry_a = None;
        node.entry_b = None;
        return;
    }
    if row >= rows {
        // unfinished range: all columns agree on every row so far
        return;
    }

    if row < row_top && (node.entry_a.is_some() || node.entry_b.is_some()) {
        if let Some(child) = node.entry_a.as_deref_mut() {
            path_sort(columns, work, child, row + 1, row_top, rows);
        }
        if let Some(child) = node.entry_b.as_deref_mut() {
            path_sort(columns, work, child, row + 1, row_top, rows);
        }
        return;
    }

    // two-pointer partition: ENTRY_A to the left, ENTRY_B to the right
    let mut temp_min = node.min as isize - 1;
    let mut temp_max = node.max as isize + 1;
    loop {
        while temp_min < node.max as isize
            && columns[work[(temp_min + 1) as usize]].data[row] == ENTRY_A
        {
            temp_min += 1;
        }
        while temp_max > node.min as isize
            && columns[work[(temp_max - 1) as usize]].data[row] == ENTRY_B
        {
            temp_max -= 1;
        }
        if temp_max - 1 > temp_min + 1 {
            work.swap((temp_min + 1) as usize, (temp_max - 1) as usize);
        } else {
            break;
        }
    }
    debug_assert_eq!(temp_min + 1, temp_max);

    if node.min as isize <= temp_min {
        let child = node
            .entry_a
            .get_or_insert_with(|| Box::new(PathNode::new(0, 0)));
        child.min = node.min;
        child.max = temp_min as usize;
        path_sort(columns, work, child, row + 1, row_top, rows);
    } else {
        node.entry_a = None;
    }

    if temp_max <= node.max as isize {
        let child = node
            .entry_b
            .get_or_insert_with(|| Box::new(PathNode::new(0, 0)));
        child.min = temp_max as usize;
        child.max = node.max;
        path_sort(columns, work, child, row + 1, row_top, rows);
    } else {
        node.entry_b = None;
    }
}

/// Lexicographic comparison of two columns over rows
/// `[row_top, row_top + row_len)`, with `ENTRY_A` ordered first.
pub(crate) fn compare_cols(
    col1: &CsCol,
    col2: &CsCol,
    row_top: usize,
    row_len: usize,
) -> Ordering {
    for row_i in row_top..row_top + row_len {
        if col1.data[row_i] == col2.data[row_i] {
            continue;
        }
        if col1.data[row_i] == ENTRY_A {
            return Ordering::Less;
        }
        return Ordering::Greater;
    }
    Ordering::Equal
}

/// Radix sort of `work[min..=max]` over rows `row..row + row_len`,
/// `ENTRY_A` first at each row.
pub(crate) fn row_sort(
    columns: &[CsCol],
    work: &mut [usize],
    min: usize,
    max: usize,
    row: usize,
    row_len: usize,
) {
    if min >= max || row_len == 0 {
        return;
    }

    let mut temp_min = min as isize - 1;
    let mut temp_max = max as isize + 1;
    loop {
        while temp_min < max as isize && columns[work[(temp_min + 1) as usize]].data[row] == ENTRY_A
        {
            temp_min += 1;
        }
        while temp_max > min as isize && columns[work[(temp_max - 1) as usize]].data[row] == ENTRY_B
        {
            temp_max -= 1;
        }
        if temp_max - 1 > temp_min + 1 {
            work.swap((temp_min + 1) as usize, (temp_max - 1) as usize);
        } else {
            break;
        }
    }

    if temp_min > min as isize {
        row_sort(columns, work, min, temp_min as usize, row + 1, row_len - 1);
    }
    if (temp_max as usize) < max {
        row_sort(columns, work, temp_max as usize, max, row + 1, row_len - 1);
    }
}

/// Re-sort an array whose first `sorted_rows` rows already order it:
/// only streaks of columns equal on that prefix need sorting over the
/// remaining rows.
pub(crate) fn smart_sort(columns: &[CsCol], work: &mut [usize], sorted_rows: usize, rows: usize) {
    let cols = work.len();
    let mut streak_min = 0usize;
    for col_i in 1..cols {
        if compare_cols(&columns[work[col_i - 1]], &columns[work[col_i]], 0, sorted_rows)
            == Ordering::Less
        {
            let streak_max = col_i - 1;
            if streak_min < streak_max {
                row_sort(columns, work, streak_min, streak_max, sorted_rows, rows - sorted_rows);
            }
            streak_min = col_i;
        }
    }
    let streak_max = cols - 1;
    if streak_min < streak_max {
        row_sort(columns, work, streak_min, streak_max, sorted_rows, rows - sorted_rows);
    }
}

/// Duplicate-streak score of a fully sorted working array:
/// `sum(streak_len^2) - cols`, zero iff all columns are distinct.
pub(crate) fn array_score(columns: &[CsCol], work: &[usize], rows: usize) -> i64 {
    let mut streak: i64 = 0;
    let mut squared_sum: i64 = 0;
    for col_i in 0..work.len() - 1 {
        streak += 1;
        if compare_cols(&columns[work[col_i]], &columns[work[col_i + 1]], 0, rows)
            == Ordering::Less
        {
            squared_sum += streak * streak;
            streak = 0;
        }
    }
    streak += 1;
    squared_sum += streak * streak;

    squared_sum - work.len() as i64
}

/// Partition non-coverable columns to the front of `work`; returns the
/// position of the first coverable column.
pub(crate) fn sort_by_coverable(columns: &[CsCol], work: &mut [usize]) -> usize {
    partition_by(work, |col_i| !columns[col_i].coverable)
}

/// Within `work[from..]`, partition columns of fewer than `t` factors
/// to the front; returns the position of the first full-strength
/// interaction.
pub(crate) fn sort_by_t_way(columns: &[CsCol], work: &mut [usize], from: usize, t: usize) -> usize {
    from + partition_by(&mut work[from..], |col_i| columns[col_i].factors() < t)
}

/// In-place two-pointer partition; `pred` columns first. Returns the
/// length of the `pred` prefix.
fn partition_by(work: &mut [usize], pred: impl Fn(usize) -> bool) -> usize {
    if work.is_empty() {
        return 0;
    }
    let mut temp_min = -1isize;
    let mut temp_max = work.len() as isize;
    loop {
        while temp_min < work.len() as isize - 1 && pred(work[(temp_min + 1) as usize]) {
            temp_min += 1;
        }
        while temp_max > 0 && !pred(work[(temp_max - 1) as usize]) {
            temp_max -= 1;
        }
        if temp_max - 1 > temp_min + 1 {
            work.swap((temp_min + 1) as usize, (temp_max - 1) as usize);
        } else {
            break;
        }
    }
    (temp_min + 1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cs::CsMatrix;
    use crate::la::LocatingArray;
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn random_matrix(level_counts: &[u8], rows: usize, seed: u64) -> CsMatrix {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let mut array = LocatingArray::new(level_counts);
        for _ in 0..rows {
            let row = (0..level_counts.len())
                .map(|f| rng.gen_range(0..level_counts[f]))
                .collect();
            array.add_row(row);
        }
        CsMatrix::new(array)
    }

    /// Every range of the tree must hold columns that agree on all rows
    /// above the range's depth, and siblings must split on the entry.
    fn assert_partitioned(matrix: &CsMatrix, work: &[usize], node: &PathNode, row: usize) {
        if node.min == node.max || row >= matrix.rows() {
            return;
        }
        let mut expected_min = node.min;
        if let Some(child) = node.entry_a.as_deref() {
            for pos in child.min..=child.max {
                assert_eq!(matrix.col(work[pos]).data[row], ENTRY_A);
            }
            assert_eq!(child.min, expected_min);
            expected_min = child.max + 1;
            assert_partitioned(matrix, work, child, row + 1);
        }
        if let Some(child) = node.entry_b.as_deref() {
            for pos in child.min..=child.max {
                assert_eq!(matrix.col(work[pos]).data[row], ENTRY_B);
            }
            assert_eq!(child.min, expected_min);
            expected_min = child.max + 1;
            assert_partitioned(matrix, work, child, row + 1);
        }
        assert_eq!(expected_min, node.max + 1);
    }

    #[test]
    fn test_path_sort_partitions() {
        let matrix = random_matrix(&[2, 3, 2], 7, 41);
        let mut work: Vec<usize> = (0..matrix.cols()).collect();
        let mut root = PathNode::new(0, matrix.cols() - 1);
        path_sort(&matrix.columns, &mut work, &mut root, 0, 0, matrix.rows());
        assert_partitioned(&matrix, &work, &root, 0);

        // the working array stays a permutation of all columns
        let mut seen = work.clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..matrix.cols()).collect::<Vec<_>>());
    }

    #[test]
    fn test_path_sort_skeleton_reuse() {
        let mut matrix = random_matrix(&[2, 3, 2], 7, 43);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(6);
        let mut work: Vec<usize> = (0..matrix.cols()).collect();
        let mut root = PathNode::new(0, matrix.cols() - 1);
        path_sort(&matrix.columns, &mut work, &mut root, 0, 0, matrix.rows());

        // resample rows >= 3 and re-sort with row_top = 3
        for row_i in 3..matrix.rows() {
            for factor_i in 0..matrix.array.factors() {
                let levels = matrix.array.grouping(factor_i).levels;
                let level = rng.gen_range(0..levels);
                matrix.array.set_level(row_i, factor_i, level);
            }
        }
        for factor_i in 0..matrix.array.factors() {
            matrix.repopulate_factor(factor_i, 3, matrix.rows() - 3);
        }
        path_sort(&matrix.columns, &mut work, &mut root, 0, 3, matrix.rows());
        assert_partitioned(&matrix, &work, &root, 0);
    }

    #[test]
    fn test_smart_sort_and_score() {
        let matrix = random_matrix(&[2, 2, 2], 8, 47);
        let mut work: Vec<usize> = (0..matrix.cols()).collect();
        smart_sort(&matrix.columns, &mut work, 0, matrix.rows());

        // sorted: never strictly decreasing between neighbours
        for pair in work.windows(2) {
            let ord = compare_cols(
                &matrix.columns[pair[0]],
                &matrix.columns[pair[1]],
                0,
                matrix.rows(),
            );
            assert_ne!(ord, Ordering::Greater);
        }

        // score is the duplicate-streak excess; with all 8 combinations
        // present every column is distinct
        let score = array_score(&matrix.columns, &work, matrix.rows());
        assert!(score >= 0);
    }

    #[test]
    fn test_partition_sorts() {
        let matrix = random_matrix(&[2, 3], 5, 13);
        let mut work: Vec<usize> = (0..matrix.cols()).collect();
        let coverable_min = sort_by_coverable(&matrix.columns, &mut work);
        // no constraints: everything is coverable
        assert_eq!(coverable_min, 0);

        let t_way_min = sort_by_t_way(&matrix.columns, &mut work, coverable_min, 2);
        for &col_i in &work[..t_way_min] {
            assert!(matrix.col(col_i).factors() < 2);
        }
        for &col_i in &work[t_way_min..] {
            assert_eq!(matrix.col(col_i).factors(), 2);
        }
        // intercept + 5 main effects ahead of the 2-way interactions
        assert_eq!(t_way_min, 6);
    }
}
