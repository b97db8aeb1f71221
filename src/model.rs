//! Sparse regression over CS-matrix columns.
//!
//! A [`Model`] is a sorted set of column indices (terms) fitted to a
//! response vector by least squares. The fit maintains a QR
//! factorization of the selected submatrix via modified Gram-Schmidt in
//! a shared [`Workspace`]; a zero pivot (collinear column) yields a
//! zero coefficient rather than an error.
//!
//! [`build_models`] grows models greedily: a beam of the best current
//! models, each extended by the columns most correlated with its
//! residuals, generation by generation, until the term budget is
//! reached. Duplicate term sets never enter a generation twice.

use std::collections::BTreeSet;

use ndarray::{Array1, Array2};

use crate::cs::CsMatrix;
use crate::error::{Error, Result};
use crate::response::ResponseVector;

/// Shared QR scratch space, sized once per search.
#[derive(Debug)]
pub struct Workspace {
    q: Array2<f64>,
    r: Array2<f64>,
    work: Array1<f64>,
}

impl Workspace {
    /// Allocate scratch space for up to `max_terms` terms over `rows`
    /// tests.
    #[must_use]
    pub fn new(rows: usize, max_terms: usize) -> Self {
        Self {
            q: Array2::zeros((rows, max_terms)),
            r: Array2::zeros((max_terms, max_terms)),
            work: Array1::zeros(rows.max(max_terms)),
        }
    }
}

/// A regression model: a sorted term set with its fit.
#[derive(Debug, Clone)]
pub struct Model {
    terms: BTreeSet<usize>,
    coefficients: Vec<f64>,
    residuals: Vec<f64>,
    model_response: Vec<f64>,
    r_squared: f64,
    tests: usize,
}

impl Model {
    /// Create the intercept-only model and fit it.
    ///
    /// # Errors
    ///
    /// Propagates the dimension check of [`Model::least_squares`].
    pub fn intercept(
        matrix: &CsMatrix,
        response: &ResponseVector,
        workspace: &mut Workspace,
    ) -> Result<Self> {
        let tests = response.len();
        let mut model = Self {
            terms: BTreeSet::from([0]),
            coefficients: Vec::new(),
            residuals: vec![0.0; tests],
            model_response: vec![0.0; tests],
            r_squared: 0.0,
            tests,
        };
        model.least_squares(matrix, response, workspace)?;
        Ok(model)
    }

    /// Number of terms, intercept included.
    #[must_use]
    pub fn terms(&self) -> usize {
        self.terms.len()
    }

    /// The term column indices in ascending order.
    #[must_use]
    pub fn term_indices(&self) -> Vec<usize> {
        self.terms.iter().copied().collect()
    }

    /// Whether `col_i` is already a term.
    #[must_use]
    pub fn contains(&self, col_i: usize) -> bool {
        self.terms.contains(&col_i)
    }

    /// Insert a term; returns `false` when it is already present.
    pub fn add_term(&mut self, col_i: usize) -> bool {
        self.terms.insert(col_i)
    }

    /// Remove a term; returns `false` when it was not present.
    pub fn remove_term(&mut self, col_i: usize) -> bool {
        self.terms.remove(&col_i)
    }

    /// Coefficients aligned with [`Model::term_indices`].
    #[must_use]
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Residuals of the current fit.
    #[must_use]
    pub fn residuals(&self) -> &[f64] {
        &self.residuals
    }

    /// R² of the current fit.
    #[must_use]
    pub fn r_squared(&self) -> f64 {
        self.r_squared
    }

    /// Adjusted R²: `1 - (1 - R²)(tests - 1) / (tests - terms - 2)`,
    /// discounting the term count beyond the intercept and error
    /// degrees of freedom.
    #[must_use]
    pub fn adjusted_r_squared(&self) -> f64 {
        let tests = self.tests as f64;
        let terms = self.terms.len() as f64;
        1.0 - (1.0 - self.r_squared) * (tests - 1.0) / (tests - terms - 2.0)
    }

    /// Whether two models share the same term set.
    #[must_use]
    pub fn same_terms(&self, other: &Self) -> bool {
        self.terms == other.terms
    }

    /// Fit the current term set by QR least squares.
    ///
    /// Modified Gram-Schmidt orthogonalizes the selected columns into
    /// `Q`, recording `R`; `R beta = Q^T y` is then solved by back
    /// substitution. A zero diagonal pivot sets that coefficient to
    /// zero, which tolerates collinear columns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] when the model has more
    /// terms than the response has rows.
    pub fn least_squares(
        &mut self,
        matrix: &CsMatrix,
        response: &ResponseVector,
        workspace: &mut Workspace,
    ) -> Result<()> {
        let tests = self.tests;
        let terms = self.terms.len();
        if terms > tests {
            return Err(Error::dimension(
                format!("at most {tests} terms"),
                format!("{terms} terms"),
            ));
        }

        let term_indices = self.term_indices();

        // Q and R by modified Gram-Schmidt, column by column
        for (col_i, &term) in term_indices.iter().enumerate() {
            let data = &matrix.col(term).data;
            for row_i in 0..tests {
                workspace.work[row_i] = data[row_i];
            }

            for prev_i in 0..col_i {
                let mut dot = 0.0;
                for row_i in 0..tests {
                    dot += data[row_i] * workspace.q[[row_i, prev_i]];
                }
                workspace.r[[prev_i, col_i]] = dot;
                for row_i in 0..tests {
                    workspace.work[row_i] -= dot * workspace.q[[row_i, prev_i]];
                }
            }

            let mut norm = 0.0;
            for row_i in 0..tests {
                norm += workspace.work[row_i] * workspace.work[row_i];
            }
            let norm = norm.sqrt();
            workspace.r[[col_i, col_i]] = norm;

            if norm == 0.0 {
                for row_i in 0..tests {
                    workspace.q[[row_i, col_i]] = 0.0;
                }
            } else {
                for row_i in 0..tests {
                    workspace.q[[row_i, col_i]] = workspace.work[row_i] / norm;
                }
            }
        }

        // work = Q^T y
        let y = response.data();
        for term_i in 0..terms {
            workspace.work[term_i] = 0.0;
        }
        for row_i in 0..tests {
            for term_i in 0..terms {
                workspace.work[term_i] += workspace.q[[row_i, term_i]] * y[row_i];
            }
        }

        // back-substitute R beta = work
        self.coefficients = vec![0.0; terms];
        for row_i in (0..terms).rev() {
            let mut solution = workspace.work[row_i];
            for col_i in row_i + 1..terms {
                solution -= workspace.r[[row_i, col_i]] * self.coefficients[col_i];
            }
            let pivot = workspace.r[[row_i, row_i]];
            self.coefficients[row_i] = if pivot == 0.0 { 0.0 } else { solution / pivot };
        }

        // residuals and R²
        self.model_response.iter_mut().for_each(|v| *v = 0.0);
        for (term_i, &term) in term_indices.iter().enumerate() {
            let data = &matrix.col(term).data;
            for row_i in 0..tests {
                self.model_response[row_i] += data[row_i] * self.coefficients[term_i];
            }
        }

        let mut ss_res = 0.0;
        for row_i in 0..tests {
            self.residuals[row_i] = y[row_i] - self.model_response[row_i];
            ss_res += self.residuals[row_i] * self.residuals[row_i];
        }

        self.r_squared = if response.ss_tot() > 0.0 {
            1.0 - ss_res / response.ss_tot()
        } else if ss_res == 0.0 {
            1.0
        } else {
            0.0
        };

        Ok(())
    }
}

/// Greedy beam search over CS-matrix columns.
///
/// Starts from the intercept-only model. Each generation extends every
/// beam model by its `new_models_n` unused columns of largest
/// `|column . residuals|`; the next generation keeps the `models_n`
/// best by R², rejecting duplicate term sets. The search stops once the
/// beam models carry `max_terms` terms. Returns the final beam, best
/// first.
///
/// # Errors
///
/// Returns [`Error::InvalidParams`] on a zero budget and
/// [`Error::DimensionMismatch`] when `max_terms` exceeds the row count
/// or the response length disagrees with the matrix.
pub fn build_models(
    matrix: &CsMatrix,
    response: &ResponseVector,
    max_terms: usize,
    models_n: usize,
    new_models_n: usize,
) -> Result<Vec<Model>> {
    if max_terms == 0 || models_n == 0 || new_models_n == 0 {
        return Err(Error::invalid_params(
            "term and model budgets must be positive",
        ));
    }
    if response.len() != matrix.rows() {
        return Err(Error::dimension(
            format!("{} response rows", matrix.rows()),
            format!("{} response rows", response.len()),
        ));
    }
    if max_terms > matrix.rows() {
        return Err(Error::dimension(
            format!("at most {} terms", matrix.rows()),
            format!("{max_terms} terms"),
        ));
    }

    let mut workspace = Workspace::new(response.len(), max_terms);
    let mut beam = vec![Model::intercept(matrix, response, &mut workspace)?];

    while beam.first().is_some_and(|m| m.terms() < max_terms) {
        let mut next_beam: Vec<Model> = Vec::with_capacity(models_n + 1);

        for model in &beam {
            // columns most correlated with this model's residuals
            let mut candidates: Vec<(usize, f64)> = (0..matrix.cols())
                .filter(|&col_i| !model.contains(col_i))
                .map(|col_i| (col_i, matrix.product_with_col(col_i, model.residuals())))
                .collect();
            candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

            for &(col_i, _product) in candidates.iter().take(new_models_n) {
                let mut trial = model.clone();
                trial.add_term(col_i);
                trial.least_squares(matrix, response, &mut workspace)?;

                if next_beam.iter().any(|kept| kept.same_terms(&trial)) {
                    continue;
                }
                let position = next_beam
                    .partition_point(|kept| kept.r_squared() >= trial.r_squared());
                next_beam.insert(position, trial);
                next_beam.truncate(models_n);
            }
        }

        if next_beam.is_empty() {
            break;
        }
        beam = next_beam;
    }

    Ok(beam)
}

/// How often a factor combination appears across the final models, and
/// with what total coefficient magnitude.
#[derive(Debug, Clone)]
pub struct Occurrence {
    /// Factor indices of the combination, descending.
    pub factors: Vec<usize>,
    /// Number of appearances across models and terms.
    pub count: usize,
    /// Sum of `|coefficient|` over those appearances.
    pub magnitude: f64,
}

/// Tally every non-empty factor sub-combination of every term across
/// `models`, grouped by combination size (1-based index 0 holds single
/// factors). Within a size, combinations are ordered by descending
/// count.
#[must_use]
pub fn count_occurrences(models: &[Model], matrix: &CsMatrix) -> Vec<Vec<Occurrence>> {
    use std::collections::BTreeMap;

    let t = matrix.array().t();
    let mut tallies: Vec<BTreeMap<Vec<usize>, (usize, f64)>> = vec![BTreeMap::new(); t];

    for model in models {
        for (term_i, &term) in model.term_indices().iter().enumerate() {
            let settings = &matrix.col(term).settings;
            if settings.is_empty() {
                continue;
            }
            let magnitude = model.coefficients()[term_i].abs();
            let factors: Vec<usize> = settings.iter().map(|s| s.factor).collect();

            // every non-empty subset, order preserved
            for mask in 1u32..(1 << factors.len()) {
                let subset: Vec<usize> = factors
                    .iter()
                    .enumerate()
                    .filter(|(bit, _)| mask & (1 << bit) != 0)
                    .map(|(_, &f)| f)
                    .collect();
                let entry = tallies[subset.len() - 1]
                    .entry(subset)
                    .or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += magnitude;
            }
        }
    }

    tallies
        .into_iter()
        .map(|tally| {
            let mut occurrences: Vec<Occurrence> = tally
                .into_iter()
                .map(|(factors, (count, magnitude))| Occurrence {
                    factors,
                    count,
                    magnitude,
                })
                .collect();
            occurrences.sort_by(|a, b| b.count.cmp(&a.count));
            occurrences
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::la::LocatingArray;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn full_factorial_3() -> CsMatrix {
        let mut array = LocatingArray::new(&[2, 2, 2]);
        for a in 0..2u8 {
            for b in 0..2u8 {
                for c in 0..2u8 {
                    array.add_row(vec![a, b, c]);
                }
            }
        }
        CsMatrix::new(array)
    }

    fn synthetic_response(matrix: &CsMatrix, terms: &[(f64, usize)]) -> ResponseVector {
        let data = (0..matrix.rows())
            .map(|row_i| {
                terms
                    .iter()
                    .map(|&(coef, col_i)| coef * matrix.col(col_i).data[row_i])
                    .sum()
            })
            .collect::<Vec<f64>>();
        ResponseVector::from_data(Array1::from(data))
    }

    #[test]
    fn test_least_squares_exact_recovery() {
        let matrix = full_factorial_3();
        let response = synthetic_response(&matrix, &[(1.5, 0), (2.0, 1), (-0.5, 4)]);
        let mut workspace = Workspace::new(matrix.rows(), 4);

        let mut model = Model::intercept(&matrix, &response, &mut workspace).unwrap();
        model.add_term(1);
        model.add_term(4);
        model.least_squares(&matrix, &response, &mut workspace).unwrap();

        assert_abs_diff_eq!(model.r_squared(), 1.0, epsilon = 1e-9);
        let coefficients = model.coefficients();
        assert_abs_diff_eq!(coefficients[0], 1.5, epsilon = 1e-9);
        assert_abs_diff_eq!(coefficients[1], 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(coefficients[2], -0.5, epsilon = 1e-9);
        for residual in model.residuals() {
            assert_abs_diff_eq!(*residual, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_r_squared_monotone_in_terms() {
        let matrix = full_factorial_3();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let data: Vec<f64> = (0..matrix.rows()).map(|_| rng.gen_range(0.0..10.0)).collect();
        let response = ResponseVector::from_data(Array1::from(data));
        let mut workspace = Workspace::new(matrix.rows(), 6);

        let mut model = Model::intercept(&matrix, &response, &mut workspace).unwrap();
        let mut previous = model.r_squared();
        for col_i in [1, 3, 5, 7] {
            model.add_term(col_i);
            model.least_squares(&matrix, &response, &mut workspace).unwrap();
            assert!(model.r_squared() >= previous - 1e-12);
            assert!(model.r_squared() <= 1.0 + 1e-12);
            previous = model.r_squared();
        }
    }

    #[test]
    fn test_adjusted_r_squared_matches_expected() {
        // y = 3 * (f0=0) + 1.5 * (f1=0): the two main effects are
        // orthogonal to each other and to the intercept over the full
        // factorial, so fitting {intercept, f0=0} leaves exactly the
        // f1=0 component as residual:
        //   SS_res = 1.5^2 * 8 = 18, SS_tot = 9 * 8 + 2.25 * 8 = 90,
        //   R^2 = 1 - 18/90 = 0.8
        //   adjusted = 1 - 0.2 * (8 - 1) / (8 - 2 - 2) = 0.65
        let matrix = full_factorial_3();
        let response = synthetic_response(&matrix, &[(3.0, 1), (1.5, 3)]);
        let mut workspace = Workspace::new(matrix.rows(), 2);

        let mut model = Model::intercept(&matrix, &response, &mut workspace).unwrap();
        model.add_term(1);
        model.least_squares(&matrix, &response, &mut workspace).unwrap();

        assert_abs_diff_eq!(model.r_squared(), 0.8, epsilon = 1e-9);
        assert_abs_diff_eq!(model.adjusted_r_squared(), 0.65, epsilon = 1e-9);
    }

    #[test]
    fn test_collinear_column_zero_coefficient() {
        // factor 0 has 2 levels: the level-0 and level-1 main-effect
        // columns are exact negations, and {intercept, f0=0, f0=1} is
        // linearly dependent
        let matrix = full_factorial_3();
        let response = synthetic_response(&matrix, &[(2.0, 1)]);
        let mut workspace = Workspace::new(matrix.rows(), 4);

        let mut model = Model::intercept(&matrix, &response, &mut workspace).unwrap();
        model.add_term(1);
        model.least_squares(&matrix, &response, &mut workspace).unwrap();
        let before = model.r_squared();

        model.add_term(2);
        model.least_squares(&matrix, &response, &mut workspace).unwrap();

        // the dependent column's pivot vanishes: coefficient 0, fit unchanged
        assert_abs_diff_eq!(model.coefficients()[2], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(model.r_squared(), before, epsilon = 1e-9);
    }

    #[test]
    fn test_too_many_terms_rejected() {
        let mut array = LocatingArray::new(&[2, 2]);
        array.add_row(vec![0, 0]);
        array.add_row(vec![1, 1]);
        let matrix = CsMatrix::new(array);
        let response = ResponseVector::from_data(Array1::from(vec![1.0, 2.0]));
        let mut workspace = Workspace::new(2, 4);

        let mut model = Model::intercept(&matrix, &response, &mut workspace).unwrap();
        model.add_term(1);
        model.add_term(2);
        assert!(model.least_squares(&matrix, &response, &mut workspace).is_err());
    }

    #[test]
    fn test_build_models_finds_planted_terms() {
        let matrix = full_factorial_3();
        let response = synthetic_response(&matrix, &[(3.0, 1), (1.0, 5)]);

        let beam = build_models(&matrix, &response, 3, 8, 4).unwrap();
        assert!(!beam.is_empty());
        let best = &beam[0];
        assert_abs_diff_eq!(best.r_squared(), 1.0, epsilon = 1e-9);
        assert!(best.contains(0));
    }

    #[test]
    fn test_beam_has_no_duplicate_term_sets() {
        let matrix = full_factorial_3();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(8);
        let data: Vec<f64> = (0..matrix.rows()).map(|_| rng.gen_range(0.0..1.0)).collect();
        let response = ResponseVector::from_data(Array1::from(data));

        let beam = build_models(&matrix, &response, 4, 6, 3).unwrap();
        for i in 0..beam.len() {
            for j in i + 1..beam.len() {
                assert!(!beam[i].same_terms(&beam[j]));
            }
        }
        // beam is sorted best-first
        for pair in beam.windows(2) {
            assert!(pair[0].r_squared() >= pair[1].r_squared() - 1e-12);
        }
    }

    #[test]
    fn test_count_occurrences() {
        let matrix = full_factorial_3();
        let response = synthetic_response(&matrix, &[(2.0, 1)]);
        let beam = build_models(&matrix, &response, 2, 4, 2).unwrap();

        let tallies = count_occurrences(&beam, &matrix);
        assert_eq!(tallies.len(), matrix.array().t());
        let singles = &tallies[0];
        assert!(!singles.is_empty());
        for pair in singles.windows(2) {
            assert!(pair[0].count >= pair[1].count);
        }
    }
}
