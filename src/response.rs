//! Response vectors: per-test measurements driving model search.
//!
//! Responses live in a directory of TSV files, one measurement column
//! per file set. The loader averages the chosen column across files and
//! per row (counting non-empty entries), optionally log-transforming
//! each value before averaging, and computes `SS_tot` once for R²
//! calculations. A [`Noise`] injector can perturb the averaged values
//! with uniform noise scaled to the observed range.

use std::fs;
use std::path::Path;

use ndarray::Array1;
use rand::Rng;

use crate::error::{Error, Result};

/// A response vector with its total sum of squares.
#[derive(Debug, Clone)]
pub struct ResponseVector {
    data: Array1<f64>,
    ss_tot: f64,
}

impl ResponseVector {
    /// Wrap response data, computing `SS_tot = sum((y_i - mean)^2)`.
    #[must_use]
    pub fn from_data(data: Array1<f64>) -> Self {
        let mean = data.sum() / data.len() as f64;
        let ss_tot = data.iter().map(|y| (y - mean) * (y - mean)).sum();
        Self { data, ss_tot }
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the vector is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The response values.
    #[must_use]
    pub fn data(&self) -> &Array1<f64> {
        &self.data
    }

    /// Total sum of squares around the mean.
    #[must_use]
    pub fn ss_tot(&self) -> f64 {
        self.ss_tot
    }
}

/// Uniform noise injector: perturbs each value by up to
/// `ratio * range / 2` either way.
#[derive(Debug, Clone, Copy)]
pub struct Noise {
    ratio: f64,
}

impl Noise {
    /// Create an injector with the given range ratio.
    #[must_use]
    pub fn new(ratio: f64) -> Self {
        Self { ratio }
    }

    /// Apply centered uniform noise scaled by `ratio * range`.
    pub fn apply<R: Rng + ?Sized>(&self, rng: &mut R, value: f64, range: f64) -> f64 {
        let noise_range = self.ratio * range;
        value + rng.gen::<f64>() * noise_range - noise_range / 2.0
    }
}

/// Load and average the `column` responses from every file in `dir`.
///
/// Each file's first line must repeat the locating array's row count;
/// its second line names the columns. Files lacking the column are
/// skipped; empty cells do not count toward a row's average. With
/// `perform_log`, values are `ln`-transformed before averaging. A
/// `noise` injector, when given, perturbs the averaged vector using the
/// observed response range.
///
/// # Errors
///
/// Returns [`Error::RowMismatch`] on a row-count disagreement,
/// [`Error::ColumnNotFound`] when no file carries the column, a parse
/// error on malformed values, and [`Error::InvalidParams`] when some
/// row ends up with no responses at all.
pub fn load_response_vector<R: Rng + ?Sized>(
    dir: impl AsRef<Path>,
    column: &str,
    perform_log: bool,
    noise: Option<&Noise>,
    rng: &mut R,
    rows: usize,
) -> Result<ResponseVector> {
    let dir = dir.as_ref();
    let mut sums = vec![0.0f64; rows];
    let mut counts = vec![0usize; rows];
    let mut column_found = false;

    let mut paths: Vec<_> = fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| !name.starts_with('.'))
                && path.is_file()
        })
        .collect();
    paths.sort();

    for path in &paths {
        let display = path.display().to_string();
        let contents = fs::read_to_string(path)?;
        let mut lines = contents.lines();

        let declared: usize = lines
            .next()
            .ok_or_else(|| Error::parse(&display, 1, "empty response file"))?
            .trim()
            .parse()
            .map_err(|_| Error::parse(&display, 1, "expected row count"))?;
        if declared != rows {
            return Err(Error::RowMismatch {
                path: display,
                expected: rows,
                found: declared,
            });
        }

        let header = lines
            .next()
            .ok_or_else(|| Error::parse(&display, 2, "missing response headers"))?;
        let Some(col_i) = header.split('\t').map(str::trim).position(|h| h == column) else {
            continue;
        };
        column_found = true;

        for (row_i, line) in lines.take(rows).enumerate() {
            let cell = line.split('\t').map(str::trim).nth(col_i).unwrap_or("");
            if cell.is_empty() {
                continue;
            }
            let value: f64 = cell.parse().map_err(|_| {
                Error::parse(&display, row_i + 3, format!("bad response value {cell:?}"))
            })?;
            counts[row_i] += 1;
            sums[row_i] += if perform_log { value.ln() } else { value };
        }
    }

    if !column_found {
        return Err(Error::ColumnNotFound {
            column: column.to_string(),
            dir: dir.display().to_string(),
        });
    }
    if let Some(row_i) = counts.iter().position(|&c| c == 0) {
        return Err(Error::invalid_params(format!(
            "row {row_i} has no responses for column {column:?}"
        )));
    }

    let mut data = Array1::zeros(rows);
    for row_i in 0..rows {
        data[row_i] = sums[row_i] / counts[row_i] as f64;
    }

    if let Some(noise) = noise {
        let min = data.iter().copied().fold(f64::INFINITY, f64::min);
        let max = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = max - min;
        for value in data.iter_mut() {
            *value = noise.apply(rng, *value, range);
        }
    }

    Ok(ResponseVector::from_data(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn write_response_file(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn test_ss_tot() {
        let response = ResponseVector::from_data(Array1::from(vec![1.0, 2.0, 3.0]));
        assert_eq!(response.len(), 3);
        assert!((response.ss_tot() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_load_averages_across_files() {
        let dir = tempfile::tempdir().unwrap();
        write_response_file(dir.path(), "run1.tsv", "2\nLatency\tThroughput\n1\t10\n2\t20\n");
        write_response_file(dir.path(), "run2.tsv", "2\nThroughput\n30\n\n");

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let response =
            load_response_vector(dir.path(), "Throughput", false, None, &mut rng, 2).unwrap();

        // row 0 averages 10 and 30; row 1 has a single entry
        assert!((response.data()[0] - 20.0).abs() < 1e-12);
        assert!((response.data()[1] - 20.0).abs() < 1e-12);
    }

    #[test]
    fn test_load_log_transform() {
        let dir = tempfile::tempdir().unwrap();
        write_response_file(dir.path(), "run.tsv", "2\nThroughput\n1\t\n7.389056098930650\n");

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let response =
            load_response_vector(dir.path(), "Throughput", true, None, &mut rng, 2).unwrap();
        assert!(response.data()[0].abs() < 1e-9);
        assert!((response.data()[1] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_load_row_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        write_response_file(dir.path(), "run.tsv", "3\nThroughput\n1\n2\n3\n");

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let result = load_response_vector(dir.path(), "Throughput", false, None, &mut rng, 2);
        assert!(matches!(result, Err(Error::RowMismatch { found: 3, .. })));
    }

    #[test]
    fn test_load_missing_column() {
        let dir = tempfile::tempdir().unwrap();
        write_response_file(dir.path(), "run.tsv", "1\nLatency\n1\n");

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let result = load_response_vector(dir.path(), "Throughput", false, None, &mut rng, 1);
        assert!(matches!(result, Err(Error::ColumnNotFound { .. })));
    }

    #[test]
    fn test_noise_stays_in_range() {
        let noise = Noise::new(0.1);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(17);
        for _ in 0..100 {
            let noisy = noise.apply(&mut rng, 5.0, 10.0);
            assert!((noisy - 5.0).abs() <= 0.5 + 1e-12);
        }
    }
}
