//! Constraint groups: logical constraints linking a subset of factors.
//!
//! A [`ConstraintGroup`] names some factors of the locating array and a
//! conjunction of boolean predicates over their numeric level values.
//! At construction it enumerates the full factorial over its factors,
//! keeps the satisfying combinations, and derives a weight window per
//! kept row so that rare level settings are drawn more often. Row
//! generation and repair sample whole group assignments from these
//! windows, which guarantees every produced row satisfies the group.
//!
//! Predicates are prefix-notation trees over the operators `==`, `<=`,
//! `>`, `IF` (disjunction), `+`, `*`, `/` with leaves `C value`
//! (constant) and `F factor` (numeric level of a factor in the row
//! under evaluation).

use rand::Rng;

use crate::error::{Error, Result};
use crate::factor::FactorCatalog;

/// Tolerance for boolean coercion and `==` on level-valued operands.
const EPS: f64 = 1e-9;

/// A prefix-notation predicate tree.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Literal constant.
    Const(f64),
    /// Numeric level of a factor in the row under evaluation.
    Factor(usize),
    /// Equality, `1.0` when both sides agree within tolerance.
    Eq(Box<Expr>, Box<Expr>),
    /// Less-or-equal comparison.
    Le(Box<Expr>, Box<Expr>),
    /// Strictly-greater comparison.
    Gt(Box<Expr>, Box<Expr>),
    /// Disjunction: `1.0` when either side evaluates to `1.0`.
    Or(Box<Expr>, Box<Expr>),
    /// Sum of both sides.
    Add(Box<Expr>, Box<Expr>),
    /// Product of both sides.
    Mul(Box<Expr>, Box<Expr>),
    /// Quotient of both sides.
    Div(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parse one expression from prefix-notation tokens starting at `pos`.
    ///
    /// `pos` is advanced past the consumed tokens.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParams`] on an unknown operand or a
    /// truncated token stream.
    pub fn parse(tokens: &[&str], pos: &mut usize) -> Result<Self> {
        let op = next_token(tokens, pos)?;

        match op {
            "C" => {
                let value = next_token(tokens, pos)?
                    .parse::<f64>()
                    .map_err(|_| Error::invalid_params("bad constant in constraint"))?;
                Ok(Self::Const(value))
            }
            "F" => {
                let factor_i = next_token(tokens, pos)?
                    .parse::<usize>()
                    .map_err(|_| Error::invalid_params("bad factor index in constraint"))?;
                Ok(Self::Factor(factor_i))
            }
            "==" | "<=" | ">" | "IF" | "+" | "*" | "/" => {
                let lhs = Box::new(Self::parse(tokens, pos)?);
                let rhs = Box::new(Self::parse(tokens, pos)?);
                Ok(match op {
                    "==" => Self::Eq(lhs, rhs),
                    "<=" => Self::Le(lhs, rhs),
                    ">" => Self::Gt(lhs, rhs),
                    "IF" => Self::Or(lhs, rhs),
                    "+" => Self::Add(lhs, rhs),
                    "*" => Self::Mul(lhs, rhs),
                    _ => Self::Div(lhs, rhs),
                })
            }
            other => Err(Error::invalid_params(format!(
                "invalid constraint operand {other:?}"
            ))),
        }
    }

    /// Evaluate against a full-width level row.
    ///
    /// Boolean operators produce `1.0`/`0.0`; factor leaves resolve to
    /// the numeric value of the factor's level in `row`.
    #[must_use]
    pub fn eval(&self, catalog: &FactorCatalog, row: &[u8]) -> f64 {
        match self {
            Self::Const(value) => *value,
            Self::Factor(factor_i) => catalog.numeric_level(*factor_i, row[*factor_i]),
            Self::Eq(lhs, rhs) => {
                bool_value((lhs.eval(catalog, row) - rhs.eval(catalog, row)).abs() < EPS)
            }
            Self::Le(lhs, rhs) => bool_value(lhs.eval(catalog, row) <= rhs.eval(catalog, row)),
            Self::Gt(lhs, rhs) => bool_value(lhs.eval(catalog, row) > rhs.eval(catalog, row)),
            Self::Or(lhs, rhs) => bool_value(
                is_true(lhs.eval(catalog, row)) || is_true(rhs.eval(catalog, row)),
            ),
            Self::Add(lhs, rhs) => lhs.eval(catalog, row) + rhs.eval(catalog, row),
            Self::Mul(lhs, rhs) => lhs.eval(catalog, row) * rhs.eval(catalog, row),
            Self::Div(lhs, rhs) => lhs.eval(catalog, row) / rhs.eval(catalog, row),
        }
    }

    /// Append this expression's prefix-notation tokens to `out`.
    pub fn push_tokens(&self, out: &mut Vec<String>) {
        let binary = |op: &str, lhs: &Self, rhs: &Self, out: &mut Vec<String>| {
            out.push(op.to_string());
            lhs.push_tokens(out);
            rhs.push_tokens(out);
        };
        match self {
            Self::Const(value) => {
                out.push("C".to_string());
                out.push(value.to_string());
            }
            Self::Factor(factor_i) => {
                out.push("F".to_string());
                out.push(factor_i.to_string());
            }
            Self::Eq(lhs, rhs) => binary("==", lhs, rhs, out),
            Self::Le(lhs, rhs) => binary("<=", lhs, rhs, out),
            Self::Gt(lhs, rhs) => binary(">", lhs, rhs, out),
            Self::Or(lhs, rhs) => binary("IF", lhs, rhs, out),
            Self::Add(lhs, rhs) => binary("+", lhs, rhs, out),
            Self::Mul(lhs, rhs) => binary("*", lhs, rhs, out),
            Self::Div(lhs, rhs) => binary("/", lhs, rhs, out),
        }
    }
}

fn next_token<'a>(tokens: &[&'a str], pos: &mut usize) -> Result<&'a str> {
    let token = tokens
        .get(*pos)
        .copied()
        .ok_or_else(|| Error::invalid_params("truncated constraint expression"))?;
    *pos += 1;
    Ok(token)
}

fn bool_value(condition: bool) -> f64 {
    if condition {
        1.0
    } else {
        0.0
    }
}

fn is_true(value: f64) -> bool {
    (value - 1.0).abs() < EPS
}

/// A conjunction of predicates over a subset of factors, with the
/// pre-enumerated satisfying combinations and their sampling weights.
#[derive(Debug, Clone)]
pub struct ConstraintGroup {
    factor_indices: Vec<usize>,
    exprs: Vec<Expr>,
    /// Satisfying level combinations; each row holds the group's own
    /// factors only, in `factor_indices` order.
    rows: Vec<Vec<u8>>,
    weight_min: Vec<u64>,
    weight_max: Vec<u64>,
    total_weight: u64,
}

impl ConstraintGroup {
    /// Build a constraint group by enumerating its full factorial.
    ///
    /// `level_counts` aligns with `factor_indices`; `total_factors` is
    /// the width of the enclosing array (predicates address factors by
    /// absolute index).
    ///
    /// Each kept row is weighted by
    /// `sum_f full_factorial / setting_count[f][level]` so that rare
    /// settings are over-sampled; the weights become contiguous integer
    /// windows over `[0, total_weight)` used by [`sample_into`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConstraintUnsatisfiable`] when no combination
    /// satisfies every predicate.
    ///
    /// [`sample_into`]: ConstraintGroup::sample_into
    pub fn build(
        group_i: usize,
        factor_indices: Vec<usize>,
        exprs: Vec<Expr>,
        level_counts: &[u8],
        total_factors: usize,
        catalog: &FactorCatalog,
    ) -> Result<Self> {
        debug_assert_eq!(factor_indices.len(), level_counts.len());
        let group_factors = factor_indices.len();

        let mut rows: Vec<Vec<u8>> = Vec::new();
        let mut setting_count: Vec<Vec<u64>> = level_counts
            .iter()
            .map(|&levels| vec![0; usize::from(levels)])
            .collect();
        let mut full_factorial: u64 = 0;

        // odometer over the group's full factorial
        let mut scratch = vec![0u8; total_factors];
        let mut levels = vec![0u8; group_factors];
        'outer: loop {
            full_factorial += 1;
            for (pos, &factor_i) in factor_indices.iter().enumerate() {
                scratch[factor_i] = levels[pos];
            }
            let satisfied = exprs.iter().all(|e| is_true(e.eval(catalog, &scratch)));
            if satisfied {
                for (pos, &level) in levels.iter().enumerate() {
                    setting_count[pos][usize::from(level)] += 1;
                }
                rows.push(levels.clone());
            }

            // advance the odometer, most-significant factor first
            for pos in (0..group_factors).rev() {
                levels[pos] += 1;
                if levels[pos] < level_counts[pos] {
                    continue 'outer;
                }
                levels[pos] = 0;
            }
            break;
        }

        if rows.is_empty() {
            return Err(Error::ConstraintUnsatisfiable { group: group_i });
        }

        let mut weight_min = Vec::with_capacity(rows.len());
        let mut weight_max = Vec::with_capacity(rows.len());
        let mut cumulative: u64 = 0;
        for row in &rows {
            let weight: u64 = row
                .iter()
                .enumerate()
                .map(|(pos, &level)| full_factorial / setting_count[pos][usize::from(level)])
                .sum();
            weight_min.push(cumulative);
            weight_max.push(cumulative + weight - 1);
            cumulative += weight;
        }

        Ok(Self {
            factor_indices,
            exprs,
            rows,
            weight_min,
            weight_max,
            total_weight: cumulative,
        })
    }

    /// Absolute factor indices belonging to this group.
    #[must_use]
    pub fn factor_indices(&self) -> &[usize] {
        &self.factor_indices
    }

    /// The predicates of this group.
    #[must_use]
    pub fn exprs(&self) -> &[Expr] {
        &self.exprs
    }

    /// Number of satisfying level combinations.
    #[must_use]
    pub fn satisfying_rows(&self) -> usize {
        self.rows.len()
    }

    /// The satisfying combinations, group-factor levels in
    /// [`factor_indices`](ConstraintGroup::factor_indices) order.
    #[must_use]
    pub fn rows(&self) -> &[Vec<u8>] {
        &self.rows
    }

    /// Whether a full-width level row satisfies every predicate.
    #[must_use]
    pub fn is_satisfied(&self, catalog: &FactorCatalog, row: &[u8]) -> bool {
        self.exprs.iter().all(|e| is_true(e.eval(catalog, row)))
    }

    /// Whether some satisfying combination matches `require` and dodges
    /// `avoid`.
    ///
    /// Both probes are full-width: `require[f] = Some(l)` demands the
    /// combination set factor `f` to level `l`, `avoid[f] = Some(l)`
    /// forbids it. Factors outside this group are ignored.
    #[must_use]
    pub fn satisfiable(&self, require: &[Option<u8>], avoid: &[Option<u8>]) -> bool {
        self.rows.iter().any(|row| {
            self.factor_indices.iter().enumerate().all(|(pos, &factor_i)| {
                let level = row[pos];
                require[factor_i].map_or(true, |l| l == level)
                    && avoid[factor_i].map_or(true, |l| l != level)
            })
        })
    }

    /// Sample a satisfying combination into `level_row` (full width).
    ///
    /// A uniform draw over `[0, total_weight)` is mapped to its owning
    /// weight window by binary search, so combinations with rare
    /// settings are proportionally more likely.
    pub fn sample_into<R: Rng + ?Sized>(&self, rng: &mut R, level_row: &mut [u8]) {
        let draw = rng.gen_range(0..self.total_weight);

        let mut bot = 0usize;
        let mut top = self.rows.len() - 1;
        while bot != top {
            let mid = (bot + top) / 2;
            if draw > self.weight_max[mid] {
                bot = mid + 1;
            } else if draw < self.weight_min[mid] {
                top = mid - 1;
            } else {
                bot = mid;
                top = mid;
            }
        }

        for (pos, &factor_i) in self.factor_indices.iter().enumerate() {
            level_row[factor_i] = self.rows[top][pos];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factor::Factor;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn indexed_catalog(level_counts: &[u8]) -> FactorCatalog {
        FactorCatalog::new(
            level_counts
                .iter()
                .enumerate()
                .map(|(i, &levels)| Factor::indexed(format!("F{i}"), levels))
                .collect(),
        )
    }

    fn sum_eq_three() -> Expr {
        // == + F 0 F 1 C 3
        let tokens = ["==", "+", "F", "0", "F", "1", "C", "3"];
        let mut pos = 0;
        let expr = Expr::parse(&tokens, &mut pos).unwrap();
        assert_eq!(pos, tokens.len());
        expr
    }

    #[test]
    fn test_expr_eval() {
        let catalog = indexed_catalog(&[4, 4]);
        let expr = sum_eq_three();
        assert_eq!(expr.eval(&catalog, &[1, 2]), 1.0);
        assert_eq!(expr.eval(&catalog, &[1, 1]), 0.0);
        assert_eq!(expr.eval(&catalog, &[3, 0]), 1.0);
    }

    #[test]
    fn test_expr_disjunction() {
        let catalog = indexed_catalog(&[2, 2]);
        let tokens = ["IF", "==", "F", "0", "C", "1", "==", "F", "1", "C", "1"];
        let mut pos = 0;
        let expr = Expr::parse(&tokens, &mut pos).unwrap();
        assert_eq!(expr.eval(&catalog, &[1, 0]), 1.0);
        assert_eq!(expr.eval(&catalog, &[0, 1]), 1.0);
        assert_eq!(expr.eval(&catalog, &[0, 0]), 0.0);
    }

    #[test]
    fn test_expr_token_round_trip() {
        let expr = sum_eq_three();
        let mut tokens = Vec::new();
        expr.push_tokens(&mut tokens);
        assert_eq!(tokens, vec!["==", "+", "F", "0", "F", "1", "C", "3"]);
    }

    #[test]
    fn test_group_enumeration() {
        let catalog = indexed_catalog(&[4, 4]);
        let group =
            ConstraintGroup::build(0, vec![0, 1], vec![sum_eq_three()], &[4, 4], 2, &catalog)
                .unwrap();

        // A + B = 3 over levels 0..=3: (0,3), (1,2), (2,1), (3,0)
        assert_eq!(group.satisfying_rows(), 4);
        for row in group.rows() {
            assert_eq!(u32::from(row[0]) + u32::from(row[1]), 3);
        }
    }

    #[test]
    fn test_group_unsatisfiable() {
        let catalog = indexed_catalog(&[2, 2]);
        let tokens = ["==", "+", "F", "0", "F", "1", "C", "9"];
        let mut pos = 0;
        let expr = Expr::parse(&tokens, &mut pos).unwrap();
        let result = ConstraintGroup::build(1, vec![0, 1], vec![expr], &[2, 2], 2, &catalog);
        assert!(matches!(
            result,
            Err(Error::ConstraintUnsatisfiable { group: 1 })
        ));
    }

    #[test]
    fn test_sampled_rows_satisfy() {
        let catalog = indexed_catalog(&[4, 4]);
        let group =
            ConstraintGroup::build(0, vec![0, 1], vec![sum_eq_three()], &[4, 4], 2, &catalog)
                .unwrap();

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let mut row = [0u8; 2];
        for _ in 0..200 {
            group.sample_into(&mut rng, &mut row);
            assert!(group.is_satisfied(&catalog, &row));
        }
    }

    #[test]
    fn test_satisfiable_probes() {
        let catalog = indexed_catalog(&[4, 4]);
        let group =
            ConstraintGroup::build(0, vec![0, 1], vec![sum_eq_three()], &[4, 4], 2, &catalog)
                .unwrap();

        // require A=1 is satisfiable via (1,2)
        assert!(group.satisfiable(&[Some(1), None], &[None, None]));
        // require A=1 while avoiding B=2 is not
        assert!(!group.satisfiable(&[Some(1), None], &[None, Some(2)]));
        // avoiding one level still leaves other combinations
        assert!(group.satisfiable(&[None, None], &[Some(0), None]));
    }
}
