//! # locar
//!
//! Construction, verification and repair of *locating arrays* for
//! fault localization in combinatorial testing.
//!
//! ## Overview
//!
//! A locating array is a test matrix in which every pair of candidate
//! factor interactions is separated by at least *k* tests and every
//! interaction is realized by at least *c* tests. Such arrays let a
//! screening experiment not just detect that some *t*-way interaction
//! influences a response, but identify *which* one.
//!
//! This library provides:
//! - The implicit compressive-sensing matrix over a locating array:
//!   one ±1 column per candidate interaction, with grouped levels and
//!   logical constraints between factors
//! - A path-tree checker that scores distinguishability far below the
//!   naive pairwise cost, with a brute-force oracle for verification
//! - Repair engines that resample rows (whole constraint groups at a
//!   time where required) until the score reaches zero, plus a row
//!   count bisection
//! - Residual-guided greedy model search over the matrix columns via
//!   incremental QR least squares
//!
//! ## Quick start
//!
//! ```rust
//! use locar::prelude::*;
//! use rand::SeedableRng;
//! use rand_xoshiro::Xoshiro256PlusPlus;
//!
//! // two binary factors, strength-2 interactions
//! let array = LocatingArray::new(&[2, 2]);
//! let mut matrix = CsMatrix::new(array);
//! let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
//!
//! // grow to 10 rows and repair until (1, 2)-locating and 1-covering
//! let outcome = matrix.random_fix(&mut rng, 1, 1, 10);
//! assert!(outcome.is_complete());
//!
//! let report = matrix.check(&mut rng, 1, 1);
//! assert!(report.is_locating());
//! ```
//!
//! ## Notation
//!
//! Throughout the crate: `t` is the interaction strength of the
//! candidate set, `k` the required row separation between column
//! pairs, and `c` the minimum number of rows realizing each coverable
//! interaction.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

pub mod constraint;
pub mod cs;
pub mod error;
pub mod factor;
pub mod la;
pub mod model;
pub mod repair;
pub mod response;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::constraint::{ConstraintGroup, Expr};
    pub use crate::cs::check::{CheckReport, ConstraintViolation};
    pub use crate::cs::{CsCol, CsMatrix, FactorSetting, ENTRY_A, ENTRY_B};
    pub use crate::error::{Error, Result};
    pub use crate::factor::{Factor, FactorCatalog};
    pub use crate::la::{GroupingInfo, LocatingArray, LA_VERSION};
    pub use crate::model::{build_models, count_occurrences, Model, Occurrence, Workspace};
    pub use crate::repair::{AutoFindReport, RepairOutcome};
    pub use crate::response::{load_response_vector, Noise, ResponseVector};
}

// Re-export commonly used items at crate root
pub use cs::check::CheckReport;
pub use cs::CsMatrix;
pub use error::{Error, Result};
pub use la::LocatingArray;
pub use model::build_models;
pub use response::ResponseVector;
