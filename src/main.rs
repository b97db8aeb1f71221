//! Command-line interface: load a locating array and its factor data,
//! then dispatch one analysis, check or repair subcommand.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use locar::model::{build_models, count_occurrences, Model};
use locar::prelude::*;

#[derive(Parser)]
#[command(
    name = "locar",
    version,
    about = "Locating array construction, verification and repair"
)]
struct Cli {
    /// Locating array TSV (v2.0)
    la: PathBuf,

    /// Factor data TSV; pass "-" to synthesize factor names from the
    /// array's level counts
    fd: String,

    /// RNG seed; defaults to the system clock
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pause so an operator can inspect process memory
    Memchk,

    /// Fit ranked regression models against a response directory
    Analysis {
        /// Directory of response TSV files
        response_dir: PathBuf,
        /// Response column to model
        column: String,
        /// 1 to ln-transform responses before averaging
        log: u8,
        /// Maximum terms per model
        terms: usize,
        /// Beam width (models kept per generation)
        models: usize,
        /// Columns tried per model per generation
        new_models: usize,
        /// Add uniform noise scaled by this ratio of the response range
        #[arg(long)]
        noise: Option<f64>,
    },

    /// Bisect the minimum row count that repairs to score zero
    Autofind {
        /// Required row separation between column pairs
        k: usize,
        /// Minimum rows realizing each coverable interaction
        c: usize,
        /// Upper bound to start the bisection from
        start_rows: usize,
    },

    /// Append-and-finalize repair (constraint-free arrays only)
    Fixla {
        /// Output path for the repaired array
        out: PathBuf,
    },

    /// Resample repair at a fixed row count
    Mtfixla {
        /// Required row separation between column pairs
        k: usize,
        /// Minimum rows realizing each coverable interaction
        c: usize,
        /// Total rows to size the array to
        rows: usize,
        /// Output path for the repaired array
        out: PathBuf,
    },

    /// Resample repair growing the array in halving chunks
    Sysfixla {
        /// Required row separation between column pairs
        k: usize,
        /// Minimum rows realizing each coverable interaction
        c: usize,
        /// Initial chunk of rows to append
        initial: usize,
        /// Smallest chunk to keep appending
        min_chunk: usize,
        /// Output path for the repaired array
        out: PathBuf,
    },

    /// Score the array and report constraint violations
    Checkla {
        /// Required row separation between column pairs
        k: usize,
        /// Minimum rows realizing each coverable interaction
        c: usize,
    },

    /// Reorder rows into non-increasing checker contribution
    Reorderrowsla {
        /// Required row separation between column pairs
        k: usize,
        /// Minimum rows realizing each coverable interaction
        c: usize,
        /// Output path for the reordered array
        out: PathBuf,
    },

    /// Write a synthetic response built from coefficient/column pairs
    Model {
        /// Directory to write Response.tsv into
        response_dir: PathBuf,
        /// Response column name to declare
        column: String,
        /// Number of coefficient/column pairs that follow
        terms: usize,
        /// Alternating coefficient and column-index values
        #[arg(num_args = 0..)]
        pairs: Vec<String>,
    },

    /// Dump the CS matrix
    Printcs,
}

fn main() {
    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        eprintln!("error: {error}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let seed = cli.seed.unwrap_or_else(clock_seed);
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);

    let factor_data = if cli.fd == "-" {
        None
    } else {
        Some(Path::new(&cli.fd))
    };
    let array = LocatingArray::from_file(&cli.la, factor_data)?;
    println!(
        "Loaded locating array: {} tests, {} factors, {} constraint groups (seed {seed})",
        array.rows(),
        array.factors(),
        array.con_groups().len()
    );
    let mut matrix = CsMatrix::new(array);
    println!("CS matrix columns: {}", matrix.cols());

    match cli.command {
        Command::Memchk => {
            println!("Check memory and press ENTER");
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
        }

        Command::Analysis {
            response_dir,
            column,
            log,
            terms,
            models,
            new_models,
            noise,
        } => {
            let noise = noise.map(Noise::new);
            let response = load_response_vector(
                &response_dir,
                &column,
                log != 0,
                noise.as_ref(),
                &mut rng,
                matrix.rows(),
            )?;
            let beam = build_models(&matrix, &response, terms, models, new_models)?;

            println!("\nFinal model ranking:");
            for (rank, model) in beam.iter().enumerate() {
                println!("\nModel {} (R-squared {:.6}):", rank + 1, model.r_squared());
                print_model(model, &matrix);
            }

            println!("\nOccurrence counts:");
            let tallies = count_occurrences(&beam, &matrix);
            for (size_i, occurrences) in tallies.iter().enumerate() {
                println!("\n{}-factor combinations:", size_i + 1);
                println!("{:>10} | {:>15} | combination", "count", "magnitude");
                for occurrence in occurrences {
                    if occurrence.count == 0 {
                        continue;
                    }
                    let names: Vec<&str> = occurrence
                        .factors
                        .iter()
                        .map(|&f| matrix.array().catalog().factor_name(f))
                        .collect();
                    println!(
                        "{:>10} | {:>15.6} | {}",
                        occurrence.count,
                        occurrence.magnitude,
                        names.join(" & ")
                    );
                }
            }
        }

        Command::Autofind { k, c, start_rows } => {
            let report = matrix.auto_find_rows(&mut rng, k, c, start_rows);
            println!(
                "Bisection finished with bounds ({}:{}) rows",
                report.lower_bound, report.upper_bound
            );
        }

        Command::Fixla { out } => {
            let score = matrix.exact_fix(&mut rng)?;
            println!(
                "Complete locating array with score {score} at {} rows",
                matrix.rows()
            );
            matrix.array().write_to_file(out)?;
        }

        Command::Mtfixla { k, c, rows, out } => {
            let outcome = matrix.random_fix(&mut rng, k, c, rows);
            print_outcome(&outcome, &matrix);
            matrix.array().write_to_file(out)?;
        }

        Command::Sysfixla {
            k,
            c,
            initial,
            min_chunk,
            out,
        } => {
            let outcome = matrix.systematic_random_fix(&mut rng, k, c, initial, min_chunk);
            print_outcome(&outcome, &matrix);
            matrix.array().write_to_file(out)?;
        }

        Command::Checkla { k, c } => {
            let report = matrix.check(&mut rng, k, c);
            println!("Path and min-count score: {}", report.score);
            println!("Brute-force score:        {}", report.brute_force_score);
            if report.score != report.brute_force_score {
                println!("Scores disagree; the checker is inconsistent on this array");
            }
            println!(
                "Indistinguishable coverable pairs: {}",
                report.indistinguishable_pairs
            );
            for violation in &report.violations {
                println!(
                    "Constraint group {} violated in row {}",
                    violation.group, violation.row
                );
            }
            if report.is_locating() {
                println!("Array is ({k}, {})-locating and {c}-covering", matrix.array().t());
            }
        }

        Command::Reorderrowsla { k, c, out } => {
            let contributions = matrix.reorder_rows(&mut rng, k, c);
            for (row_i, contribution) in contributions.iter().enumerate() {
                println!("{row_i}\t{contribution}");
            }
            matrix.array().write_to_file(out)?;
        }

        Command::Model {
            response_dir,
            column,
            terms,
            pairs,
        } => {
            let parsed = parse_term_pairs(terms, &pairs)?;
            for &(coefficient, col_i) in &parsed {
                println!("{coefficient} * {}", matrix.col_name(col_i));
            }
            matrix.write_response(&response_dir, &column, &parsed)?;
        }

        Command::Printcs => {
            print!("{}", matrix.render());
            if !matrix.verify_mapping() {
                eprintln!("warning: column mapping failed verification");
            }
        }
    }

    Ok(())
}

fn print_model(model: &Model, matrix: &CsMatrix) {
    println!("{:>12} | term", "coefficient");
    for (coefficient, &term) in model
        .coefficients()
        .iter()
        .zip(model.term_indices().iter())
    {
        println!("{coefficient:>12.6} | {}", matrix.col_name(term));
    }
    if (model.r_squared() - 1.0).abs() < f64::EPSILON {
        println!("Perfect model");
    }
    println!("R-squared:          {:.6}", model.r_squared());
    println!("Adjusted R-squared: {:.6}", model.adjusted_r_squared());
}

fn print_outcome(outcome: &RepairOutcome, matrix: &CsMatrix) {
    println!(
        "Score {} after {} resample iterations at {} rows",
        outcome.score,
        outcome.iterations,
        matrix.rows()
    );
    if outcome.score > 0 && outcome.resample.is_none() {
        println!("No resampleable setting remains; residual score surfaced");
    }
}

fn parse_term_pairs(terms: usize, pairs: &[String]) -> Result<Vec<(f64, usize)>> {
    if pairs.len() < 2 * terms {
        return Err(Error::invalid_params(format!(
            "expected {} coefficient/column values, found {}",
            2 * terms,
            pairs.len()
        )));
    }
    let mut parsed = Vec::with_capacity(terms);
    for term_i in 0..terms {
        let coefficient: f64 = pairs[2 * term_i]
            .parse()
            .map_err(|_| Error::invalid_params(format!("bad coefficient {:?}", pairs[2 * term_i])))?;
        let col_i: usize = pairs[2 * term_i + 1]
            .parse()
            .map_err(|_| Error::invalid_params(format!("bad column index {:?}", pairs[2 * term_i + 1])))?;
        parsed.push((coefficient, col_i));
    }
    Ok(parsed)
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos() & u128::from(u64::MAX)).unwrap_or(0))
        .unwrap_or(0)
}
