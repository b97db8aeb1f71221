//! End-to-end scenarios across load, repair, check and analysis.

use locar::model::{build_models, count_occurrences};
use locar::prelude::*;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

fn indexed_catalog(names: &[&str], levels: &[u8]) -> FactorCatalog {
    FactorCatalog::new(
        names
            .iter()
            .zip(levels)
            .map(|(name, &l)| Factor::indexed(*name, l))
            .collect(),
    )
}

#[test]
fn repair_write_reload_check() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(2024);
    let array = LocatingArray::new(&[2, 3, 2]);
    let mut matrix = CsMatrix::new(array);

    let outcome = matrix.random_fix(&mut rng, 1, 1, 14);
    assert!(outcome.is_complete(), "repair left score {}", outcome.score);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("repaired.tsv");
    matrix.array().write_to_file(&path).unwrap();

    let reloaded = LocatingArray::from_file(&path, None).unwrap();
    assert_eq!(reloaded.rows(), 14);
    let reloaded_matrix = CsMatrix::new(reloaded);
    let report = reloaded_matrix.check(&mut rng, 1, 1);
    assert!(report.is_locating());
    assert_eq!(report.score, report.brute_force_score);
}

#[test]
fn constrained_file_round_trip_keeps_group_semantics() {
    let catalog = indexed_catalog(&["A", "B", "C"], &[4, 4, 2]);
    let mut array = LocatingArray::with_catalog(&[4, 4, 2], catalog);
    let tokens = ["==", "+", "F", "0", "F", "1", "C", "3"];
    let mut pos = 0;
    array
        .add_constraint_group(vec![0, 1], vec![Expr::parse(&tokens, &mut pos).unwrap()])
        .unwrap();

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
    for row_i in 0..6 {
        array.add_row(vec![0, 3, u8::from(row_i % 2 == 0)]);
        let last = array.rows() - 1;
        array.sample_group_into_row(0, &mut rng, last);
    }

    let dir = tempfile::tempdir().unwrap();
    let la_path = dir.path().join("la.tsv");
    let fd_path = dir.path().join("fd.tsv");
    array.write_to_file(&la_path).unwrap();
    std::fs::write(
        &fd_path,
        "3\n\
         A\t4\t1\ta0\ta1\ta2\ta3\t0\t1\t2\t3\n\
         B\t4\t1\tb0\tb1\tb2\tb3\t0\t1\t2\t3\n\
         C\t2\t0\toff\ton\n",
    )
    .unwrap();

    let reloaded = LocatingArray::from_file(&la_path, Some(&fd_path)).unwrap();
    assert_eq!(reloaded.con_groups().len(), 1);
    assert_eq!(reloaded.con_groups()[0].satisfying_rows(), 4);
    for row_i in 0..reloaded.rows() {
        assert!(reloaded.con_groups()[0]
            .is_satisfied(reloaded.catalog(), reloaded.row(row_i)));
    }

    // the checker agrees with the brute-force oracle under constraints
    let matrix = CsMatrix::new(reloaded);
    let report = matrix.check(&mut rng, 2, 1);
    assert_eq!(report.score, report.brute_force_score);
}

#[test]
fn synthetic_response_analysis_recovers_planted_model() {
    // a full factorial over three binary factors, a planted response
    // over two of its columns, written out and read back through the
    // response-file pipeline
    let mut array = LocatingArray::new(&[2, 2, 2]);
    for a in 0..2u8 {
        for b in 0..2u8 {
            for c in 0..2u8 {
                array.add_row(vec![a, b, c]);
            }
        }
    }
    let matrix = CsMatrix::new(array);

    let dir = tempfile::tempdir().unwrap();
    matrix
        .write_response(dir.path(), "Throughput", &[(3.0, 1), (1.5, 8)])
        .unwrap();

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
    let response =
        load_response_vector(dir.path(), "Throughput", false, None, &mut rng, matrix.rows())
            .unwrap();

    let beam = build_models(&matrix, &response, 3, 10, 5).unwrap();
    let best = &beam[0];
    assert!((best.r_squared() - 1.0).abs() < 1e-9);

    let tallies = count_occurrences(&beam, &matrix);
    assert!(!tallies[0].is_empty());
}

#[test]
fn grouped_and_mixed_levels_mapping_totality() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(77);
    let mut array = LocatingArray::new(&[5, 2, 3, 4]);
    array.set_level_groups(0, vec![0, 0, 0, 1, 1]);
    array.set_level_groups(3, vec![0, 1, 1, 2]);
    for _ in 0..9 {
        let row = vec![
            rng.gen_range(0..5u8),
            rng.gen_range(0..2u8),
            rng.gen_range(0..3u8),
            rng.gen_range(0..4u8),
        ];
        array.add_row(row);
    }
    let matrix = CsMatrix::new(array);
    assert!(matrix.verify_mapping());

    // column parity holds for grouped settings too
    for col_i in 0..matrix.cols() {
        let col = matrix.col(col_i);
        for row_i in 0..matrix.rows() {
            let realized = col
                .settings
                .iter()
                .all(|s| s.covers(matrix.array().level(row_i, s.factor)));
            assert_eq!(col.data[row_i] == ENTRY_A, realized);
        }
    }

    // and the checker still matches the oracle
    let report = matrix.check(&mut rng, 1, 1);
    assert_eq!(report.score, report.brute_force_score);
}

#[test]
fn systematic_fix_grows_from_existing_rows() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(404);
    let mut array = LocatingArray::new(&[2, 2]);
    array.add_row(vec![0, 0]);
    array.add_row(vec![1, 1]);
    let mut matrix = CsMatrix::new(array);

    let outcome = matrix.systematic_random_fix(&mut rng, 1, 1, 8, 2);
    assert!(outcome.is_complete());
    assert!(matrix.rows() >= 4);

    // the first two rows were finalized before repair began
    assert_eq!(matrix.array().row(0), &[0, 0]);
    assert_eq!(matrix.array().row(1), &[1, 1]);
}
