use approx::assert_relative_eq;
use bart_mcmc::split_rules::SplitRule;
use bart_mcmc::tree::{DecisionTree, ROOT};
use bart_mcmc::{
    BartError, BartRng, BartSettings, BartState, ChainSnapshot, DataMatrix, NormalAlgorithm, Phase, Response,
    RngAlgorithm, TreeInit,
};
use ndarray::{array, Array1, Array2};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

fn regression_data(n: usize) -> DataMatrix {
    let x = Array2::from_shape_fn((n, 3), |(i, j)| ((i * (j + 3) + j) % 17) as f64 / 17.0);
    let y = Array1::from_iter(x.outer_iter().map(|row| 3.0 * row[0] - 2.0 * row[1] + ((row[2] * 7.0).sin())));
    let x_test = x.slice(ndarray::s![..5, ..]).to_owned();
    DataMatrix::continuous(x, y).unwrap().with_test(x_test, None).unwrap()
}

fn settings() -> BartSettings {
    BartSettings {
        n_trees: 10,
        n_thin: 1,
        seed: 17,
        ..BartSettings::default()
    }
}

/// One binary column and one continuous column.
fn binary_data() -> DataMatrix {
    let x = array![[0.0, 0.1], [1.0, 0.2], [0.0, 0.3], [1.0, 0.4], [0.0, 0.5], [1.0, 0.6]];
    let y = array![0.0, 1.0, 0.2, 1.1, -0.1, 0.9];
    DataMatrix::continuous(x, y).unwrap()
}

fn binary_split_tree(data: &DataMatrix) -> DecisionTree {
    let mut tree = DecisionTree::new(0.0, data.n_obs());
    tree.split_leaf(
        ROOT,
        SplitRule::Continuous {
            variable: 0,
            threshold: 0.5,
        },
        data.x(),
    )
    .unwrap();
    tree
}

#[test]
fn test_fixed_seed_runs_are_bit_identical() {
    let data = regression_data(40);
    let mut a = BartState::new(settings(), data.clone(), 0).unwrap();
    let mut b = BartState::new(settings(), data, 0).unwrap();

    let samples_a = a.run(20, 30).unwrap();
    let samples_b = b.run(20, 30).unwrap();

    assert_eq!(samples_a, samples_b);
    let bits = |v: Vec<f64>| v.into_iter().map(f64::to_bits).collect::<Vec<_>>();
    assert_eq!(bits(samples_a.variances()), bits(samples_b.variances()));
}

#[test]
fn test_chains_with_different_seeds_differ() {
    let data = regression_data(40);
    let mut a = BartState::new(settings(), data.clone(), 0).unwrap();
    let mut b = BartState::new(settings(), data, 1).unwrap();

    assert_ne!(a.run(5, 5).unwrap().variances(), b.run(5, 5).unwrap().variances());
}

#[test]
fn test_invariants_hold_every_iteration() {
    let data = regression_data(50);
    let mut state = BartState::new(settings(), data, 0).unwrap();

    for i in 0..60 {
        if i == 20 {
            state.finish_warmup().unwrap();
        }
        state.step().unwrap();
        state.check_invariants().unwrap();
        assert!(state.variance() > 0.0);
        assert!(state.forest().aggregation_error() < 1e-9);
    }
    assert_eq!(state.phase(), Phase::Sampling);
    assert!(state.forest().empty_leaf().is_none());
}

#[test]
fn test_counters_and_records() {
    let data = regression_data(30);
    let settings = BartSettings {
        n_thin: 2,
        keep_train_fits: false,
        ..settings()
    };
    let mut state = BartState::new(settings, data, 0).unwrap();

    let samples = state.run(5, 4).unwrap();

    assert_eq!(samples.len(), 4);
    let counters = state.counters();
    assert_eq!(counters.burn_in, 5);
    assert_eq!(counters.samples, 4);
    assert_eq!(counters.iterations, 13);
    assert_eq!(counters.thinning, 0);
    for record in &samples.records {
        assert!(record.train_fit.is_none());
        assert_eq!(record.test_fit.len(), 5);
        assert_eq!(record.variable_counts.len(), 3);
        assert!(record.variance > 0.0);
    }
}

#[test]
fn test_stump_initialisation_includes_offset() {
    let data = regression_data(20);
    let offset = Array1::from_iter((0..20).map(|i| i as f64 * 0.1));
    let target_mean = (data.y() - &offset).mean().unwrap();
    let data = data.with_offset(offset.clone()).unwrap();

    let state = BartState::new(settings(), data, 0).unwrap();
    let predictions = state.predictions();

    for i in 0..20 {
        assert_relative_eq!(predictions[i], target_mean + offset[i], epsilon = 1e-12);
    }
    assert_eq!(state.phase(), Phase::WarmUp);
}

#[test]
fn test_rejected_predictor_update_leaves_state_untouched() {
    let data = binary_data();
    let tree = binary_split_tree(&data);
    let mut state = BartState::new(BartSettings { n_trees: 2, ..settings() }, data, 0).unwrap();
    state.set_tree(0, tree).unwrap();
    state.finish_warmup().unwrap();

    let column_before = state.data().x().column(0).to_owned();
    let forest_before = state.forest().clone();

    let zeros = Array1::zeros(6);
    assert!(!state.set_predictor(0, zeros.view(), false).unwrap());

    assert_eq!(state.data().x().column(0), column_before);
    assert_eq!(state.forest(), &forest_before);
    assert_eq!(
        state.forest().tree(0).rule(ROOT),
        Some(&SplitRule::Continuous {
            variable: 0,
            threshold: 0.5
        })
    );
}

#[test]
fn test_accepted_predictor_update_reroutes_trees() {
    let data = binary_data();
    let tree = binary_split_tree(&data);
    let mut state = BartState::new(BartSettings { n_trees: 2, ..settings() }, data, 0).unwrap();
    state.set_tree(0, tree).unwrap();
    state.finish_warmup().unwrap();

    let flipped = array![1.0, 0.0, 1.0, 0.0, 0.0, 1.0];
    assert!(state.set_predictor(0, flipped.view(), false).unwrap());

    assert_eq!(state.data().x().column(0), flipped);
    let tree = state.forest().tree(0);
    let left = tree.left_child(ROOT).unwrap();
    assert_eq!(tree.observations(left), &[1, 3, 4]);
    state.check_invariants().unwrap();
    state.step().unwrap();
}

#[test]
fn test_forced_update_coalesces_in_sampling_phase() {
    let data = binary_data();
    let tree = binary_split_tree(&data);
    let mut state = BartState::new(BartSettings { n_trees: 2, ..settings() }, data, 0).unwrap();
    state.set_tree(0, tree).unwrap();
    state.finish_warmup().unwrap();

    let zeros = Array1::zeros(6);
    assert!(state.set_predictor(0, zeros.view(), true).unwrap());

    assert_eq!(state.data().x().column(0), zeros);
    assert_eq!(state.forest().tree(0).count_leaves(), 1);
    state.check_invariants().unwrap();
    state.step().unwrap();
}

#[test]
fn test_forced_update_repairs_trees_during_warmup() {
    let data = binary_data();
    let tree = binary_split_tree(&data);
    let mut state = BartState::new(BartSettings { n_trees: 2, ..settings() }, data, 0).unwrap();
    state.set_tree(0, tree).unwrap();

    let zeros = Array1::zeros(6);
    assert!(state.set_predictor(0, zeros.view(), true).unwrap());
    assert_eq!(state.phase(), Phase::WarmUp);
    assert_eq!(state.data().x().column(0), zeros);
    assert_eq!(state.forest().tree(0).count_leaves(), 1);
    assert!(state.forest().empty_leaf().is_none());
    state.check_invariants().unwrap();
    state.step().unwrap();
}

#[test]
fn test_warmup_tolerates_installed_empty_leaves() {
    let data = binary_data();
    let mut state = BartState::new(BartSettings { n_trees: 2, ..settings() }, data.clone(), 0).unwrap();

    let mut tree = DecisionTree::new(0.0, data.n_obs());
    tree.split_leaf(
        ROOT,
        SplitRule::Continuous {
            variable: 1,
            threshold: 5.0,
        },
        data.x(),
    )
    .unwrap();
    state.set_tree(0, tree).unwrap();
    assert!(state.forest().tree(0).has_empty_leaf());

    // The right leaf was already empty, so this is not a conflict.
    let shifted = array![0.2, 0.3, 0.4, 0.5, 0.6, 0.7];
    assert!(state.set_predictor(1, shifted.view(), false).unwrap());
    assert_eq!(state.data().x().column(1), shifted);
    state.step().unwrap();

    state.finish_warmup().unwrap();
    assert!(state.forest().empty_leaf().is_none());
    state.check_invariants().unwrap();
}

#[test]
fn test_set_tree_rejects_empty_leaves_after_warmup() {
    let data = binary_data();
    let mut state = BartState::new(BartSettings { n_trees: 2, ..settings() }, data.clone(), 0).unwrap();
    state.finish_warmup().unwrap();

    let mut tree = DecisionTree::new(0.0, data.n_obs());
    tree.split_leaf(
        ROOT,
        SplitRule::Continuous {
            variable: 1,
            threshold: 5.0,
        },
        data.x(),
    )
    .unwrap();

    assert!(matches!(state.set_tree(0, tree.clone()), Err(BartError::Tree(_))));
    assert!(matches!(
        state.set_tree(2, tree),
        Err(BartError::DimensionMismatch { .. })
    ));
}

#[test]
fn test_malformed_predictor_updates_are_errors() {
    let mut state = BartState::new(settings(), regression_data(20), 0).unwrap();
    let before = state.data().clone();

    assert!(matches!(
        state.set_predictor(0, Array1::zeros(19).view(), true),
        Err(BartError::DimensionMismatch { .. })
    ));
    assert!(matches!(
        state.set_predictor(3, Array1::zeros(20).view(), true),
        Err(BartError::InvalidPredictor { column: 3, .. })
    ));
    let mut nan = Array1::zeros(20);
    nan[4] = f64::NAN;
    assert!(matches!(
        state.set_predictor(1, nan.view(), false),
        Err(BartError::InvalidPredictor { column: 1, .. })
    ));
    assert!(state.set_predictors(Array2::zeros((20, 2)), true).is_err());
    assert_eq!(state.data(), &before);
}

#[test]
fn test_whole_matrix_update() {
    let data = binary_data();
    let tree = binary_split_tree(&data);
    let mut state = BartState::new(BartSettings { n_trees: 2, ..settings() }, data.clone(), 0).unwrap();
    state.set_tree(0, tree).unwrap();
    state.finish_warmup().unwrap();

    let mut collapsed = data.x().clone();
    collapsed.column_mut(0).fill(1.0);
    assert!(!state.set_predictors(collapsed.clone(), false).unwrap());
    assert_eq!(state.data().x(), data.x());

    assert!(state.set_predictors(collapsed.clone(), true).unwrap());
    assert_eq!(state.data().x(), &collapsed);
    assert!(state.forest().empty_leaf().is_none());
}

#[test]
fn test_test_set_updates_leave_trees_alone() {
    let mut state = BartState::new(settings(), regression_data(30), 0).unwrap();
    state.run(10, 0).unwrap();

    let forest_trees = state.forest().trees().to_vec();
    let train = state.predictions();
    let test_before = state.test_predictions();

    state
        .set_test_predictor(0, array![0.9, 0.1, 0.5, 0.3, 0.7].view())
        .unwrap();
    assert_eq!(state.forest().trees(), forest_trees.as_slice());
    assert_eq!(state.predictions(), train);
    state.check_invariants().unwrap();

    let x_test = Array2::from_elem((2, 3), 0.25);
    state
        .set_test_predictors(x_test.clone(), Some(array![1.0, 2.0]))
        .unwrap();
    let expected: Array1<f64> = state
        .forest()
        .trees()
        .iter()
        .map(|tree| tree.predict(&x_test))
        .fold(Array1::zeros(2), |acc, fit| acc + fit)
        + array![1.0, 2.0];
    let test_after = state.test_predictions();
    assert_eq!(test_after.len(), 2);
    for i in 0..2 {
        assert_relative_eq!(test_after[i], expected[i], epsilon = 1e-12);
    }
    assert_eq!(test_before.len(), 5);

    state.set_test_offset(array![-1.0, 0.5]).unwrap();
    let shifted = state.test_predictions();
    assert_relative_eq!(shifted[0], expected[0] - 2.0, epsilon = 1e-12);
    assert_relative_eq!(shifted[1], expected[1] - 1.5, epsilon = 1e-12);
    assert_eq!(state.predictions(), train);
    assert!(matches!(
        state.set_test_offset(array![1.0]),
        Err(BartError::DimensionMismatch { .. })
    ));
}

#[test]
fn test_snapshot_resumes_bit_for_bit() {
    let data = regression_data(30);
    let mut original = BartState::new(settings(), data, 0).unwrap();
    for _ in 0..10 {
        original.step().unwrap();
    }
    original.finish_warmup().unwrap();
    for _ in 0..3 {
        original.step().unwrap();
    }

    let json = original.store_state().unwrap().to_json().unwrap();
    let mut resumed = BartState::restore(ChainSnapshot::from_json(&json).unwrap()).unwrap();
    assert_eq!(resumed.phase(), Phase::Sampling);
    assert_eq!(resumed.counters(), original.counters());

    for _ in 0..15 {
        original.step().unwrap();
        resumed.step().unwrap();
        assert_eq!(original.variance().to_bits(), resumed.variance().to_bits());
        assert_eq!(original.predictions(), resumed.predictions());
        assert_eq!(original.test_predictions(), resumed.test_predictions());
    }
    assert_eq!(original.move_statistics(), resumed.move_statistics());
}

#[test]
fn test_snapshot_through_writer() {
    let mut state = BartState::new(settings(), regression_data(20), 0).unwrap();
    state.step().unwrap();

    let mut buffer = Vec::new();
    state.store_state().unwrap().write_to(&mut buffer).unwrap();
    let snapshot = ChainSnapshot::read_from(buffer.as_slice()).unwrap();
    assert_eq!(snapshot.counters().iterations, 1);
    assert_eq!(snapshot.phase(), Phase::WarmUp);

    let restored = BartState::restore(snapshot).unwrap();
    assert_eq!(restored.forest().trees(), state.forest().trees());

    // A truncated stream surfaces as a snapshot error.
    let truncated = &buffer[..buffer.len() / 2];
    assert!(matches!(
        ChainSnapshot::read_from(truncated),
        Err(BartError::Snapshot(_))
    ));
}

#[test]
fn test_probit_chain() {
    let x = Array2::from_shape_fn((40, 1), |(i, _)| i as f64);
    let y = Array1::from_iter((0..40).map(|i| if i >= 20 { 1.0 } else { 0.0 }));
    let data = DataMatrix::continuous(x, y.clone()).unwrap();
    let settings = BartSettings {
        response: Response::Probit,
        ..settings()
    }
    .calibrated(&data)
    .unwrap();

    let mut state = BartState::new(settings, data, 0).unwrap();
    let samples = state.run(30, 20).unwrap();

    assert!(samples.variances().iter().all(|&v| v == 1.0));
    let latent = state.latent().unwrap();
    for i in 0..40 {
        assert_eq!(latent[i] > 0.0, y[i] == 1.0);
    }
    let fit = samples.mean_train_fit().unwrap();
    assert!(fit[35] > fit[5]);

    assert!(state.set_response(array![0.0, 2.0].iter().cycle().take(40).cloned().collect()).is_err());
}

#[test]
fn test_probit_requires_binary_response() {
    let settings = BartSettings {
        response: Response::Probit,
        ..settings()
    };
    assert!(matches!(
        BartState::new(settings, regression_data(10), 0),
        Err(BartError::InvalidConfiguration(_))
    ));
}

#[test]
fn test_prior_initialisation() {
    let settings = BartSettings {
        tree_init: TreeInit::Prior,
        ..settings()
    };
    let mut state = BartState::new(settings, regression_data(30), 0).unwrap();
    assert!(state.forest().empty_leaf().is_none());
    state.check_invariants().unwrap();
    state.run(5, 5).unwrap();
}

#[test]
fn test_user_generator() {
    let settings = BartSettings {
        rng_algorithm: RngAlgorithm::User,
        ..settings()
    };
    assert!(matches!(
        BartState::new(settings.clone(), regression_data(10), 0),
        Err(BartError::RngState(_))
    ));

    let rng = BartRng::with_user_generator(
        Box::new(Xoshiro256PlusPlus::seed_from_u64(1)),
        NormalAlgorithm::BoxMuller,
    );
    let mut state = BartState::with_rng(settings, regression_data(10), 0, rng).unwrap();
    state.step().unwrap();
    assert!(matches!(state.store_state(), Err(BartError::RngState(_))));
}

#[test]
fn test_invalid_settings_are_rejected() {
    let data = regression_data(10);
    for settings in [
        BartSettings { n_trees: 0, ..settings() },
        BartSettings { alpha: 1.0, ..settings() },
        BartSettings { beta: -1.0, ..settings() },
        BartSettings { leaf_sd: 0.0, ..settings() },
        BartSettings { nu: 0.0, ..settings() },
        BartSettings { lambda: -2.0, ..settings() },
        BartSettings { n_thin: 0, ..settings() },
        BartSettings { initial_variance: Some(0.0), ..settings() },
    ] {
        assert!(matches!(
            BartState::new(settings, data.clone(), 0),
            Err(BartError::InvalidConfiguration(_))
        ));
    }
}
