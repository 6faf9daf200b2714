use bart_mcmc::data::{CutpointOptions, DataMatrix, Predictor, PredictorKind};
use bart_mcmc::BartError;
use ndarray::{array, Array1, Array2};

#[test]
fn test_cutpoints_are_midpoints_of_distinct_values() {
    let predictor = Predictor::continuous(array![3.0, 1.0, 2.0, 1.0].view(), &CutpointOptions::default());
    assert_eq!(predictor.kind(), PredictorKind::Continuous);
    assert_eq!(predictor.cutpoints(), &[1.5, 2.5]);
}

#[test]
fn test_cutpoints_fall_back_to_grid() {
    let values = Array1::from_iter((0..1000).map(|i| i as f64 / 999.0));
    let options = CutpointOptions {
        n_cuts: 9,
        use_quantiles: false,
    };
    let predictor = Predictor::continuous(values.view(), &options);
    let cuts = predictor.cutpoints();

    assert_eq!(cuts.len(), 9);
    for (k, cut) in cuts.iter().enumerate() {
        assert!((cut - (k + 1) as f64 / 10.0).abs() < 1e-12);
    }
}

#[test]
fn test_quantile_cutpoints_are_sorted_and_inside_range() {
    let values = Array1::from_iter((0..500).map(|i| ((i * 37) % 500) as f64 * (i as f64).sqrt()));
    let options = CutpointOptions {
        n_cuts: 20,
        use_quantiles: true,
    };
    let predictor = Predictor::continuous(values.view(), &options);
    let cuts = predictor.cutpoints();
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    assert!(!cuts.is_empty() && cuts.len() <= 20);
    assert!(cuts.windows(2).all(|w| w[0] < w[1]));
    assert!(cuts.iter().all(|&c| c > min && c < max));
}

#[test]
fn test_new_validates_inputs() {
    let x = array![[0.0, 1.0], [1.0, 0.0], [2.0, 1.0]];

    let err = DataMatrix::new(
        x.clone(),
        array![1.0, 2.0],
        &[PredictorKind::Continuous; 2],
        CutpointOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        BartError::DimensionMismatch {
            expected: 3,
            found: 2,
            ..
        }
    ));

    let err = DataMatrix::new(
        x.clone(),
        array![1.0, 2.0, 3.0],
        &[PredictorKind::Continuous, PredictorKind::Categorical { n_levels: 1 }],
        CutpointOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, BartError::InvalidPredictor { column: 1, .. }));

    let err = DataMatrix::new(
        x.clone(),
        array![1.0, 2.0, 3.0],
        &[PredictorKind::Continuous, PredictorKind::Categorical { n_levels: 33 }],
        CutpointOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, BartError::InvalidPredictor { column: 1, .. }));

    assert!(DataMatrix::continuous(x, array![1.0, f64::NAN, 3.0]).is_err());
    assert!(DataMatrix::continuous(Array2::zeros((0, 2)), Array1::zeros(0)).is_err());
}

#[test]
fn test_categorical_columns_hold_level_codes() {
    let x = array![[0.0, 0.5], [2.0, 1.5], [1.0, 2.5]];
    let data = DataMatrix::new(
        x,
        array![1.0, 2.0, 3.0],
        &[PredictorKind::Categorical { n_levels: 3 }, PredictorKind::Continuous],
        CutpointOptions::default(),
    )
    .unwrap();

    assert_eq!(data.n_vars(), 2);
    assert!(data.predictor(0).cutpoints().is_empty());
    assert!(data.validate_column(0, array![0.0, 1.0, 2.0].view()).is_ok());
    assert!(data.validate_column(0, array![0.0, 1.5, 2.0].view()).is_err());
    assert!(data.validate_column(0, array![0.0, 3.0, 2.0].view()).is_err());
    assert!(data.validate_column(0, array![0.0, -1.0, 2.0].view()).is_err());
}

#[test]
fn test_validate_column_rejects_malformed_input() {
    let data = DataMatrix::continuous(array![[0.0], [1.0]], array![0.0, 1.0]).unwrap();

    assert!(matches!(
        data.validate_column(1, array![0.0, 1.0].view()),
        Err(BartError::InvalidPredictor { column: 1, .. })
    ));
    assert!(matches!(
        data.validate_column(0, array![0.0].view()),
        Err(BartError::DimensionMismatch { .. })
    ));
    assert!(matches!(
        data.validate_column(0, array![0.0, f64::INFINITY].view()),
        Err(BartError::InvalidPredictor { column: 0, .. })
    ));
}

#[test]
fn test_offsets_and_test_set() {
    let data = DataMatrix::continuous(array![[0.0], [1.0]], array![0.0, 1.0])
        .unwrap()
        .with_offset(array![0.5, 0.5])
        .unwrap()
        .with_test(array![[0.2], [0.4], [0.6]], None)
        .unwrap();

    assert_eq!(data.offset(), &array![0.5, 0.5]);
    assert_eq!(data.n_test(), 3);
    assert_eq!(data.offset_test(), &Array1::<f64>::zeros(3));

    let mut data = data;
    assert!(data.set_offset(array![1.0]).is_err());
    assert!(data.set_test(array![[0.1, 0.2]], None).is_err());
    assert!(data.set_test_offset(array![1.0, 2.0, 3.0]).is_ok());
    data.set_test_column(0, array![9.0, 8.0, 7.0].view()).unwrap();
    assert_eq!(data.x_test().column(0).to_vec(), vec![9.0, 8.0, 7.0]);
    assert!(data.set_response(array![1.0, 2.0, 3.0]).is_err());
}
