use std::str::FromStr;

use approx::assert_relative_eq;
use bart_mcmc::ops::{sample_latent, sample_lower_truncated, Response, TreeSamplingOps};
use bart_mcmc::proposal::{MoveKind, MoveProbabilities};
use bart_mcmc::rng::BartRng;
use bart_mcmc::variance::VariancePrior;
use ndarray::Array1;
use statrs::distribution::{ChiSquared, ContinuousCDF};

fn ops() -> TreeSamplingOps {
    TreeSamplingOps {
        alpha: 0.95,
        beta: 2.0,
        leaf_sd: 1.0,
    }
}

#[test]
fn test_split_probability_decays_with_depth() {
    let ops = ops();
    assert_relative_eq!(ops.split_probability(0), 0.95);
    assert_relative_eq!(ops.split_probability(1), 0.2375);
    assert_relative_eq!(ops.log_leaf_prior(1), (1.0f64 - 0.2375).ln());
    assert_relative_eq!(ops.log_split_prior(2), (0.95f64 / 9.0).ln());
}

#[test]
fn test_sample_expand_flag_frequency() {
    let ops = ops();
    let mut rng = BartRng::seed_from_u64(10);
    let hits = (0..20_000).filter(|_| ops.sample_expand_flag(1, &mut rng)).count();
    assert_relative_eq!(hits as f64 / 20_000.0, 0.2375, epsilon = 0.015);
}

#[test]
fn test_leaf_log_likelihood() {
    let ops = TreeSamplingOps {
        alpha: 0.95,
        beta: 2.0,
        leaf_sd: 0.5,
    };
    assert_eq!(ops.leaf_log_likelihood(0, 0.0, 2.0), 0.0);

    let (n, s, sigma2, tau2) = (4.0, 3.0, 2.0, 0.25);
    let expected = -0.5 * (1.0f64 + n * tau2 / sigma2).ln() + tau2 * s * s / (2.0 * sigma2 * (sigma2 + n * tau2));
    assert_relative_eq!(ops.leaf_log_likelihood(4, 3.0, 2.0), expected, epsilon = 1e-12);
}

#[test]
fn test_leaf_value_posterior_moments() {
    let ops = ops();
    let mut rng = BartRng::seed_from_u64(4);
    let draws: Vec<f64> = (0..20_000)
        .map(|_| ops.sample_leaf_value(100, 50.0, 1.0, &mut rng))
        .collect();
    let mean = draws.iter().sum::<f64>() / draws.len() as f64;
    let var = draws.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / draws.len() as f64;

    assert_relative_eq!(mean, 50.0 / 101.0, epsilon = 0.005);
    assert_relative_eq!(var, 1.0 / 101.0, epsilon = 0.001);
}

#[test]
fn test_empty_leaf_draws_from_prior() {
    let ops = TreeSamplingOps {
        alpha: 0.95,
        beta: 2.0,
        leaf_sd: 2.0,
    };
    let mut rng = BartRng::seed_from_u64(5);
    let draws: Vec<f64> = (0..20_000)
        .map(|_| ops.sample_leaf_value(0, 0.0, 1.0, &mut rng))
        .collect();
    let var = draws.iter().map(|d| d * d).sum::<f64>() / draws.len() as f64;
    assert_relative_eq!(var, 4.0, epsilon = 0.15);
}

#[test]
fn test_response_from_str() {
    assert_eq!(Response::from_str("continuous"), Ok(Response::Continuous));
    assert_eq!(Response::from_str("Probit"), Ok(Response::Probit));
    assert!(Response::from_str("logit").is_err());
}

#[test]
fn test_latent_draws_respect_sign() {
    let mut rng = BartRng::seed_from_u64(6);
    for mean in [-6.0, -1.0, 0.0, 1.0, 6.0] {
        for _ in 0..500 {
            assert!(sample_latent(mean, true, &mut rng) > 0.0);
            assert!(sample_latent(mean, false, &mut rng) < 0.0);
        }
    }
}

#[test]
fn test_truncated_normal_moments() {
    let mut rng = BartRng::seed_from_u64(7);
    let n = 40_000;

    let half: f64 = (0..n).map(|_| sample_lower_truncated(0.0, &mut rng)).sum::<f64>() / n as f64;
    assert_relative_eq!(half, (2.0 / std::f64::consts::PI).sqrt(), epsilon = 0.02);

    // Mean of N(0, 1) conditioned on exceeding 3 is phi(3) / (1 - Phi(3)).
    let tail: Vec<f64> = (0..n).map(|_| sample_lower_truncated(3.0, &mut rng)).collect();
    assert!(tail.iter().all(|&z| z > 3.0));
    let tail_mean = tail.iter().sum::<f64>() / n as f64;
    assert_relative_eq!(tail_mean, 3.2831, epsilon = 0.01);
}

#[test]
fn test_move_probabilities() {
    let moves = MoveProbabilities::default();
    assert!(moves.validate().is_ok());
    assert_relative_eq!(moves.probability(MoveKind::Grow), 0.25);
    assert_relative_eq!(moves.probability(MoveKind::Prune), 0.25);
    assert_relative_eq!(moves.probability(MoveKind::Change), 0.4);
    assert_relative_eq!(moves.probability(MoveKind::Swap), 0.1);
    assert_relative_eq!(*moves.cumulative().last().unwrap(), 1.0);

    let mut rng = BartRng::seed_from_u64(8);
    let swaps = (0..20_000)
        .filter(|_| moves.sample(&mut rng) == MoveKind::Swap)
        .count();
    assert_relative_eq!(swaps as f64 / 20_000.0, 0.1, epsilon = 0.01);

    let unnormalised = MoveProbabilities {
        change: 0.5,
        ..moves
    };
    assert!(unnormalised.validate().is_err());
    let no_prune = MoveProbabilities {
        birth: 1.0,
        ..moves
    };
    assert!(no_prune.validate().is_err());
    let negative = MoveProbabilities {
        birth_or_death: 0.7,
        swap: -0.1,
        ..moves
    };
    assert!(negative.validate().is_err());
}

#[test]
fn test_variance_prior_validation() {
    assert!(VariancePrior::new(0.0, 1.0).is_err());
    assert!(VariancePrior::new(3.0, -1.0).is_err());
    assert!(VariancePrior::from_quantile(3.0, 1.0, 1.0).is_err());
}

#[test]
fn test_variance_prior_from_quantile() {
    let prior = VariancePrior::from_quantile(3.0, 0.9, 2.0).unwrap();
    // P(sigma² < 4) = P(chi²(3) > 3 lambda / 4)
    let chi2 = ChiSquared::new(3.0).unwrap();
    let p = 1.0 - chi2.cdf(3.0 * prior.lambda / 4.0);
    assert_relative_eq!(p, 0.9, epsilon = 1e-6);
}

#[test]
fn test_variance_draws_are_positive_and_centred() {
    let prior = VariancePrior::new(3.0, 1.0).unwrap();
    let residuals = Array1::from_iter((0..1000).map(|i| if i % 2 == 0 { 2.0 } else { -2.0 }));
    let mut rng = BartRng::seed_from_u64(9);

    let draws: Vec<f64> = (0..2000)
        .map(|_| prior.sample(residuals.view(), &mut rng).unwrap())
        .collect();
    assert!(draws.iter().all(|&d| d > 0.0));
    let mean = draws.iter().sum::<f64>() / draws.len() as f64;
    // E[(nu lambda + SSR) / chi²(nu + n)] = (3 + 4000) / (1003 - 2)
    assert_relative_eq!(mean, 4003.0 / 1001.0, epsilon = 0.05);

    let zero = Array1::zeros(5);
    assert!(prior.sample(zero.view(), &mut rng).unwrap() > 0.0);
}
