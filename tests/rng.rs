use std::str::FromStr;

use bart_mcmc::rng::{BartRng, NormalAlgorithm, RngAlgorithm};
use bart_mcmc::BartError;
use rand::{RngCore, SeedableRng};
use rand_mt::Mt;
use rand_xoshiro::Xoshiro256PlusPlus;

const ALL_NORMALS: [NormalAlgorithm; 5] = [
    NormalAlgorithm::Inversion,
    NormalAlgorithm::BoxMuller,
    NormalAlgorithm::KindermanRamage,
    NormalAlgorithm::BuggyKindermanRamage,
    NormalAlgorithm::Ziggurat,
];

fn moments(draws: &[f64]) -> (f64, f64) {
    let n = draws.len() as f64;
    let mean = draws.iter().sum::<f64>() / n;
    let var = draws.iter().map(|d| (d - mean) * (d - mean)).sum::<f64>() / (n - 1.0);
    (mean, var)
}

#[test]
fn test_normal_algorithms_are_standard_normal() {
    for algorithm in [
        RngAlgorithm::Xoshiro256PlusPlus,
        RngAlgorithm::ChaCha20,
        RngAlgorithm::MersenneTwister,
    ] {
        for normal in ALL_NORMALS {
            let mut rng = BartRng::new(algorithm, normal, 2024).unwrap();
            let draws: Vec<f64> = (0..40_000).map(|_| rng.normal()).collect();
            let (mean, var) = moments(&draws);
            assert!(mean.abs() < 0.03, "{:?}/{:?}: mean {}", algorithm, normal, mean);
            assert!((var - 1.0).abs() < 0.05, "{:?}/{:?}: var {}", algorithm, normal, var);
            assert!(draws.iter().all(|d| d.is_finite()));
        }
    }
}

#[test]
fn test_uniform_lies_in_unit_interval() {
    let mut rng = BartRng::seed_from_u64(1);
    let draws: Vec<f64> = (0..10_000).map(|_| rng.uniform()).collect();
    assert!(draws.iter().all(|&u| (0.0..1.0).contains(&u)));
    let (mean, _) = moments(&draws);
    assert!((mean - 0.5).abs() < 0.02);
}

#[test]
fn test_same_seed_same_stream() {
    for normal in ALL_NORMALS {
        let mut a = BartRng::new(RngAlgorithm::ChaCha20, normal, 9).unwrap();
        let mut b = BartRng::new(RngAlgorithm::ChaCha20, normal, 9).unwrap();
        for _ in 0..100 {
            assert_eq!(a.normal().to_bits(), b.normal().to_bits());
            assert_eq!(a.uniform().to_bits(), b.uniform().to_bits());
        }
    }

    let mut a = BartRng::seed_from_u64(1);
    let mut b = BartRng::seed_from_u64(2);
    assert_ne!(a.next_u64(), b.next_u64());
}

#[test]
fn test_state_resumes_stream() {
    for normal in ALL_NORMALS {
        let mut rng = BartRng::new(RngAlgorithm::Xoshiro256PlusPlus, normal, 5).unwrap();
        // An odd number of draws leaves a Box-Muller deviate cached.
        for _ in 0..7 {
            rng.normal();
        }
        let mut resumed = BartRng::from_state(rng.state().unwrap()).unwrap();
        assert_eq!(resumed.normal_algorithm(), normal);
        for _ in 0..50 {
            assert_eq!(rng.normal().to_bits(), resumed.normal().to_bits());
        }
    }
}

#[test]
fn test_state_survives_json() {
    let mut rng = BartRng::new(RngAlgorithm::ChaCha20, NormalAlgorithm::BoxMuller, 77).unwrap();
    rng.normal();
    let json = serde_json::to_string(&rng.state().unwrap()).unwrap();
    let mut resumed = BartRng::from_state(serde_json::from_str(&json).unwrap()).unwrap();
    for _ in 0..20 {
        assert_eq!(rng.normal().to_bits(), resumed.normal().to_bits());
    }
}

#[test]
fn test_mersenne_twister_stream_and_state() {
    let mut rng = BartRng::new(RngAlgorithm::MersenneTwister, NormalAlgorithm::BoxMuller, 9).unwrap();
    let mut reference = Mt::new_with_key([9u32, 0]);
    for _ in 0..10 {
        assert_eq!(rng.next_u32(), reference.next_u32());
    }

    for _ in 0..1_001 {
        rng.normal();
    }
    let json = serde_json::to_string(&rng.state().unwrap()).unwrap();
    let mut resumed = BartRng::from_state(serde_json::from_str(&json).unwrap()).unwrap();
    // Past the replayed words, and across a second capture.
    for _ in 0..700 {
        assert_eq!(rng.normal().to_bits(), resumed.normal().to_bits());
    }
    let mut again = BartRng::from_state(resumed.state().unwrap()).unwrap();
    for _ in 0..700 {
        let expected = rng.next_u64();
        assert_eq!(resumed.next_u64(), expected);
        assert_eq!(again.next_u64(), expected);
    }

    let padded = json.replacen("[", "[1,", 1);
    let bad = serde_json::from_str(&padded).map(BartRng::from_state);
    assert!(!matches!(bad, Ok(Ok(_))));
}

#[test]
fn test_reseed_and_select_algorithm() {
    let mut rng = BartRng::seed_from_u64(3);
    let first: Vec<u64> = (0..4).map(|_| rng.next_u64()).collect();
    rng.set_seed(3).unwrap();
    let again: Vec<u64> = (0..4).map(|_| rng.next_u64()).collect();
    assert_eq!(first, again);

    rng.select_algorithm(RngAlgorithm::ChaCha20, NormalAlgorithm::Ziggurat)
        .unwrap();
    assert_eq!(rng.algorithm(), RngAlgorithm::ChaCha20);
    assert_eq!(rng.normal_algorithm(), NormalAlgorithm::Ziggurat);
}

#[test]
fn test_user_generator_is_opaque() {
    let user = Box::new(Xoshiro256PlusPlus::seed_from_u64(8));
    let mut rng = BartRng::with_user_generator(user, NormalAlgorithm::Inversion);
    let mut reference = Xoshiro256PlusPlus::seed_from_u64(8);

    assert_eq!(rng.algorithm(), RngAlgorithm::User);
    assert_eq!(rng.next_u64(), reference.next_u64());
    assert!(matches!(rng.state(), Err(BartError::RngState(_))));
    assert!(matches!(rng.set_seed(1), Err(BartError::RngState(_))));
    assert!(BartRng::new(RngAlgorithm::User, NormalAlgorithm::Inversion, 0).is_err());
}

#[test]
fn test_algorithms_parse_from_str() {
    assert_eq!(
        RngAlgorithm::from_str("Xoshiro256PlusPlus"),
        Ok(RngAlgorithm::Xoshiro256PlusPlus)
    );
    assert_eq!(RngAlgorithm::from_str("chacha20"), Ok(RngAlgorithm::ChaCha20));
    assert_eq!(
        RngAlgorithm::from_str("Mersenne-Twister"),
        Ok(RngAlgorithm::MersenneTwister)
    );
    assert_eq!(RngAlgorithm::from_str("mt19937"), Ok(RngAlgorithm::MersenneTwister));
    assert_eq!(
        NormalAlgorithm::from_str("box-muller"),
        Ok(NormalAlgorithm::BoxMuller)
    );
    assert_eq!(
        NormalAlgorithm::from_str("Buggy_Kinderman_Ramage"),
        Ok(NormalAlgorithm::BuggyKindermanRamage)
    );
    assert!(NormalAlgorithm::from_str("polar").is_err());
    assert_eq!(NormalAlgorithm::default(), NormalAlgorithm::Inversion);
}
