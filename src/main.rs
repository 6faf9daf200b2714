use ndarray::{Array1, Array2};

use bart_mcmc::{BartError, BartRng, BartSettings, DataMatrix, Sampler};

fn main() -> Result<(), BartError> {
    // Friedman's test function with 100 noisy observations
    let mut rng = BartRng::seed_from_u64(42);
    let n = 100;
    let x = Array2::from_shape_fn((n, 5), |_| rng.uniform());
    let y: Array1<f64> = x
        .outer_iter()
        .map(|row| {
            10.0 * (std::f64::consts::PI * row[0] * row[1]).sin()
                + 20.0 * (row[2] - 0.5).powi(2)
                + 10.0 * row[3]
                + 5.0 * row[4]
        })
        .collect();
    let y = y.mapv(|v| v + rng.normal());

    let x_test = x.slice(ndarray::s![..10, ..]).to_owned();
    let data = DataMatrix::continuous(x, y.clone())?.with_test(x_test, None)?;

    let settings = BartSettings {
        n_trees: 50,
        n_burn: 200,
        n_samples: 200,
        n_chains: 2,
        seed: 7,
        ..BartSettings::default()
    }
    .calibrated(&data)?;

    let mut sampler = Sampler::new(settings, data)?;
    let samples = sampler.run()?;

    for chain in &samples {
        let variances = chain.variances();
        let mean_sigma = variances.iter().map(|v| v.sqrt()).sum::<f64>() / variances.len() as f64;
        println!("chain {}: posterior mean sigma = {:.3}", chain.chain, mean_sigma);
        if let Some(fit) = chain.mean_test_fit() {
            println!("  first test fits: {:.2?}", fit.iter().take(3).collect::<Vec<_>>());
            println!("  observed:        {:.2?}", y.iter().take(3).collect::<Vec<_>>());
        }
    }

    // Rejection sampling of a replacement column for chain 0
    let state = &mut sampler.chains_mut()[0];
    let mut accepted = false;
    for attempt in 1..=20 {
        let candidate = Array1::from_shape_fn(n, |_| rng.uniform());
        if state.set_predictor(4, candidate.view(), false)? {
            println!("replacement column accepted after {} attempts", attempt);
            accepted = true;
            break;
        }
    }
    if !accepted {
        println!("no replacement column accepted in 20 attempts");
    }

    Ok(())
}
