//   Copyright 2024 The PyMC Developers
//
//   Licensed under the Apache License, Version 2.0 (the "License");
//   you may not use this file except in compliance with the License.
//   You may obtain a copy of the License at
//
//       http://www.apache.org/licenses/LICENSE-2.0
//
//   Unless required by applicable law or agreed to in writing, software
//   distributed under the License is distributed on an "AS IS" BASIS,
//   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//   See the License for the specific language governing permissions and
//   limitations under the License.

//! Per-chain random number generation.
//!
//! Every stochastic operation of the sampler receives a `&mut BartRng`; there
//! is no process-wide generator. A `BartRng` pairs a uniform bit generator,
//! selected from [`RngAlgorithm`], with a standard normal algorithm selected
//! from [`NormalAlgorithm`]. It implements [`rand::RngCore`] so the
//! distributions of `rand_distr` can draw from it directly.
//!
//! The state of the built-in generators can be captured with
//! [`BartRng::state`] and restored with [`BartRng::from_state`], which is what
//! lets a chain resume bit-for-bit from a snapshot.

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use rand::distributions::Open01;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, StandardNormal};
use rand_mt::Mt;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use crate::error::BartError;
use crate::math::standard_normal_quantile;

/// Uniform bit generators available to a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RngAlgorithm {
    /// xoshiro256++ from `rand_xoshiro`.
    #[default]
    Xoshiro256PlusPlus,
    /// ChaCha with 20 rounds from `rand_chacha`.
    ChaCha20,
    /// 32-bit Mersenne-Twister (MT19937) from `rand_mt`.
    MersenneTwister,
    /// A caller supplied generator, see [`BartRng::with_user_generator`].
    User,
}

impl FromStr for RngAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "xoshiro256plusplus" | "xoshiro" => Ok(RngAlgorithm::Xoshiro256PlusPlus),
            "chacha20" | "chacha" => Ok(RngAlgorithm::ChaCha20),
            "mersennetwister" | "mt19937" => Ok(RngAlgorithm::MersenneTwister),
            "user" => Ok(RngAlgorithm::User),
            _ => Err(format!("Unknown rng algorithm: {}", s)),
        }
    }
}

/// Algorithms turning uniform deviates into standard normal deviates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NormalAlgorithm {
    /// Inversion of the normal CDF using 27 + 53 bits of uniform input.
    #[default]
    Inversion,
    /// Box-Muller transform; the second deviate of each pair is cached.
    BoxMuller,
    /// Kinderman-Ramage (1976) with the corrected constants.
    KindermanRamage,
    /// The historical Kinderman-Ramage variant, including its defects.
    ///
    /// Only useful to reproduce streams produced by legacy software.
    BuggyKindermanRamage,
    /// Ziggurat method from `rand_distr::StandardNormal`.
    Ziggurat,
}

impl FromStr for NormalAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_', ' '], "").as_str() {
            "inversion" => Ok(NormalAlgorithm::Inversion),
            "boxmuller" => Ok(NormalAlgorithm::BoxMuller),
            "kindermanramage" => Ok(NormalAlgorithm::KindermanRamage),
            "buggykindermanramage" => Ok(NormalAlgorithm::BuggyKindermanRamage),
            "ziggurat" => Ok(NormalAlgorithm::Ziggurat),
            _ => Err(format!("Unknown normal algorithm: {}", s)),
        }
    }
}

/// Number of outputs that determine the full MT19937 state.
const MT_STATE_WORDS: usize = 624;

/// MT19937 whose state is captured as its next `MT_STATE_WORDS` outputs.
///
/// `rand_mt` can rebuild a twister from 624 consecutive outputs, but the
/// rebuilt twister continues after them; those outputs are therefore
/// replayed from `pending` before the twister is drawn from again.
#[derive(Clone)]
struct MersenneTwister {
    twister: Mt,
    pending: VecDeque<u32>,
}

impl MersenneTwister {
    fn seed_from_u64(seed: u64) -> Self {
        Self {
            twister: Mt::new_with_key([seed as u32, (seed >> 32) as u32]),
            pending: VecDeque::new(),
        }
    }

    fn lookahead(&self) -> Vec<u32> {
        let mut copy = self.clone();
        (0..MT_STATE_WORDS).map(|_| copy.next_u32()).collect()
    }

    fn from_lookahead(outputs: Vec<u32>) -> Result<Self, BartError> {
        if outputs.len() != MT_STATE_WORDS {
            return Err(BartError::RngState(format!(
                "a Mersenne-Twister state holds {} words, found {}",
                MT_STATE_WORDS,
                outputs.len()
            )));
        }
        let twister = Mt::recover(outputs.iter().copied())
            .map_err(|err| BartError::RngState(format!("{:?}", err)))?;
        Ok(Self {
            twister,
            pending: outputs.into(),
        })
    }
}

impl RngCore for MersenneTwister {
    fn next_u32(&mut self) -> u32 {
        match self.pending.pop_front() {
            Some(word) => word,
            None => self.twister.next_u32(),
        }
    }

    fn next_u64(&mut self) -> u64 {
        let low = u64::from(self.next_u32());
        let high = u64::from(self.next_u32());
        (high << 32) | low
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let bytes = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

enum Generator {
    Xoshiro(Xoshiro256PlusPlus),
    ChaCha(ChaCha20Rng),
    Mt(MersenneTwister),
    User(Box<dyn RngCore + Send>),
}

impl Generator {
    fn seeded(algorithm: RngAlgorithm, seed: u64) -> Result<Self, BartError> {
        match algorithm {
            RngAlgorithm::Xoshiro256PlusPlus => {
                Ok(Generator::Xoshiro(Xoshiro256PlusPlus::seed_from_u64(seed)))
            }
            RngAlgorithm::ChaCha20 => Ok(Generator::ChaCha(ChaCha20Rng::seed_from_u64(seed))),
            RngAlgorithm::MersenneTwister => {
                Ok(Generator::Mt(MersenneTwister::seed_from_u64(seed)))
            }
            RngAlgorithm::User => Err(BartError::RngState(
                "a user generator cannot be seeded by the sampler".to_string(),
            )),
        }
    }

    fn algorithm(&self) -> RngAlgorithm {
        match self {
            Generator::Xoshiro(_) => RngAlgorithm::Xoshiro256PlusPlus,
            Generator::ChaCha(_) => RngAlgorithm::ChaCha20,
            Generator::Mt(_) => RngAlgorithm::MersenneTwister,
            Generator::User(_) => RngAlgorithm::User,
        }
    }

    fn as_core(&mut self) -> &mut dyn RngCore {
        match self {
            Generator::Xoshiro(rng) => rng,
            Generator::ChaCha(rng) => rng,
            Generator::Mt(rng) => rng,
            Generator::User(rng) => rng.as_mut(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum GeneratorState {
    Xoshiro256PlusPlus(Xoshiro256PlusPlus),
    ChaCha20(ChaCha20Rng),
    MersenneTwister(Vec<u32>),
}

/// Opaque, serialisable state of a [`BartRng`] built on a built-in generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RngState {
    generator: GeneratorState,
    normal: NormalAlgorithm,
    box_muller_cache: Option<f64>,
}

/// Random number facade owned by a single chain.
pub struct BartRng {
    generator: Generator,
    normal: NormalAlgorithm,
    box_muller_cache: Option<f64>,
}

impl fmt::Debug for BartRng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BartRng")
            .field("algorithm", &self.generator.algorithm())
            .field("normal", &self.normal)
            .finish()
    }
}

impl BartRng {
    /// Creates a generator of the given kind seeded from `seed`.
    pub fn new(
        algorithm: RngAlgorithm,
        normal: NormalAlgorithm,
        seed: u64,
    ) -> Result<Self, BartError> {
        Ok(Self {
            generator: Generator::seeded(algorithm, seed)?,
            normal,
            box_muller_cache: None,
        })
    }

    /// Creates the default generator (xoshiro256++ with inversion) from `seed`.
    pub fn seed_from_u64(seed: u64) -> Self {
        Self {
            generator: Generator::Xoshiro(Xoshiro256PlusPlus::seed_from_u64(seed)),
            normal: NormalAlgorithm::default(),
            box_muller_cache: None,
        }
    }

    /// Wraps a caller supplied uniform bit generator.
    ///
    /// The sampler treats it as opaque: it can be used but neither seeded nor
    /// captured in a snapshot.
    pub fn with_user_generator(generator: Box<dyn RngCore + Send>, normal: NormalAlgorithm) -> Self {
        Self {
            generator: Generator::User(generator),
            normal,
            box_muller_cache: None,
        }
    }

    /// Uniform algorithm currently in use.
    pub fn algorithm(&self) -> RngAlgorithm {
        self.generator.algorithm()
    }

    /// Normal algorithm currently in use.
    pub fn normal_algorithm(&self) -> NormalAlgorithm {
        self.normal
    }

    /// Switches algorithms, seeding the new generator from the current stream.
    pub fn select_algorithm(
        &mut self,
        algorithm: RngAlgorithm,
        normal: NormalAlgorithm,
    ) -> Result<(), BartError> {
        let seed = self.next_u64();
        self.generator = Generator::seeded(algorithm, seed)?;
        self.normal = normal;
        self.box_muller_cache = None;
        Ok(())
    }

    /// Reseeds the current algorithm.
    pub fn set_seed(&mut self, seed: u64) -> Result<(), BartError> {
        self.generator = Generator::seeded(self.generator.algorithm(), seed)?;
        self.box_muller_cache = None;
        Ok(())
    }

    /// Captures the generator state.
    pub fn state(&self) -> Result<RngState, BartError> {
        let generator = match &self.generator {
            Generator::Xoshiro(rng) => GeneratorState::Xoshiro256PlusPlus(rng.clone()),
            Generator::ChaCha(rng) => GeneratorState::ChaCha20(rng.clone()),
            Generator::Mt(rng) => GeneratorState::MersenneTwister(rng.lookahead()),
            Generator::User(_) => {
                return Err(BartError::RngState(
                    "the state of a user generator cannot be captured".to_string(),
                ))
            }
        };

        Ok(RngState {
            generator,
            normal: self.normal,
            box_muller_cache: self.box_muller_cache,
        })
    }

    /// Rebuilds a generator from a captured state.
    pub fn from_state(state: RngState) -> Result<Self, BartError> {
        let generator = match state.generator {
            GeneratorState::Xoshiro256PlusPlus(rng) => Generator::Xoshiro(rng),
            GeneratorState::ChaCha20(rng) => Generator::ChaCha(rng),
            GeneratorState::MersenneTwister(outputs) => {
                Generator::Mt(MersenneTwister::from_lookahead(outputs)?)
            }
        };

        Ok(Self {
            generator,
            normal: state.normal,
            box_muller_cache: state.box_muller_cache,
        })
    }

    /// Uniform deviate on `[0, 1)`.
    #[inline]
    pub fn uniform(&mut self) -> f64 {
        self.gen::<f64>()
    }

    #[inline]
    fn open_uniform(&mut self) -> f64 {
        self.sample(Open01)
    }

    /// Standard normal deviate drawn with the selected algorithm.
    pub fn normal(&mut self) -> f64 {
        match self.normal {
            NormalAlgorithm::Inversion => self.normal_inversion(),
            NormalAlgorithm::BoxMuller => self.normal_box_muller(),
            NormalAlgorithm::KindermanRamage => self.normal_kinderman_ramage(false),
            NormalAlgorithm::BuggyKindermanRamage => self.normal_kinderman_ramage(true),
            NormalAlgorithm::Ziggurat => StandardNormal.sample(self),
        }
    }

    fn normal_inversion(&mut self) -> f64 {
        const BIG: f64 = 134_217_728.0;
        let u = (BIG * self.uniform()).floor() + self.open_uniform();
        standard_normal_quantile(u / BIG)
    }

    fn normal_box_muller(&mut self) -> f64 {
        if let Some(cached) = self.box_muller_cache.take() {
            return cached;
        }
        let theta = 2.0 * PI * self.open_uniform();
        let radius = (-2.0 * self.open_uniform().ln()).sqrt() + 10.0 * f64::MIN_POSITIVE;
        self.box_muller_cache = Some(radius * theta.sin());
        radius * theta.cos()
    }

    fn normal_kinderman_ramage(&mut self, legacy: bool) -> f64 {
        const A: f64 = 2.216_035_867_166_471;
        const C1: f64 = 0.398_942_280_401_433;
        const C2: f64 = 0.180_025_191_068_563;
        let g = |x: f64| C1 * (-x * x / 2.0).exp() - C2 * (A - x);
        let signed = |t: f64, u2: f64, u3: f64| if u2 < u3 { t } else { -t };

        let u1 = self.open_uniform();
        if u1 < 0.884_070_402_298_758 {
            let u2 = self.open_uniform();
            // The legacy variant carries a dropped digit in the slope.
            let slope = if legacy {
                1.131_131_635_441_80
            } else {
                1.131_131_635_444_180
            };
            return A * (slope * u1 + u2 - 1.0);
        }

        if u1 >= 0.973_310_954_173_898 {
            // Tail.
            loop {
                let u2 = self.open_uniform();
                let u3 = self.open_uniform();
                let tt = A * A - 2.0 * u3.ln();
                if u2 * u2 < (A * A) / tt {
                    return if u1 < 0.986_655_477_086_949 {
                        tt.sqrt()
                    } else {
                        -tt.sqrt()
                    };
                }
            }
        }

        if u1 >= 0.958_720_824_790_463 {
            loop {
                let u2 = self.open_uniform();
                let u3 = self.open_uniform();
                let tt = A - 0.630_834_801_921_960 * u2.min(u3);
                if u2.max(u3) <= 0.755_591_531_667_601 {
                    return signed(tt, u2, u3);
                }
                if 0.034_240_503_750_111 * (u2 - u3).abs() <= g(tt) {
                    return signed(tt, u2, u3);
                }
            }
        }

        if u1 >= 0.911_312_780_288_703 {
            loop {
                let u2 = self.open_uniform();
                let u3 = self.open_uniform();
                let tt = 0.479_727_404_222_441 + 1.105_473_661_022_070 * u2.min(u3);
                if u2.max(u3) <= 0.872_834_976_671_790 {
                    return signed(tt, u2, u3);
                }
                if 0.049_264_496_342_790 * (u2 - u3).abs() <= g(tt) {
                    return signed(tt, u2, u3);
                }
            }
        }

        loop {
            let u2 = self.open_uniform();
            let u3 = self.open_uniform();
            let tt = 0.479_727_404_222_441 - 0.595_507_138_015_940 * u2.min(u3);
            // The legacy variant accepts negative tt here.
            if !legacy && tt < 0.0 {
                continue;
            }
            if u2.max(u3) <= 0.805_577_924_423_817 {
                return signed(tt, u2, u3);
            }
            if 0.053_377_549_506_886 * (u2 - u3).abs() <= g(tt) {
                return signed(tt, u2, u3);
            }
        }
    }
}

impl RngCore for BartRng {
    fn next_u32(&mut self) -> u32 {
        self.generator.as_core().next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.generator.as_core().next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.generator.as_core().fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.generator.as_core().try_fill_bytes(dest)
    }
}
