//! Delay draws for one operation: fixed, uniform, or negative-exponential
//!
//! A [`Cycle`] pairs a delay distribution with a pacing discipline:
//! *cycle time* is measured from the previous operation's start to the next
//! start, *think time* from the previous operation's end to the next start.
//! The engine only asks a cycle for a draw; applying it to the right base
//! clock is the pacer's job.
//!
//! # Configuration
//!
//! ```toml
//! cycle = { type = "thinktime", dist = "negexp", mean = 1000, max = 5000 }
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Pacing discipline for a delay draw
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleType {
    /// Pace from operation start to next operation start
    CycleTime,
    /// Pace from operation end to next operation start
    ThinkTime,
}

impl Default for CycleType {
    fn default() -> Self {
        CycleType::CycleTime
    }
}

/// Delay distribution, all parameters in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dist", rename_all = "lowercase")]
pub enum Delay {
    /// Constant delay
    Fixed { ms: i64 },
    /// Uniform over `[min, max]`
    Uniform { min: i64, max: i64 },
    /// Negative-exponential with the given mean, truncated at `max`
    NegExp { mean: i64, max: i64 },
}

/// Delay distribution plus pacing discipline for one operation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    #[serde(rename = "type", default)]
    pub kind: CycleType,
    #[serde(flatten)]
    pub delay: Delay,
}

impl Cycle {
    pub fn fixed(kind: CycleType, ms: i64) -> Self {
        Self {
            kind,
            delay: Delay::Fixed { ms },
        }
    }

    /// Draw one delay. Always nonnegative.
    pub fn draw(&self, rng: &mut impl Rng) -> i64 {
        let drawn = match self.delay {
            Delay::Fixed { ms } => ms,
            Delay::Uniform { min, max } => {
                if min >= max {
                    min
                } else {
                    rng.random_range(min..=max)
                }
            }
            Delay::NegExp { mean, max } => {
                // Inverse-CDF sampling; 1 - u keeps ln away from zero.
                let u: f64 = rng.random();
                let sample = -(mean as f64) * (1.0 - u).ln();
                (sample as i64).min(max)
            }
        };
        drawn.max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_fixed_draw_is_constant() {
        let cycle = Cycle::fixed(CycleType::CycleTime, 250);
        let mut rng = rng();
        for _ in 0..10 {
            assert_eq!(cycle.draw(&mut rng), 250);
        }
    }

    #[test]
    fn test_negative_fixed_clamps_to_zero() {
        let cycle = Cycle::fixed(CycleType::ThinkTime, -5);
        assert_eq!(cycle.draw(&mut rng()), 0);
    }

    #[test]
    fn test_uniform_draw_stays_in_bounds() {
        let cycle = Cycle {
            kind: CycleType::CycleTime,
            delay: Delay::Uniform { min: 100, max: 200 },
        };
        let mut rng = rng();
        for _ in 0..1000 {
            let d = cycle.draw(&mut rng);
            assert!((100..=200).contains(&d), "draw {} out of bounds", d);
        }
    }

    #[test]
    fn test_negexp_truncates_at_max() {
        let cycle = Cycle {
            kind: CycleType::ThinkTime,
            delay: Delay::NegExp {
                mean: 1000,
                max: 2000,
            },
        };
        let mut rng = rng();
        let draws: Vec<i64> = (0..5000).map(|_| cycle.draw(&mut rng)).collect();
        assert!(draws.iter().all(|&d| (0..=2000).contains(&d)));
        // The truncated mean sits well below the nominal 1000ms mean but
        // must stay in a plausible band.
        let mean = draws.iter().sum::<i64>() as f64 / draws.len() as f64;
        assert!(mean > 500.0 && mean < 1000.0, "truncated mean {}", mean);
    }

    #[test]
    fn test_cycle_toml_round_trip() {
        let parsed: Cycle =
            toml::from_str("type = \"thinktime\"\ndist = \"negexp\"\nmean = 1000\nmax = 5000\n")
                .unwrap();
        assert_eq!(parsed.kind, CycleType::ThinkTime);
        assert_eq!(
            parsed.delay,
            Delay::NegExp {
                mean: 1000,
                max: 5000
            }
        );

        // The pacing discipline defaults to cycle time.
        let parsed: Cycle = toml::from_str("dist = \"fixed\"\nms = 100\n").unwrap();
        assert_eq!(parsed.kind, CycleType::CycleTime);
    }
}
