//! Operation choosers: flat weights or a Markov transition matrix
//!
//! A mix describes how a virtual user distributes its invocations across the
//! operations of one mix slot (foreground or background). [`MixSpec`] is the
//! declarative form carried in the parameter repository; [`Selector`] is the
//! stateful sampler a driver thread owns. Over many draws a selector's
//! output converges to the stationary distribution of the specified matrix
//! (for a flat mix, to the normalized weights themselves).

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Declarative mix specification from the parameter repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MixSpec {
    /// Independent draws from one weight vector; the previous operation is
    /// irrelevant
    Flat { weights: Vec<f64> },
    /// Markov transitions: row `i` is the distribution of the operation
    /// following operation `i`
    Matrix { rows: Vec<Vec<f64>> },
}

impl MixSpec {
    /// Number of operations this mix spans
    pub fn dim(&self) -> usize {
        match self {
            MixSpec::Flat { weights } => weights.len(),
            MixSpec::Matrix { rows } => rows.len(),
        }
    }

    /// Check shape and weight sanity against the operation count of the slot
    pub fn validate(&self, ops: usize) -> Result<(), String> {
        match self {
            MixSpec::Flat { weights } => {
                if weights.len() != ops {
                    return Err(format!(
                        "flat mix has {} weights for {} operations",
                        weights.len(),
                        ops
                    ));
                }
                check_weights(weights, "mix")
            }
            MixSpec::Matrix { rows } => {
                if rows.len() != ops {
                    return Err(format!(
                        "mix matrix has {} rows for {} operations",
                        rows.len(),
                        ops
                    ));
                }
                for (i, row) in rows.iter().enumerate() {
                    if row.len() != ops {
                        return Err(format!("mix matrix row {} is not {} wide", i, ops));
                    }
                    check_weights(row, &format!("mix matrix row {}", i))?;
                }
                Ok(())
            }
        }
    }

    /// Build the stateful sampler for one driver thread.
    ///
    /// A matrix selector needs a previous operation before its first draw;
    /// it is seeded uniformly at random, the same way a fresh user lands on
    /// an arbitrary page of a site.
    pub fn selector(&self, rng: &mut impl Rng) -> Selector {
        match self {
            MixSpec::Flat { weights } => Selector::Flat(FlatMix {
                cdf: cumulative(weights),
            }),
            MixSpec::Matrix { rows } => Selector::Matrix(MatrixMix {
                cdf_rows: rows.iter().map(|r| cumulative(r)).collect(),
                prev: rng.random_range(0..rows.len()),
            }),
        }
    }
}

fn check_weights(weights: &[f64], what: &str) -> Result<(), String> {
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(format!("{} contains a negative or non-finite weight", what));
    }
    if weights.iter().sum::<f64>() <= 0.0 {
        return Err(format!("{} sums to zero", what));
    }
    Ok(())
}

/// Normalized cumulative distribution ending at 1.0
fn cumulative(weights: &[f64]) -> Vec<f64> {
    let total: f64 = weights.iter().sum();
    let mut acc = 0.0;
    let mut cdf: Vec<f64> = weights
        .iter()
        .map(|w| {
            acc += w / total;
            acc
        })
        .collect();
    if let Some(last) = cdf.last_mut() {
        *last = 1.0;
    }
    cdf
}

fn sample(cdf: &[f64], rng: &mut impl Rng) -> usize {
    let u: f64 = rng.random();
    cdf.partition_point(|&p| p <= u).min(cdf.len() - 1)
}

/// Stateful operation sampler owned by one driver thread
#[derive(Debug, Clone)]
pub enum Selector {
    Flat(FlatMix),
    Matrix(MatrixMix),
}

impl Selector {
    /// Choose the next operation index within the mix
    pub fn select(&mut self, rng: &mut impl Rng) -> usize {
        match self {
            Selector::Flat(flat) => sample(&flat.cdf, rng),
            Selector::Matrix(matrix) => {
                let next = sample(&matrix.cdf_rows[matrix.prev], rng);
                matrix.prev = next;
                next
            }
        }
    }
}

/// Memoryless sampler over a fixed weight vector
#[derive(Debug, Clone)]
pub struct FlatMix {
    cdf: Vec<f64>,
}

/// Markov sampler: the previous selection picks the row
#[derive(Debug, Clone)]
pub struct MatrixMix {
    cdf_rows: Vec<Vec<f64>>,
    prev: usize,
}
