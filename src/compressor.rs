//! Online vector-quantization codebook that turns observations into codes.
//!
//! The codebook only ever grows: `train` may append centroids for novel
//! observations but never removes one, so `code_size` is monotonic.

use crate::config::CompressorConfig;
use crate::env::Observation;
use crate::error::ExperimentError;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub type Code = Vec<f64>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodeEncoding {
    /// Cosine similarity to each centroid, clamped at zero.
    #[default]
    Cosine,
    /// `1 / (1 + mean squared distance)` to each centroid.
    Distance,
}

/// Representative observations committed by one worker while evaluating
/// one individual. Opaque to the aggregator beyond being mergeable.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainingContribution {
    observations: Vec<Observation>,
}

impl TrainingContribution {
    pub fn push(&mut self, observation: Observation) {
        self.observations.push(observation);
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }
}

#[derive(Clone, Debug)]
pub struct ObservationCompressor {
    centroids: Vec<Observation>,
    obs_len: usize,
    max_centroids: usize,
    novelty_threshold: f64,
    learning_rate: f64,
    encoding: CodeEncoding,
    train_set: Vec<Observation>,
    ntrains: usize,
}

impl ObservationCompressor {
    /// Starts with `initial_centroids` uniform-random centroids.
    pub fn new<R: Rng + ?Sized>(cfg: &CompressorConfig, obs_len: usize, rng: &mut R) -> Self {
        let centroids = (0..cfg.initial_centroids)
            .map(|_| (0..obs_len).map(|_| rng.gen::<f64>()).collect())
            .collect();
        Self {
            centroids,
            obs_len,
            max_centroids: cfg.max_centroids,
            novelty_threshold: cfg.novelty_threshold,
            learning_rate: cfg.learning_rate,
            encoding: cfg.encoding,
            train_set: Vec::new(),
            ntrains: 0,
        }
    }

    pub fn code_size(&self) -> usize {
        self.centroids.len()
    }

    pub fn obs_len(&self) -> usize {
        self.obs_len
    }

    pub fn ntrains(&self) -> usize {
        self.ntrains
    }

    pub fn centroids(&self) -> &[Observation] {
        &self.centroids
    }

    /// Replaces the codebook wholesale (checkpoint restore).
    pub fn set_centroids(&mut self, centroids: Vec<Observation>) -> Result<(), ExperimentError> {
        if let Some(bad) = centroids.iter().find(|c| c.len() != self.obs_len) {
            return Err(ExperimentError::DimensionMismatch {
                what: "centroid length",
                expected: self.obs_len,
                actual: bad.len(),
            });
        }
        self.centroids = centroids;
        self.max_centroids = self.max_centroids.max(self.centroids.len());
        Ok(())
    }

    pub fn train_set(&self) -> &[Observation] {
        &self.train_set
    }

    pub fn push_training(&mut self, observation: Observation) {
        self.train_set.push(observation);
    }

    pub fn merge_contribution(&mut self, contribution: TrainingContribution) {
        self.train_set.extend(contribution.observations);
    }

    /// Seeds every centroid as a blend of `seed` and uniform noise.
    pub fn reset_centroids<R: Rng + ?Sized>(
        &mut self,
        seed: &Observation,
        proportion: f64,
        rng: &mut R,
    ) -> Result<(), ExperimentError> {
        self.check_len(seed)?;
        for centroid in &mut self.centroids {
            for (c, s) in centroid.iter_mut().zip(seed) {
                *c = proportion * s + (1.0 - proportion) * rng.gen::<f64>();
            }
        }
        Ok(())
    }

    pub fn encode(&self, observation: &Observation) -> Result<Code, ExperimentError> {
        self.check_len(observation)?;
        let code = match self.encoding {
            CodeEncoding::Cosine => {
                let norm = dot(observation, observation).sqrt();
                self.centroids
                    .iter()
                    .map(|c| {
                        let denom = norm * dot(c, c).sqrt();
                        if denom > 0.0 {
                            (dot(observation, c) / denom).max(0.0)
                        } else {
                            0.0
                        }
                    })
                    .collect()
            }
            CodeEncoding::Distance => self
                .centroids
                .iter()
                .map(|c| 1.0 / (1.0 + mean_sq_dist(observation, c)))
                .collect(),
        };
        Ok(code)
    }

    /// Consumes the training set. Returns how many centroids were added.
    pub fn train(&mut self) -> usize {
        let before = self.centroids.len();
        let train_set = std::mem::take(&mut self.train_set);
        for obs in train_set {
            if obs.len() != self.obs_len {
                tracing::warn!(len = obs.len(), expected = self.obs_len, "dropping malformed training observation");
                continue;
            }
            let nearest = self
                .centroids
                .iter()
                .enumerate()
                .map(|(i, c)| (i, mean_sq_dist(&obs, c).sqrt()))
                .min_by(|a, b| a.1.total_cmp(&b.1));

            match nearest {
                Some((_, dist))
                    if dist > self.novelty_threshold
                        && self.centroids.len() < self.max_centroids =>
                {
                    self.centroids.push(obs);
                }
                Some((idx, _)) => {
                    let lr = self.learning_rate;
                    for (c, o) in self.centroids[idx].iter_mut().zip(&obs) {
                        *c += lr * (o - *c);
                    }
                }
                None => self.centroids.push(obs),
            }
        }
        self.ntrains += 1;
        self.centroids.len() - before
    }

    fn check_len(&self, observation: &Observation) -> Result<(), ExperimentError> {
        if observation.len() != self.obs_len {
            return Err(ExperimentError::DimensionMismatch {
                what: "observation length",
                expected: self.obs_len,
                actual: observation.len(),
            });
        }
        Ok(())
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn mean_sq_dist(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f64>() / a.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn cfg(initial: usize, max: usize) -> CompressorConfig {
        CompressorConfig {
            initial_centroids: initial,
            max_centroids: max,
            novelty_threshold: 0.2,
            learning_rate: 0.5,
            ..CompressorConfig::default()
        }
    }

    #[test]
    fn code_length_tracks_codebook() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let compr = ObservationCompressor::new(&cfg(3, 5), 4, &mut rng);
        assert_eq!(compr.code_size(), 3);
        let code = compr.encode(&vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        assert_eq!(code.len(), 3);
        assert!(code.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(compr.encode(&vec![1.0]).is_err());
    }

    #[test]
    fn novel_observations_grow_the_codebook_up_to_capacity() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut compr = ObservationCompressor::new(&cfg(1, 3), 2, &mut rng);
        compr.set_centroids(vec![vec![0.0, 0.0]]).unwrap();
        for obs in [vec![10.0, 0.0], vec![0.0, 10.0], vec![-10.0, -10.0]] {
            compr.push_training(obs);
        }
        assert_eq!(compr.train(), 2);
        assert_eq!(compr.code_size(), 3);
        assert!(compr.train_set().is_empty());

        compr.push_training(vec![50.0, 50.0]);
        assert_eq!(compr.train(), 0);
        assert_eq!(compr.code_size(), 3);
        assert_eq!(compr.ntrains(), 2);
    }

    #[test]
    fn familiar_observations_move_the_nearest_centroid() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut compr = ObservationCompressor::new(&cfg(1, 4), 2, &mut rng);
        compr.set_centroids(vec![vec![0.0, 0.0], vec![1.0, 1.0]]).unwrap();
        compr.push_training(vec![0.1, 0.1]);
        assert_eq!(compr.train(), 0);
        assert_eq!(compr.centroids()[0], vec![0.05, 0.05]);
        assert_eq!(compr.centroids()[1], vec![1.0, 1.0]);
    }

    #[test]
    fn contributions_append_in_merge_order() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let mut compr = ObservationCompressor::new(&cfg(1, 4), 1, &mut rng);
        for i in 0..3 {
            let mut contribution = TrainingContribution::default();
            contribution.push(vec![i as f64]);
            compr.merge_contribution(contribution);
        }
        assert_eq!(compr.train_set(), &[vec![0.0], vec![1.0], vec![2.0]]);
    }

    #[test]
    fn full_proportion_seeding_copies_the_seed() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut compr = ObservationCompressor::new(&cfg(2, 4), 3, &mut rng);
        let seed = vec![0.2, 0.4, 0.6];
        compr.reset_centroids(&seed, 1.0, &mut rng).unwrap();
        assert!(compr.centroids().iter().all(|c| c == &seed));
    }

    #[test]
    fn distance_encoding_peaks_at_the_centroid() {
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let mut compr = ObservationCompressor::new(
            &CompressorConfig {
                encoding: CodeEncoding::Distance,
                ..cfg(1, 2)
            },
            2,
            &mut rng,
        );
        compr.set_centroids(vec![vec![1.0, 1.0], vec![0.0, 0.0]]).unwrap();
        assert_eq!(compr.encode(&vec![1.0, 1.0]).unwrap(), vec![1.0, 0.5]);
    }
}
