use crate::env::Observation;
use rand::Rng;

/// Size-one reservoir over the observations of a single rollout.
///
/// The k-th offered observation replaces the holder with probability 1/k, so
/// the holder at the end is a uniform draw over everything offered.
#[derive(Clone, Debug, Default)]
pub struct ReservoirSampler {
    holder: Option<Observation>,
    seen: usize,
}

impl ReservoirSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.holder = None;
        self.seen = 0;
    }

    pub fn offer<R: Rng + ?Sized>(&mut self, observation: &Observation, rng: &mut R) {
        self.seen += 1;
        if self.seen == 1 || rng.gen::<f64>() < 1.0 / self.seen as f64 {
            self.holder = Some(observation.clone());
        }
    }

    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn holder(&self) -> Option<&Observation> {
        self.holder.as_ref()
    }

    /// Hands out the sampled observation and resets for the next rollout.
    pub fn take(&mut self) -> Option<Observation> {
        self.seen = 0;
        self.holder.take()
    }
}
