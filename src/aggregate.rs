//! Collapses the frames emitted while one action is repeated into a single observation.

use crate::env::Observation;
use crate::error::ExperimentError;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameAggregation {
    /// Element-wise mean over the burst.
    Average,
    First,
    #[default]
    Last,
    /// First frame of the burst minus the environment's reset observation.
    DeltaFromReset,
}

/// Pure function of the burst, the policy and (for `DeltaFromReset`) the reset frame.
pub fn aggregate(
    policy: FrameAggregation,
    frames: &[Observation],
    reset_obs: &Observation,
) -> Result<Observation, ExperimentError> {
    let first = frames.first().ok_or(ExperimentError::DimensionMismatch {
        what: "frame burst length",
        expected: 1,
        actual: 0,
    })?;
    let len = first.len();
    if let Some(bad) = frames.iter().find(|f| f.len() != len) {
        return Err(ExperimentError::DimensionMismatch {
            what: "frame length",
            expected: len,
            actual: bad.len(),
        });
    }

    match policy {
        FrameAggregation::Average => {
            let mut sum = vec![0.0; len];
            for frame in frames {
                for (acc, v) in sum.iter_mut().zip(frame) {
                    *acc += v;
                }
            }
            let n = frames.len() as f64;
            Ok(sum.into_iter().map(|v| v / n).collect())
        }
        FrameAggregation::First => Ok(first.clone()),
        FrameAggregation::Last => Ok(frames[frames.len() - 1].clone()),
        FrameAggregation::DeltaFromReset => {
            if reset_obs.len() != len {
                return Err(ExperimentError::DimensionMismatch {
                    what: "reset observation length",
                    expected: len,
                    actual: reset_obs.len(),
                });
            }
            Ok(first.iter().zip(reset_obs).map(|(a, b)| a - b).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn burst() -> Vec<Observation> {
        vec![vec![1.0, 0.0, 2.0], vec![3.0, 0.0, 4.0], vec![5.0, 3.0, 0.0]]
    }

    #[test]
    fn each_policy_reduces_the_burst() {
        let reset = vec![0.5, 0.5, 0.5];
        let frames = burst();
        assert_eq!(
            aggregate(FrameAggregation::Average, &frames, &reset).unwrap(),
            vec![3.0, 1.0, 2.0]
        );
        assert_eq!(
            aggregate(FrameAggregation::First, &frames, &reset).unwrap(),
            vec![1.0, 0.0, 2.0]
        );
        assert_eq!(
            aggregate(FrameAggregation::Last, &frames, &reset).unwrap(),
            vec![5.0, 3.0, 0.0]
        );
        assert_eq!(
            aggregate(FrameAggregation::DeltaFromReset, &frames, &reset).unwrap(),
            vec![0.5, -0.5, 1.5]
        );
    }

    #[test]
    fn single_frame_burst_is_identity_for_average() {
        let frames = vec![vec![0.25, 0.75]];
        assert_eq!(
            aggregate(FrameAggregation::Average, &frames, &vec![0.0, 0.0]).unwrap(),
            frames[0]
        );
    }

    #[test]
    fn empty_or_ragged_bursts_are_rejected() {
        let reset = vec![0.0; 2];
        assert!(aggregate(FrameAggregation::Last, &[], &reset).is_err());
        let ragged = vec![vec![0.0, 1.0], vec![1.0]];
        assert!(aggregate(FrameAggregation::Average, &ragged, &reset).is_err());
        assert!(aggregate(FrameAggregation::DeltaFromReset, &[vec![1.0]], &reset).is_err());
    }

    #[test]
    fn policy_names_are_kebab_case() {
        let parsed: FrameAggregation = serde_json::from_str("\"delta-from-reset\"").unwrap();
        assert_eq!(parsed, FrameAggregation::DeltaFromReset);
        assert_eq!(serde_json::to_string(&FrameAggregation::Average).unwrap(), "\"average\"");
    }
}
