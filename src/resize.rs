//! Grows the search distribution and the policy network in lockstep when the
//! compressor's code size grows.

use crate::error::ExperimentError;
use crate::network::FeedForwardNet;
use crate::optimizer::Optimizer;

/// Where and how many parameters a code-size change introduces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResizePlan {
    pub old_code_size: usize,
    pub new_code_size: usize,
    pub diff: usize,
    /// End of the old input-weight block of the first layer.
    pub insert_offset: usize,
    pub new_params: usize,
}

impl ResizePlan {
    /// `None` when the code size did not change; an error when it shrank.
    pub fn for_growth(
        old_code_size: usize,
        new_code_size: usize,
        first_hidden: usize,
    ) -> Result<Option<Self>, ExperimentError> {
        if new_code_size < old_code_size {
            return Err(ExperimentError::CodeSizeShrank {
                previous: old_code_size,
                current: new_code_size,
            });
        }
        if new_code_size == old_code_size {
            return Ok(None);
        }
        let diff = new_code_size - old_code_size;
        Ok(Some(Self {
            old_code_size,
            new_code_size,
            diff,
            insert_offset: old_code_size * first_hidden,
            new_params: diff * first_hidden,
        }))
    }
}

/// Returns `optimizer` expanded according to `plan`. Random state and best
/// record are carried over; every pre-existing mean/covariance entry is kept
/// bit-identical. `optimizer` itself is left as it was.
pub fn resize_optimizer(
    optimizer: &Optimizer,
    plan: &ResizePlan,
    variance: f64,
) -> Result<Optimizer, ExperimentError> {
    match optimizer {
        Optimizer::Xnes(xnes) => Ok(Optimizer::Xnes(xnes.resized(
            plan.insert_offset,
            plan.new_params,
            variance,
        )?)),
        Optimizer::BlockDiagonal(bdnes) => {
            let mut grown = bdnes.clone();
            grown.resize_first_block(plan.insert_offset, plan.new_params, variance)?;
            Ok(Optimizer::BlockDiagonal(grown))
        }
    }
}

/// Rebuilds `net` for the plan's new code size, keeping every learned weight.
pub fn resize_network(
    net: &FeedForwardNet,
    plan: &ResizePlan,
) -> Result<FeedForwardNet, ExperimentError> {
    if net.inputs() != plan.old_code_size {
        return Err(ExperimentError::DimensionMismatch {
            what: "network input size",
            expected: plan.old_code_size,
            actual: net.inputs(),
        });
    }
    net.with_input_size(plan.new_code_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OptimizerConfig, OptimizerKind};
    use crate::optimizer::Genotype;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn trained(kind: OptimizerKind, net: &FeedForwardNet) -> Optimizer {
        let cfg = OptimizerConfig {
            kind,
            popsize: Some(6),
            ..OptimizerConfig::default()
        };
        let mut opt =
            Optimizer::build(&cfg, &net.layer_param_counts(), ChaCha8Rng::seed_from_u64(17)).unwrap();
        for _ in 0..3 {
            opt.train(|pop: &[Genotype]| Ok(pop.iter().map(|x| x.sum()).collect()))
                .unwrap();
        }
        opt
    }

    #[test]
    fn plan_offsets_follow_the_first_layer() {
        let plan = ResizePlan::for_growth(4, 7, 5).unwrap().unwrap();
        assert_eq!(plan.diff, 3);
        assert_eq!(plan.insert_offset, 20);
        assert_eq!(plan.new_params, 15);
        assert_eq!(ResizePlan::for_growth(4, 4, 5).unwrap(), None);
    }

    #[test]
    fn shrinking_code_size_is_fatal() {
        assert_eq!(
            ResizePlan::for_growth(6, 5, 3),
            Err(ExperimentError::CodeSizeShrank {
                previous: 6,
                current: 5
            })
        );
    }

    #[test]
    fn xnes_resize_preserves_priors_and_continuity() {
        let net = FeedForwardNet::new(vec![3, 2, 2]).unwrap();
        let opt = trained(OptimizerKind::Xnes, &net);
        let Optimizer::Xnes(before) = &opt else {
            panic!("expected xnes");
        };
        let before = before.clone();

        let plan = ResizePlan::for_growth(3, 5, net.first_hidden()).unwrap().unwrap();
        let resized = resize_optimizer(&opt, &plan, 1e-4).unwrap();
        let grown_net = resize_network(&net, &plan).unwrap();
        assert_eq!(grown_net.inputs(), 5);
        assert_eq!(resized.ndims(), grown_net.nweights());

        let Optimizer::Xnes(after) = &resized else {
            panic!("variant changed");
        };
        assert_eq!(after.rng(), before.rng());
        assert_eq!(after.best(), before.best());

        let old_n = before.ndims();
        let map = |i: usize| if i < plan.insert_offset { i } else { i + plan.new_params };
        for i in 0..old_n {
            assert_eq!(
                after.state().mean[map(i)].to_bits(),
                before.state().mean[i].to_bits()
            );
            for j in 0..old_n {
                assert_eq!(
                    after.state().covariance[(map(i), map(j))].to_bits(),
                    before.state().covariance[(i, j)].to_bits()
                );
            }
        }
        for k in plan.insert_offset..plan.insert_offset + plan.new_params {
            assert_eq!(after.state().mean[k], 0.0);
            assert_eq!(after.state().covariance[(k, k)], 1e-4);
        }
    }

    #[test]
    fn block_diagonal_resize_only_grows_the_first_block() {
        let net = FeedForwardNet::new(vec![2, 3, 2]).unwrap();
        let opt = trained(OptimizerKind::BlockDiagonal, &net);
        let Optimizer::BlockDiagonal(before) = &opt else {
            panic!("expected block-diagonal");
        };
        let before = before.clone();

        let plan = ResizePlan::for_growth(2, 4, net.first_hidden()).unwrap().unwrap();
        let resized = resize_optimizer(&opt, &plan, 1e-4).unwrap();
        let Optimizer::BlockDiagonal(after) = &resized else {
            panic!("variant changed");
        };
        assert_eq!(after.ndims_lst(), &[before.ndims_lst()[0] + 6, before.ndims_lst()[1]]);
        assert_eq!(after.blocks()[1].state(), before.blocks()[1].state());
        assert_eq!(after.blocks()[0].rng(), before.blocks()[0].rng());
        assert_eq!(after.blocks()[0].best(), before.blocks()[0].best());
        assert_eq!(after.best(), before.best());
        assert_eq!(resized.ndims(), resize_network(&net, &plan).unwrap().nweights());
    }

    #[test]
    fn network_must_match_the_old_code_size() {
        let net = FeedForwardNet::new(vec![3, 2, 1]).unwrap();
        let plan = ResizePlan::for_growth(4, 6, 2).unwrap().unwrap();
        assert!(resize_network(&net, &plan).is_err());
    }
}
