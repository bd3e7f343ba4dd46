use super::xnes::default_popsize;
use super::{BestRecord, DistributionState, Genotype, Xnes, XnesSettings};
use crate::error::ExperimentError;
use anyhow::Result;
use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Block-diagonal NES: independent `Xnes` blocks over contiguous slices of
/// the genotype, all sharing one population size and one fitness vector.
#[derive(Clone, Debug)]
pub struct BlockDiagonalNes {
    blocks: Vec<Xnes>,
    ndims_lst: Vec<usize>,
    fixed_popsize: Option<usize>,
    popsize: usize,
    best: BestRecord,
    last_fits: Vec<f64>,
}

impl BlockDiagonalNes {
    pub fn new(
        block_dims: &[usize],
        initial_variance: f64,
        mut rng: ChaCha8Rng,
        settings: XnesSettings,
    ) -> Self {
        let blocks: Vec<Xnes> = block_dims
            .iter()
            .map(|&dims| {
                let block_rng = ChaCha8Rng::seed_from_u64(rng.gen());
                Xnes::new(
                    DistributionState::isotropic(dims, initial_variance),
                    block_rng,
                    settings,
                )
            })
            .collect();
        let ndims: usize = block_dims.iter().sum();
        let mut bdnes = Self {
            blocks,
            ndims_lst: block_dims.to_vec(),
            fixed_popsize: settings.popsize,
            popsize: 0,
            best: BestRecord::unset(DVector::zeros(ndims)),
            last_fits: Vec::new(),
        };
        bdnes.sync_popsize();
        bdnes
    }

    pub fn blocks(&self) -> &[Xnes] {
        &self.blocks
    }

    pub fn ndims_lst(&self) -> &[usize] {
        &self.ndims_lst
    }

    pub fn ndims(&self) -> usize {
        self.ndims_lst.iter().sum()
    }

    pub fn popsize(&self) -> usize {
        self.popsize
    }

    pub fn best(&self) -> &BestRecord {
        &self.best
    }

    pub fn last_fits(&self) -> &[f64] {
        &self.last_fits
    }

    pub fn mean(&self) -> DVector<f64> {
        let parts: Vec<f64> = self
            .blocks
            .iter()
            .flat_map(|b| b.state().mean.iter().copied())
            .collect();
        DVector::from_vec(parts)
    }

    /// Full covariance with zero cross-block terms.
    pub fn covariance(&self) -> DMatrix<f64> {
        let n = self.ndims();
        let mut cov = DMatrix::zeros(n, n);
        let mut offset = 0;
        for block in &self.blocks {
            let d = block.ndims();
            cov.view_mut((offset, offset), (d, d))
                .copy_from(&block.state().covariance);
            offset += d;
        }
        cov
    }

    pub fn convergence(&self) -> f64 {
        self.blocks.iter().map(Xnes::convergence).sum()
    }

    /// Grows the first block only; the other blocks are untouched.
    ///
    /// The shared population size is re-derived from the new block
    /// dimensionalities and pushed to every block.
    pub fn resize_first_block(
        &mut self,
        offset: usize,
        count: usize,
        variance: f64,
    ) -> Result<(), ExperimentError> {
        let Some(first) = self.blocks.first() else {
            return Err(ExperimentError::DimensionMismatch {
                what: "block count",
                expected: 1,
                actual: 0,
            });
        };
        let grown = first.resized(offset, count, variance)?;
        self.ndims_lst[0] = grown.ndims();
        self.blocks[0] = grown;
        self.sync_popsize();
        Ok(())
    }

    pub fn train<F>(&mut self, objective: F) -> Result<()>
    where
        F: FnOnce(&[Genotype]) -> Result<Vec<f64>>,
    {
        let popsize = self.popsize;
        let mut block_zs = Vec::with_capacity(self.blocks.len());
        let mut block_pops = Vec::with_capacity(self.blocks.len());
        for block in &mut self.blocks {
            let (zs, pop) = block.sample(popsize)?;
            block_zs.push(zs);
            block_pops.push(pop);
        }

        let population: Vec<Genotype> = (0..popsize)
            .map(|i| {
                let joined: Vec<f64> = block_pops
                    .iter()
                    .flat_map(|pop| pop[i].iter().copied())
                    .collect();
                DVector::from_vec(joined)
            })
            .collect();

        let fits = objective(&population)?;
        if fits.len() != popsize {
            return Err(ExperimentError::DimensionMismatch {
                what: "fitness vector length",
                expected: popsize,
                actual: fits.len(),
            }
            .into());
        }
        self.best.observe(&population, &fits);
        for ((block, zs), pop) in self.blocks.iter_mut().zip(&block_zs).zip(&block_pops) {
            block.update(zs, &fits)?;
            block.observe_best(pop, &fits);
        }
        self.last_fits = fits;
        Ok(())
    }

    fn sync_popsize(&mut self) {
        self.popsize = self.fixed_popsize.unwrap_or_else(|| {
            self.ndims_lst
                .iter()
                .map(|&d| default_popsize(d))
                .max()
                .unwrap_or(2)
        });
        for block in &mut self.blocks {
            block.set_popsize(self.popsize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> XnesSettings {
        XnesSettings {
            popsize: None,
            sigma_lrate: None,
            mean_lrate: 1.0,
        }
    }

    #[test]
    fn blocks_follow_the_given_partition() {
        let bd = BlockDiagonalNes::new(&[6, 3], 0.5, ChaCha8Rng::seed_from_u64(1), settings());
        assert_eq!(bd.ndims_lst(), &[6, 3]);
        assert_eq!(bd.ndims(), 9);
        assert_eq!(bd.popsize(), default_popsize(6));
        assert!(bd.blocks().iter().all(|b| b.popsize() == bd.popsize()));

        let cov = bd.covariance();
        assert_eq!(cov[(0, 0)], 0.5);
        assert_eq!(cov[(8, 8)], 0.5);
        assert_eq!(cov[(0, 8)], 0.0);
    }

    #[test]
    fn train_evaluates_joined_individuals() {
        let mut bd = BlockDiagonalNes::new(&[2, 3], 1.0, ChaCha8Rng::seed_from_u64(2), settings());
        let mut seen_len = 0;
        bd.train(|pop: &[Genotype]| {
            seen_len = pop[0].len();
            Ok(pop.iter().map(|x| -x.norm_squared()).collect())
        })
        .unwrap();
        assert_eq!(seen_len, 5);
        assert_eq!(bd.last_fits().len(), bd.popsize());
        assert!(bd.best().fitness.is_finite());
    }

    #[test]
    fn resizing_touches_only_the_first_block() {
        let mut bd = BlockDiagonalNes::new(&[4, 3], 1.0, ChaCha8Rng::seed_from_u64(3), settings());
        let second_before = bd.blocks()[1].state().clone();
        let first_rng = bd.blocks()[0].rng().clone();

        bd.resize_first_block(2, 30, 1e-4).unwrap();
        assert_eq!(bd.ndims_lst(), &[34, 3]);
        assert_eq!(bd.blocks()[1].state(), &second_before);
        assert_eq!(bd.blocks()[0].rng(), &first_rng);
        assert_eq!(bd.popsize(), default_popsize(34));
        assert!(bd.blocks().iter().all(|b| b.popsize() == default_popsize(34)));
    }
}
