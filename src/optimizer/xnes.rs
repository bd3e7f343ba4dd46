use super::{BestRecord, DistributionState, Genotype};
use crate::config::OptimizerConfig;
use crate::error::ExperimentError;
use anyhow::{anyhow, Result};
use nalgebra::{Cholesky, DMatrix, DVector, SymmetricEigen};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

/// Hyperparameters that are re-derived whenever the dimensionality changes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct XnesSettings {
    pub popsize: Option<usize>,
    pub sigma_lrate: Option<f64>,
    pub mean_lrate: f64,
}

impl From<&OptimizerConfig> for XnesSettings {
    fn from(cfg: &OptimizerConfig) -> Self {
        Self {
            popsize: cfg.popsize,
            sigma_lrate: cfg.sigma_lrate,
            mean_lrate: cfg.mean_lrate,
        }
    }
}

/// Exponential NES with a full covariance matrix.
///
/// Individuals are `mean + A z` with `A` the Cholesky factor of the
/// covariance and `z ~ N(0, I)`.
#[derive(Clone, Debug)]
pub struct Xnes {
    state: DistributionState,
    rng: ChaCha8Rng,
    best: BestRecord,
    settings: XnesSettings,
    popsize: usize,
    sigma_lrate: f64,
    last_fits: Vec<f64>,
}

impl Xnes {
    pub fn new(state: DistributionState, rng: ChaCha8Rng, settings: XnesSettings) -> Self {
        let ndims = state.ndims();
        let best = BestRecord::unset(state.mean.clone());
        Self {
            state,
            rng,
            best,
            settings,
            popsize: settings.popsize.unwrap_or_else(|| default_popsize(ndims)),
            sigma_lrate: settings.sigma_lrate.unwrap_or_else(|| default_sigma_lrate(ndims)),
            last_fits: Vec::new(),
        }
    }

    /// A new optimizer over the expanded distribution. The random state and
    /// the best record are carried over as they are.
    pub fn resized(&self, offset: usize, count: usize, variance: f64) -> Result<Self, ExperimentError> {
        let state = self.state.expanded(offset, count, variance)?;
        let mut grown = Self::new(state, self.rng.clone(), self.settings);
        grown.best = self.best.clone();
        grown.last_fits = self.last_fits.clone();
        Ok(grown)
    }

    /// Overwrites the distribution and best record (checkpoint restore).
    pub fn restore(&mut self, state: DistributionState, best: BestRecord) {
        let ndims = state.ndims();
        self.state = state;
        self.best = best;
        self.popsize = self.settings.popsize.unwrap_or_else(|| default_popsize(ndims));
        self.sigma_lrate = self
            .settings
            .sigma_lrate
            .unwrap_or_else(|| default_sigma_lrate(ndims));
    }

    pub fn state(&self) -> &DistributionState {
        &self.state
    }

    pub fn rng(&self) -> &ChaCha8Rng {
        &self.rng
    }

    pub fn best(&self) -> &BestRecord {
        &self.best
    }

    pub fn last_fits(&self) -> &[f64] {
        &self.last_fits
    }

    pub fn ndims(&self) -> usize {
        self.state.ndims()
    }

    pub fn popsize(&self) -> usize {
        self.popsize
    }

    pub fn set_popsize(&mut self, popsize: usize) {
        self.popsize = popsize;
    }

    pub fn sigma_lrate(&self) -> f64 {
        self.sigma_lrate
    }

    pub fn convergence(&self) -> f64 {
        self.state.covariance.trace()
    }

    pub fn train<F>(&mut self, objective: F) -> Result<()>
    where
        F: FnOnce(&[Genotype]) -> Result<Vec<f64>>,
    {
        let (zs, population) = self.sample(self.popsize)?;
        let fits = objective(&population)?;
        check_fits(&fits, population.len())?;
        self.best.observe(&population, &fits);
        self.update(&zs, &fits)?;
        self.last_fits = fits;
        Ok(())
    }

    pub(crate) fn observe_best(&mut self, population: &[Genotype], fits: &[f64]) {
        self.best.observe(population, fits);
    }

    /// Draws `n` standard-normal vectors and the individuals they map to.
    pub(crate) fn sample(&mut self, n: usize) -> Result<(Vec<DVector<f64>>, Vec<Genotype>)> {
        let factor = self.factor()?;
        let ndims = self.ndims();
        let mut zs = Vec::with_capacity(n);
        let mut population = Vec::with_capacity(n);
        for _ in 0..n {
            let z = DVector::from_fn(ndims, |_, _| StandardNormal.sample(&mut self.rng));
            population.push(&self.state.mean + &factor * &z);
            zs.push(z);
        }
        Ok((zs, population))
    }

    /// Natural-gradient step from the samples' `z` vectors and their fitness.
    pub(crate) fn update(&mut self, zs: &[DVector<f64>], fits: &[f64]) -> Result<()> {
        check_fits(fits, zs.len())?;
        let ndims = self.ndims();
        let factor = self.factor()?;
        let utils = utilities(fits);

        let mut grad_mean = DVector::zeros(ndims);
        let mut grad_cov = DMatrix::zeros(ndims, ndims);
        let eye = DMatrix::<f64>::identity(ndims, ndims);
        for (z, u) in zs.iter().zip(&utils) {
            grad_mean += z * *u;
            grad_cov += (z * z.transpose() - &eye) * *u;
        }

        self.state.mean += &factor * grad_mean * self.settings.mean_lrate;
        let new_factor = &factor * expm_symmetric(grad_cov * (self.sigma_lrate / 2.0));
        let cov = &new_factor * new_factor.transpose();
        self.state.covariance = (&cov + cov.transpose()) * 0.5;
        Ok(())
    }

    fn factor(&self) -> Result<DMatrix<f64>> {
        Cholesky::new(self.state.covariance.clone())
            .map(|c| c.l())
            .ok_or_else(|| anyhow!("covariance is no longer positive definite"))
    }
}

fn check_fits(fits: &[f64], expected: usize) -> Result<(), ExperimentError> {
    if fits.len() != expected {
        return Err(ExperimentError::DimensionMismatch {
            what: "fitness vector length",
            expected,
            actual: fits.len(),
        });
    }
    Ok(())
}

pub fn default_popsize(ndims: usize) -> usize {
    4 + (3.0 * (ndims.max(1) as f64).ln()).floor() as usize
}

pub fn default_sigma_lrate(ndims: usize) -> f64 {
    let d = ndims.max(1) as f64;
    (9.0 + 3.0 * d.ln()) / (5.0 * d * d.sqrt())
}

/// Rank-based fitness shaping; higher fitness ranks first, utilities sum to zero.
pub(crate) fn utilities(fits: &[f64]) -> Vec<f64> {
    let n = fits.len();
    if n == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| fits[*b].total_cmp(&fits[*a]));

    let log_half = (n as f64 / 2.0 + 1.0).ln();
    let raw: Vec<f64> = (1..=n)
        .map(|rank| (log_half - (rank as f64).ln()).max(0.0))
        .collect();
    let total: f64 = raw.iter().sum();

    let mut utils = vec![0.0; n];
    for (rank, &idx) in order.iter().enumerate() {
        utils[idx] = raw[rank] / total - 1.0 / n as f64;
    }
    utils
}

fn expm_symmetric(m: DMatrix<f64>) -> DMatrix<f64> {
    let eig = SymmetricEigen::new(m);
    let exp_vals = DMatrix::from_diagonal(&eig.eigenvalues.map(f64::exp));
    &eig.eigenvectors * exp_vals * eig.eigenvectors.transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn settings() -> XnesSettings {
        XnesSettings {
            popsize: None,
            sigma_lrate: None,
            mean_lrate: 1.0,
        }
    }

    #[test]
    fn utilities_favour_the_fittest_and_sum_to_zero() {
        let utils = utilities(&[1.0, 9.0, 3.0, 7.0]);
        assert!(utils[1] > utils[3]);
        assert!(utils[3] >= utils[2]);
        assert!(utils[2] >= utils[0]);
        assert!(utils.iter().sum::<f64>().abs() < 1e-12);
    }

    #[test]
    fn default_hyperparameters_follow_dimensionality() {
        assert_eq!(default_popsize(1), 4);
        assert_eq!(default_popsize(10), 10);
        assert!(default_sigma_lrate(100) < default_sigma_lrate(10));
    }

    #[test]
    fn same_seed_samples_identically() {
        let state = DistributionState::isotropic(4, 1.0);
        let mut a = Xnes::new(state.clone(), ChaCha8Rng::seed_from_u64(11), settings());
        let mut b = Xnes::new(state, ChaCha8Rng::seed_from_u64(11), settings());
        assert_eq!(a.sample(5).unwrap().1, b.sample(5).unwrap().1);
    }

    #[test]
    fn climbs_towards_the_optimum_of_a_sphere() {
        let target = DVector::from_vec(vec![1.0, -2.0]);
        let state = DistributionState::isotropic(2, 1.0);
        let mut opt = Xnes::new(state, ChaCha8Rng::seed_from_u64(21), settings());
        for _ in 0..300 {
            opt.train(|pop: &[Genotype]| Ok(pop.iter().map(|x| -(x - &target).norm_squared()).collect()))
                .unwrap();
        }
        let err = (&opt.state().mean - &target).norm();
        assert!(err < 0.1, "mean still {err} away from the optimum");
        assert!(opt.best().fitness > -0.05);
        assert_eq!(opt.last_fits().len(), opt.popsize());
    }

    #[test]
    fn objective_returning_wrong_length_is_rejected() {
        let mut opt = Xnes::new(
            DistributionState::isotropic(3, 1.0),
            ChaCha8Rng::seed_from_u64(1),
            settings(),
        );
        let err = opt.train(|_: &[Genotype]| Ok(vec![0.0])).unwrap_err();
        assert!(err.downcast_ref::<ExperimentError>().is_some());
    }

    #[test]
    fn resize_keeps_rng_and_best() {
        let mut opt = Xnes::new(
            DistributionState::isotropic(3, 1.0),
            ChaCha8Rng::seed_from_u64(5),
            settings(),
        );
        opt.train(|pop: &[Genotype]| Ok(pop.iter().map(|x| x.sum()).collect()))
            .unwrap();
        let rng_before = opt.rng().clone();
        let best_before = opt.best().clone();

        let grown = opt.resized(1, 2, 1e-4).unwrap();
        assert_eq!(grown.ndims(), 5);
        assert_eq!(grown.rng(), &rng_before);
        assert_eq!(grown.best(), &best_before);
        assert_eq!(grown.popsize(), default_popsize(5));
    }
}
