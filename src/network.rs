//! Fixed-topology feed-forward policy network.
//!
//! Parameters are laid out layer by layer. Each layer is an `(in + 1) x out`
//! matrix flattened row-major: one row per input, bias row last. The first
//! layer's input-weight block therefore ends at `inputs * hidden[0]`, which
//! is where weights for newly added inputs get inserted.

use crate::error::ExperimentError;
use nalgebra::{DMatrix, DVector};

#[derive(Clone, Debug, PartialEq)]
pub struct FeedForwardNet {
    layer_sizes: Vec<usize>,
    layers: Vec<DMatrix<f64>>,
    last_output: Vec<f64>,
}

impl FeedForwardNet {
    /// `layer_sizes` is `[inputs, hidden.., outputs]`; weights start at zero.
    pub fn new(layer_sizes: Vec<usize>) -> Result<Self, ExperimentError> {
        if layer_sizes.len() < 2 || layer_sizes.contains(&0) {
            return Err(ExperimentError::InvalidConfig(format!(
                "network needs >= 2 non-empty layers, got {layer_sizes:?}"
            )));
        }
        let layers = layer_sizes
            .windows(2)
            .map(|w| DMatrix::zeros(w[0] + 1, w[1]))
            .collect();
        Ok(Self {
            layer_sizes,
            layers,
            last_output: Vec::new(),
        })
    }

    pub fn layer_sizes(&self) -> &[usize] {
        &self.layer_sizes
    }

    pub fn inputs(&self) -> usize {
        self.layer_sizes[0]
    }

    pub fn outputs(&self) -> usize {
        self.layer_sizes[self.layer_sizes.len() - 1]
    }

    pub fn first_hidden(&self) -> usize {
        self.layer_sizes[1]
    }

    /// Parameter count of each layer, in genotype order.
    pub fn layer_param_counts(&self) -> Vec<usize> {
        self.layers.iter().map(|m| m.len()).collect()
    }

    pub fn nweights(&self) -> usize {
        self.layers.iter().map(|m| m.len()).sum()
    }

    pub fn load_weights(&mut self, genotype: &[f64]) -> Result<(), ExperimentError> {
        if genotype.len() != self.nweights() {
            return Err(ExperimentError::DimensionMismatch {
                what: "genotype length",
                expected: self.nweights(),
                actual: genotype.len(),
            });
        }
        let mut offset = 0;
        for layer in &mut self.layers {
            let (rows, cols) = layer.shape();
            let n = rows * cols;
            *layer = DMatrix::from_row_slice(rows, cols, &genotype[offset..offset + n]);
            offset += n;
        }
        Ok(())
    }

    /// Flattens the current weights back into genotype order.
    pub fn weights(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.nweights());
        for layer in &self.layers {
            for row in layer.row_iter() {
                out.extend(row.iter().copied());
            }
        }
        out
    }

    pub fn reset_state(&mut self) {
        self.last_output.clear();
    }

    pub fn last_output(&self) -> &[f64] {
        &self.last_output
    }

    pub fn activate(&mut self, input: &[f64]) -> Result<Vec<f64>, ExperimentError> {
        if input.len() != self.inputs() {
            return Err(ExperimentError::DimensionMismatch {
                what: "network input",
                expected: self.inputs(),
                actual: input.len(),
            });
        }
        let mut signal = DVector::from_column_slice(input);
        for layer in &self.layers {
            let with_bias = signal.push(1.0);
            signal = (layer.transpose() * with_bias).map(f64::tanh);
        }
        self.last_output = signal.iter().copied().collect();
        Ok(self.last_output.clone())
    }

    /// Rebuilds with `inputs` input units. Every existing weight is carried
    /// over; rows for the added inputs start at zero.
    pub fn with_input_size(&self, inputs: usize) -> Result<Self, ExperimentError> {
        let old = self.inputs();
        if inputs < old {
            return Err(ExperimentError::CodeSizeShrank {
                previous: old,
                current: inputs,
            });
        }
        let mut sizes = self.layer_sizes.clone();
        sizes[0] = inputs;
        let mut grown = Self::new(sizes)?;
        let first = &self.layers[0];
        let hidden = first.ncols();
        let target = &mut grown.layers[0];
        for r in 0..old {
            for c in 0..hidden {
                target[(r, c)] = first[(r, c)];
            }
        }
        for c in 0..hidden {
            target[(inputs, c)] = first[(old, c)];
        }
        grown.layers[1..].clone_from_slice(&self.layers[1..]);
        Ok(grown)
    }

    /// Expands a genotype recorded before one or more resizes to the current
    /// layout by inserting zeros for the input weights it predates.
    pub fn pad_genotype(&self, genotype: &DVector<f64>) -> Result<DVector<f64>, ExperimentError> {
        let current = self.nweights();
        let hidden = self.first_hidden();
        let old_inputs = current
            .checked_sub(genotype.len())
            .filter(|m| m % hidden == 0)
            .and_then(|m| self.inputs().checked_sub(m / hidden));
        let Some(old_inputs) = old_inputs else {
            return Err(ExperimentError::DimensionMismatch {
                what: "best genotype length",
                expected: current,
                actual: genotype.len(),
            });
        };
        let missing = current - genotype.len();
        if missing == 0 {
            return Ok(genotype.clone());
        }
        Ok(genotype.clone().insert_rows(old_inputs * hidden, missing, 0.0))
    }
}
