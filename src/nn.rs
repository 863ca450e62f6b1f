//! Components to build a neural network

use std::{
    fmt::{self, Display},
    sync::atomic::{self, AtomicUsize},
};

use rand::Rng;
use rand_distr::{Distribution, Uniform};
use thiserror::Error;

use crate::{
    device::Device,
    values::{Value, ValueError},
};

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error("Input size mismatch: expected {expected} features, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error("A layer needs at least one input and one output, got {n_inputs} -> {n_outputs}")]
    EmptyLayer { n_inputs: usize, n_outputs: usize },
    #[error(transparent)]
    Value(#[from] ValueError),
}

/// Represents the torch.nn.Module. NNs should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Module {
    fn zero_grad(&mut self) {
        for p in self.parameters().iter_mut() {
            p.zero_grad();
        }
    }

    fn parameters(&self) -> Vec<Value>;
    fn forward(&self, input: &Value) -> Result<Value, NNError>;
}

/// A fully connected layer, `y = x W + b`
///
/// The weight is stored `[n_inputs, n_outputs]` so a row-major batch multiplies it directly.
pub struct Linear {
    pub weight: Value,
    pub bias: Value,
    n_inputs: usize,
    n_outputs: usize,
    device: Device,
}

impl Linear {
    /// Creates a new layer with the given number of inputs and outputs
    pub fn new(
        n_inputs: usize,
        n_outputs: usize,
        device: Device,
        rng: &mut impl Rng,
    ) -> Result<Self, NNError> {
        if n_inputs == 0 || n_outputs == 0 {
            return Err(NNError::EmptyLayer {
                n_inputs,
                n_outputs,
            });
        }
        // Same default as torch.nn.Linear: U(-1/sqrt(fan_in), 1/sqrt(fan_in)) for weights and biases
        let bound = 1.0 / (n_inputs as f32).sqrt();
        let uniform = Uniform::new_inclusive(-bound, bound).map_err(|_| NNError::EmptyLayer {
            n_inputs,
            n_outputs,
        })?;
        let weight = (0..n_inputs * n_outputs)
            .map(|_| uniform.sample(rng))
            .collect();
        let bias = (0..n_outputs).map(|_| uniform.sample(rng)).collect();
        Ok(Self {
            weight: Value::new(&[n_inputs, n_outputs], weight)?,
            bias: Value::new(&[n_outputs], bias)?,
            n_inputs,
            n_outputs,
            device,
        })
    }

    // Testing utility for a deterministic and simple layer
    #[cfg(test)]
    fn new_ones(n_inputs: usize, n_outputs: usize) -> Self {
        Self {
            weight: Value::new(&[n_inputs, n_outputs], vec![1.0; n_inputs * n_outputs]).unwrap(),
            bias: Value::new(&[n_outputs], vec![1.0; n_outputs]).unwrap(),
            n_inputs,
            n_outputs,
            device: Device::Cpu,
        }
    }

    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    pub fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    /// Returns all the parameters in the layer
    pub fn parameters(&self) -> Vec<Value> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    /// Computes forward pass for a `[batch, n_inputs]` input
    pub fn forward(&self, input: &Value) -> Result<Value, NNError> {
        let shape = input.shape();
        if shape.len() != 2 || shape[1] != self.n_inputs {
            return Err(NNError::InputSizeMismatch {
                expected: self.n_inputs,
                got: shape.get(1..).map(|s| s.iter().product()).unwrap_or(0),
            });
        }
        let output = input.matmul(&self.weight, self.device)?.add_bias(&self.bias)?;
        let n_output_nans = output.data().iter().filter(|v| v.is_nan()).count();
        if n_output_nans > 0 {
            log::debug!("n_output_nans: {}", n_output_nans);
        }
        Ok(output)
    }
}

impl Display for Linear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Linear(in_features={}, out_features={}, bias=True)",
            self.n_inputs, self.n_outputs
        )
    }
}

/// Applies ReLU element-wise, works for arbitrary shapes
#[derive(Default)]
pub struct ReLU {
    n_dead_neurons: AtomicUsize,
}

impl ReLU {
    pub fn new() -> Self {
        Self {
            n_dead_neurons: AtomicUsize::new(0),
        }
    }

    pub fn forward(&self, input: &Value) -> Value {
        let n_dead_neurons = input.data().iter().filter(|v| **v <= 0.0).count();
        self.n_dead_neurons
            .store(n_dead_neurons, atomic::Ordering::Relaxed);
        input.relu()
    }

    /// Returns the number of inactive activations in the last forward pass (used for debugging)
    pub fn n_dead_neurons(&self) -> usize {
        self.n_dead_neurons.load(atomic::Ordering::Relaxed)
    }
}

impl Display for ReLU {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReLU()")
    }
}

/// Flattens every dimension after the batch dimension
#[derive(Default)]
pub struct Flatten;

impl Flatten {
    pub fn new() -> Self {
        Self
    }

    pub fn forward(&self, input: &Value) -> Result<Value, NNError> {
        Ok(input.flatten()?)
    }
}

impl Display for Flatten {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flatten(start_dim=1, end_dim=-1)")
    }
}
