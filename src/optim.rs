//! Optimizer(s)

use crate::values::Value;

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step with accumulated gradients
    fn step(&mut self);
    /// Zeros gradients for all parameters
    fn zero_grad(&mut self);
}

/// SGD with optional momentum
pub struct SGD {
    params: Vec<Value>,
    // fixed, there is no schedule
    lr: f32,
    momentum: f32,
    // velocity per parameter tensor, empty when momentum is disabled
    velocity: Vec<Vec<f32>>,
}

impl SGD {
    pub fn new(params: Vec<Value>, lr: f32, momentum: f32) -> Self {
        let velocity = if momentum == 0.0 {
            vec![]
        } else {
            params.iter().map(|p| vec![0.0; p.numel()]).collect()
        };
        Self {
            params,
            lr,
            momentum,
            velocity,
        }
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    #[cfg(test)]
    fn velocities(&self) -> &[Vec<f32>] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self) {
        let lr = self.lr;
        if self.velocity.is_empty() {
            for param in self.params.iter_mut() {
                param.update_data(|data, grad| {
                    for (p, g) in data.iter_mut().zip(grad) {
                        *p -= lr * g;
                    }
                });
            }
            return;
        }

        let momentum = self.momentum;
        for (param, velocity) in self.params.iter_mut().zip(self.velocity.iter_mut()) {
            param.update_data(|data, grad| {
                for ((p, g), v) in data.iter_mut().zip(grad).zip(velocity.iter_mut()) {
                    *v = momentum * *v - lr * g;
                    *p += *v;
                }
            });
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }
}
