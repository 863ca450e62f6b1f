//! The image classifier: flatten followed by three fully connected layers

use std::fmt::{self, Display};

use rand::Rng;

use crate::{
    device::Device,
    nn::{Flatten, Linear, Module, NNError, ReLU},
    values::Value,
};

pub const INPUT_SIZE: usize = 3 * 224 * 224;
pub const HIDDEN_SIZE: usize = 512;
pub const NUM_CLASSES: usize = 100;

/// `Flatten -> Linear -> ReLU -> Linear -> ReLU -> Linear`, producing unnormalized class scores
pub struct NeuralNetwork {
    flatten: Flatten,
    l1: Linear,
    l1_relu: ReLU,
    l2: Linear,
    l2_relu: ReLU,
    l3: Linear,
}

impl NeuralNetwork {
    /// The 3x224x224 -> 100 class network
    pub fn new(device: Device, rng: &mut impl Rng) -> Result<Self, NNError> {
        Self::with_sizes(INPUT_SIZE, HIDDEN_SIZE, NUM_CLASSES, device, rng)
    }

    pub fn with_sizes(
        input_size: usize,
        hidden_size: usize,
        n_classes: usize,
        device: Device,
        rng: &mut impl Rng,
    ) -> Result<Self, NNError> {
        Ok(Self {
            flatten: Flatten::new(),
            l1: Linear::new(input_size, hidden_size, device, rng)?,
            l1_relu: ReLU::new(),
            l2: Linear::new(hidden_size, hidden_size, device, rng)?,
            l2_relu: ReLU::new(),
            l3: Linear::new(hidden_size, n_classes, device, rng)?,
        })
    }

    pub fn n_classes(&self) -> usize {
        self.l3.n_outputs()
    }

    /// Inactive ReLU units in the last forward pass, per hidden layer
    pub fn n_dead_neurons(&self) -> [usize; 2] {
        [
            self.l1_relu.n_dead_neurons(),
            self.l2_relu.n_dead_neurons(),
        ]
    }
}

impl Module for NeuralNetwork {
    fn forward(&self, input: &Value) -> Result<Value, NNError> {
        let x = self.flatten.forward(input)?;
        let l1_out = self.l1.forward(&x)?;
        let l1_relu_out = self.l1_relu.forward(&l1_out);
        let l2_out = self.l2.forward(&l1_relu_out)?;
        let l2_relu_out = self.l2_relu.forward(&l2_out);
        let logits = self.l3.forward(&l2_relu_out)?;
        Ok(logits)
    }

    fn parameters(&self) -> Vec<Value> {
        self.l1
            .parameters()
            .into_iter()
            .chain(self.l2.parameters())
            .chain(self.l3.parameters())
            .collect()
    }
}

// Mirrors the nested module summary PyTorch prints for a model
impl Display for NeuralNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NeuralNetwork(")?;
        writeln!(f, "  (flatten): {}", self.flatten)?;
        writeln!(f, "  (linear_relu_stack): Sequential(")?;
        writeln!(f, "    (0): {}", self.l1)?;
        writeln!(f, "    (1): {}", self.l1_relu)?;
        writeln!(f, "    (2): {}", self.l2)?;
        writeln!(f, "    (3): {}", self.l2_relu)?;
        writeln!(f, "    (4): {}", self.l3)?;
        writeln!(f, "  )")?;
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    fn small_model() -> NeuralNetwork {
        let mut rng = Pcg64Mcg::seed_from_u64(3);
        NeuralNetwork::with_sizes(3 * 4 * 4, 8, NUM_CLASSES, Device::Cpu, &mut rng).unwrap()
    }

    #[test]
    fn test_output_shape() {
        let model = small_model();
        let input = Value::constant(&[5, 3, 4, 4], vec![0.5; 5 * 48]).unwrap();
        let logits = model.forward(&input).unwrap();
        assert_eq!(logits.shape(), vec![5, NUM_CLASSES]);
    }

    #[test]
    fn test_full_size_output_shape() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let model = NeuralNetwork::new(Device::detect(), &mut rng).unwrap();
        let input = Value::constant(&[2, 3, 224, 224], vec![0.1; 2 * INPUT_SIZE]).unwrap();
        let logits = model.forward(&input).unwrap();
        assert_eq!(logits.shape(), vec![2, NUM_CLASSES]);
        assert_eq!(model.n_classes(), NUM_CLASSES);
    }

    #[test]
    fn test_wrong_input_shape() {
        let model = small_model();
        let input = Value::constant(&[2, 3, 5, 5], vec![0.5; 2 * 75]).unwrap();
        assert!(matches!(
            model.forward(&input),
            Err(NNError::InputSizeMismatch {
                expected: 48,
                got: 75
            })
        ));
    }

    #[test]
    fn test_parameters() {
        let model = small_model();
        let params = model.parameters();
        assert_eq!(params.len(), 6);
        let n_params: usize = params.iter().map(|p| p.numel()).sum();
        assert_eq!(n_params, 48 * 8 + 8 + 8 * 8 + 8 + 8 * NUM_CLASSES + NUM_CLASSES);
    }

    #[test]
    fn test_summary() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let model = NeuralNetwork::with_sizes(6, 4, 2, Device::Cpu, &mut rng).unwrap();
        let expected = "\
NeuralNetwork(
  (flatten): Flatten(start_dim=1, end_dim=-1)
  (linear_relu_stack): Sequential(
    (0): Linear(in_features=6, out_features=4, bias=True)
    (1): ReLU()
    (2): Linear(in_features=4, out_features=4, bias=True)
    (3): ReLU()
    (4): Linear(in_features=4, out_features=2, bias=True)
  )
)";
        assert_eq!(model.to_string(), expected);
    }
}
