//! Incremental gradient update functions for backprop
//!
//! Applied depending on the operation which created outputs from inputs. Corresponds to
//! a node in the computation graph. Each rule computes the full operand gradient before
//! accumulating it, so an operand may appear twice in one operation.

use std::rc::Rc;

use crate::{
    device::Device,
    values::{Value, log_sum_exp},
};

/// Represents the function in the computation graph
#[derive(Debug, Clone)]
pub enum BackpropFunc {
    /// `[m, k] x [k, n]`, the backward products run on the same device as the forward one
    MatMul { device: Device },
    AddBias,
    ReLU,
    Flatten,
    /// Mean cross entropy against the recorded labels
    CrossEntropy { targets: Rc<[usize]> },
}

impl BackpropFunc {
    pub fn n_operands(&self) -> usize {
        match self {
            BackpropFunc::MatMul { .. } => 2,
            BackpropFunc::AddBias => 2,
            BackpropFunc::ReLU => 1,
            BackpropFunc::Flatten => 1,
            BackpropFunc::CrossEntropy { .. } => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackpropFunc::MatMul { .. } => "MatMul",
            BackpropFunc::AddBias => "AddBias",
            BackpropFunc::ReLU => "ReLU",
            BackpropFunc::Flatten => "Flatten",
            BackpropFunc::CrossEntropy { .. } => "CrossEntropy",
        }
    }
}

/// Represents backprop for the operation `in1 x in2 = out`
/// d in1 = d out x in2^T and d in2 = in1^T x d out
pub fn matmul(in1: &Value, in2: &Value, out: &Value, device: Device) {
    let (m, k) = (in1.shape()[0], in1.shape()[1]);
    let n = in2.shape()[1];

    let d_in1 = in1.requires_grad().then(|| {
        let mut d = vec![0.0; m * k];
        device.gemm(m, n, k, &out.grad(), (n, 1), &in2.data(), (1, n), &mut d);
        d
    });
    let d_in2 = in2.requires_grad().then(|| {
        let mut d = vec![0.0; k * n];
        device.gemm(k, m, n, &in1.data(), (1, k), &out.grad(), (n, 1), &mut d);
        d
    });

    if let Some(d) = d_in1 {
        in1.accumulate_grad(&d);
    }
    if let Some(d) = d_in2 {
        in2.accumulate_grad(&d);
    }
}

/// Represents backprop for the operation `in1 + broadcast(in2) = out`
/// The bias gradient is the column sum of the output gradient
pub fn add_bias(in1: &Value, in2: &Value, out: &Value) {
    let n = in2.numel();
    let d_out = out.grad().to_vec();
    let mut d_bias = vec![0.0; n];
    if n > 0 {
        for row in d_out.chunks_exact(n) {
            for (d, g) in d_bias.iter_mut().zip(row) {
                *d += g;
            }
        }
    }
    in1.accumulate_grad(&d_out);
    in2.accumulate_grad(&d_bias);
}

/// Represents backprop for the operation `relu(in) = out`
pub fn relu(in1: &Value, out: &Value) {
    let d_in = in1
        .data()
        .iter()
        .zip(out.grad().iter())
        .map(|(x, g)| if *x > 0.0 { *g } else { 0.0 })
        .collect::<Vec<_>>();
    in1.accumulate_grad(&d_in);
}

/// Represents backprop for the operation `flatten(in) = out`, the layout is unchanged
pub fn flatten(in1: &Value, out: &Value) {
    let d_in = out.grad().to_vec();
    in1.accumulate_grad(&d_in);
}

/// Represents backprop for the operation `cross_entropy(in, targets) = out`
/// d in = d out * (softmax(in) - onehot(targets)) / batch
pub fn cross_entropy(in1: &Value, out: &Value, targets: &[usize]) {
    let grad = out.grad()[0];
    let n_classes = in1.shape()[1];
    let scale = grad / targets.len().max(1) as f32;
    let mut d_in = in1.data().to_vec();
    if n_classes == 0 {
        // no logits, so no labels either: nothing to propagate
        in1.accumulate_grad(&d_in);
        return;
    }
    for (row, &t) in d_in.chunks_exact_mut(n_classes).zip(targets) {
        let lse = log_sum_exp(row);
        for v in row.iter_mut() {
            *v = (*v - lse).exp() * scale;
        }
        row[t] -= scale;
    }
    in1.accumulate_grad(&d_in);
}

/// Applies a backprop function for operators with two operands
pub fn update_gradients_two_operands(in1: &Value, in2: &Value, out: &Value) {
    let backprop_fn = { out.0.borrow().backprop_fn.clone() };
    match backprop_fn {
        Some(BackpropFunc::MatMul { device }) => matmul(in1, in2, out, device),
        Some(BackpropFunc::AddBias) => add_bias(in1, in2, out),
        None => {}
        _ => panic!("Invalid backprop function: {:?}", backprop_fn),
    }
}

/// Applies a backprop function for operators with one operand
pub fn update_gradients_one_operand(in1: &Value, out: &Value) {
    let backprop_fn = { out.0.borrow().backprop_fn.clone() };
    match backprop_fn {
        Some(BackpropFunc::ReLU) => relu(in1, out),
        Some(BackpropFunc::Flatten) => flatten(in1, out),
        Some(BackpropFunc::CrossEntropy { targets }) => cross_entropy(in1, out, &targets),
        None => {}
        _ => panic!("Invalid backprop function: {:?}", backprop_fn),
    }
}
