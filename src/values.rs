//! Tensor values which form a computation graph
use std::{
    cell::{Cell, Ref, RefCell},
    collections::HashSet,
    fmt::{self, Debug, Display},
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use thiserror::Error;

use crate::{
    backprop_fns::{BackpropFunc, update_gradients_one_operand, update_gradients_two_operands},
    device::Device,
};

type SharedValue = Rc<RefCell<InnerValue>>;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Runs `f` without recording a computation graph, analogous to `torch.no_grad()`.
/// Values derived inside `f` have no children and never receive gradients.
pub fn no_grad<T>(f: impl FnOnce() -> T) -> T {
    struct Restore(bool);
    impl Drop for Restore {
        fn drop(&mut self) {
            GRAD_ENABLED.with(|enabled| enabled.set(self.0));
        }
    }
    let _restore = Restore(GRAD_ENABLED.with(|enabled| enabled.replace(false)));
    f()
}

pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|enabled| enabled.get())
}

/// Errors raised by tensor operations
#[derive(Debug, Error)]
pub enum ValueError {
    #[error("{len} elements cannot be viewed with shape {shape:?}")]
    DataShapeMismatch { shape: Vec<usize>, len: usize },
    #[error("{op}: expected {expected}, got shape {got:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: String,
        got: Vec<usize>,
    },
    #[error("backward can only be called on a single element value, got shape {shape:?}")]
    NonScalarBackward { shape: Vec<usize> },
    #[error("label {label} is out of range for {n_classes} classes")]
    LabelOutOfRange { label: usize, n_classes: usize },
    #[error("expected {expected} labels, got {got}")]
    LabelCountMismatch { expected: usize, got: usize },
}

/// Newtype representing a shared tensor in a computation graph
#[derive(Debug, Clone)]
pub struct Value(pub(crate) SharedValue);

impl Value {
    /// Create a new leaf value which accumulates gradients (a trainable parameter)
    pub fn new(shape: &[usize], data: Vec<f32>) -> Result<Self, ValueError> {
        Self::new_leaf(shape, data, true)
    }

    /// Create a new leaf value which never receives gradients (inputs, labels)
    pub fn constant(shape: &[usize], data: Vec<f32>) -> Result<Self, ValueError> {
        Self::new_leaf(shape, data, false)
    }

    fn new_leaf(shape: &[usize], data: Vec<f32>, requires_grad: bool) -> Result<Self, ValueError> {
        if shape.iter().product::<usize>() != data.len() {
            return Err(ValueError::DataShapeMismatch {
                shape: shape.to_vec(),
                len: data.len(),
            });
        }
        Ok(Self(Rc::new(RefCell::new(InnerValue::new(
            shape.to_vec(),
            data,
            requires_grad,
            None,
        )))))
    }

    /// Create a new value derived from an operation on other values (i.e. not a leaf node).
    /// The graph edge is only recorded when some operand needs a gradient and recording is enabled.
    fn new_derived(
        shape: Vec<usize>,
        data: Vec<f32>,
        backprop_fn: BackpropFunc,
        operands: &[&Value],
    ) -> Self {
        let requires_grad = is_grad_enabled() && operands.iter().any(|v| v.requires_grad());
        let backprop_fn = requires_grad.then_some(backprop_fn);
        let mut inner = InnerValue::new(shape, data, requires_grad, backprop_fn);
        if requires_grad {
            inner.children = operands.iter().map(|v| v.0.clone()).collect();
        }
        Self(Rc::new(RefCell::new(inner)))
    }

    pub fn shape(&self) -> Vec<usize> {
        self.0.borrow().shape.clone()
    }

    pub fn numel(&self) -> usize {
        self.0.borrow().data.len()
    }

    pub fn data(&self) -> Ref<'_, [f32]> {
        Ref::map(self.0.borrow(), |inner| inner.data.as_slice())
    }

    /// Gradient of the output with respect to this value, empty if the value does not require gradients
    pub fn grad(&self) -> Ref<'_, [f32]> {
        Ref::map(self.0.borrow(), |inner| inner.grad.as_slice())
    }

    /// The first element, intended for single element values such as a loss
    pub fn item(&self) -> f32 {
        self.0.borrow().data.first().copied().unwrap_or(f32::NAN)
    }

    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    /// Mutates the data in place given the current gradient.
    // Strictly, &mut isn't needed since the value is behind a shared mutable type,
    // but it indicates that the value should be exclusively mutable
    pub fn update_data(&mut self, f: impl FnOnce(&mut [f32], &[f32])) {
        let mut inner = self.0.borrow_mut();
        let inner = &mut *inner;
        f(&mut inner.data, &inner.grad);
    }

    /// Adds `delta` to the gradient, ignored when the value does not require gradients
    pub(crate) fn accumulate_grad(&self, delta: &[f32]) {
        let mut inner = self.0.borrow_mut();
        if !inner.requires_grad {
            return;
        }
        debug_assert_eq!(inner.grad.len(), delta.len());
        for (g, d) in inner.grad.iter_mut().zip(delta) {
            *g += d;
        }
    }

    /// Unlike PyTorch which only zeros out the gradients of the leaf nodes, this zeros out
    /// all gradients in the computation graph which are children of this node
    pub fn zero_grad(&mut self) {
        self.0.borrow_mut().grad.fill(0.0);

        let mut backprop_order = vec![];
        let mut visited: HashSet<u64> = HashSet::new();
        self.backward_inner(&mut backprop_order, &mut visited);
        for value in backprop_order.into_iter().rev() {
            value.0.borrow_mut().grad.fill(0.0);
        }
    }

    /// Backpropagates from a single element value into every value it was derived from
    pub fn backward(&self) -> Result<(), ValueError> {
        {
            let mut inner = self.0.borrow_mut();
            if inner.data.len() != 1 {
                return Err(ValueError::NonScalarBackward {
                    shape: inner.shape.clone(),
                });
            }
            if !inner.requires_grad {
                return Ok(());
            }
            // d out / d out = 1
            inner.grad[0] = 1.0;
        }

        let mut backprop_order = vec![];
        let mut visited: HashSet<u64> = HashSet::new();

        // visit in post order
        self.backward_inner(&mut backprop_order, &mut visited);

        // apply backprop, reversed to start from root first
        for value in backprop_order.into_iter().rev() {
            let n_operands = value.0.borrow().children.len();
            if let Some(f) = value.0.borrow().backprop_fn.as_ref() {
                debug_assert!(f.n_operands() == n_operands);
            }
            match n_operands {
                0 => {}
                1 => {
                    let in1 = Value(value.0.borrow().children[0].clone());
                    update_gradients_one_operand(&in1, &value);
                }
                2 => {
                    let in1 = Value(value.0.borrow().children[0].clone());
                    let in2 = Value(value.0.borrow().children[1].clone());
                    update_gradients_two_operands(&in1, &in2, &value);
                }
                _ => {
                    panic!("Unsupported number of operands: {}", n_operands);
                }
            }
        }
        Ok(())
    }

    fn backward_inner(&self, backprop_order: &mut Vec<Value>, visited: &mut HashSet<u64>) {
        for c in self.0.borrow().children.iter() {
            if visited.contains(&c.borrow().id) {
                continue;
            }
            visited.insert(c.borrow().id);
            let value = Value(c.clone());
            value.backward_inner(backprop_order, visited);
        }
        backprop_order.push(self.clone());
    }
}

// Operations on values
impl Value {
    /// Matrix product of `[m, k]` and `[k, n]` values, computed on `device`
    pub fn matmul(&self, rhs: &Value, device: Device) -> Result<Value, ValueError> {
        let (m, k) = self.matrix_dims("matmul")?;
        let (k_rhs, n) = rhs.matrix_dims("matmul")?;
        if k != k_rhs {
            return Err(ValueError::ShapeMismatch {
                op: "matmul",
                expected: format!("[{}, _] on the right hand side", k),
                got: rhs.shape(),
            });
        }
        let mut data = vec![0.0; m * n];
        device.gemm(
            m,
            k,
            n,
            &self.data(),
            (k, 1),
            &rhs.data(),
            (n, 1),
            &mut data,
        );
        Ok(Value::new_derived(
            vec![m, n],
            data,
            BackpropFunc::MatMul { device },
            &[self, rhs],
        ))
    }

    /// Adds a `[n]` bias to every row of a `[m, n]` value
    pub fn add_bias(&self, bias: &Value) -> Result<Value, ValueError> {
        let (m, n) = self.matrix_dims("add_bias")?;
        if bias.shape() != [n] {
            return Err(ValueError::ShapeMismatch {
                op: "add_bias",
                expected: format!("[{}]", n),
                got: bias.shape(),
            });
        }
        let mut data = self.data().to_vec();
        if n > 0 {
            let bias = bias.data();
            for row in data.chunks_exact_mut(n) {
                for (v, b) in row.iter_mut().zip(bias.iter()) {
                    *v += b;
                }
            }
        }
        Ok(Value::new_derived(
            vec![m, n],
            data,
            BackpropFunc::AddBias,
            &[self, bias],
        ))
    }

    pub fn relu(&self) -> Value {
        let data = self.data().iter().map(|v| v.max(0.0)).collect();
        Value::new_derived(self.shape(), data, BackpropFunc::ReLU, &[self])
    }

    /// Collapses every dimension after the first, `[n, d1, d2, ..] -> [n, d1 * d2 * ..]`
    pub fn flatten(&self) -> Result<Value, ValueError> {
        let shape = self.shape();
        if shape.is_empty() {
            return Err(ValueError::ShapeMismatch {
                op: "flatten",
                expected: "at least one dimension".to_string(),
                got: shape,
            });
        }
        let batch = shape[0];
        let features = shape[1..].iter().product();
        Ok(Value::new_derived(
            vec![batch, features],
            self.data().to_vec(),
            BackpropFunc::Flatten,
            &[self],
        ))
    }

    /// Mean cross entropy between `[m, classes]` logits and integer class labels
    pub fn cross_entropy(&self, targets: &[usize]) -> Result<Value, ValueError> {
        let (m, n_classes) = self.matrix_dims("cross_entropy")?;
        if targets.len() != m {
            return Err(ValueError::LabelCountMismatch {
                expected: m,
                got: targets.len(),
            });
        }
        if let Some(&label) = targets.iter().find(|&&t| t >= n_classes) {
            return Err(ValueError::LabelOutOfRange { label, n_classes });
        }
        let loss = if m == 0 {
            0.0
        } else {
            let logits = self.data();
            let total: f32 = logits
                .chunks_exact(n_classes)
                .zip(targets)
                .map(|(row, &t)| log_sum_exp(row) - row[t])
                .sum();
            total / m as f32
        };
        Ok(Value::new_derived(
            vec![1],
            vec![loss],
            BackpropFunc::CrossEntropy {
                targets: targets.into(),
            },
            &[self],
        ))
    }

    /// Index of the largest element in each row of a `[m, n]` value
    pub fn argmax_rows(&self) -> Result<Vec<usize>, ValueError> {
        let (_, n) = self.matrix_dims("argmax_rows")?;
        if n == 0 {
            return Err(ValueError::ShapeMismatch {
                op: "argmax_rows",
                expected: "at least one column".to_string(),
                got: self.shape(),
            });
        }
        let data = self.data();
        Ok(data
            .chunks_exact(n)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                        if v > best.1 { (i, v) } else { best }
                    })
                    .0
            })
            .collect())
    }

    fn matrix_dims(&self, op: &'static str) -> Result<(usize, usize), ValueError> {
        match self.shape()[..] {
            [rows, cols] => Ok((rows, cols)),
            _ => Err(ValueError::ShapeMismatch {
                op,
                expected: "a 2 dimensional value".to_string(),
                got: self.shape(),
            }),
        }
    }
}

/// `log(sum(exp(row)))`, shifted by the row maximum for numerical stability
pub(crate) fn log_sum_exp(row: &[f32]) -> f32 {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max.is_infinite() {
        return max;
    }
    max + row.iter().map(|v| (v - max).exp()).sum::<f32>().ln()
}

// pretty print a value and its children recursively in a JSON-like format
// the tensor contents are omitted, they can be very large
impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn fmt_value(value: &Value, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let inner = value.0.borrow();
            let indent_str = " ".repeat(indent);
            let indent_inner = " ".repeat(indent + 2);
            writeln!(f, "{}{{", indent_str)?;
            writeln!(f, "{}\"shape\": {:?},", indent_inner, inner.shape)?;
            writeln!(f, "{}\"requires_grad\": {},", indent_inner, inner.requires_grad)?;
            writeln!(f, "{}\"id\": {},", indent_inner, inner.id)?;
            writeln!(
                f,
                "{}\"backprop_fn\": {:?},",
                indent_inner,
                inner.backprop_fn.as_ref().map(BackpropFunc::name)
            )?;
            writeln!(f, "{}\"children\": [", indent_inner)?;
            for (i, child) in inner.children.iter().enumerate() {
                let child_value = Value(child.clone());
                fmt_value(&child_value, indent + 4, f)?;
                if i < inner.children.len() - 1 {
                    writeln!(f, ",")?;
                } else {
                    writeln!(f)?;
                }
            }
            writeln!(f, "{}]", indent_inner)?;
            write!(f, "{}}}", indent_str)
        }
        fmt_value(self, 0, f)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        let a = self.0.borrow();
        let b = other.0.borrow();
        a.shape == b.shape && a.data == b.data
    }
}

// unfortunate that there isn't a blanket impl for AsRef<T> for T
// <https://doc.rust-lang.org/std/convert/trait.AsRef.html#reflexivity>
impl AsRef<Value> for Value {
    fn as_ref(&self) -> &Value {
        self
    }
}

pub(crate) struct InnerValue {
    /// row-major storage, the network uses 32 bit precision floats
    pub(crate) data: Vec<f32>,
    pub(crate) shape: Vec<usize>,
    /// gradient of the output with respect to each element,
    /// only allocated when `requires_grad` is set
    pub(crate) grad: Vec<f32>,
    pub(crate) requires_grad: bool,
    /// List of the node inputs in the forward pass
    /// These nodes are "children" in the backwards pass
    children: Vec<SharedValue>,
    /// Unique identifier for the node
    id: u64,
    /// The function which created this value from its children
    /// `None` when the value is a leaf node
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

impl Debug for InnerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InnerValue")
            .field("shape", &self.shape)
            .field("requires_grad", &self.requires_grad)
            .field("id", &self.id)
            .field("backprop_fn", &self.backprop_fn)
            .field("n_children", &self.children.len())
            .finish()
    }
}

impl InnerValue {
    pub fn new(
        shape: Vec<usize>,
        data: Vec<f32>,
        requires_grad: bool,
        backprop_fn: Option<BackpropFunc>,
    ) -> Self {
        let grad = if requires_grad {
            vec![0.0; data.len()]
        } else {
            vec![]
        };
        Self {
            data,
            shape,
            grad,
            requires_grad,
            children: vec![],
            id: next_id(),
            backprop_fn,
        }
    }
}

fn next_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}
