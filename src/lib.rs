//! A minimal image classification training example: a fully connected network
//! trained on synthetic images, with the tensor building blocks it needs exposed
//! through a PyTorch-like API.

pub mod backprop_fns;
pub mod dataloader;
pub mod datasets;
pub mod device;
pub mod loss;
pub mod model;
pub mod nn;
pub mod optim;
pub mod plot;
pub mod train;
pub mod values;
