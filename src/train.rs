//! Training and evaluation loops

use std::fmt::{self, Display};

use thiserror::Error;

use crate::{
    dataloader::{DataLoader, DataLoaderError},
    datasets::Dataset,
    loss::CrossEntropyLoss,
    nn::{Module, NNError},
    optim::Optim,
    values::{ValueError, no_grad},
};

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    DataLoader(#[from] DataLoaderError),
    #[error(transparent)]
    NN(#[from] NNError),
    #[error(transparent)]
    Value(#[from] ValueError),
}

/// Samples processed so far in an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
}

impl Progress {
    /// Progress after batch `batch` (zero based) holding `len` samples
    pub fn after_batch(batch: usize, batch_size: usize, len: usize, total: usize) -> Self {
        Self {
            current: batch * batch_size + len,
            total,
        }
    }
}

impl Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:>5}/{:>5}]", self.current, self.total)
    }
}

/// Outcome of one pass over the training set
#[derive(Debug, Clone, Default)]
pub struct TrainReport {
    /// loss of every batch, in order
    pub losses: Vec<f32>,
    pub progress: Vec<Progress>,
}

impl TrainReport {
    pub fn n_batches(&self) -> usize {
        self.losses.len()
    }

    pub fn mean_loss(&self) -> f32 {
        if self.losses.is_empty() {
            return f32::NAN;
        }
        self.losses.iter().sum::<f32>() / self.losses.len() as f32
    }
}

/// Outcome of one pass over the test set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestReport {
    /// mean of the per-batch losses
    pub avg_loss: f32,
    pub correct: usize,
    pub size: usize,
}

impl TestReport {
    /// Fraction of correct top-1 predictions, in `[0, 1]`
    pub fn accuracy(&self) -> f32 {
        accuracy(self.correct, self.size)
    }
}

impl Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Test Error: \n Accuracy: {:>0.1}%, Avg loss: {:>8.6} \n",
            100.0 * self.accuracy(),
            self.avg_loss
        )
    }
}

pub fn accuracy(correct: usize, size: usize) -> f32 {
    if size == 0 {
        return 0.0;
    }
    correct.min(size) as f32 / size as f32
}

/// Number of predictions equal to their label
pub fn count_correct(predictions: &[usize], labels: &[usize]) -> usize {
    predictions
        .iter()
        .zip(labels)
        .filter(|(p, l)| p == l)
        .count()
}

/// One epoch of training: forward, loss, backward and an optimizer step per batch.
/// Every `log_interval` batches the current loss and progress are logged.
pub fn train_loop<D: Dataset, M: Module, O: Optim>(
    dataloader: &mut DataLoader<D>,
    model: &M,
    optim: &mut O,
    log_interval: usize,
) -> Result<TrainReport, TrainError> {
    let size = dataloader.dataset().len();
    let batch_size = dataloader.batch_size();
    let mut report = TrainReport::default();

    for (batch, data) in dataloader.iter().enumerate() {
        let data = data?;
        // Compute prediction and loss
        let pred = model.forward(&data.images)?;
        let loss = CrossEntropyLoss::call(&pred, &data.labels)?;

        // Backpropagation
        loss.backward()?;
        optim.step();
        optim.zero_grad();

        let loss = loss.item();
        let progress = Progress::after_batch(batch, batch_size, data.len(), size);
        if log_interval > 0 && batch % log_interval == 0 {
            log::info!("loss: {:>7.6}  {}", loss, progress);
        }
        report.losses.push(loss);
        report.progress.push(progress);
    }
    Ok(report)
}

/// Evaluates the model on every test batch without recording a computation graph
pub fn test_loop<D: Dataset, M: Module>(
    dataloader: &mut DataLoader<D>,
    model: &M,
) -> Result<TestReport, TrainError> {
    let size = dataloader.dataset().len();
    let num_batches = dataloader.len();

    let (test_loss, correct) = no_grad(|| -> Result<(f32, usize), TrainError> {
        let mut test_loss = 0.0;
        let mut correct = 0;
        for data in dataloader.iter() {
            let data = data?;
            let pred = model.forward(&data.images)?;
            test_loss += CrossEntropyLoss::call(&pred, &data.labels)?.item();
            correct += count_correct(&pred.argmax_rows()?, &data.labels);
        }
        Ok((test_loss, correct))
    })?;

    Ok(TestReport {
        avg_loss: test_loss / num_batches.max(1) as f32,
        correct,
        size,
    })
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::{datasets::FakeData, device::Device, model::NeuralNetwork, optim::SGD};

    const IMAGE_SHAPE: [usize; 3] = [3, 4, 4];

    fn small_model(seed: u64) -> NeuralNetwork {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        NeuralNetwork::with_sizes(48, 16, 100, Device::Cpu, &mut rng).unwrap()
    }

    fn loader(size: usize, batch_size: usize, offset: u64) -> DataLoader<FakeData> {
        let dataset = FakeData::new(size, &IMAGE_SHAPE, 100, offset);
        DataLoader::seeded(dataset, batch_size, true, offset).unwrap()
    }

    #[test]
    fn test_epoch_progress() {
        let model = small_model(0);
        let mut optim = SGD::new(model.parameters(), 1e-3, 0.0);
        let mut train = loader(10000, 500, 1);
        let report = train_loop(&mut train, &model, &mut optim, 100).unwrap();

        assert_eq!(report.n_batches(), 20);
        assert_eq!(report.progress[0].to_string(), "[  500/10000]");
        assert_eq!(
            report.progress[19],
            Progress {
                current: 10000,
                total: 10000
            }
        );
        assert!(report.losses.iter().all(|l| l.is_finite()));
    }

    #[test]
    fn test_training_step_changes_parameters() {
        let model = small_model(1);
        let before = model
            .parameters()
            .iter()
            .map(|p| p.data().to_vec())
            .collect::<Vec<_>>();
        let mut optim = SGD::new(model.parameters(), 1e-3, 0.0);
        let mut train = loader(8, 8, 2);
        train_loop(&mut train, &model, &mut optim, 100).unwrap();

        let after = model
            .parameters()
            .iter()
            .map(|p| p.data().to_vec())
            .collect::<Vec<_>>();
        assert_ne!(before, after);
        // gradients are cleared after the step
        assert!(model.parameters().iter().all(|p| p.grad().iter().all(|g| *g == 0.0)));
    }

    #[test]
    fn test_seeded_runs_are_deterministic() {
        let run = || {
            let model = small_model(7);
            let mut optim = SGD::new(model.parameters(), 1e-3, 0.0);
            let mut train = loader(200, 50, 11);
            train_loop(&mut train, &model, &mut optim, 100)
                .unwrap()
                .losses
        };
        let first = run();
        assert_eq!(first.len(), 4);
        assert_eq!(first, run());
    }

    #[test]
    fn test_loop_accuracy_in_range() {
        let model = small_model(5);
        let mut test = loader(300, 128, 3);
        let report = test_loop(&mut test, &model).unwrap();
        assert_eq!(report.size, 300);
        assert!(report.correct <= 300);
        assert!((0.0..=1.0).contains(&report.accuracy()));
        assert!(report.avg_loss.is_finite());
        // evaluation does not leave gradients behind
        assert!(model.parameters().iter().all(|p| p.grad().iter().all(|g| *g == 0.0)));
    }

    #[test]
    fn test_accuracy() {
        assert_eq!(accuracy(0, 0), 0.0);
        assert_eq!(accuracy(5, 10), 0.5);
        assert_eq!(accuracy(10, 10), 1.0);
        assert_eq!(count_correct(&[1, 2, 3], &[1, 0, 3]), 2);
    }

    #[test]
    fn test_mean_loss() {
        let report = TrainReport {
            losses: vec![1.0, 2.0, 4.5],
            progress: vec![],
        };
        assert_eq!(report.n_batches(), 3);
        assert_eq!(report.mean_loss(), 2.5);
        assert!(TrainReport::default().mean_loss().is_nan());
    }

    #[test]
    fn test_report_display() {
        let report = TestReport {
            avg_loss: 4.6,
            correct: 123,
            size: 10000,
        };
        assert_eq!(
            report.to_string(),
            "Test Error: \n Accuracy: 1.2%, Avg loss: 4.600000 \n"
        );
    }
}
