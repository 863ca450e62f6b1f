//! Trains the fully connected classifier on synthetic 3x224x224 images
//! using the library provided by `fakedata_mlp`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run --release
//! cargo run --release -- -h
//! ```
//!
//! Without arguments it runs the full 500 epoch schedule. Flags shrink the run,
//! fix the seeds or write training curves.

use std::{error::Error, time::Instant};

use fakedata_mlp::{
    dataloader::DataLoader,
    datasets::FakeData,
    device::Device,
    model::{NUM_CLASSES, NeuralNetwork},
    nn::Module,
    optim::SGD,
    plot::{EpochSummary, plot_history},
    train::{TrainError, test_loop, train_loop},
};

use clap::Parser;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = 500)]
    epochs: usize,
    /// Training batch size, evaluation uses twice as many samples per batch
    #[clap(short, long, default_value_t = 500)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 1e-3)]
    lr: f32,
    #[clap(short, long, default_value_t = 0.0)]
    momentum: f32,
    /// Samples in each of the train and test sets
    #[clap(long, default_value_t = 10000)]
    dataset_size: usize,
    /// Log the training loss every this many batches
    #[clap(long, default_value_t = 100)]
    log_interval: usize,
    /// Seeds data generation, initialization and shuffling for reproducible runs
    #[clap(long)]
    seed: Option<u64>,
    /// Compute threads, detected when omitted
    #[clap(long)]
    threads: Option<usize>,
    /// Write loss and accuracy curves to this directory after training
    #[clap(long)]
    plot_dir: Option<String>,
}

/// Builds the data, model and optimizer, then trains for `args.epochs` epochs.
/// Meant to run inside the device's thread pool.
fn run(args: &Args, device: Device) -> Result<Vec<EpochSummary>, TrainError> {
    let image_shape = FakeData::DEFAULT_IMAGE_SHAPE;
    let (training_data, test_data) = match args.seed {
        // the test set starts far enough along the stream not to share samples with the train set
        Some(seed) => (
            FakeData::new(args.dataset_size, &image_shape, NUM_CLASSES, seed),
            FakeData::new(
                args.dataset_size,
                &image_shape,
                NUM_CLASSES,
                seed.wrapping_add(1 << 32),
            ),
        ),
        None => (
            FakeData::random(args.dataset_size, &image_shape, NUM_CLASSES),
            FakeData::random(args.dataset_size, &image_shape, NUM_CLASSES),
        ),
    };

    let batch_size = args.batch_size;
    let (mut train_dataloader, mut test_dataloader, mut rng) = match args.seed {
        Some(seed) => (
            DataLoader::seeded(training_data, batch_size, true, seed)?,
            DataLoader::seeded(test_data, batch_size * 2, true, seed.wrapping_add(1))?,
            Pcg64Mcg::seed_from_u64(seed),
        ),
        None => (
            DataLoader::new(training_data, batch_size, true)?,
            DataLoader::new(test_data, batch_size * 2, true)?,
            Pcg64Mcg::from_rng(&mut rand::rng()),
        ),
    };

    let model = NeuralNetwork::new(device, &mut rng)?;
    log::info!("{}", model);

    let epochs = args.epochs;
    let mut optimizer = SGD::new(model.parameters(), args.lr, args.momentum);
    log::debug!("SGD with lr {} and momentum {}", optimizer.lr(), args.momentum);

    let mut history = Vec::with_capacity(epochs);

    for t in 0..epochs {
        log::info!("Epoch {}\n-------------------------------", t + 1);
        let train_report = train_loop(
            &mut train_dataloader,
            &model,
            &mut optimizer,
            args.log_interval,
        )?;
        log::debug!(
            "dead ReLU units after epoch {}: {:?}",
            t + 1,
            model.n_dead_neurons()
        );
        let test_report = test_loop(&mut test_dataloader, &model)?;
        log::info!("{}", test_report);
        history.push(EpochSummary {
            epoch: t + 1,
            train_loss: train_report.mean_loss(),
            test_loss: test_report.avg_loss,
            accuracy: test_report.accuracy(),
        });
    }
    Ok(history)
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let args = Args::parse();

    let device = args.threads.map_or_else(Device::detect, Device::with_threads);
    log::info!("Using {} device", device);

    // every rayon task (data generation and matrix products) runs on the device's workers
    let pool = device.thread_pool()?;
    let start_time = Instant::now();
    let history = pool.install(|| run(&args, device))?;
    log::info!(
        "Done! It took {} seconds to train",
        start_time.elapsed().as_secs_f64()
    );

    if let Some(plot_dir) = args.plot_dir {
        std::fs::create_dir_all(&plot_dir)?;
        plot_history(&history, &format!("{}/training_curves.png", plot_dir))?;
    }
    Ok(())
}
