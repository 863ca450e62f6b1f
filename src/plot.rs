//! Training curve plots

use std::error::Error;

use plotters::{
    chart::ChartBuilder,
    prelude::{BitMapBackend, IntoDrawingArea, LineSeries, PathElement},
    style::{BLACK, BLUE, Color, RED, WHITE},
};

/// Per epoch summary kept for plotting
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    /// one based
    pub epoch: usize,
    pub train_loss: f32,
    pub test_loss: f32,
    /// in `[0, 1]`
    pub accuracy: f32,
}

/// Plots train/test loss (top) and test accuracy (bottom) over epochs
pub fn plot_history(history: &[EpochSummary], file_name: &str) -> Result<(), Box<dyn Error>> {
    let root_area = BitMapBackend::new(file_name, (800, 800)).into_drawing_area();
    root_area.fill(&WHITE)?;
    let (upper, lower) = root_area.split_vertically(400);

    let n_epochs = history.len().max(2);
    let max_loss = history
        .iter()
        .flat_map(|s| [s.train_loss, s.test_loss])
        .filter(|l| l.is_finite())
        .fold(0.0f32, f32::max)
        .max(1e-3)
        * 1.1;

    let mut chart = ChartBuilder::on(&upper)
        .caption("Loss", ("sans-serif", 30))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(50)
        .build_cartesian_2d(1usize..n_epochs, 0.0f32..max_loss)?;
    chart.configure_mesh().x_desc("epoch").draw()?;
    chart
        .draw_series(LineSeries::new(
            history.iter().map(|s| (s.epoch, s.train_loss)),
            &RED,
        ))?
        .label("train")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));
    chart
        .draw_series(LineSeries::new(
            history.iter().map(|s| (s.epoch, s.test_loss)),
            &BLUE,
        ))?
        .label("test")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));
    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    let mut chart = ChartBuilder::on(&lower)
        .caption("Test accuracy (%)", ("sans-serif", 30))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(50)
        .build_cartesian_2d(1usize..n_epochs, 0.0f32..100.0f32)?;
    chart.configure_mesh().x_desc("epoch").draw()?;
    chart.draw_series(LineSeries::new(
        history.iter().map(|s| (s.epoch, 100.0 * s.accuracy)),
        BLUE.filled(),
    ))?;

    root_area.present()?;
    log::info!("Training curves saved to '{}'.", file_name);
    Ok(())
}
