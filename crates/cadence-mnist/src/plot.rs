//! Loss and accuracy curves, train against validation.

use std::path::Path;

use crate::trainer::Curve;

#[cfg(feature = "plots")]
pub fn plot_curves<P: AsRef<Path>>(path: P, train: &Curve, valid: &Curve) -> anyhow::Result<()> {
    use plotters::prelude::*;

    let root = SVGBackend::new(path.as_ref(), (1200, 480)).into_drawing_area();
    root.fill(&WHITE)?;
    let panels = root.split_evenly((1, 2));

    let last_step = train
        .steps
        .iter()
        .chain(&valid.steps)
        .copied()
        .fold(1.0f64, f64::max);

    let metrics: [(&str, fn(&Curve) -> &[f64]); 2] =
        [("Loss", |c| c.loss.as_slice()), ("Accuracy", |c| c.accuracy.as_slice())];
    for (area, (name, values)) in panels.iter().zip(metrics) {
        let y_max = values(train)
            .iter()
            .chain(values(valid))
            .copied()
            .filter(|v| v.is_finite())
            .fold(0.0f64, f64::max)
            .max(1e-3)
            * 1.05;
        let mut chart = ChartBuilder::on(area)
            .margin(20)
            .caption(name, ("sans-serif", 22))
            .x_label_area_size(45)
            .y_label_area_size(55)
            .build_cartesian_2d(0.0..last_step, 0.0..y_max)?;
        chart.configure_mesh().x_desc("step").y_desc(name).draw()?;

        for (label, curve, color) in [("train", train, BLUE), ("valid", valid, RED)] {
            let series: Vec<(f64, f64)> = curve
                .steps
                .iter()
                .copied()
                .zip(values(curve).iter().copied())
                .collect();
            chart
                .draw_series(LineSeries::new(series, &color))?
                .label(label)
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color.filled()));
        }
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()?;
    }
    root.present()?;
    Ok(())
}

#[cfg(not(feature = "plots"))]
pub fn plot_curves<P: AsRef<Path>>(_path: P, _train: &Curve, _valid: &Curve) -> anyhow::Result<()> {
    anyhow::bail!("plots feature is not enabled")
}
