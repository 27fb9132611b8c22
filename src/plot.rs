use plotters::prelude::*;
use std::path::Path;

/// 2次元の場 (`nx * ny` 個、x が外側のループ) をヒートマップとしてPNGファイルに出力します。
///
/// 色は最小値が青、最大値が赤になるよう線形に割り当てます。
pub fn plot_heatmap(
    path: &Path,
    title: &str,
    values: &[f64],
    nx: usize,
    ny: usize,
    domain: (f64, f64),
) -> Result<(), Box<dyn std::error::Error>> {
    if values.len() != nx * ny || nx == 0 || ny == 0 {
        return Err(format!(
            "ヒートマップの値の数 {} が格子 {}x{} と一致しません。",
            values.len(),
            nx,
            ny
        )
        .into());
    }
    let (lower, upper) = domain;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = if max > min { max - min } else { 1.0 };
    let cell_x = (upper - lower) / nx as f64;
    let cell_y = (upper - lower) / ny as f64;

    let root = BitMapBackend::new(path, (800, 700)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 30).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(lower..upper, lower..upper)?;
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc("x")
        .y_desc("y")
        .draw()?;
    chart.draw_series((0..nx).flat_map(|i| (0..ny).map(move |j| (i, j))).map(|(i, j)| {
        let t = (values[i * ny + j] - min) / span;
        let x0 = lower + i as f64 * cell_x;
        let y0 = lower + j as f64 * cell_y;
        Rectangle::new(
            [(x0, y0), (x0 + cell_x, y0 + cell_y)],
            HSLColor(2.0 / 3.0 * (1.0 - t), 0.8, 0.5).filled(),
        )
    }))?;
    root.present()?;
    Ok(())
}
