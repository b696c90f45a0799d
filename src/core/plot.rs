//! Diagnostic plots: orbit-pair counts, velocity and offset maps.
//!
//! Plotting never decides the outcome of a run; callers pass results through [`try_plot`].

use crate::types::{FlowError, FlowResult, GridContext, OrbitPair, VelocityImage};
use plotters::prelude::*;
use std::collections::BTreeMap;
use std::path::Path;

/// Longest raster side drawn at full resolution; larger rasters are strided
const MAX_PLOT_CELLS: usize = 600;

fn plot_err<E: std::fmt::Display>(e: E) -> FlowError {
    FlowError::Plot(e.to_string())
}

/// Log a failed plot and carry on
pub fn try_plot(result: FlowResult<()>) {
    if let Err(e) = result {
        log::warn!("Plot not written: {}", e);
    }
}

/// Piecewise-linear colour scales
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colormap {
    Turbo,
    Viridis,
}

const TURBO_STOPS: [(u8, u8, u8); 9] = [
    (48, 18, 59),
    (70, 107, 227),
    (40, 187, 236),
    (50, 242, 152),
    (164, 252, 60),
    (237, 208, 58),
    (251, 128, 34),
    (210, 49, 5),
    (122, 4, 3),
];

const VIRIDIS_STOPS: [(u8, u8, u8); 9] = [
    (68, 1, 84),
    (71, 44, 122),
    (59, 81, 139),
    (44, 113, 142),
    (33, 144, 141),
    (39, 173, 129),
    (92, 200, 99),
    (170, 220, 50),
    (253, 231, 37),
];

impl Colormap {
    fn stops(&self) -> &'static [(u8, u8, u8)] {
        match self {
            Colormap::Turbo => &TURBO_STOPS,
            Colormap::Viridis => &VIRIDIS_STOPS,
        }
    }

    /// Colour at `t`, clamped to [0, 1]
    pub fn color(&self, t: f64) -> RGBColor {
        let stops = self.stops();
        let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
        let pos = t * (stops.len() - 1) as f64;
        let i = (pos.floor() as usize).min(stops.len() - 2);
        let f = pos - i as f64;
        let lerp = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * f).round() as u8;
        let (a, b) = (stops[i], stops[i + 1]);
        RGBColor(lerp(a.0, b.0), lerp(a.1, b.1), lerp(a.2, b.2))
    }
}

/// Bar chart of record counts per orbit pair, in key order
pub fn plot_pair_counts(counts: &BTreeMap<OrbitPair, usize>, path: &Path) -> FlowResult<()> {
    if counts.is_empty() {
        return Ok(());
    }
    let keys: Vec<&OrbitPair> = counts.keys().collect();
    let max_count = counts.values().copied().max().unwrap_or(1);

    let root = BitMapBackend::new(path, (1200, 800)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(15)
        .x_label_area_size(90)
        .y_label_area_size(60)
        .build_cartesian_2d((0..keys.len()).into_segmented(), 0..max_count + 1)
        .map_err(plot_err)?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_desc("Orbital pairing")
        .y_desc("Count")
        .x_labels(keys.len())
        .x_label_formatter(&|v| match v {
            SegmentValue::CenterOf(i) => keys.get(*i).map(|k| k.to_string()).unwrap_or_default(),
            _ => String::new(),
        })
        .x_label_style(
            ("sans-serif", 14)
                .into_font()
                .transform(FontTransform::Rotate90),
        )
        .draw()
        .map_err(plot_err)?;

    chart
        .draw_series(
            Histogram::vertical(&chart)
                .style(BLUE.filled())
                .margin(8)
                .data(counts.values().enumerate().map(|(i, &c)| (i, c))),
        )
        .map_err(plot_err)?;

    root.present().map_err(plot_err)?;
    log::debug!("Wrote pair-count chart: {}", path.display());
    Ok(())
}

/// Velocity magnitude map (turbo, 0..vmax, m/day)
pub fn plot_velocity_map(
    image: &VelocityImage,
    grid: &GridContext,
    vmax: f32,
    title: &str,
    outputs: &[&Path],
) -> FlowResult<()> {
    draw_raster(image, grid, vmax as f64, Colormap::Turbo, title, "Velocity [m/d]", outputs)
}

/// Offset magnitude map (viridis, 0..vmax, m)
pub fn plot_offset_map(
    image: &VelocityImage,
    grid: &GridContext,
    vmax: f32,
    title: &str,
    outputs: &[&Path],
) -> FlowResult<()> {
    draw_raster(
        image,
        grid,
        vmax as f64,
        Colormap::Viridis,
        title,
        "Displacement from expected flow [m]",
        outputs,
    )
}

/// Render once to the first output and copy to the rest
fn draw_raster(
    image: &VelocityImage,
    grid: &GridContext,
    vmax: f64,
    colormap: Colormap,
    title: &str,
    units: &str,
    outputs: &[&Path],
) -> FlowResult<()> {
    let (first, rest) = outputs
        .split_first()
        .ok_or_else(|| FlowError::Plot("No output path for plot".to_string()))?;
    let vmax = if vmax > 0.0 { vmax } else { 1.0 };
    let (rows, cols) = image.dim();
    let b = grid.bounds;
    let px = grid.pixel_size;
    let step = (rows.max(cols) / MAX_PLOT_CELLS).max(1);
    let cell = px * step as f64;

    {
        let root = BitMapBackend::new(first, (1000, 800)).into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;
        let (map_area, bar_area) = root.split_horizontally(860);

        let mut chart = ChartBuilder::on(&map_area)
            .caption(title, ("sans-serif", 20))
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(80)
            .build_cartesian_2d(b.min_x..b.max_x, b.min_y..b.max_y)
            .map_err(plot_err)?;

        chart
            .configure_mesh()
            .disable_mesh()
            .x_labels(5)
            .y_labels(5)
            .x_label_formatter(&|x| format!("{:.0}", x))
            .y_label_formatter(&|y| format!("{:.0}", y))
            .label_style(("sans-serif", 12))
            .draw()
            .map_err(plot_err)?;

        chart
            .draw_series(
                (0..rows)
                    .step_by(step)
                    .flat_map(|r| (0..cols).step_by(step).map(move |c| (r, c)))
                    .filter_map(|(r, c)| {
                        let v = image[[r, c]];
                        if !v.is_finite() {
                            return None;
                        }
                        let x0 = b.min_x + c as f64 * px;
                        let y0 = b.max_y - r as f64 * px;
                        let x1 = (x0 + cell).min(b.max_x);
                        let y1 = (y0 - cell).max(b.min_y);
                        let color = colormap.color(v as f64 / vmax);
                        Some(Rectangle::new([(x0, y0), (x1, y1)], color.filled()))
                    }),
            )
            .map_err(plot_err)?;

        let mut bar = ChartBuilder::on(&bar_area)
            .margin_top(40)
            .margin_bottom(40)
            .margin_right(10)
            .y_label_area_size(50)
            .build_cartesian_2d(0.0..1.0, 0.0..vmax)
            .map_err(plot_err)?;
        bar.configure_mesh()
            .disable_mesh()
            .disable_x_axis()
            .y_desc(units)
            .label_style(("sans-serif", 12))
            .draw()
            .map_err(plot_err)?;
        let levels = 100;
        bar.draw_series((0..levels).map(|i| {
            let lo = vmax * i as f64 / levels as f64;
            let hi = vmax * (i + 1) as f64 / levels as f64;
            let color = colormap.color((i as f64 + 0.5) / levels as f64);
            Rectangle::new([(0.0, lo), (1.0, hi)], color.filled())
        }))
        .map_err(plot_err)?;

        root.present().map_err(plot_err)?;
    }

    for extra in rest {
        std::fs::copy(first, extra)?;
    }
    log::debug!("Wrote map: {}", first.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_colormap_endpoints_and_clamp() {
        assert_eq!(Colormap::Viridis.color(0.0), RGBColor(68, 1, 84));
        assert_eq!(Colormap::Viridis.color(1.0), RGBColor(253, 231, 37));
        assert_eq!(Colormap::Turbo.color(-3.0), Colormap::Turbo.color(0.0));
        assert_eq!(Colormap::Turbo.color(7.0), Colormap::Turbo.color(1.0));
        assert_eq!(Colormap::Turbo.color(f64::NAN), Colormap::Turbo.color(0.0));
    }

    #[test]
    fn test_colormap_interpolates() {
        // Halfway between the first two turbo stops
        assert_eq!(Colormap::Turbo.color(0.0625), RGBColor(59, 63, 143));
    }
}
