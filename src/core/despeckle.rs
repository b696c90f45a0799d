use crate::types::{FlowError, FlowResult, VelocityImage};
use ndarray::{Array2, Zip};

/// Median despeckle parameters
#[derive(Debug, Clone)]
pub struct DespeckleParams {
    /// Filter window size (must be odd)
    pub window_size: usize,
}

impl Default for DespeckleParams {
    fn default() -> Self {
        Self { window_size: 3 }
    }
}

/// NaN-aware median filter for velocity fields.
///
/// No-data pixels stay no-data; every finite pixel is replaced by the median of the finite
/// pixels in its window (clipped at the image border).
pub struct Despeckle {
    params: DespeckleParams,
}

impl Despeckle {
    pub fn new() -> Self {
        Self {
            params: DespeckleParams::default(),
        }
    }

    pub fn with_params(params: DespeckleParams) -> Self {
        Self { params }
    }

    pub fn apply(&self, image: &VelocityImage) -> FlowResult<VelocityImage> {
        if self.params.window_size % 2 == 0 || self.params.window_size == 0 {
            return Err(FlowError::Processing(format!(
                "Despeckle window size must be odd, got {}",
                self.params.window_size
            )));
        }

        let (height, width) = image.dim();
        let half_window = self.params.window_size / 2;
        let mut filtered = Array2::from_elem((height, width), f32::NAN);

        Zip::indexed(&mut filtered).par_for_each(|(i, j), out| {
            if !image[[i, j]].is_finite() {
                return;
            }

            let i_start = i.saturating_sub(half_window);
            let i_end = (i + half_window + 1).min(height);
            let j_start = j.saturating_sub(half_window);
            let j_end = (j + half_window + 1).min(width);

            let mut window_values = Vec::with_capacity(self.params.window_size * self.params.window_size);
            for wi in i_start..i_end {
                for wj in j_start..j_end {
                    let v = image[[wi, wj]];
                    if v.is_finite() {
                        window_values.push(v);
                    }
                }
            }
            *out = median_in_place(&mut window_values).unwrap_or(f32::NAN);
        });

        Ok(filtered)
    }
}

impl Default for Despeckle {
    fn default() -> Self {
        Self::new()
    }
}

/// 3x3 NaN-aware median despeckle
pub fn despeckle(image: &VelocityImage) -> FlowResult<VelocityImage> {
    Despeckle::new().apply(image)
}

/// Median of finite values; even counts average the two middle values. `None` if empty.
pub fn median_in_place(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Per-pixel median across a stack of grid-aligned rasters, ignoring NaN.
///
/// Pixels that are NaN in every layer stay NaN. All layers must share one shape.
pub fn nanmedian_stack(stack: &[VelocityImage]) -> FlowResult<VelocityImage> {
    let first = stack
        .first()
        .ok_or_else(|| FlowError::Processing("Cannot take the median of an empty stack".to_string()))?;
    let shape = first.dim();
    for (i, layer) in stack.iter().enumerate() {
        if layer.dim() != shape {
            return Err(FlowError::GridMismatch(format!(
                "stack layer {} has shape {:?}, expected {:?}",
                i,
                layer.dim(),
                shape
            )));
        }
    }

    let mut median = Array2::from_elem(shape, f32::NAN);
    Zip::indexed(&mut median).par_for_each(|idx, out| {
        let mut values: Vec<f32> = stack
            .iter()
            .map(|layer| layer[idx])
            .filter(|v| v.is_finite())
            .collect();
        if let Some(m) = median_in_place(&mut values) {
            *out = m;
        }
    });

    Ok(median)
}
