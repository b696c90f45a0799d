//! Off-ice error statistics.
//!
//! Exposed bedrock does not move, so whatever velocity remains over rock after correction
//! is the field's error.

use crate::types::{MaskImage, VelocityImage};
use ndarray::Zip;

/// Error statistics over rock pixels. `None` where no rock pixel has a finite value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RockStatistics {
    pub mag_rmse: Option<f64>,
    pub dx_mean: Option<f64>,
    pub dx_sd: Option<f64>,
    pub dy_mean: Option<f64>,
    pub dy_sd: Option<f64>,
}

/// Rock statistics in velocity and in displacement units
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OffIceUncertainty {
    /// m/day
    pub velocity: RockStatistics,
    /// m over the field's day separation
    pub displacement: RockStatistics,
}

/// Streaming mean / population standard deviation
#[derive(Debug, Clone, Copy, Default)]
struct Moments {
    n: usize,
    sum: f64,
    sum_sq: f64,
}

impl Moments {
    fn push(&mut self, v: f64) {
        self.n += 1;
        self.sum += v;
        self.sum_sq += v * v;
    }

    fn mean(&self) -> Option<f64> {
        (self.n > 0).then(|| self.sum / self.n as f64)
    }

    fn sd(&self) -> Option<f64> {
        let mean = self.mean()?;
        let var = (self.sum_sq / self.n as f64 - mean * mean).max(0.0);
        Some(var.sqrt())
    }

    fn rms(&self) -> Option<f64> {
        (self.n > 0).then(|| (self.sum_sq / self.n as f64).sqrt())
    }
}

/// Statistics of `scale * (dx, dy)` over pixels where `rock == 1`
pub fn rock_statistics(dx: &VelocityImage, dy: &VelocityImage, rock: &MaskImage, scale: f64) -> RockStatistics {
    let mut x = Moments::default();
    let mut y = Moments::default();
    let mut mag = Moments::default();

    Zip::from(dx).and(dy).and(rock).for_each(|&vx, &vy, &r| {
        if r != 1 {
            return;
        }
        let vx = vx as f64 * scale;
        let vy = vy as f64 * scale;
        if vx.is_finite() {
            x.push(vx);
        }
        if vy.is_finite() {
            y.push(vy);
        }
        let m = (vx * vx + vy * vy).sqrt();
        if m.is_finite() {
            mag.push(m);
        }
    });

    RockStatistics {
        mag_rmse: mag.rms(),
        dx_mean: x.mean(),
        dx_sd: x.sd(),
        dy_mean: y.mean(),
        dy_sd: y.sd(),
    }
}

pub fn off_ice_uncertainty(
    dx: &VelocityImage,
    dy: &VelocityImage,
    rock: &MaskImage,
    day_sep: f64,
) -> OffIceUncertainty {
    OffIceUncertainty {
        velocity: rock_statistics(dx, dy, rock, 1.0),
        displacement: rock_statistics(dx, dy, rock, day_sep),
    }
}
