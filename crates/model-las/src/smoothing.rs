//! Логарифм распределения с равномерным «полом».

use candle_core::{D, Module, Result, Tensor};

/// `log((1 - floor) * x + floor / V)` по последней оси.
///
/// Нулевые вероятности превращаются в конечный `log(floor / V)`, а не в `-inf`.
#[derive(Debug, Clone, Copy)]
pub struct LogWithLabelSmoothing {
    floor: f64,
}

impl Default for LogWithLabelSmoothing {
    fn default() -> Self {
        Self { floor: 0.01 }
    }
}

impl LogWithLabelSmoothing {
    pub fn new(floor: f64) -> Self {
        Self { floor }
    }
}

impl Module for LogWithLabelSmoothing {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let num_classes = x.dim(D::Minus1)?;
        x.affine(1.0 - self.floor, self.floor / num_classes as f64)?
            .log()
    }
}
