//! Входные батчи модели.

use candle_core::Tensor;

use crate::error::{LasError, LasResult};

/// Батч акустических признаков.
///
/// `features`: `[batch, channels, freq, time]`, `lengths[b]`: число валидных
/// фреймов сэмпла `b`. Сортировка по длине не требуется.
#[derive(Debug, Clone)]
pub struct AcousticBatch {
    pub features: Tensor,
    pub lengths: Vec<usize>,
}

impl AcousticBatch {
    pub fn new(features: Tensor, lengths: Vec<usize>) -> LasResult<Self> {
        let (batch, _, _, time) = features.dims4()?;
        if lengths.len() != batch {
            return Err(LasError::Data(format!(
                "lengths ({}) не совпадает с размером батча ({batch})",
                lengths.len()
            )));
        }
        if let Some(&bad) = lengths.iter().find(|&&l| l == 0 || l > time) {
            return Err(LasError::Data(format!(
                "длина {bad} вне диапазона [1, {time}]"
            )));
        }
        Ok(Self { features, lengths })
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }
}

/// Батч целевых меток: все последовательности склеены подряд.
#[derive(Debug, Clone)]
pub struct LabelBatch {
    pub labels: Vec<u32>,
    pub lengths: Vec<usize>,
}

impl LabelBatch {
    pub fn new(labels: Vec<u32>, lengths: Vec<usize>) -> LasResult<Self> {
        let total: usize = lengths.iter().sum();
        if total != labels.len() {
            return Err(LasError::Data(format!(
                "сумма длин меток ({total}) не совпадает с числом меток ({})",
                labels.len()
            )));
        }
        Ok(Self { labels, lengths })
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    /// Последовательности по сэмплам.
    pub fn split(&self) -> Vec<&[u32]> {
        let mut out = Vec::with_capacity(self.lengths.len());
        let mut offset = 0;
        for &len in &self.lengths {
            out.push(&self.labels[offset..offset + len]);
            offset += len;
        }
        out
    }
}
