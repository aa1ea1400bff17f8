//! Свёрточно-рекуррентный энкодер (Listener).
//!
//! Архитектура:
//! - 3 × {Conv2d (11×3, pad 5×1) → LeakyReLU → AvgPool (3, stride 2, pad 1) → BatchNorm2d},
//!   каналы `C0 → c → 2c → 4c`
//! - reshape `[B, C, F, T] → [B, T, C·F]`
//! - многослойный двунаправленный LSTM с учётом длин, направления суммируются
//! - опционально по-шаговая проекция Linear → LeakyReLU → LayerNorm
//!
//! Весовые ключи:
//! - feature.cv{1,2,3}.{weight,bias}, feature.bn{1,2,3}.{weight,bias,running_mean,running_var}
//! - rnns.weight_ih_l{i}[_reverse], ...
//! - fc.fc1.weight

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{Activation, BatchNorm, BatchNormConfig, Linear, VarBuilder, batch_norm};
use tracing::{debug, info};

use las_core::config::{
    CONV_KERNEL, CONV_PADDING, NUM_CONV_STAGES, POOL_KERNEL, POOL_PADDING, POOL_STRIDE,
};
use las_core::{LasResult, ListenerConfig, PoolAxis};

use crate::layers::{Conv2dRect, LayerNorm, SequenceLstm, TimeDistributed, length_mask};

const LEAKY_SLOPE: f64 = 0.01;

/// Одна стадия свёрточной части.
#[derive(Debug, Clone)]
struct ConvStage {
    conv: Conv2dRect,
    norm: BatchNorm,
}

/// Проекция на выходе энкодера: Linear (без bias) → LeakyReLU → LayerNorm.
#[derive(Debug, Clone)]
struct ListenerProjection {
    fc1: Linear,
    norm: LayerNorm,
}

impl Module for ListenerProjection {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.fc1.forward(x)?;
        let x = Activation::LeakyRelu(LEAKY_SLOPE).forward(&x)?;
        self.norm.forward(&x)
    }
}

/// Энкодер LAS.
#[derive(Debug, Clone)]
pub struct Listener {
    config: ListenerConfig,
    stages: Vec<ConvStage>,
    rnns: SequenceLstm,
    fc: Option<TimeDistributed<ListenerProjection>>,
}

impl Listener {
    pub fn load(config: ListenerConfig, vb: VarBuilder) -> LasResult<Self> {
        config.validate()?;

        let feature_vb = vb.pp("feature");
        let mut stages = Vec::with_capacity(NUM_CONV_STAGES);
        let mut in_channels = config.in_channels;
        let mut out_channels = config.conv_channels;
        for i in 1..=NUM_CONV_STAGES {
            let conv = Conv2dRect::load(
                in_channels,
                out_channels,
                CONV_KERNEL,
                CONV_PADDING,
                feature_vb.pp(format!("cv{i}")),
            )?;
            let bn_config = BatchNormConfig {
                eps: config.batch_norm_eps,
                ..Default::default()
            };
            let norm = batch_norm(out_channels, bn_config, feature_vb.pp(format!("bn{i}")))?;
            stages.push(ConvStage { conv, norm });
            in_channels = out_channels;
            out_channels *= 2;
        }

        let rnns = SequenceLstm::load(
            config.rnn_input_size(),
            config.rnn_hidden_size,
            config.rnn_num_layers,
            config.bidirectional,
            vb.pp("rnns"),
        )?;

        let fc = if config.last_fc {
            let fc1 = candle_nn::linear_no_bias(
                config.rnn_hidden_size,
                config.listen_vec_size,
                vb.pp("fc").pp("fc1"),
            )?;
            Some(TimeDistributed::new(ListenerProjection {
                fc1,
                norm: LayerNorm::no_affine(1e-5),
            }))
        } else {
            None
        };

        info!(
            "Listener: {} каналов × {} бинов → LSTM {}×{} (bidirectional={}) → {}",
            config.out_channels(),
            config.freq_out(),
            config.rnn_num_layers,
            config.rnn_hidden_size,
            config.bidirectional,
            config.listen_vec_size
        );

        Ok(Self {
            config,
            stages,
            rnns,
            fc,
        })
    }

    pub fn output_dim(&self) -> usize {
        self.config.listen_vec_size
    }

    fn pool(&self, x: &Tensor) -> Result<Tensor> {
        match self.config.pool_axis {
            PoolAxis::Frequency => x
                .pad_with_zeros(2, POOL_PADDING, POOL_PADDING)?
                .avg_pool2d_with_stride((POOL_KERNEL, 1), (POOL_STRIDE, 1)),
            PoolAxis::Time => x
                .pad_with_zeros(3, POOL_PADDING, POOL_PADDING)?
                .avg_pool2d_with_stride((1, POOL_KERNEL), (1, POOL_STRIDE)),
        }
    }

    /// Forward: `[B, C, F, T]` + длины → (`[B, T', listen_vec_size]`, длины T').
    ///
    /// `train` переключает BatchNorm между статистиками батча и накопленными.
    pub fn forward(
        &self,
        x: &Tensor,
        lengths: &[usize],
        train: bool,
    ) -> Result<(Tensor, Vec<usize>)> {
        let mut h = x.clone();
        for stage in &self.stages {
            h = stage.conv.forward(&h)?;
            h = Activation::LeakyRelu(LEAKY_SLOPE).forward(&h)?;
            h = self.pool(&h)?;
            h = stage.norm.forward_t(&h, train)?;
        }

        // [B, C, F, T] → [B, T, C·F]
        let (batch, channels, freq, time) = h.dims4()?;
        let y = h
            .reshape((batch, channels * freq, time))?
            .transpose(1, 2)?
            .contiguous()?;

        let out_lengths: Vec<usize> = lengths
            .iter()
            .map(|&len| self.config.encoded_len(len).min(time))
            .collect();
        let mask = length_mask(&out_lengths, time, y.device())?.to_dtype(y.dtype())?;

        let y = self.rnns.forward(&y, &mask)?;
        let y = match &self.fc {
            Some(fc) => fc.forward(&y)?,
            None => y,
        };

        debug!("Listener: {:?} → {:?}", x.dims(), y.dims());
        Ok((y, out_lengths))
    }
}
