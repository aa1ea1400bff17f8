//! Механизмы внимания декодера.
//!
//! - [`DotProductAttention`]: dot-product между состоянием декодера и выходом
//!   энкодера, одна или несколько голов, маскированный softmax.
//! - [`MultiHeadSelfAttention`]: scaled dot-product с аддитивной маской и dropout.
//!
//! Оба варианта доступны через [`AttentionMechanism`] с одинаковым контрактом:
//! query `[B, S, Hq]`, keys `[B, T, Hk]` → (context `[B, S, Hc]`, weights `[B, heads, S, T]`).

use candle_core::{D, Module, Result, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder, linear, linear_no_bias};

use las_core::{AttentionConfig, AttentionKind};

/// Softmax по последней оси, обнуляющий веса на позициях паддинга.
///
/// `shift = e - max(e)` (максимум строки по валидным позициям), `exps = exp(shift) * mask`,
/// `exps / (sum(exps) + epsilon)`. Даже для нулевой маски результат конечен.
#[derive(Debug, Clone, Copy)]
pub struct MaskedSoftmax {
    epsilon: f64,
}

impl Default for MaskedSoftmax {
    fn default() -> Self {
        Self { epsilon: 1e-5 }
    }
}

impl MaskedSoftmax {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }

    /// e: `[B, ..., T]`, mask: `[B, T]`.
    pub fn forward(&self, e: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let Some(mask) = mask else {
            return candle_nn::ops::softmax_last_dim(e);
        };

        let rank = e.rank();
        let (batch, time) = mask.dims2()?;
        let mut shape = vec![1usize; rank];
        shape[0] = batch;
        shape[rank - 1] = time;
        let mask = mask.to_dtype(e.dtype())?.reshape(shape)?;

        // Максимум по валидным позициям строки: замаскированные сдвигаются к минимуму строки.
        let min = e.min_keepdim(D::Minus1)?;
        let valid = e.broadcast_sub(&min)?.broadcast_mul(&mask)?.broadcast_add(&min)?;
        let max = valid.max_keepdim(D::Minus1)?;
        // shift <= 0 и на замаскированных позициях, чтобы exp не переполнялся.
        let shift = e.broadcast_sub(&max)?;
        let shift = (&shift - shift.relu()?)?;
        let exps = shift.exp()?.broadcast_mul(&mask)?;
        let sums = (exps.sum_keepdim(D::Minus1)? + self.epsilon)?;
        exps.broadcast_div(&sums)
    }
}

/// Dot-product внимание «состояние декодера → выход энкодера».
///
/// Проекции:
/// - phi: Linear(state_vec_size, proj_hidden_size * num_heads) с bias
/// - psi: Linear(listen_vec_size, proj_hidden_size) без bias, паддинг энкодера остаётся нулевым
/// - reduce: Linear(listen_vec_size * num_heads, listen_vec_size), только для heads > 1
#[derive(Debug, Clone)]
pub struct DotProductAttention {
    phi: Option<Linear>,
    psi: Option<Linear>,
    reduce: Option<Linear>,
    num_heads: usize,
    scale_scores: bool,
    normal: MaskedSoftmax,
}

impl DotProductAttention {
    pub fn load(
        state_vec_size: usize,
        listen_vec_size: usize,
        config: &AttentionConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let num_heads = config.num_heads;
        let (phi, psi) = if config.apply_proj {
            let phi = linear(state_vec_size, config.proj_hidden_size * num_heads, vb.pp("phi"))?;
            let psi = linear_no_bias(listen_vec_size, config.proj_hidden_size, vb.pp("psi"))?;
            (Some(phi), Some(psi))
        } else {
            if state_vec_size != listen_vec_size * num_heads {
                candle_core::bail!(
                    "attention: state_vec_size ({state_vec_size}) != listen_vec_size ({listen_vec_size}) × heads ({num_heads})"
                );
            }
            (None, None)
        };

        let reduce = if num_heads > 1 {
            Some(linear(listen_vec_size * num_heads, listen_vec_size, vb.pp("reduce"))?)
        } else {
            None
        };

        Ok(Self {
            phi,
            psi,
            reduce,
            num_heads,
            scale_scores: config.scale_scores,
            normal: MaskedSoftmax::new(config.softmax_eps),
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// `<m, n>`: `[B, 1, P] × [B, T, P]ᵀ → [B, 1, T]`.
    fn score(&self, m: &Tensor, n: &Tensor) -> Result<Tensor> {
        let e = m.contiguous()?.matmul(&n.transpose(1, 2)?.contiguous()?)?;
        if self.scale_scores {
            let width = m.dim(D::Minus1)? as f64;
            e.affine(1.0 / width.sqrt(), 0.0)
        } else {
            Ok(e)
        }
    }

    /// s: `[B, 1, Hs]`, h: `[B, T, Hc]`, mask: `[B, T]` →
    /// (context `[B, 1, Hc]`, weights `[B, heads, 1, T]`).
    pub fn forward(&self, s: &Tensor, h: &Tensor, mask: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let m = match &self.phi {
            Some(phi) => phi.forward(s)?,
            None => s.clone(),
        };
        let n = match &self.psi {
            Some(psi) => psi.forward(h)?,
            None => h.clone(),
        };

        match &self.reduce {
            Some(reduce) => {
                let width = m.dim(D::Minus1)? / self.num_heads;
                let mut contexts = Vec::with_capacity(self.num_heads);
                let mut weights = Vec::with_capacity(self.num_heads);
                for head in 0..self.num_heads {
                    let mi = m.narrow(D::Minus1, head * width, width)?;
                    let a = self.normal.forward(&self.score(&mi, &n)?, mask)?;
                    contexts.push(a.matmul(h)?);
                    weights.push(a);
                }
                let c = reduce.forward(&Tensor::cat(&contexts, D::Minus1)?)?;
                let a = Tensor::stack(&weights, 1)?;
                Ok((c, a))
            }
            None => {
                let a = self.normal.forward(&self.score(&m, &n)?, mask)?;
                let c = a.matmul(h)?;
                Ok((c, a.unsqueeze(1)?))
            }
        }
    }
}

/// Multi-head scaled dot-product внимание с аддитивной маской.
///
/// (B, S, D) -proj-> (B, S, P) -split-> (B, H, S, W), P = H * W.
/// Маскированные ключи получают `-10000` к скору перед softmax.
#[derive(Debug, Clone)]
pub struct MultiHeadSelfAttention {
    proj_q: Linear,
    proj_k: Linear,
    proj_v: Linear,
    dropout: Dropout,
    num_heads: usize,
}

impl MultiHeadSelfAttention {
    pub fn load(
        query_size: usize,
        key_size: usize,
        proj_hidden_size: usize,
        num_heads: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_heads == 0 || proj_hidden_size % num_heads != 0 {
            candle_core::bail!(
                "self-attention: proj_hidden_size ({proj_hidden_size}) не делится на num_heads ({num_heads})"
            );
        }
        Ok(Self {
            proj_q: linear(query_size, proj_hidden_size, vb.pp("proj_q"))?,
            proj_k: linear(key_size, proj_hidden_size, vb.pp("proj_k"))?,
            proj_v: linear(key_size, proj_hidden_size, vb.pp("proj_v"))?,
            dropout: Dropout::new(dropout),
            num_heads,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, width) = x.dims3()?;
        x.reshape((batch, seq_len, self.num_heads, width / self.num_heads))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// q: `[B, S, Dq]`, k: `[B, T, Dk]`, mask: `[B, T]` →
    /// (context `[B, S, P]`, scores `[B, H, S, T]`).
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, seq_len, _) = q.dims3()?;

        let v = self.split_heads(&self.proj_v.forward(k)?)?;
        let q = self.split_heads(&self.proj_q.forward(q)?)?;
        let k = self.split_heads(&self.proj_k.forward(k)?)?;

        let head_dim = q.dim(D::Minus1)? as f64;
        let mut scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? / head_dim.sqrt())?;

        if let Some(mask) = mask {
            let time = mask.dim(1)?;
            let penalty = mask
                .to_dtype(scores.dtype())?
                .reshape((batch, 1, 1, time))?
                .affine(-10000.0, 10000.0)?;
            scores = scores.broadcast_sub(&penalty)?;
        }

        let scores = candle_nn::ops::softmax_last_dim(&scores)?;
        let scores = self.dropout.forward(&scores, train)?;

        let h = scores
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, ()))?;
        Ok((h, scores))
    }
}

/// Механизм внимания декодера, выбираемый через [`AttentionKind`].
#[derive(Debug, Clone)]
pub enum AttentionMechanism {
    DotProduct(DotProductAttention),
    SelfAttention(MultiHeadSelfAttention),
}

impl AttentionMechanism {
    pub fn load(
        state_vec_size: usize,
        listen_vec_size: usize,
        config: &AttentionConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        match config.kind {
            AttentionKind::DotProduct => Ok(Self::DotProduct(DotProductAttention::load(
                state_vec_size,
                listen_vec_size,
                config,
                vb,
            )?)),
            AttentionKind::MultiHeadSelfAttention { dropout } => {
                Ok(Self::SelfAttention(MultiHeadSelfAttention::load(
                    state_vec_size,
                    listen_vec_size,
                    config.proj_hidden_size,
                    config.num_heads,
                    dropout,
                    vb,
                )?))
            }
        }
    }

    pub fn num_heads(&self) -> usize {
        match self {
            Self::DotProduct(attn) => attn.num_heads(),
            Self::SelfAttention(attn) => attn.num_heads(),
        }
    }

    pub fn forward(
        &self,
        query: &Tensor,
        keys: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        match self {
            Self::DotProduct(attn) => attn.forward(query, keys, mask),
            Self::SelfAttention(attn) => attn.forward(query, keys, mask, train),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use crate::layers::length_mask;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn test_masked_softmax_sums_to_one_over_valid_positions() {
        let device = Device::Cpu;
        let e = Tensor::randn(0f32, 3f32, (3, 1, 6), &device).unwrap();
        let mask = length_mask(&[6, 4, 1], 6, &device).unwrap();
        let a: Vec<Vec<Vec<f32>>> = MaskedSoftmax::default()
            .forward(&e, Some(&mask))
            .unwrap()
            .to_vec3()
            .unwrap();

        for (row, len) in a.iter().zip([6usize, 4, 1]) {
            let sum: f32 = row[0][..len].iter().sum();
            assert!((sum - 1.0).abs() < 1e-3, "sum = {sum}");
            assert!(row[0][len..].iter().all(|w| *w == 0.0));
        }
    }

    #[test]
    fn test_masked_softmax_rows_do_not_depend_on_each_other() {
        let device = Device::Cpu;
        let e = Tensor::new(&[[[12f32, 11., 10.]], [[0., 0.5, 1.]]], &device).unwrap();
        let mask = length_mask(&[3, 3], 3, &device).unwrap();
        let softmax = MaskedSoftmax::default();

        let together: Vec<Vec<Vec<f32>>> =
            softmax.forward(&e, Some(&mask)).unwrap().to_vec3().unwrap();
        let alone: Vec<Vec<Vec<f32>>> = softmax
            .forward(&e.narrow(0, 1, 1).unwrap(), Some(&mask.narrow(0, 1, 1).unwrap()))
            .unwrap()
            .to_vec3()
            .unwrap();

        for row in &together {
            let sum: f32 = row[0].iter().sum();
            assert!((sum - 1.0).abs() < 1e-4, "sum = {sum}");
        }
        for (a, b) in together[1][0].iter().zip(&alone[0][0]) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_masked_softmax_ignores_large_padded_scores() {
        let device = Device::Cpu;
        let e = Tensor::new(&[[[0f32, 0., 50.]]], &device).unwrap();
        let mask = length_mask(&[2], 3, &device).unwrap();
        let a: Vec<f32> = MaskedSoftmax::default()
            .forward(&e, Some(&mask))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!((a[0] - 0.5).abs() < 1e-4);
        assert!((a[1] - 0.5).abs() < 1e-4);
        assert_eq!(a[2], 0.0);
    }

    #[test]
    fn test_masked_softmax_all_zero_mask_is_finite() {
        let device = Device::Cpu;
        let e = Tensor::randn(0f32, 1f32, (1, 1, 4), &device).unwrap();
        let mask = Tensor::zeros((1, 4), DType::F32, &device).unwrap();
        let a: Vec<f32> = MaskedSoftmax::default()
            .forward(&e, Some(&mask))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(a.iter().all(|w| w.is_finite() && *w == 0.0));
    }

    #[test]
    fn test_query_equal_to_key_gets_max_weight() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let config = AttentionConfig {
            num_heads: 1,
            apply_proj: false,
            ..Default::default()
        };
        let attn = DotProductAttention::load(4, 4, &config, vb).unwrap();

        // Единичные ключи: базис + диагональ.
        let keys = Tensor::new(
            &[[
                [1f32, 0., 0., 0.],
                [0., 1., 0., 0.],
                [0., 0., 1., 0.],
                [0., 0., 0., 1.],
                [0.5, 0.5, 0.5, 0.5],
            ]],
            &device,
        )
        .unwrap();
        let query = Tensor::new(&[[[0f32, 0., 1., 0.]]], &device).unwrap();
        let mask = length_mask(&[5], 5, &device).unwrap();

        let (c, a) = attn.forward(&query, &keys, Some(&mask)).unwrap();
        assert_eq!(c.dims(), &[1, 1, 4]);
        assert_eq!(a.dims(), &[1, 1, 1, 5]);

        let w: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        for (i, wi) in w.iter().enumerate() {
            if i != 2 {
                assert!(w[2] > *wi, "weights = {w:?}");
            }
        }
    }

    #[test]
    fn test_multi_head_dot_product_shapes() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let config = AttentionConfig {
            num_heads: 3,
            proj_hidden_size: 8,
            ..Default::default()
        };
        let attn = DotProductAttention::load(16, 12, &config, vb).unwrap();
        let s = Tensor::randn(0f32, 1f32, (2, 1, 16), &device).unwrap();
        let h = Tensor::randn(0f32, 1f32, (2, 7, 12), &device).unwrap();
        let mask = length_mask(&[7, 3], 7, &device).unwrap();

        let (c, a) = attn.forward(&s, &h, Some(&mask)).unwrap();
        assert_eq!(c.dims(), &[2, 1, 12]);
        assert_eq!(a.dims(), &[2, 3, 1, 7]);

        let padded: Vec<f32> = a.get(1).unwrap().narrow(2, 3, 4).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(padded.iter().all(|w| *w == 0.0));
    }

    #[test]
    fn test_self_attention_ignores_masked_keys() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let attn = MultiHeadSelfAttention::load(6, 10, 8, 2, 0.1, vb).unwrap();

        let q = Tensor::randn(0f32, 1f32, (2, 3, 6), &device).unwrap();
        let k = Tensor::randn(0f32, 1f32, (2, 5, 10), &device).unwrap();
        let mask = length_mask(&[5, 2], 5, &device).unwrap();

        let (h, scores) = attn.forward(&q, &k, Some(&mask), false).unwrap();
        assert_eq!(h.dims(), &[2, 3, 8]);
        assert_eq!(scores.dims(), &[2, 2, 3, 5]);

        let masked: Vec<f32> = scores.get(1).unwrap().narrow(2, 2, 3).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(masked.iter().all(|w| *w < 1e-6));

        let row_sums: Vec<f32> = scores.sum(D::Minus1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(row_sums.iter().all(|s| (s - 1.0).abs() < 1e-4));
    }

    #[test]
    fn test_mechanism_dispatches_on_kind() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let config = AttentionConfig {
            kind: AttentionKind::MultiHeadSelfAttention { dropout: 0.0 },
            proj_hidden_size: 12,
            num_heads: 2,
            ..Default::default()
        };
        let attn = AttentionMechanism::load(16, 12, &config, vb).unwrap();
        assert!(matches!(attn, AttentionMechanism::SelfAttention(_)));
        assert_eq!(attn.num_heads(), 2);

        let s = Tensor::randn(0f32, 1f32, (2, 1, 16), &device).unwrap();
        let h = Tensor::randn(0f32, 1f32, (2, 4, 12), &device).unwrap();
        let (c, a) = attn.forward(&s, &h, None, true).unwrap();
        assert_eq!(c.dims(), &[2, 1, 12]);
        assert_eq!(a.dims(), &[2, 2, 1, 4]);
    }
}
