//! Базовые слои LAS: LSTM, прямоугольная свёртка, LayerNorm без аффинных
//! параметров и обёртка `TimeDistributed`.
//!
//! Весовые ключи LSTM совпадают с PyTorch:
//! - weight_ih_l{i}[_reverse]: [4*hidden, input]
//! - weight_hh_l{i}[_reverse]: [4*hidden, hidden]
//! - bias_ih_l{i}[_reverse], bias_hh_l{i}[_reverse]: [4*hidden]

use candle_core::{D, DType, Device, IndexOp, Module, Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// Маска валидности `[batch, max_len]`: 1.0 для `t < lengths[b]`, иначе 0.0.
pub fn length_mask(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; lengths.len() * max_len];
    for (b, &len) in lengths.iter().enumerate() {
        let len = len.min(max_len);
        data[b * max_len..b * max_len + len].fill(1.0);
    }
    Tensor::from_vec(data, (lengths.len(), max_len), device)
}

/// One-hot с «полом»: `(1 - floor) * onehot + floor / num_classes`.
///
/// При `floor = 0` получается обычный one-hot. Результат `[ids.len(), num_classes]`.
pub fn onehot(ids: &[u32], num_classes: usize, floor: f64, device: &Device) -> Result<Tensor> {
    let base = (floor / num_classes as f64) as f32;
    let hot = (1.0 - floor) as f32 + base;
    let mut data = vec![base; ids.len() * num_classes];
    for (i, &id) in ids.iter().enumerate() {
        let id = id as usize;
        if id >= num_classes {
            candle_core::bail!("label {id} вне словаря размера {num_classes}");
        }
        data[i * num_classes + id] = hot;
    }
    Tensor::from_vec(data, (ids.len(), num_classes), device)
}

/// LayerNorm по последней оси без обучаемых weight/bias.
#[derive(Debug, Clone, Copy)]
pub struct LayerNorm {
    eps: f64,
}

impl LayerNorm {
    pub fn no_affine(eps: f64) -> Self {
        Self { eps }
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let input_dtype = x.dtype();
        let x_f32 = x.to_dtype(DType::F32)?;

        let mean = x_f32.mean_keepdim(D::Minus1)?;
        let x_centered = x_f32.broadcast_sub(&mean)?;
        let variance = x_centered.sqr()?.mean_keepdim(D::Minus1)?;
        x_centered
            .broadcast_div(&(variance + self.eps)?.sqrt()?)?
            .to_dtype(input_dtype)
    }
}

/// Применяет модуль к `[d0, d1, ...]`, схлопывая две ведущие оси в одну.
///
/// Позволяет прогонять по-шаговые (2D) модули по дополненным
/// последовательностям любой длины и размера батча.
#[derive(Debug, Clone)]
pub struct TimeDistributed<M> {
    inner: M,
}

impl<M: Module> TimeDistributed<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }
}

impl<M: Module> Module for TimeDistributed<M> {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims();
        if dims.len() < 3 {
            candle_core::bail!("TimeDistributed: ожидается rank >= 3, получено {dims:?}");
        }
        let (d0, d1) = (dims[0], dims[1]);
        let flat = x.reshape((d0 * d1, ()))?;
        let y = self.inner.forward(&flat)?;
        y.reshape((d0, d1, ()))
    }
}

/// Conv2d с прямоугольным ядром и симметричным паддингом, stride = 1.
#[derive(Debug, Clone)]
pub struct Conv2dRect {
    weight: Tensor, // [out, in, kh, kw]
    bias: Tensor,   // [out]
    padding: (usize, usize),
}

impl Conv2dRect {
    pub fn load(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        padding: (usize, usize),
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_channels, in_channels, kernel.0, kernel.1),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bound = 1.0 / ((in_channels * kernel.0 * kernel.1) as f64).sqrt();
        let bias = vb.get_with_hints(
            out_channels,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        Ok(Self {
            weight,
            bias,
            padding,
        })
    }
}

impl Module for Conv2dRect {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (ph, pw) = self.padding;
        let x = x.pad_with_zeros(2, ph, ph)?.pad_with_zeros(3, pw, pw)?;
        let y = x.conv2d(&self.weight, 0, 1, 1, 1)?;
        y.broadcast_add(&self.bias.reshape((1, (), 1, 1))?)
    }
}

/// Один слой LSTM, батчевый.
///
/// Формулы:
/// gates = x @ W_ih^T + h @ W_hh^T + b_ih + b_hh
/// i, f, g, o = gates.chunk(4)
/// c = sigmoid(f) * c_prev + sigmoid(i) * tanh(g)
/// h = sigmoid(o) * tanh(c)
#[derive(Debug, Clone)]
pub struct LstmLayer {
    weight_ih: Tensor, // [4*hidden, input_size]
    weight_hh: Tensor, // [4*hidden, hidden_size]
    bias_ih: Tensor,   // [4*hidden]
    bias_hh: Tensor,   // [4*hidden]
    hidden_size: usize,
}

impl LstmLayer {
    /// `suffix`: "" для прямого направления, "_reverse" для обратного.
    pub fn load(
        input_size: usize,
        hidden_size: usize,
        layer_idx: usize,
        suffix: &str,
        vb: VarBuilder,
    ) -> Result<Self> {
        let gate_size = 4 * hidden_size;
        let bound = 1.0 / (hidden_size as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let weight_ih = vb.get_with_hints(
            (gate_size, input_size),
            &format!("weight_ih_l{layer_idx}{suffix}"),
            init,
        )?;
        let weight_hh = vb.get_with_hints(
            (gate_size, hidden_size),
            &format!("weight_hh_l{layer_idx}{suffix}"),
            init,
        )?;
        let bias_ih = vb.get_with_hints(gate_size, &format!("bias_ih_l{layer_idx}{suffix}"), init)?;
        let bias_hh = vb.get_with_hints(gate_size, &format!("bias_hh_l{layer_idx}{suffix}"), init)?;
        Ok(Self {
            weight_ih,
            weight_hh,
            bias_ih,
            bias_hh,
            hidden_size,
        })
    }

    /// Один шаг: x `[batch, input]`, h/c `[batch, hidden]` → (h_new, c_new).
    pub fn step(&self, x: &Tensor, h: &Tensor, c: &Tensor) -> Result<(Tensor, Tensor)> {
        let gates = x
            .matmul(&self.weight_ih.t()?)?
            .broadcast_add(&self.bias_ih)?
            .broadcast_add(&h.matmul(&self.weight_hh.t()?)?)?
            .broadcast_add(&self.bias_hh)?;

        let hs = self.hidden_size;

        // input, forget, cell, output gates
        let i_gate = gates.narrow(D::Minus1, 0, hs)?;
        let f_gate = gates.narrow(D::Minus1, hs, hs)?;
        let g_gate = gates.narrow(D::Minus1, 2 * hs, hs)?;
        let o_gate = gates.narrow(D::Minus1, 3 * hs, hs)?;

        let i_gate = candle_nn::Activation::Sigmoid.forward(&i_gate)?;
        let f_gate = candle_nn::Activation::Sigmoid.forward(&f_gate)?;
        let g_gate = g_gate.tanh()?;
        let o_gate = candle_nn::Activation::Sigmoid.forward(&o_gate)?;

        let c_new = ((f_gate * c)? + (i_gate * g_gate)?)?;
        let h_new = (o_gate * c_new.tanh()?)?;

        Ok((h_new, c_new))
    }

    /// Прогон по последовательности `[batch, time, input]` с маской `[batch, time]`.
    ///
    /// На замаскированных шагах состояние не меняется, а выход равен нулю.
    /// Для `reverse` проход идёт с конца, поэтому каждый сэмпл начинает
    /// с нулевого состояния на своём последнем валидном шаге.
    pub fn forward_masked(&self, xs: &Tensor, mask: &Tensor, reverse: bool) -> Result<Tensor> {
        let (batch, time, _) = xs.dims3()?;
        let mut h = Tensor::zeros((batch, self.hidden_size), xs.dtype(), xs.device())?;
        let mut c = h.clone();

        let steps: Vec<usize> = if reverse {
            (0..time).rev().collect()
        } else {
            (0..time).collect()
        };

        let mut outputs = Vec::with_capacity(time);
        for t in steps {
            let x = xs.i((.., t, ..))?.contiguous()?;
            let m = mask.i((.., t..t + 1))?.to_dtype(xs.dtype())?;
            let keep = m.affine(-1.0, 1.0)?;

            let (h_new, c_new) = self.step(&x, &h, &c)?;
            outputs.push(h_new.broadcast_mul(&m)?);
            h = (h_new.broadcast_mul(&m)? + h.broadcast_mul(&keep)?)?;
            c = (c_new.broadcast_mul(&m)? + c.broadcast_mul(&keep)?)?;
        }
        if reverse {
            outputs.reverse();
        }
        Tensor::stack(&outputs, 1)
    }
}

/// Состояние многослойного LSTM.
#[derive(Debug, Clone)]
pub struct LstmState {
    /// h[i]: [batch, hidden] для каждого слоя.
    pub h: Vec<Tensor>,
    /// c[i]: [batch, hidden] для каждого слоя.
    pub c: Vec<Tensor>,
}

impl LstmState {
    /// Нулевое начальное состояние.
    pub fn zeros(
        num_layers: usize,
        batch: usize,
        hidden_size: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let zeros = Tensor::zeros((batch, hidden_size), dtype, device)?;
        Ok(Self {
            h: vec![zeros.clone(); num_layers],
            c: vec![zeros; num_layers],
        })
    }
}

/// Однонаправленный многослойный LSTM с пошаговым интерфейсом (декодер).
#[derive(Debug, Clone)]
pub struct StackedLstm {
    layers: Vec<LstmLayer>,
    hidden_size: usize,
}

impl StackedLstm {
    pub fn load(
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let in_size = if i == 0 { input_size } else { hidden_size };
            layers.push(LstmLayer::load(in_size, hidden_size, i, "", vb.clone())?);
        }
        Ok(Self {
            layers,
            hidden_size,
        })
    }

    /// Шаг по всем слоям. `state = None` означает нулевое начальное состояние.
    pub fn step(&self, x: &Tensor, state: Option<&LstmState>) -> Result<(Tensor, LstmState)> {
        let zeros;
        let state = match state {
            Some(s) => s,
            None => {
                let batch = x.dim(0)?;
                zeros = LstmState::zeros(
                    self.layers.len(),
                    batch,
                    self.hidden_size,
                    x.dtype(),
                    x.device(),
                )?;
                &zeros
            }
        };

        let mut x = x.clone();
        let mut new_h = Vec::with_capacity(self.layers.len());
        let mut new_c = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let (h_new, c_new) = layer.step(&x, &state.h[i], &state.c[i])?;
            x = h_new.clone();
            new_h.push(h_new);
            new_c.push(c_new);
        }

        Ok((x, LstmState { h: new_h, c: new_c }))
    }
}

/// Многослойный (би)направленный LSTM над дополненными последовательностями.
///
/// Между слоями выходы направлений конкатенируются, на выходе стека суммируются,
/// так что ширина результата всегда равна `hidden_size`.
#[derive(Debug, Clone)]
pub struct SequenceLstm {
    layers: Vec<(LstmLayer, Option<LstmLayer>)>,
}

impl SequenceLstm {
    pub fn load(
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        bidirectional: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let directions = if bidirectional { 2 } else { 1 };
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let in_size = if i == 0 {
                input_size
            } else {
                hidden_size * directions
            };
            let forward = LstmLayer::load(in_size, hidden_size, i, "", vb.clone())?;
            let backward = if bidirectional {
                Some(LstmLayer::load(in_size, hidden_size, i, "_reverse", vb.clone())?)
            } else {
                None
            };
            layers.push((forward, backward));
        }
        Ok(Self { layers })
    }

    /// xs `[batch, time, input]`, mask `[batch, time]` → `[batch, time, hidden]`.
    pub fn forward(&self, xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let mut x = xs.clone();
        let last = self.layers.len() - 1;
        for (i, (forward, backward)) in self.layers.iter().enumerate() {
            let y_f = forward.forward_masked(&x, mask, false)?;
            x = match backward {
                Some(backward) => {
                    let y_b = backward.forward_masked(&x, mask, true)?;
                    if i == last {
                        (y_f + y_b)?
                    } else {
                        Tensor::cat(&[&y_f, &y_b], D::Minus1)?
                    }
                }
                None => y_f,
            };
        }
        Ok(x)
    }
}
