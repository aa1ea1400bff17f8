//! Авторегрессионный декодер (Speller).
//!
//! Шаг t:
//! 1. LSTM по `[предыдущий вход, предыдущий контекст]`, LayerNorm без аффинных параметров
//! 2. Внимание по всему выходу энкодера (с маской по длинам)
//! 3. Распределение по словарю: `softmax(fc2(fc1([s, c])))`
//! 4. Кольцевой буфер последних `num_eos` признаков «argmax == eos»;
//!    если все `num_eos` подряд, длина сэмпла фиксируется как `t + 1`
//! 5. Ранний выход, когда длины всех сэмплов зафиксированы
//! 6. Следующий вход: ground truth с вероятностью `ratio` (обучение),
//!    иначе собственное распределение

use candle_core::{D, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder, linear, linear_no_bias};
use rand::Rng;
use tracing::debug;

use las_core::{LasError, LasResult, SpellerConfig};

use crate::attention::AttentionMechanism;
use crate::layers::{LayerNorm, LstmState, StackedLstm, length_mask, onehot};

/// Цели для scheduled sampling.
#[derive(Debug, Clone, Copy)]
pub struct TeacherForcing<'a> {
    /// Псевдо-распределения целей `[B, T_y, V]`.
    pub targets: &'a Tensor,
    /// Вероятность подать ground truth вместо собственного предсказания.
    pub ratio: f64,
}

/// Результат декодирования.
#[derive(Debug, Clone)]
pub struct SpellerOutput {
    /// Распределения по шагам `[B, T_out, V]`.
    pub y_hats: Tensor,
    /// Зафиксированные длины; `max_seq_len`, если сэмпл не завершился.
    pub lengths: Vec<usize>,
    /// Веса внимания `[B, heads, T_out, T_enc]`.
    pub attentions: Tensor,
}

/// Состояние одного прохода декодера.
#[derive(Debug)]
struct DecodeState {
    hidden: Option<LstmState>,
    lengths: Vec<usize>,
    eos_ring: Vec<Vec<bool>>,
}

impl DecodeState {
    fn new(batch: usize, max_seq_len: usize, num_eos: usize) -> Self {
        Self {
            hidden: None,
            lengths: vec![max_seq_len; batch],
            eos_ring: vec![vec![false; batch]; num_eos],
        }
    }

    /// Записать признаки eos шага `t` и зафиксировать длины завершившихся сэмплов.
    ///
    /// Длина выставляется только пока она ещё больше `t`, так что повторная
    /// серия eos позже её не перезаписывает.
    fn record_eos(&mut self, t: usize, is_eos: &[bool]) {
        let slot = t % self.eos_ring.len();
        self.eos_ring[slot].copy_from_slice(is_eos);
        for (b, len) in self.lengths.iter_mut().enumerate() {
            if *len > t && self.eos_ring.iter().all(|row| row[b]) {
                *len = t + 1;
            }
        }
    }

    fn all_finished(&self, t: usize) -> bool {
        self.lengths.iter().all(|&len| len <= t + 1)
    }
}

/// Attention-декодер LAS.
#[derive(Debug, Clone)]
pub struct Speller {
    rnns: StackedLstm,
    norm: LayerNorm,
    attention: AttentionMechanism,
    fc1: Linear,
    fc2: Linear,
    label_vec_size: usize,
    sos: u32,
    eos: u32,
    max_seq_len: usize,
    num_eos: usize,
    masked_attend: bool,
}

impl Speller {
    pub fn load(
        listen_vec_size: usize,
        label_vec_size: usize,
        sos: u32,
        eos: u32,
        config: &SpellerConfig,
        vb: VarBuilder,
    ) -> LasResult<Self> {
        if sos as usize >= label_vec_size || eos as usize >= label_vec_size || sos == eos {
            return Err(LasError::Config(format!(
                "speller: некорректные sos={sos}, eos={eos} для словаря {label_vec_size}"
            )));
        }
        config.validate(listen_vec_size)?;

        let hs = config.rnn_hidden_size;
        let rnns = StackedLstm::load(
            label_vec_size + listen_vec_size,
            hs,
            config.rnn_num_layers,
            vb.pp("rnns"),
        )?;
        let attention =
            AttentionMechanism::load(hs, listen_vec_size, &config.attention, vb.pp("attention"))?;
        let fc1 = linear(hs + listen_vec_size, config.chardist_hidden, vb.pp("chardist").pp("fc1"))?;
        let fc2 = linear_no_bias(config.chardist_hidden, label_vec_size, vb.pp("chardist").pp("fc2"))?;

        Ok(Self {
            rnns,
            norm: LayerNorm::no_affine(1e-5),
            attention,
            fc1,
            fc2,
            label_vec_size,
            sos,
            eos,
            max_seq_len: config.max_seq_len,
            num_eos: config.num_eos,
            masked_attend: config.masked_attend,
        })
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn num_eos(&self) -> usize {
        self.num_eos
    }

    pub fn num_heads(&self) -> usize {
        self.attention.num_heads()
    }

    /// `[B, 1, V]` one-hot для одного и того же символа.
    fn symbol(&self, id: u32, batch: usize, h: &Tensor) -> Result<Tensor> {
        onehot(&vec![id; batch], self.label_vec_size, 0.0, h.device())?
            .to_dtype(h.dtype())?
            .unsqueeze(1)
    }

    /// Декодирование.
    ///
    /// * `h`: выход энкодера `[B, T, Hc]`
    /// * `enc_lengths`: валидные длины `h`
    /// * `teacher`: цели для scheduled sampling (только обучение)
    /// * `train`: режим dropout во внимании
    pub fn forward<R: Rng>(
        &self,
        h: &Tensor,
        enc_lengths: &[usize],
        teacher: Option<TeacherForcing<'_>>,
        rng: &mut R,
        train: bool,
    ) -> Result<SpellerOutput> {
        let (batch, time, _) = h.dims3()?;
        let sos = self.symbol(self.sos, batch, h)?;
        let eos = self.symbol(self.eos, batch, h)?;

        let in_mask = if self.masked_attend {
            Some(length_mask(enc_lengths, time, h.device())?.to_dtype(h.dtype())?)
        } else {
            None
        };

        let mut state = DecodeState::new(batch, self.max_seq_len, self.num_eos);
        let mut y_hats = Vec::new();
        let mut attentions = Vec::new();
        let mut x = Tensor::cat(&[&sos, &h.narrow(1, 0, 1)?], D::Minus1)?;

        for t in 0..self.max_seq_len {
            let (s, hidden) = self.rnns.step(&x.squeeze(1)?, state.hidden.as_ref())?;
            state.hidden = Some(hidden);
            let s = self.norm.forward(&s)?.unsqueeze(1)?;

            let (c, a) = self.attention.forward(&s, h, in_mask.as_ref(), train)?;
            let y_hat = self.fc1.forward(&Tensor::cat(&[&s, &c], D::Minus1)?)?;
            let y_hat = candle_nn::ops::softmax_last_dim(&self.fc2.forward(&y_hat)?)?;

            let preds: Vec<u32> = y_hat.squeeze(1)?.argmax(D::Minus1)?.to_vec1()?;
            let is_eos: Vec<bool> = preds.iter().map(|&p| p == self.eos).collect();
            state.record_eos(t, &is_eos);

            y_hats.push(y_hat.clone());
            attentions.push(a);

            if state.all_finished(t) {
                debug!("Speller: ранний выход на шаге {}", t + 1);
                break;
            }

            let next = match teacher {
                Some(tf) if rng.gen_bool(tf.ratio) => {
                    if t < tf.targets.dim(1)? {
                        tf.targets.narrow(1, t, 1)?
                    } else {
                        eos.clone()
                    }
                }
                _ => y_hat,
            };
            x = Tensor::cat(&[&next, &c], D::Minus1)?;
        }

        let y_hats = Tensor::cat(&y_hats, 1)?;
        let attentions = Tensor::cat(&attentions, 2)?;
        debug!(
            "Speller: {} шагов, длины {:?}",
            y_hats.dim(1)?,
            state.lengths
        );

        Ok(SpellerOutput {
            y_hats,
            lengths: state.lengths,
            attentions,
        })
    }
}
