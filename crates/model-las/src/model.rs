//! ListenAttendSpell: энкодер, декодер и log-сглаживание в одной модели.
//!
//! Два режима:
//! - обучение: фильтрация батча, шумные псевдо-распределения целей,
//!   scheduled sampling, выравнивание длин предсказаний и целей
//! - инференс: свободное декодирование, длины без хвостовых eos,
//!   распределения без колонок sos/eos

use std::path::Path;

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use las_core::{AcousticBatch, LabelBatch, LasConfig, LasError, LasResult};

use crate::layers::onehot;
use crate::listener::Listener;
use crate::smoothing::LogWithLabelSmoothing;
use crate::speller::{Speller, TeacherForcing};

/// Верхняя граница случайного «пола» и поэлементного шума целей.
const TARGET_NOISE: f64 = 0.1;

/// Результат обучающего прохода (только по оставленным сэмплам).
#[derive(Debug, Clone)]
pub struct TrainOutput {
    /// Log-сглаженные предсказания `[B', T, V]`.
    pub log_probs: Tensor,
    /// Длины, зафиксированные декодером.
    pub output_lengths: Vec<usize>,
    /// Индексы целей `[B', T]` (u32), дополненные blank.
    pub targets: Tensor,
    /// Длины целей вместе с хвостовыми eos.
    pub target_lengths: Vec<usize>,
    /// Веса внимания `[B', heads, T_out, T_enc]`.
    pub attentions: Tensor,
    /// `(фреймы - 1, метки - 1)` на сэмпл, для визуализации внимания.
    pub regions: Vec<(usize, usize)>,
    /// Индексы оставленных сэмплов исходного батча.
    pub kept: Vec<usize>,
}

/// Результат инференса.
#[derive(Debug, Clone)]
pub struct InferOutput {
    /// Log-сглаженные распределения по базовому словарю `[B, T_out, num_labels]`.
    pub log_probs: Tensor,
    /// Длины без хвостовых eos; `max_seq_len` для незавершившихся сэмплов.
    pub output_lengths: Vec<usize>,
    pub attentions: Tensor,
}

#[derive(Debug, Clone)]
pub enum LasOutput {
    Train(TrainOutput),
    Infer(InferOutput),
}

/// Listen-Attend-Spell.
#[derive(Debug)]
pub struct ListenAttendSpell {
    config: LasConfig,
    listen: Listener,
    spell: Speller,
    log: LogWithLabelSmoothing,
    rng: StdRng,
    training: bool,
}

impl ListenAttendSpell {
    /// Создать модель. Весовые префиксы: `listen.*`, `spell.*`.
    pub fn new(config: LasConfig, vb: VarBuilder) -> LasResult<Self> {
        config.validate()?;

        let listen = Listener::load(config.listener.clone(), vb.pp("listen"))?;
        let spell = Speller::load(
            listen.output_dim(),
            config.label_vec_size(),
            config.sos(),
            config.eos(),
            &config.speller,
            vb.pp("spell"),
        )?;

        info!(
            "LAS: словарь {} (+sos/eos), {} голов внимания, max_seq_len={}",
            config.num_labels,
            spell.num_heads(),
            spell.max_seq_len()
        );

        Ok(Self {
            log: LogWithLabelSmoothing::new(config.smoothing),
            rng: StdRng::seed_from_u64(config.seed),
            training: true,
            listen,
            spell,
            config,
        })
    }

    /// Загрузить веса из safetensors-файла.
    pub fn load_safetensors(
        path: impl AsRef<Path>,
        config: LasConfig,
        device: &Device,
    ) -> LasResult<Self> {
        let path = path.as_ref();
        info!("LAS: загрузка весов из {:?}", path);
        if !path.exists() {
            return Err(LasError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("файл весов {:?} не найден", path),
            )));
        }
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)? };
        Self::new(config, vb)
    }

    pub fn config(&self) -> &LasConfig {
        &self.config
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Проход в текущем режиме. В режиме обучения метки обязательны.
    pub fn forward(
        &mut self,
        batch: &AcousticBatch,
        labels: Option<&LabelBatch>,
        ratio: f64,
    ) -> LasResult<LasOutput> {
        if self.training {
            let labels = labels.ok_or_else(|| {
                LasError::Data("обучающий проход требует метки".into())
            })?;
            Ok(LasOutput::Train(self.forward_train(batch, labels, ratio)?))
        } else {
            Ok(LasOutput::Infer(self.forward_infer(batch)?))
        }
    }

    /// Обучающий проход с teacher forcing ratio `ratio`.
    pub fn forward_train(
        &mut self,
        batch: &AcousticBatch,
        labels: &LabelBatch,
        ratio: f64,
    ) -> LasResult<TrainOutput> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(LasError::Config(format!("teacher forcing ratio {ratio} вне [0, 1]")));
        }
        if labels.batch_size() != batch.batch_size() {
            return Err(LasError::Data(format!(
                "размер батча меток ({}) не совпадает с батчем признаков ({})",
                labels.batch_size(),
                batch.batch_size()
            )));
        }

        let max_seq_len = self.spell.max_seq_len();
        let kept: Vec<usize> = batch
            .lengths
            .iter()
            .zip(&labels.lengths)
            .enumerate()
            .filter(|(_, (x_len, y_len))| x_len > y_len && **y_len < max_seq_len)
            .map(|(b, _)| b)
            .collect();
        if kept.len() < batch.batch_size() {
            warn!(
                "LAS: отброшено {} сэмплов с x_len <= y_len или y_len >= {max_seq_len}",
                batch.batch_size() - kept.len()
            );
        }
        if kept.is_empty() {
            return Err(LasError::EmptyBatch);
        }

        let device = batch.features.device();
        let features = if kept.len() == batch.batch_size() {
            batch.features.clone()
        } else {
            let index: Vec<u32> = kept.iter().map(|&b| b as u32).collect();
            let index = Tensor::from_vec(index, kept.len(), device)?;
            batch.features.index_select(&index, 0)?
        };
        let x_lengths: Vec<usize> = kept.iter().map(|&b| batch.lengths[b]).collect();

        // listen
        let (h, enc_lengths) = self.listen.forward(&features, &x_lengths, true)?;

        // цели с хвостовыми eos, дополненные blank
        let num_eos = self.spell.num_eos();
        let sequences = labels.split();
        let target_lengths: Vec<usize> = kept.iter().map(|&b| sequences[b].len() + num_eos).collect();
        let width = target_lengths.iter().copied().max().unwrap_or(0);
        let mut target_ids: Vec<u32> = Vec::with_capacity(kept.len() * width);
        for &b in &kept {
            let seq = sequences[b];
            target_ids.extend_from_slice(seq);
            target_ids.extend(std::iter::repeat_n(self.config.eos(), num_eos));
            target_ids.extend(std::iter::repeat_n(self.config.blank, width - seq.len() - num_eos));
        }

        let targets = self.noised_targets(&target_ids, (kept.len(), width), &h)?;

        // spell
        let out = self.spell.forward(
            &h,
            &enc_lengths,
            Some(TeacherForcing {
                targets: &targets,
                ratio,
            }),
            &mut self.rng,
            true,
        )?;

        let regions: Vec<(usize, usize)> = enc_lengths
            .iter()
            .zip(&target_lengths)
            .map(|(&frames, &len)| (frames.saturating_sub(1), len.saturating_sub(1)))
            .collect();

        // выравнивание длин предсказаний и целей
        let vocab = self.config.label_vec_size();
        let steps = out.y_hats.dim(1)?;
        let (y_hats, width) = if steps < width {
            let pad = onehot(
                &vec![self.config.blank; kept.len() * (width - steps)],
                vocab,
                0.0,
                device,
            )?
            .to_dtype(out.y_hats.dtype())?
            .reshape((kept.len(), width - steps, vocab))?;
            (Tensor::cat(&[&out.y_hats, &pad], 1)?, width)
        } else {
            if steps > width {
                let mut padded = Vec::with_capacity(kept.len() * steps);
                for row in target_ids.chunks(width) {
                    padded.extend_from_slice(row);
                    padded.extend(std::iter::repeat_n(self.config.blank, steps - width));
                }
                target_ids = padded;
            }
            (out.y_hats, steps)
        };
        let targets = Tensor::from_vec(target_ids, (kept.len(), width), device)?;

        let log_probs = self.log.forward(&y_hats)?;
        debug!(
            "LAS train: {} сэмплов, предсказания {:?}, цели {:?}",
            kept.len(),
            log_probs.dims(),
            targets.dims()
        );

        Ok(TrainOutput {
            log_probs,
            output_lengths: out.lengths,
            targets,
            target_lengths,
            attentions: out.attentions,
            regions,
            kept,
        })
    }

    /// Псевдо-распределения целей: `softmax(onehot_floor(y) * noise)`,
    /// `floor ~ U[0, 0.1)`, `noise ~ U[0, 0.1)` поэлементно.
    fn noised_targets(
        &mut self,
        ids: &[u32],
        (batch, width): (usize, usize),
        like: &Tensor,
    ) -> LasResult<Tensor> {
        let vocab = self.config.label_vec_size();
        let floor = self.rng.gen_range(0.0..TARGET_NOISE);
        let hot = onehot(ids, vocab, floor, like.device())?;

        let noise: Vec<f32> = (0..ids.len() * vocab)
            .map(|_| self.rng.gen_range(0.0..TARGET_NOISE as f32))
            .collect();
        let noise = Tensor::from_vec(noise, (ids.len(), vocab), like.device())?;

        let targets = candle_nn::ops::softmax_last_dim(&(hot * noise)?)?
            .reshape((batch, width, vocab))?
            .to_dtype(like.dtype())?;
        Ok(targets)
    }

    /// Инференс: свободное декодирование без целей.
    pub fn forward_infer(&mut self, batch: &AcousticBatch) -> LasResult<InferOutput> {
        let (h, enc_lengths) = self.listen.forward(&batch.features, &batch.lengths, false)?;
        let out = self.spell.forward(&h, &enc_lengths, None, &mut self.rng, false)?;

        let max_seq_len = self.spell.max_seq_len();
        let num_eos = self.spell.num_eos();
        let output_lengths: Vec<usize> = out
            .lengths
            .iter()
            .map(|&len| {
                if len == max_seq_len {
                    len
                } else {
                    len.saturating_sub(num_eos)
                }
            })
            .collect();

        // без колонок sos и eos
        let y_hats = out.y_hats.narrow(D::Minus1, 0, self.config.num_labels)?;
        let log_probs = self.log.forward(&y_hats)?;
        debug!("LAS infer: {:?}, длины {:?}", log_probs.dims(), output_lengths);

        Ok(InferOutput {
            log_probs,
            output_lengths,
            attentions: out.attentions,
        })
    }
}
