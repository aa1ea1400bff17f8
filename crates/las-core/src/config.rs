//! Конфигурационные структуры для модели Listen-Attend-Spell.
//!
//! Значения по умолчанию соответствуют эталонному чекпойнту:
//! 129 частотных бинов, 4 входных канала, ширина энкодера/декодера 256,
//! 4 головы внимания, максимальная длина декодирования 256.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LasError, LasResult};

/// Число стадий conv → pool в энкодере.
pub const NUM_CONV_STAGES: usize = 3;

/// Размер ядра свёртки энкодера (частота, время).
pub const CONV_KERNEL: (usize, usize) = (11, 3);

/// Паддинг свёртки энкодера (частота, время).
pub const CONV_PADDING: (usize, usize) = (5, 1);

/// Ядро, шаг и паддинг average-pooling по сжимаемой оси.
pub const POOL_KERNEL: usize = 3;
pub const POOL_STRIDE: usize = 2;
pub const POOL_PADDING: usize = 1;

/// Длина оси после свёртки/пулинга: `(in - kernel + 2 * pad) / stride + 1`.
pub fn conv_out_extent(input: usize, kernel: usize, padding: usize, stride: usize) -> usize {
    (input + 2 * padding).saturating_sub(kernel) / stride + 1
}

/// Длина оси после одной стадии пулинга энкодера.
pub fn pooled_extent(input: usize) -> usize {
    conv_out_extent(input, POOL_KERNEL, POOL_PADDING, POOL_STRIDE)
}

/// Ось, которую сжимает average-pooling энкодера.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolAxis {
    /// Сжимается частотная ось, длины по времени не меняются.
    Frequency,
    /// Сжимается временная ось, длины пересчитываются по формуле пулинга.
    Time,
}

/// Конфигурация энкодера (Listener).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Количество входных каналов (2 × input_folding).
    pub in_channels: usize,

    /// Количество частотных бинов спектрограммы.
    pub freq_bins: usize,

    /// Каналы первой свёртки; удваиваются на каждой стадии.
    pub conv_channels: usize,

    /// Ось пулинга.
    pub pool_axis: PoolAxis,

    /// Размер скрытого состояния LSTM.
    pub rnn_hidden_size: usize,

    /// Количество слоёв LSTM.
    pub rnn_num_layers: usize,

    /// Двунаправленный LSTM (выходы направлений суммируются).
    pub bidirectional: bool,

    /// Ширина выхода энкодера.
    pub listen_vec_size: usize,

    /// Финальная проекция Linear → LeakyReLU → LayerNorm.
    pub last_fc: bool,

    /// Epsilon для BatchNorm2d.
    pub batch_norm_eps: f64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            in_channels: 4,
            freq_bins: 129,
            conv_channels: 64,
            pool_axis: PoolAxis::Frequency,
            rnn_hidden_size: 256,
            rnn_num_layers: 4,
            bidirectional: true,
            listen_vec_size: 256,
            last_fc: true,
            batch_norm_eps: 1e-5,
        }
    }
}

impl ListenerConfig {
    /// Каналы после последней стадии (c × 2^(stages-1)).
    pub fn out_channels(&self) -> usize {
        self.conv_channels << (NUM_CONV_STAGES - 1)
    }

    /// Количество частотных бинов на выходе свёрточной части.
    pub fn freq_out(&self) -> usize {
        match self.pool_axis {
            PoolAxis::Frequency => (0..NUM_CONV_STAGES).fold(self.freq_bins, |n, _| pooled_extent(n)),
            PoolAxis::Time => self.freq_bins,
        }
    }

    /// Ширина входа LSTM: каналы × частоты.
    pub fn rnn_input_size(&self) -> usize {
        self.out_channels() * self.freq_out()
    }

    /// Длина закодированной последовательности для входа длины `len`.
    pub fn encoded_len(&self, len: usize) -> usize {
        match self.pool_axis {
            PoolAxis::Frequency => len,
            PoolAxis::Time => (0..NUM_CONV_STAGES).fold(len, |n, _| pooled_extent(n)),
        }
    }

    pub fn validate(&self) -> LasResult<()> {
        if self.in_channels == 0 || self.conv_channels == 0 {
            return Err(LasError::Config("listener: channel counts must be > 0".into()));
        }
        if self.freq_bins == 0 {
            return Err(LasError::Config("listener: freq_bins must be > 0".into()));
        }
        if self.rnn_hidden_size == 0 || self.rnn_num_layers == 0 {
            return Err(LasError::Config("listener: empty recurrent stack".into()));
        }
        if !self.last_fc && self.rnn_hidden_size != self.listen_vec_size {
            return Err(LasError::Config(format!(
                "listener: без last_fc rnn_hidden_size ({}) должен совпадать с listen_vec_size ({})",
                self.rnn_hidden_size, self.listen_vec_size
            )));
        }
        Ok(())
    }
}

/// Вариант механизма внимания.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttentionKind {
    /// Dot-product внимание с маскированным softmax (одна или несколько голов).
    DotProduct,
    /// Multi-head scaled dot-product с аддитивной маской и dropout.
    MultiHeadSelfAttention { dropout: f32 },
}

/// Конфигурация внимания декодера.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionConfig {
    pub kind: AttentionKind,

    /// Размерность пространства скоров (на одну голову для dot-product).
    pub proj_hidden_size: usize,

    /// Количество голов.
    pub num_heads: usize,

    /// Обучаемые проекции query/key (только dot-product).
    pub apply_proj: bool,

    /// Делить скоры на sqrt(d).
    pub scale_scores: bool,

    /// Epsilon в знаменателе маскированного softmax.
    pub softmax_eps: f64,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            kind: AttentionKind::DotProduct,
            proj_hidden_size: 256,
            num_heads: 4,
            apply_proj: true,
            scale_scores: true,
            softmax_eps: 1e-5,
        }
    }
}

impl AttentionConfig {
    /// Проверка согласованности с шириной состояния декодера и выхода энкодера.
    pub fn validate(&self, state_vec_size: usize, listen_vec_size: usize) -> LasResult<()> {
        if self.num_heads == 0 {
            return Err(LasError::Config("attention: num_heads must be > 0".into()));
        }
        match self.kind {
            AttentionKind::DotProduct => {
                if !self.apply_proj && state_vec_size != listen_vec_size * self.num_heads {
                    return Err(LasError::Config(format!(
                        "attention: без проекции state_vec_size ({state_vec_size}) должен быть \
                         listen_vec_size × num_heads ({listen_vec_size} × {})",
                        self.num_heads
                    )));
                }
            }
            AttentionKind::MultiHeadSelfAttention { dropout } => {
                if self.proj_hidden_size % self.num_heads != 0 {
                    return Err(LasError::Config(format!(
                        "attention: proj_hidden_size ({}) не делится на num_heads ({})",
                        self.proj_hidden_size, self.num_heads
                    )));
                }
                if self.proj_hidden_size != listen_vec_size {
                    return Err(LasError::Config(format!(
                        "attention: контекст self-attention ({}) должен совпадать с listen_vec_size ({listen_vec_size})",
                        self.proj_hidden_size
                    )));
                }
                if !(0.0..1.0).contains(&dropout) {
                    return Err(LasError::Config(format!("attention: dropout {dropout} вне [0, 1)")));
                }
            }
        }
        Ok(())
    }
}

/// Конфигурация декодера (Speller).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpellerConfig {
    /// Размер скрытого состояния LSTM (state_vec_size).
    pub rnn_hidden_size: usize,

    /// Количество слоёв LSTM.
    pub rnn_num_layers: usize,

    /// Максимальное число шагов декодирования.
    pub max_seq_len: usize,

    /// Сколько подряд eos считается завершением.
    pub num_eos: usize,

    /// Маскировать паддинг энкодера во внимании.
    pub masked_attend: bool,

    /// Скрытый слой классификатора символов.
    pub chardist_hidden: usize,

    pub attention: AttentionConfig,
}

impl Default for SpellerConfig {
    fn default() -> Self {
        Self {
            rnn_hidden_size: 256,
            rnn_num_layers: 2,
            max_seq_len: 256,
            num_eos: 3,
            masked_attend: true,
            chardist_hidden: 128,
            attention: AttentionConfig::default(),
        }
    }
}

impl SpellerConfig {
    pub fn validate(&self, listen_vec_size: usize) -> LasResult<()> {
        if self.rnn_hidden_size == 0 || self.rnn_num_layers == 0 {
            return Err(LasError::Config("speller: empty recurrent stack".into()));
        }
        if self.max_seq_len == 0 {
            return Err(LasError::Config("speller: max_seq_len must be > 0".into()));
        }
        if self.num_eos == 0 {
            return Err(LasError::Config("speller: num_eos must be > 0".into()));
        }
        self.attention.validate(self.rnn_hidden_size, listen_vec_size)
    }
}

/// Конфигурация расписания teacher forcing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfrSchedulerConfig {
    /// Значение во время разогрева.
    pub upper: f64,

    /// Значение после затухания.
    pub lower: f64,

    /// Длительность разогрева в эпохах.
    pub warm_up: usize,

    /// Длительность линейного затухания в эпохах.
    pub epochs: usize,

    /// Начинать расписание заново после конца затухания.
    pub restart: bool,
}

impl Default for TfrSchedulerConfig {
    fn default() -> Self {
        Self {
            upper: 0.9,
            lower: 0.1,
            warm_up: 5,
            epochs: 32,
            restart: false,
        }
    }
}

impl TfrSchedulerConfig {
    pub fn validate(&self) -> LasResult<()> {
        if !(0.0 <= self.lower && self.lower <= self.upper && self.upper < 1.0) {
            return Err(LasError::Config(format!(
                "tfr: требуется 0 <= lower ({}) <= upper ({}) < 1",
                self.lower, self.upper
            )));
        }
        if self.epochs == 0 {
            return Err(LasError::Config("tfr: epochs must be > 0".into()));
        }
        Ok(())
    }
}

/// Корневая конфигурация модели.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LasConfig {
    /// Размер базового словаря (без sos/eos).
    pub num_labels: usize,

    /// Индекс blank-метки для паддинга целей.
    pub blank: u32,

    /// Floor для log-сглаживания выходов.
    pub smoothing: f64,

    /// Seed генератора для scheduled sampling и шума меток.
    pub seed: u64,

    pub listener: ListenerConfig,

    pub speller: SpellerConfig,

    pub tfr_scheduler: TfrSchedulerConfig,
}

impl Default for LasConfig {
    fn default() -> Self {
        Self {
            num_labels: 30,
            blank: 0,
            smoothing: 0.001,
            seed: 42,
            listener: ListenerConfig::default(),
            speller: SpellerConfig::default(),
            tfr_scheduler: TfrSchedulerConfig::default(),
        }
    }
}

impl LasConfig {
    /// Полный размер словаря: базовые метки + sos + eos.
    pub fn label_vec_size(&self) -> usize {
        self.num_labels + 2
    }

    pub fn sos(&self) -> u32 {
        (self.label_vec_size() - 2) as u32
    }

    pub fn eos(&self) -> u32 {
        (self.label_vec_size() - 1) as u32
    }

    pub fn validate(&self) -> LasResult<()> {
        if self.num_labels == 0 {
            return Err(LasError::Config("num_labels must be > 0".into()));
        }
        if self.blank as usize >= self.num_labels {
            return Err(LasError::Config(format!(
                "blank ({}) вне базового словаря ({})",
                self.blank, self.num_labels
            )));
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(LasError::Config(format!("smoothing {} вне [0, 1)", self.smoothing)));
        }
        self.listener.validate()?;
        self.speller.validate(self.listener.listen_vec_size)?;
        self.tfr_scheduler.validate()
    }

    /// Загрузить и проверить конфигурацию из JSON-файла.
    pub fn from_json_file(path: impl AsRef<Path>) -> LasResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}
