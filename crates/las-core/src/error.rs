//! Error types for the LAS workspace.

use thiserror::Error;

/// Main error type for LAS operations.
#[derive(Error, Debug)]
pub enum LasError {
    /// Несогласованные гиперпараметры. Фатально на этапе конструирования.
    #[error("Config error: {0}")]
    Config(String),

    /// Некорректный батч (длины, размеры, метки).
    #[error("Data error: {0}")]
    Data(String),

    /// После фильтрации в обучающем батче не осталось ни одного сэмпла.
    #[error("Empty batch: all samples were filtered out (x_len <= y_len or y_len >= max_seq_len)")]
    EmptyBatch,

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for LAS operations.
pub type LasResult<T> = Result<T, LasError>;
