//! # las-core
//!
//! Базовые типы, конфигурация и ошибки для Listen-Attend-Spell.
//!
//! - Входные батчи ([`AcousticBatch`], [`LabelBatch`])
//! - Конфигурации энкодера, внимания, декодера и расписания teacher forcing
//! - Унифицированная обработка ошибок через [`LasError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    AttentionConfig, AttentionKind, LasConfig, ListenerConfig, PoolAxis, SpellerConfig,
    TfrSchedulerConfig,
};
pub use error::{LasError, LasResult};
pub use types::{AcousticBatch, LabelBatch};
