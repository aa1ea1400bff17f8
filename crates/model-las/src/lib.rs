//! Listen-Attend-Spell: чистая Rust-реализация на Candle.
//!
//! Свёрточно-рекуррентный энкодер спектрограмм + авторегрессионный
//! attention-декодер символов со scheduled sampling.

pub mod attention;
pub mod layers;
pub mod listener;
pub mod model;
pub mod scheduler;
pub mod smoothing;
pub mod speller;

pub use model::{InferOutput, LasOutput, ListenAttendSpell, TrainOutput};
pub use scheduler::{TfrScheduler, TfrSchedulerState};
