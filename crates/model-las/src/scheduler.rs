//! Расписание teacher forcing ratio по эпохам.
//!
//! - `upper`, пока `epoch < warm_up`
//! - линейное затухание `upper + slope * (epoch - warm_up)` до `warm_up + epochs`,
//!   где `slope = (lower - upper) / epochs`
//! - `lower` после окончания затухания
//!
//! Планировщик не держит ссылку на модель: `step` возвращает новое значение,
//! которое передаётся в `ListenAttendSpell::forward_train`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use las_core::{LasError, LasResult, TfrSchedulerConfig};

/// Снимок состояния планировщика.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TfrSchedulerState {
    pub upper: f64,
    pub lower: f64,
    pub warm_up: usize,
    pub end_epochs: usize,
    pub slope: f64,
    pub restart: bool,
    pub last_epoch: i64,
}

#[derive(Debug, Clone)]
pub struct TfrScheduler {
    state: TfrSchedulerState,
}

impl TfrScheduler {
    pub fn new(config: &TfrSchedulerConfig) -> LasResult<Self> {
        config.validate()?;
        Ok(Self {
            state: TfrSchedulerState {
                upper: config.upper,
                lower: config.lower,
                warm_up: config.warm_up,
                end_epochs: config.warm_up + config.epochs,
                slope: (config.lower - config.upper) / config.epochs as f64,
                restart: config.restart,
                last_epoch: -1,
            },
        })
    }

    /// Текущее значение ratio для `last_epoch`.
    pub fn ratio(&self) -> f64 {
        let s = &self.state;
        if s.last_epoch < s.warm_up as i64 {
            s.upper
        } else if s.last_epoch < s.end_epochs as i64 {
            s.upper + s.slope * (s.last_epoch - s.warm_up as i64) as f64
        } else {
            s.lower
        }
    }

    /// Перейти к следующей (или заданной) эпохе и вернуть новый ratio.
    pub fn step(&mut self, epoch: Option<usize>) -> f64 {
        if self.state.restart && self.state.last_epoch == self.state.end_epochs as i64 {
            self.state.last_epoch = -1;
        }
        self.state.last_epoch = match epoch {
            Some(epoch) => epoch as i64,
            None => self.state.last_epoch + 1,
        };
        let ratio = self.ratio();
        debug!("TFR: эпоха {} → {ratio:.4}", self.state.last_epoch);
        ratio
    }

    pub fn last_epoch(&self) -> i64 {
        self.state.last_epoch
    }

    pub fn state_dict(&self) -> TfrSchedulerState {
        self.state.clone()
    }

    pub fn load_state_dict(&mut self, state: TfrSchedulerState) -> LasResult<()> {
        if !(0.0 <= state.lower && state.lower <= state.upper && state.upper < 1.0) {
            return Err(LasError::Config(format!(
                "tfr: снимок с некорректным диапазоном [{}, {}]",
                state.lower, state.upper
            )));
        }
        self.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(restart: bool) -> TfrScheduler {
        TfrScheduler::new(&TfrSchedulerConfig {
            upper: 0.9,
            lower: 0.1,
            warm_up: 2,
            epochs: 4,
            restart,
        })
        .unwrap()
    }

    #[test]
    fn test_warm_up_then_linear_decay_then_floor() {
        let mut s = scheduler(false);
        assert_eq!(s.last_epoch(), -1);
        let ratios: Vec<f64> = (0..10).map(|_| s.step(None)).collect();

        assert_eq!(ratios[0], 0.9);
        assert_eq!(ratios[1], 0.9);
        assert!((ratios[3] - 0.7).abs() < 1e-12);
        assert!((ratios[5] - 0.3).abs() < 1e-12);
        for r in &ratios[6..] {
            assert_eq!(*r, 0.1);
        }
        assert!(ratios.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn test_explicit_epoch_overrides_counter() {
        let mut s = scheduler(false);
        assert!((s.step(Some(4)) - 0.5).abs() < 1e-12);
        assert_eq!(s.last_epoch(), 4);
        assert!((s.step(None) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_restart_wraps_after_end_of_decay() {
        let mut s = scheduler(true);
        for _ in 0..7 {
            s.step(None);
        }
        assert_eq!(s.last_epoch(), 6);
        // last_epoch == end → сброс на -1, следующий шаг снова эпоха 0.
        assert_eq!(s.step(None), 0.9);
        assert_eq!(s.last_epoch(), 0);
    }

    #[test]
    fn test_snapshot_survives_json() {
        let mut s = scheduler(false);
        s.step(Some(3));
        let json = serde_json::to_string(&s.state_dict()).unwrap();

        let mut restored = scheduler(false);
        restored
            .load_state_dict(serde_json::from_str(&json).unwrap())
            .unwrap();
        assert_eq!(restored.state_dict(), s.state_dict());
        assert_eq!(restored.ratio(), s.ratio());
    }

    #[test]
    fn test_invalid_range_is_rejected() {
        let err = TfrScheduler::new(&TfrSchedulerConfig {
            upper: 0.2,
            lower: 0.5,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, LasError::Config(_)));
    }
}
