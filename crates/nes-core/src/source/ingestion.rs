//! Rate schedules for ingestion-rate gathering.

use std::fmt;
use std::time::Duration;

use super::SourceError;

/// Length of one production period.
pub const INGESTION_PERIOD: Duration = Duration::from_millis(100);

/// Periods each schedule step is held for (one second).
const PERIODS_PER_STEP: u64 = 10;

const UNIFORM: &[u64] = &[100];
/// Moderate surge.
const M1: &[u64] = &[100, 150, 200, 150];
/// Strong surge.
const M2: &[u64] = &[100, 200, 400, 200];
/// Moderate dip.
const D1: &[u64] = &[100, 75, 50, 75];
/// Strong dip.
const D2: &[u64] = &[100, 50, 25, 50];

/// How the per-period buffer count evolves over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IngestionRateMode {
    /// Constant rate.
    #[default]
    Uniform,
    /// Rate rises to 2x and back, one step per second.
    M1,
    /// Rate rises to 4x and back, one step per second.
    M2,
    /// Rate falls to 0.5x and back, one step per second.
    D1,
    /// Rate falls to 0.25x and back, one step per second.
    D2,
    /// Sine-shaped rate. Not supported.
    Sinus,
    /// Cosine-shaped rate. Not supported.
    Cosinus,
}

impl IngestionRateMode {
    fn table(self) -> Option<&'static [u64]> {
        match self {
            Self::Uniform => Some(UNIFORM),
            Self::M1 => Some(M1),
            Self::M2 => Some(M2),
            Self::D1 => Some(D1),
            Self::D2 => Some(D2),
            Self::Sinus | Self::Cosinus => None,
        }
    }
}

impl fmt::Display for IngestionRateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uniform => "UNIFORM",
            Self::M1 => "M1",
            Self::M2 => "M2",
            Self::D1 => "D1",
            Self::D2 => "D2",
            Self::Sinus => "SINUS",
            Self::Cosinus => "COSINUS",
        };
        f.write_str(name)
    }
}

/// Number of buffers to produce in each 100 ms period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionSchedule {
    per_period: u64,
    table: &'static [u64],
}

impl IngestionSchedule {
    /// Builds a schedule for `buffers_per_second` shaped by `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidConfig`] for rates below 10 buffers per
    /// second and [`SourceError::UnsupportedIngestionMode`] for the sine
    /// shaped modes.
    pub fn new(buffers_per_second: u64, mode: IngestionRateMode) -> Result<Self, SourceError> {
        if buffers_per_second < 10 {
            return Err(SourceError::InvalidConfig(format!(
                "ingestion rate {buffers_per_second} is below 10 buffers per second"
            )));
        }
        let table = mode
            .table()
            .ok_or(SourceError::UnsupportedIngestionMode(mode))?;
        Ok(Self {
            per_period: buffers_per_second / 10,
            table,
        })
    }

    /// Buffers to produce in period `period` (0-based).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn buffers_in_period(&self, period: u64) -> u64 {
        let step = (period / PERIODS_PER_STEP) as usize % self.table.len();
        (self.per_period * self.table[step] / 100).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_rate() {
        let schedule = IngestionSchedule::new(100, IngestionRateMode::Uniform).unwrap();
        assert!((0..50).all(|p| schedule.buffers_in_period(p) == 10));
    }

    #[test]
    fn test_surge_and_dip() {
        let m2 = IngestionSchedule::new(100, IngestionRateMode::M2).unwrap();
        assert_eq!(m2.buffers_in_period(0), 10);
        assert_eq!(m2.buffers_in_period(25), 40);
        assert_eq!(m2.buffers_in_period(40), 10);

        let d2 = IngestionSchedule::new(40, IngestionRateMode::D2).unwrap();
        assert_eq!(d2.buffers_in_period(20), 1);
    }

    #[test]
    fn test_rejected_modes() {
        let err = IngestionSchedule::new(100, IngestionRateMode::Sinus).unwrap_err();
        assert!(err.to_string().contains("not yet supported"));
        assert!(matches!(
            IngestionSchedule::new(100, IngestionRateMode::Cosinus),
            Err(SourceError::UnsupportedIngestionMode(IngestionRateMode::Cosinus))
        ));
        assert!(matches!(
            IngestionSchedule::new(5, IngestionRateMode::Uniform),
            Err(SourceError::InvalidConfig(_))
        ));
    }
}
