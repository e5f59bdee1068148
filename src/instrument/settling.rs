//! Integration time and settling-time estimate for the LCR meter.
//!
//! The estimate is a fixed lookup table of dead times measured on the
//! E4980A, not a physical model. Low test frequencies and long apertures
//! need considerably longer before `FETC?` returns a fresh reading.

use crate::error::DaqError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Measurement aperture shared by both instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IntegrationTime {
    /// `SHOR` on the LCR meter, `SLI 1` on the analyzer.
    Short,
    /// `MED` on the LCR meter, `SLI 2` on the analyzer.
    Medium,
    /// `LONG` on the LCR meter, `SLI 3` on the analyzer.
    Long,
}

impl IntegrationTime {
    /// Token used in the LCR `APER` command.
    pub fn scpi_token(self) -> &'static str {
        match self {
            IntegrationTime::Short => "SHOR",
            IntegrationTime::Medium => "MED",
            IntegrationTime::Long => "LONG",
        }
    }

    /// Code used in the analyzer `SLI` command.
    pub fn analyzer_code(self) -> u8 {
        match self {
            IntegrationTime::Short => 1,
            IntegrationTime::Medium => 2,
            IntegrationTime::Long => 3,
        }
    }

    /// Base delays in seconds for the bands f >= 1 kHz, 0.1 <= f < 1 kHz and f < 0.1 kHz.
    fn band_delays(self) -> [f64; 3] {
        match self {
            IntegrationTime::Short => [0.05, 0.3, 1.8],
            IntegrationTime::Medium => [0.15, 0.4, 1.8],
            IntegrationTime::Long => [0.8, 1.0, 2.0],
        }
    }
}

impl fmt::Display for IntegrationTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scpi_token())
    }
}

impl FromStr for IntegrationTime {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SHOR" | "SHORT" | "1" => Ok(IntegrationTime::Short),
            "MED" | "MEDIUM" | "2" => Ok(IntegrationTime::Medium),
            "LONG" | "3" => Ok(IntegrationTime::Long),
            other => Err(DaqError::InvalidValue(format!(
                "integration time '{}' is not one of SHOR, MED, LONG",
                other
            ))),
        }
    }
}

impl TryFrom<String> for IntegrationTime {
    type Error = DaqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IntegrationTime> for String {
    fn from(value: IntegrationTime) -> Self {
        value.scpi_token().to_string()
    }
}

/// Seconds to wait after `TRIGGER` before fetching a result.
///
/// `frequency_khz` selects one of three bands (>= 1, [0.1, 1), < 0.1 kHz) and
/// the band delay is multiplied by `averaging`.
pub fn estimate_settling_time(integration: IntegrationTime, frequency_khz: f64, averaging: u32) -> f64 {
    let [high, mid, low] = integration.band_delays();
    let base = if frequency_khz < 0.1 {
        low
    } else if frequency_khz < 1.0 {
        mid
    } else {
        high
    };
    base * f64::from(averaging)
}

/// [`estimate_settling_time`] as a `Duration`.
pub fn settling_duration(integration: IntegrationTime, frequency_khz: f64, averaging: u32) -> Duration {
    Duration::from_secs_f64(estimate_settling_time(integration, frequency_khz, averaging))
}
