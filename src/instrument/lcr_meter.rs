//! Keysight E4980A LCR meter controller
//!
//! Drives capacitance/resistance measurements over an [`InstrumentSession`].
//! The controller mirrors the instrument's bias output and trigger source
//! locally so that unsafe transitions are rejected without a round trip:
//!
//! ```text
//! initialize ──► Idle (bias OFF, trigger INT)
//!    configure ──► Configured (trigger BUS)
//!       apply_bias ──► Measuring (bias ON at 0 V)
//!          set_bias_voltage / measure_rc (repeatable)
//!       release ──► Idle (bias OFF, trigger INT)
//! ```
//!
//! Bias output is only ever switched on after the bias voltage has been
//! programmed to 0 V.
//!
//! ## Configuration
//!
//! ```toml
//! [lcr]
//! resource = "GPIB0::18::INSTR"
//!
//! [lcr.measurement]
//! frequency_khz = 400.0
//! ac_level_v = 0.04
//! integration = "MED"
//! averaging = 4
//! function = "CSRS"
//! ```

use super::settling::{settling_duration, IntegrationTime};
use crate::adapters::{open_session, AdapterConfig, InstrumentSession};
use crate::error::{AppResult, DaqError};
use crate::shutdown::ShutdownSignal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Hold time after switching bias output on.
pub const BIAS_SETTLE: Duration = Duration::from_millis(50);

/// Impedance parameter pair returned by `FETC?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImpedanceFunction {
    /// Series capacitance and series resistance.
    Csrs,
    /// Parallel capacitance and parallel resistance.
    Cprp,
}

impl fmt::Display for ImpedanceFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImpedanceFunction::Csrs => f.write_str("CSRS"),
            ImpedanceFunction::Cprp => f.write_str("CPRP"),
        }
    }
}

/// Measurement settings sent by [`LcrMeter::configure`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LcrConfig {
    /// Test signal frequency in kHz.
    pub frequency_khz: f64,
    /// Test signal level in volts.
    pub ac_level_v: f64,
    /// Measurement aperture.
    pub integration: IntegrationTime,
    /// Averaging count for `APER`.
    pub averaging: u32,
    /// Impedance parameter pair.
    pub function: ImpedanceFunction,
}

impl Default for LcrConfig {
    fn default() -> Self {
        Self {
            frequency_khz: 400.0,
            ac_level_v: 0.04,
            integration: IntegrationTime::Medium,
            averaging: 4,
            function: ImpedanceFunction::Csrs,
        }
    }
}

impl LcrConfig {
    /// Checks the values against the instrument's accepted ranges.
    pub fn validate(&self) -> AppResult<()> {
        if !(0.02..=2000.0).contains(&self.frequency_khz) {
            return Err(DaqError::InvalidValue(format!(
                "frequency {} kHz outside 0.02-2000 kHz",
                self.frequency_khz
            )));
        }
        if !(0.0..=20.0).contains(&self.ac_level_v) {
            return Err(DaqError::InvalidValue(format!(
                "AC level {} V outside 0-20 V",
                self.ac_level_v
            )));
        }
        if !(1..=256).contains(&self.averaging) {
            return Err(DaqError::InvalidValue(format!(
                "averaging count {} outside 1-256",
                self.averaging
            )));
        }
        Ok(())
    }

    /// Delay between `TRIGGER` and `FETC?` for these settings.
    pub fn settling_time(&self) -> Duration {
        settling_duration(self.integration, self.frequency_khz, self.averaging)
    }
}

/// Local mirror of the DC bias output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BiasState {
    /// Output disabled.
    Off,
    /// Output enabled at 0 V.
    OnZero,
    /// Output enabled at a nonzero voltage.
    OnApplied {
        /// Programmed bias in volts.
        volts: f64,
    },
}

impl BiasState {
    /// True while the bias output is enabled.
    pub fn is_on(self) -> bool {
        !matches!(self, BiasState::Off)
    }
}

/// Local mirror of the trigger source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Free-running internal trigger.
    Internal,
    /// Explicit `TRIGGER` commands.
    Bus,
}

/// One capacitance/resistance reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImpedanceReading {
    /// Capacitance in farads.
    pub capacitance: f64,
    /// Resistance in ohms.
    pub resistance: f64,
}

/// Parses a `FETC?` response holding exactly two comma-separated numbers.
pub fn parse_rc_response(response: &str) -> AppResult<ImpedanceReading> {
    let fields: Vec<&str> = response.trim().split(',').map(str::trim).collect();
    if fields.len() != 2 {
        return Err(DaqError::Parse(format!(
            "expected 2 fields in FETC? response, got {}: '{}'",
            fields.len(),
            response.trim()
        )));
    }
    let number = |field: &str| {
        field.parse::<f64>().map_err(|e| {
            DaqError::Parse(format!(
                "invalid number '{}' in FETC? response '{}': {}",
                field,
                response.trim(),
                e
            ))
        })
    };
    Ok(ImpedanceReading {
        capacitance: number(fields[0])?,
        resistance: number(fields[1])?,
    })
}

fn volts(value: f64) -> String {
    // Avoid sending "-0V".
    let value = if value == 0.0 { 0.0 } else { value };
    format!("{}V", value)
}

/// Controller for one LCR meter session.
pub struct LcrMeter<S: InstrumentSession> {
    session: S,
    config: LcrConfig,
    bias: BiasState,
    trigger: TriggerSource,
    shutdown: ShutdownSignal,
}

impl LcrMeter<Box<dyn InstrumentSession>> {
    /// Opens `resource` and initializes the meter.
    ///
    /// # Errors
    /// `Connection` if the address cannot be opened.
    pub async fn connect(
        resource: &str,
        adapter: &AdapterConfig,
        config: LcrConfig,
    ) -> AppResult<Self> {
        info!("Connecting to LCR meter at {}", resource);
        let session = open_session(resource, adapter).await?;
        Self::initialize(session, config).await
    }
}

impl<S: InstrumentSession> LcrMeter<S> {
    /// Takes ownership of an open session and forces bias to 0 V / OFF.
    pub async fn initialize(session: S, config: LcrConfig) -> AppResult<Self> {
        config.validate()?;
        let mut meter = Self {
            session,
            config,
            bias: BiasState::Off,
            trigger: TriggerSource::Internal,
            shutdown: ShutdownSignal::new(),
        };
        meter.send("BIAS:VOLT 0V").await?;
        meter.send("BIAS:STAT OFF").await?;
        info!("LCR meter {} initialized", meter.session.resource());
        Ok(meter)
    }

    /// Makes the settling and bias delays interruptible by `signal`.
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = signal;
        self
    }

    /// Bus address of the session.
    pub fn resource(&self) -> &str {
        self.session.resource()
    }

    /// Measurement settings.
    pub fn config(&self) -> &LcrConfig {
        &self.config
    }

    /// Mirrored bias output state.
    pub fn bias_state(&self) -> BiasState {
        self.bias
    }

    /// Mirrored trigger source.
    pub fn trigger_source(&self) -> TriggerSource {
        self.trigger
    }

    /// Shutdown signal used for interruptible delays.
    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    async fn send(&mut self, command: &str) -> AppResult<()> {
        debug!("LCR {} <- {}", self.session.resource(), command);
        self.session.write(command).await
    }

    /// Puts the meter under bus trigger and sends the measurement settings.
    pub async fn configure(&mut self) -> AppResult<()> {
        self.send("TRIG:SOUR BUS").await?;
        self.trigger = TriggerSource::Bus;
        self.send("INIT:CONT ON").await?;

        let commands = [
            format!("APER {},{}", self.config.integration, self.config.averaging),
            format!("FUNC:IMP {}", self.config.function),
            format!("VOLT {}", volts(self.config.ac_level_v)),
            format!("FREQ {}KHZ", self.config.frequency_khz),
        ];
        for command in &commands {
            self.send(command).await?;
        }
        info!(
            "LCR meter configured: {} kHz, {} V, {} x{}, {}",
            self.config.frequency_khz,
            self.config.ac_level_v,
            self.config.integration,
            self.config.averaging,
            self.config.function
        );
        Ok(())
    }

    /// Programs 0 V, switches the bias output on and waits for it to settle.
    ///
    /// # Errors
    /// `InvalidState` if the output is already on.
    pub async fn apply_bias(&mut self) -> AppResult<()> {
        if self.bias.is_on() {
            return Err(DaqError::InvalidState(
                "bias output is already enabled".to_string(),
            ));
        }
        self.send("BIAS:VOLT 0V").await?;
        self.send("BIAS:STAT ON").await?;
        self.bias = BiasState::OnZero;
        self.shutdown.sleep(BIAS_SETTLE).await?;
        info!("LCR bias output enabled at 0 V");
        Ok(())
    }

    /// Changes the DC bias while the output is on.
    ///
    /// # Errors
    /// `InvalidState` if the output is off.
    pub async fn set_bias_voltage(&mut self, bias_volts: f64) -> AppResult<()> {
        if !self.bias.is_on() {
            return Err(DaqError::InvalidState(
                "bias output must be enabled at 0 V before programming a bias".to_string(),
            ));
        }
        if !bias_volts.is_finite() {
            return Err(DaqError::InvalidValue(format!("bias voltage {}", bias_volts)));
        }
        self.send(&format!("BIAS:VOLT {}", volts(bias_volts))).await?;
        self.bias = if bias_volts == 0.0 {
            BiasState::OnZero
        } else {
            BiasState::OnApplied { volts: bias_volts }
        };
        Ok(())
    }

    /// Triggers one measurement and returns `(capacitance, resistance)`.
    ///
    /// # Errors
    /// `InvalidState` before [`configure`](Self::configure), `Cancelled` if
    /// the shutdown signal fires while settling, `Parse` on a malformed reply.
    pub async fn measure_rc(&mut self) -> AppResult<ImpedanceReading> {
        if self.trigger != TriggerSource::Bus {
            return Err(DaqError::InvalidState(
                "meter must be configured for bus trigger before measuring".to_string(),
            ));
        }
        if !self.bias.is_on() {
            debug!("measuring with bias output off");
        }
        self.send("TRIGGER").await?;
        self.shutdown.sleep(self.config.settling_time()).await?;
        let response = self.session.query("FETC?").await?;
        let reading = parse_rc_response(&response)?;
        debug!(
            "LCR reading C={} R={}",
            reading.capacitance, reading.resistance
        );
        Ok(reading)
    }

    /// Discharges and disables the bias output and restores the internal trigger.
    ///
    /// The output is only switched on for the discharge hold once 0 V has been
    /// accepted; if the zero write fails, the hold is skipped and the output
    /// goes straight to OFF. The remaining commands are attempted even if an
    /// earlier one fails. The discharge hold is not interruptible. Calling
    /// this repeatedly sends the same sequence each time.
    pub async fn release(&mut self) -> AppResult<()> {
        let mut errors = Vec::new();

        match self.send("BIAS:VOLT 0V").await {
            Ok(()) => match self.send("BIAS:STAT ON").await {
                Ok(()) => tokio::time::sleep(BIAS_SETTLE).await,
                Err(e) => errors.push(e),
            },
            Err(e) => {
                warn!("LCR bias could not be zeroed, disabling output without discharge: {}", e);
                errors.push(e);
            }
        }
        match self.send("BIAS:STAT OFF").await {
            Ok(()) => self.bias = BiasState::Off,
            Err(e) => errors.push(e),
        }
        match self.send("TRIG:SOURCE INT").await {
            Ok(()) => self.trigger = TriggerSource::Internal,
            Err(e) => errors.push(e),
        }

        match errors.len() {
            0 => {
                info!("LCR meter {} released", self.session.resource());
                Ok(())
            }
            1 => Err(errors.remove(0)),
            _ => Err(DaqError::ShutdownFailed(errors)),
        }
    }

    /// Releases the meter and closes the session.
    pub async fn close(&mut self) -> AppResult<()> {
        let released = self.release().await;
        self.session.close().await?;
        released
    }
}

impl<S: InstrumentSession> Drop for LcrMeter<S> {
    fn drop(&mut self) {
        if self.bias.is_on() {
            warn!(
                "LCR meter {} dropped with bias output enabled ({:?}); call release() first",
                self.session.resource(),
                self.bias
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockAdapter, Transcript};

    async fn meter_with(adapter: MockAdapter) -> (LcrMeter<MockAdapter>, Transcript) {
        let transcript = adapter.transcript();
        let meter = LcrMeter::initialize(adapter, LcrConfig::default())
            .await
            .unwrap();
        (meter, transcript)
    }

    #[tokio::test]
    async fn test_initialize_zeroes_bias() {
        let (meter, transcript) = meter_with(MockAdapter::new("MOCK::LCR")).await;
        assert_eq!(transcript.commands(), vec!["BIAS:VOLT 0V", "BIAS:STAT OFF"]);
        assert_eq!(meter.bias_state(), BiasState::Off);
        assert_eq!(meter.trigger_source(), TriggerSource::Internal);
    }

    #[tokio::test]
    async fn test_initialize_rejects_invalid_config() {
        let config = LcrConfig {
            averaging: 0,
            ..LcrConfig::default()
        };
        let result = LcrMeter::initialize(MockAdapter::new("MOCK::LCR"), config).await;
        assert!(matches!(result, Err(DaqError::InvalidValue(_))));
    }

    #[tokio::test]
    async fn test_configure_command_order() {
        let (mut meter, transcript) = meter_with(MockAdapter::new("MOCK::LCR")).await;
        transcript.clear();
        meter.configure().await.unwrap();
        assert_eq!(
            transcript.commands(),
            vec![
                "TRIG:SOUR BUS",
                "INIT:CONT ON",
                "APER MED,4",
                "FUNC:IMP CSRS",
                "VOLT 0.04V",
                "FREQ 400KHZ",
            ]
        );
        assert_eq!(meter.trigger_source(), TriggerSource::Bus);
    }

    #[tokio::test]
    async fn test_configure_fails_on_rejected_write() {
        let (mut meter, _) = meter_with(MockAdapter::new("MOCK::LCR").fail_on("FUNC:IMP CSRS")).await;
        assert!(matches!(meter.configure().await, Err(DaqError::Instrument(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_bias_zero_before_enable() {
        let (mut meter, transcript) = meter_with(MockAdapter::new("MOCK::LCR")).await;
        transcript.clear();
        let start = tokio::time::Instant::now();
        meter.apply_bias().await.unwrap();

        assert_eq!(transcript.commands(), vec!["BIAS:VOLT 0V", "BIAS:STAT ON"]);
        assert!(start.elapsed() >= BIAS_SETTLE);
        assert_eq!(meter.bias_state(), BiasState::OnZero);
        meter.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_bias_twice_is_rejected() {
        let (mut meter, transcript) = meter_with(MockAdapter::new("MOCK::LCR")).await;
        meter.apply_bias().await.unwrap();
        let sent = transcript.commands().len();

        assert!(matches!(meter.apply_bias().await, Err(DaqError::InvalidState(_))));
        assert_eq!(transcript.commands().len(), sent);
        meter.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_bias_voltage_requires_output_on() {
        let (mut meter, transcript) = meter_with(MockAdapter::new("MOCK::LCR")).await;
        assert!(matches!(
            meter.set_bias_voltage(1.5).await,
            Err(DaqError::InvalidState(_))
        ));
        assert!(transcript.position("BIAS:VOLT 1.5V").is_none());

        meter.apply_bias().await.unwrap();
        meter.set_bias_voltage(1.5).await.unwrap();
        assert_eq!(meter.bias_state(), BiasState::OnApplied { volts: 1.5 });
        let on = transcript.position("BIAS:STAT ON").unwrap();
        let applied = transcript.position("BIAS:VOLT 1.5V").unwrap();
        assert!(on < applied);

        meter.set_bias_voltage(-0.0).await.unwrap();
        assert_eq!(meter.bias_state(), BiasState::OnZero);
        assert_eq!(transcript.commands().last().unwrap(), "BIAS:VOLT 0V");
        meter.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_sequence_and_idempotence() {
        let (mut meter, transcript) = meter_with(MockAdapter::new("MOCK::LCR")).await;
        meter.configure().await.unwrap();
        meter.apply_bias().await.unwrap();

        let expected = vec!["BIAS:VOLT 0V", "BIAS:STAT ON", "BIAS:STAT OFF", "TRIG:SOURCE INT"];
        transcript.clear();
        meter.release().await.unwrap();
        assert_eq!(transcript.commands(), expected);
        assert_eq!(meter.bias_state(), BiasState::Off);
        assert_eq!(meter.trigger_source(), TriggerSource::Internal);

        transcript.clear();
        meter.release().await.unwrap();
        assert_eq!(transcript.commands(), expected);
        assert_eq!(meter.bias_state(), BiasState::Off);
        assert_eq!(meter.trigger_source(), TriggerSource::Internal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_attempts_every_command() {
        let adapter = MockAdapter::new("MOCK::LCR")
            .fail_on("BIAS:STAT ON")
            .fail_on("TRIG:SOURCE INT");
        let transcript = adapter.transcript();
        let mut meter = LcrMeter::initialize(adapter, LcrConfig::default())
            .await
            .unwrap();
        transcript.clear();

        match meter.release().await {
            Err(DaqError::ShutdownFailed(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected ShutdownFailed, got {:?}", other),
        }
        assert_eq!(transcript.commands().len(), 4);
        assert_eq!(meter.bias_state(), BiasState::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_never_enables_after_failed_zero() {
        let adapter = MockAdapter::new("MOCK::LCR").fail_on("BIAS:VOLT 0V");
        let transcript = adapter.transcript();
        let mut meter = LcrMeter {
            session: adapter,
            config: LcrConfig::default(),
            bias: BiasState::OnApplied { volts: 2.0 },
            trigger: TriggerSource::Bus,
            shutdown: ShutdownSignal::new(),
        };

        assert!(matches!(meter.release().await, Err(DaqError::Instrument(_))));
        assert_eq!(
            transcript.commands(),
            vec!["BIAS:VOLT 0V", "BIAS:STAT OFF", "TRIG:SOURCE INT"]
        );
        assert!(transcript.position("BIAS:STAT ON").is_none());
        assert_eq!(meter.bias_state(), BiasState::Off);
        assert_eq!(meter.trigger_source(), TriggerSource::Internal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_rc_waits_and_parses() {
        let adapter = MockAdapter::new("MOCK::LCR").with_response("FETC?", "12.5,340.2\n");
        let (mut meter, transcript) = meter_with(adapter).await;
        meter.configure().await.unwrap();
        meter.apply_bias().await.unwrap();
        transcript.clear();

        let start = tokio::time::Instant::now();
        let reading = meter.measure_rc().await.unwrap();
        assert_eq!(
            reading,
            ImpedanceReading {
                capacitance: 12.5,
                resistance: 340.2
            }
        );
        // MED at 400 kHz, 4 averages.
        assert!(start.elapsed() >= Duration::from_millis(599));
        assert_eq!(transcript.commands(), vec!["TRIGGER", "FETC?"]);
        meter.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_measure_rc_requires_configure() {
        let (mut meter, transcript) = meter_with(MockAdapter::new("MOCK::LCR")).await;
        assert!(matches!(meter.measure_rc().await, Err(DaqError::InvalidState(_))));
        assert!(transcript.position("TRIGGER").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_rc_missing_field() {
        let adapter = MockAdapter::new("MOCK::LCR").with_response("FETC?", "12.5");
        let (mut meter, _) = meter_with(adapter).await;
        meter.configure().await.unwrap();
        assert!(matches!(meter.measure_rc().await, Err(DaqError::Parse(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_rc_cancelled_during_settling() {
        let adapter = MockAdapter::new("MOCK::LCR").with_default_response("FETC?", "1,2");
        let transcript = adapter.transcript();
        let config = LcrConfig {
            frequency_khz: 0.05,
            integration: IntegrationTime::Long,
            averaging: 64,
            ..LcrConfig::default()
        };
        let signal = ShutdownSignal::new();
        let mut meter = LcrMeter::initialize(adapter, config)
            .await
            .unwrap()
            .with_shutdown(signal.clone());
        meter.configure().await.unwrap();

        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.trigger();
        });
        assert!(matches!(meter.measure_rc().await, Err(DaqError::Cancelled)));
        assert!(transcript.position("FETC?").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_then_closes() {
        let (mut meter, transcript) = meter_with(MockAdapter::new("MOCK::LCR")).await;
        meter.apply_bias().await.unwrap();
        meter.close().await.unwrap();
        assert_eq!(transcript.commands().last().unwrap(), "TRIG:SOURCE INT");
        assert!(meter.write_after_close().await.is_err());
    }

    impl LcrMeter<MockAdapter> {
        async fn write_after_close(&mut self) -> AppResult<()> {
            self.session.write("*IDN?").await
        }
    }

    #[test]
    fn test_parse_rc_response() {
        let reading = parse_rc_response("+1.23450E-12,+3.40200E+02\n").unwrap();
        assert_eq!(reading.capacitance, 1.2345e-12);
        assert_eq!(reading.resistance, 340.2);
        assert!(matches!(parse_rc_response("12.5"), Err(DaqError::Parse(_))));
        assert!(matches!(parse_rc_response("1,2,3"), Err(DaqError::Parse(_))));
        assert!(matches!(parse_rc_response("abc,2"), Err(DaqError::Parse(_))));
        assert!(matches!(parse_rc_response(""), Err(DaqError::Parse(_))));
    }

    #[test]
    fn test_volts_formatting() {
        assert_eq!(volts(0.04), "0.04V");
        assert_eq!(volts(-0.0), "0V");
        assert_eq!(volts(-1.25), "-1.25V");
    }
}
