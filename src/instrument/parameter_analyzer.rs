//! Agilent 4156C semiconductor parameter analyzer controller
//!
//! Talks the analyzer's FLEX command set over an [`InstrumentSession`]. Four
//! SMU channels are mapped onto the drain, source, gate and substrate of the
//! device under test. Drain, source and substrate are held at a static bias
//! while the gate is stepped point by point by the caller (see
//! [`crate::sweep::run_transfer_sweep`]).
//!
//! Terminal roles and compliance limits are local state and must be set
//! before any operation that references them.
//!
//! ## Configuration
//!
//! ```toml
//! [analyzer]
//! resource = "GPIB0::17::INSTR"
//!
//! [analyzer.measurement]
//! integration = "MED"
//! averaging = 4
//! vd = 0.025
//! vs = 0.0
//! vb = 0.0
//!
//! [analyzer.roles]
//! drain = 1
//! source = 2
//! gate = 3
//! substrate = 4
//!
//! [analyzer.compliance]
//! drain = 15e-3
//! gate = 1e-4
//! substrate = 15e-3
//! ```

use super::settling::IntegrationTime;
use crate::adapters::{open_session, AdapterConfig, InstrumentSession};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// `DV` output range code for drain, source and substrate (20 V range).
const STATIC_BIAS_RANGE: u8 = 12;
/// `DV` output range code for the gate (auto).
const GATE_RANGE: u8 = 0;
/// `RI` fixed low-current range code for the gate channel.
const GATE_CURRENT_RANGE: u8 = 13;
/// `RI` auto-ranging code.
const AUTO_CURRENT_RANGE: u8 = 0;

/// Static bias and measurement settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Integration time (`SLI`).
    pub integration: IntegrationTime,
    /// Averaging count (`AV`).
    pub averaging: u32,
    /// Drain voltage in volts.
    pub vd: f64,
    /// Source voltage in volts.
    pub vs: f64,
    /// Substrate voltage in volts.
    pub vb: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            integration: IntegrationTime::Medium,
            averaging: 4,
            vd: 0.025,
            vs: 0.0,
            vb: 0.0,
        }
    }
}

impl AnalyzerConfig {
    /// Drain-source voltage programmed on the drain channel.
    pub fn vds(&self) -> f64 {
        self.vd - self.vs
    }

    /// Checks averaging range and that voltages are finite.
    pub fn validate(&self) -> AppResult<()> {
        if !(1..=1023).contains(&self.averaging) {
            return Err(DaqError::InvalidValue(format!(
                "analyzer averaging count {} outside 1-1023",
                self.averaging
            )));
        }
        for (name, value) in [("vd", self.vd), ("vs", self.vs), ("vb", self.vb)] {
            if !value.is_finite() {
                return Err(DaqError::InvalidValue(format!("{} = {}", name, value)));
            }
        }
        Ok(())
    }
}

/// SMU channel assigned to each terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalRoles {
    /// Drain SMU.
    pub drain: u8,
    /// Source SMU.
    pub source: u8,
    /// Gate SMU.
    pub gate: u8,
    /// Substrate SMU.
    pub substrate: u8,
}

impl Default for TerminalRoles {
    fn default() -> Self {
        Self {
            drain: 1,
            source: 2,
            gate: 3,
            substrate: 4,
        }
    }
}

impl TerminalRoles {
    /// Channels in measurement order: drain, source, gate, substrate.
    pub fn measurement_order(&self) -> [u8; 4] {
        [self.drain, self.source, self.gate, self.substrate]
    }

    /// Channels must be distinct and within 1-8.
    pub fn validate(&self) -> AppResult<()> {
        let channels = self.measurement_order();
        if let Some(bad) = channels.iter().find(|ch| !(1..=8).contains(*ch)) {
            return Err(DaqError::InvalidValue(format!(
                "SMU channel {} outside 1-8",
                bad
            )));
        }
        let unique: HashSet<u8> = channels.iter().copied().collect();
        if unique.len() != channels.len() {
            return Err(DaqError::InvalidValue(format!(
                "terminal roles must use distinct channels: {:?}",
                self
            )));
        }
        Ok(())
    }
}

/// Compliance currents in amperes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Compliance {
    /// Drain (and source) compliance.
    pub drain: f64,
    /// Gate compliance.
    pub gate: f64,
    /// Substrate compliance.
    pub substrate: f64,
}

impl Default for Compliance {
    fn default() -> Self {
        Self {
            drain: 15e-3,
            gate: 1e-4,
            substrate: 15e-3,
        }
    }
}

impl Compliance {
    /// Every limit must be positive and finite.
    pub fn validate(&self) -> AppResult<()> {
        for (name, value) in [
            ("drain", self.drain),
            ("gate", self.gate),
            ("substrate", self.substrate),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(DaqError::InvalidValue(format!(
                    "{} compliance {} must be > 0",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Local mirror of the SMU outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// Channels disconnected (after `*RST` or release).
    Disconnected,
    /// Channels connected, all outputs at 0 V.
    Zero,
    /// At least one channel is sourcing a programmed voltage.
    Biased,
}

/// Four terminal currents from one measurement round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TerminalCurrents {
    /// Drain current in amperes.
    pub drain: f64,
    /// Source current in amperes.
    pub source: f64,
    /// Gate current in amperes.
    pub gate: f64,
    /// Substrate current in amperes.
    pub substrate: f64,
}

/// Parses one `RMD?` reply. A leading alphabetic status header is ignored.
pub fn parse_current_response(response: &str) -> AppResult<f64> {
    let trimmed = response.trim_end_matches(|c: char| c == '\n' || c == '\r').trim();
    let value = trimmed.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    value.parse::<f64>().map_err(|e| {
        DaqError::Parse(format!("invalid RMD? response '{}': {}", trimmed, e))
    })
}

fn number(value: f64) -> String {
    let value = if value == 0.0 { 0.0 } else { value };
    value.to_string()
}

/// Controller for one parameter analyzer session.
pub struct ParameterAnalyzer<S: InstrumentSession> {
    session: S,
    config: AnalyzerConfig,
    roles: Option<TerminalRoles>,
    compliance: Option<Compliance>,
    outputs: OutputState,
    measurement_configured: bool,
}

impl ParameterAnalyzer<Box<dyn InstrumentSession>> {
    /// Opens `resource` and resets the analyzer.
    ///
    /// # Errors
    /// `Connection` if the address cannot be opened.
    pub async fn connect(
        resource: &str,
        adapter: &AdapterConfig,
        config: AnalyzerConfig,
    ) -> AppResult<Self> {
        info!("Connecting to parameter analyzer at {}", resource);
        let session = open_session(resource, adapter).await?;
        Self::initialize(session, config).await
    }
}

impl<S: InstrumentSession> ParameterAnalyzer<S> {
    /// Takes ownership of an open session and performs a hard reset.
    pub async fn initialize(session: S, config: AnalyzerConfig) -> AppResult<Self> {
        config.validate()?;
        let mut analyzer = Self {
            session,
            config,
            roles: None,
            compliance: None,
            outputs: OutputState::Disconnected,
            measurement_configured: false,
        };
        analyzer.reset().await?;
        info!("Parameter analyzer {} initialized", analyzer.session.resource());
        Ok(analyzer)
    }

    /// Bus address of the session.
    pub fn resource(&self) -> &str {
        self.session.resource()
    }

    /// Static bias settings.
    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Terminal roles, once defined.
    pub fn roles(&self) -> Option<TerminalRoles> {
        self.roles
    }

    /// Compliance limits, once set.
    pub fn compliance(&self) -> Option<Compliance> {
        self.compliance
    }

    /// Mirrored output state.
    pub fn output_state(&self) -> OutputState {
        self.outputs
    }

    async fn send(&mut self, command: &str) -> AppResult<()> {
        debug!("Analyzer {} <- {}", self.session.resource(), command);
        self.session.write(command).await
    }

    fn require_roles(&self) -> AppResult<TerminalRoles> {
        self.roles.ok_or_else(|| {
            DaqError::InvalidState("terminal roles have not been defined".to_string())
        })
    }

    fn require_compliance(&self) -> AppResult<Compliance> {
        self.compliance.ok_or_else(|| {
            DaqError::InvalidState("compliance limits have not been set".to_string())
        })
    }

    fn require_connected(&self) -> AppResult<()> {
        if self.outputs == OutputState::Disconnected {
            return Err(DaqError::InvalidState(
                "channels are not enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Sends `*RST`. All outputs return to 0 V and disconnect.
    pub async fn reset(&mut self) -> AppResult<()> {
        self.send("*RST").await?;
        self.outputs = OutputState::Disconnected;
        self.measurement_configured = false;
        Ok(())
    }

    /// Assigns SMU channels to terminals. No device I/O.
    pub fn define_terminal_roles(&mut self, roles: TerminalRoles) -> AppResult<()> {
        roles.validate()?;
        self.roles = Some(roles);
        Ok(())
    }

    /// Sets compliance limits used by later bias commands. No device I/O.
    pub fn set_compliance(&mut self, compliance: Compliance) -> AppResult<()> {
        compliance.validate()?;
        self.compliance = Some(compliance);
        Ok(())
    }

    /// User-settings mode, clear buffer, connect all channels.
    ///
    /// # Errors
    /// `InvalidState` while any output is biased.
    pub async fn enable_channels(&mut self) -> AppResult<()> {
        if self.outputs == OutputState::Biased {
            return Err(DaqError::InvalidState(
                "cannot connect channels while outputs are biased; release or reset first"
                    .to_string(),
            ));
        }
        for command in ["US", "BC", "CN"] {
            self.send(command).await?;
        }
        self.outputs = OutputState::Zero;
        Ok(())
    }

    /// Integration, averaging, ASCII output and a staircase measurement on
    /// the four terminal channels.
    pub async fn configure_measurement(&mut self) -> AppResult<()> {
        let roles = self.require_roles()?;
        let mut commands = vec![
            format!("SLI {}", self.config.integration.analyzer_code()),
            format!("AV {}", self.config.averaging),
            // Keep sweeping when a channel reaches compliance.
            "WM 1".to_string(),
            // ASCII output.
            "FMT 2,1".to_string(),
            format!(
                "MM 1,{},{},{},{}",
                roles.gate, roles.drain, roles.source, roles.substrate
            ),
        ];
        for channel in [roles.gate, roles.drain, roles.source, roles.substrate] {
            commands.push(format!("CMM {},1", channel));
        }
        for command in &commands {
            self.send(command).await?;
        }
        self.measurement_configured = true;
        Ok(())
    }

    /// Gate on a fixed low-current range, every other channel auto-ranged.
    pub async fn configure_current_ranging(&mut self) -> AppResult<()> {
        let roles = self.require_roles()?;
        let commands = [
            format!("RI {},{}", roles.gate, GATE_CURRENT_RANGE),
            format!("RI {},{}", roles.drain, AUTO_CURRENT_RANGE),
            format!("RI {},{}", roles.source, AUTO_CURRENT_RANGE),
            format!("RI {},{}", roles.substrate, AUTO_CURRENT_RANGE),
        ];
        for command in &commands {
            self.send(command).await?;
        }
        Ok(())
    }

    /// Reset, enable channels, configure measurement and current ranging.
    pub async fn configure(&mut self) -> AppResult<()> {
        self.require_roles()?;
        self.reset().await?;
        self.enable_channels().await?;
        self.configure_measurement().await?;
        self.configure_current_ranging().await?;
        info!("Parameter analyzer {} configured", self.session.resource());
        Ok(())
    }

    /// Programs source, drain (as Vds) and substrate. The gate is left to
    /// [`step_gate_voltage`](Self::step_gate_voltage).
    pub async fn apply_bias(&mut self) -> AppResult<()> {
        let roles = self.require_roles()?;
        let compliance = self.require_compliance()?;
        self.require_connected()?;

        let commands = [
            format!(
                "DV {},{},{},{}",
                roles.source,
                STATIC_BIAS_RANGE,
                number(self.config.vs),
                number(compliance.drain)
            ),
            format!(
                "DV {},{},{},{}",
                roles.drain,
                STATIC_BIAS_RANGE,
                number(self.config.vds()),
                number(compliance.drain)
            ),
            format!(
                "DV {},{},{},{}",
                roles.substrate,
                STATIC_BIAS_RANGE,
                number(self.config.vb),
                number(compliance.substrate)
            ),
        ];
        for command in &commands {
            self.outputs = OutputState::Biased;
            self.send(command).await?;
        }
        info!(
            "Analyzer bias applied: Vs={} Vds={} Vb={}",
            self.config.vs,
            self.config.vds(),
            self.config.vb
        );
        Ok(())
    }

    /// Programs the gate to `voltage` with the gate compliance.
    pub async fn step_gate_voltage(&mut self, voltage: f64) -> AppResult<()> {
        let roles = self.require_roles()?;
        let compliance = self.require_compliance()?;
        self.require_connected()?;
        if !voltage.is_finite() {
            return Err(DaqError::InvalidValue(format!("gate voltage {}", voltage)));
        }
        self.outputs = OutputState::Biased;
        self.send(&format!(
            "DV {},{},{},{}",
            roles.gate,
            GATE_RANGE,
            number(voltage),
            number(compliance.gate)
        ))
        .await
    }

    /// Reads drain, source, gate and substrate currents, in that order.
    ///
    /// # Errors
    /// `InvalidState` before roles are defined or before
    /// [`configure_measurement`](Self::configure_measurement).
    pub async fn measure_currents(&mut self) -> AppResult<TerminalCurrents> {
        let roles = self.require_roles()?;
        if !self.measurement_configured {
            return Err(DaqError::InvalidState(
                "measurement mode is not configured; call configure_measurement first".to_string(),
            ));
        }
        let mut values = [0.0_f64; 4];
        for (slot, channel) in values.iter_mut().zip(roles.measurement_order()) {
            self.send(&format!("TI {},11", channel)).await?;
            let response = self.session.query("RMD?").await?;
            *slot = parse_current_response(&response)?;
        }
        let [drain, source, gate, substrate] = values;
        debug!(
            "Analyzer currents Id={} Is={} Ig={} Ib={}",
            drain, source, gate, substrate
        );
        Ok(TerminalCurrents {
            drain,
            source,
            gate,
            substrate,
        })
    }

    /// Forces every output to 0 V (`DZ`) and disconnects the channels (`CL`).
    ///
    /// Both commands are attempted even if the first fails. Repeated calls
    /// send the same sequence.
    pub async fn release(&mut self) -> AppResult<()> {
        let mut errors = Vec::new();
        for command in ["DZ", "CL"] {
            if let Err(e) = self.send(command).await {
                errors.push(e);
            }
        }
        match errors.len() {
            0 => {
                self.outputs = OutputState::Disconnected;
                info!("Parameter analyzer {} released", self.session.resource());
                Ok(())
            }
            1 => Err(errors.remove(0)),
            _ => Err(DaqError::ShutdownFailed(errors)),
        }
    }

    /// Releases the analyzer and closes the session.
    pub async fn close(&mut self) -> AppResult<()> {
        let released = self.release().await;
        self.session.close().await?;
        released
    }
}

impl<S: InstrumentSession> Drop for ParameterAnalyzer<S> {
    fn drop(&mut self) {
        if self.outputs == OutputState::Biased {
            warn!(
                "Parameter analyzer {} dropped with biased outputs; call release() first",
                self.session.resource()
            );
        }
    }
}
