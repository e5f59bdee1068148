//! Instrument controllers.
//!
//! - [`lcr_meter`]: E4980A LCR meter, capacitance/resistance readings.
//! - [`parameter_analyzer`]: 4156C parameter analyzer, four-terminal currents.
//! - [`settling`]: integration time and the LCR settling-time table.
//!
//! Each controller exclusively owns one [`crate::adapters::InstrumentSession`]
//! and keeps a local mirror of the instrument state it has changed.

pub mod lcr_meter;
pub mod parameter_analyzer;
pub mod settling;

pub use lcr_meter::{BiasState, ImpedanceFunction, ImpedanceReading, LcrConfig, LcrMeter, TriggerSource};
pub use parameter_analyzer::{
    AnalyzerConfig, Compliance, OutputState, ParameterAnalyzer, TerminalCurrents, TerminalRoles,
};
pub use settling::{estimate_settling_time, IntegrationTime};
