//! Core library for the keysight_daq application.
//!
//! This library drives two bench instruments over GPIB/VISA to automate
//! capacitance-voltage and current-voltage measurements:
//!
//! - an E4980A LCR meter ([`instrument::LcrMeter`]), and
//! - a 4156C semiconductor parameter analyzer ([`instrument::ParameterAnalyzer`]).
//!
//! Both controllers talk through the [`adapters::InstrumentSession`] trait,
//! mirror the instrument state they change, and are released by the
//! [`sweep`] runners on every exit path.

pub mod adapters;
pub mod config;
pub mod error;
pub mod instrument;
pub mod shutdown;
pub mod sweep;

pub use error::{AppResult, DaqError};
