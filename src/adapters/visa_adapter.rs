//! VISA session for GPIB/USB/Ethernet instruments
//!
//! Provides the `InstrumentSession` implementation for the VISA protocol,
//! supporting instruments via GPIB, USB, Ethernet, etc.
//!
//! Supports resource strings like:
//! - "GPIB0::18::INSTR" (GPIB interface)
//! - "USB0::0x0957::0x0909::MY12345678::INSTR" (USB)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)

use super::{AdapterConfig, InstrumentSession};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use super::bounded;
#[cfg(feature = "instrument_visa")]
use std::io::{BufRead, BufReader, Write};
#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// VISA session owning one open instrument.
///
/// VISA calls are blocking, so every operation runs on Tokio's blocking pool
/// and is bounded by the configured timeout.
pub struct VisaAdapter {
    resource: String,
    #[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
    timeout: Duration,
    #[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
    write_terminator: String,

    #[cfg(feature = "instrument_visa")]
    instrument: Option<Arc<Mutex<Instrument>>>,
}

impl VisaAdapter {
    /// Opens `resource` through the default VISA resource manager.
    ///
    /// # Errors
    /// `Connection` if the resource manager or the address cannot be opened.
    #[cfg(feature = "instrument_visa")]
    pub async fn open(resource: &str, config: &AdapterConfig) -> AppResult<Self> {
        let resource_str = resource.to_string();
        let timeout = config.timeout();
        let timeout_ms = timeout.as_millis() as u32;

        let instrument = tokio::task::spawn_blocking(move || {
            let rm = DefaultRM::new().map_err(|e| {
                DaqError::Connection(format!("Failed to create VISA resource manager: {}", e))
            })?;
            let c_string = std::ffi::CString::new(resource_str.clone()).map_err(|e| {
                DaqError::Connection(format!("Invalid VISA resource '{}': {}", resource_str, e))
            })?;
            let res_id: ResID = c_string.into();
            let instr = rm
                .open(&res_id, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                .map_err(|e| {
                    DaqError::Connection(format!(
                        "Failed to open VISA resource '{}': {}",
                        resource_str, e
                    ))
                })?;
            if let Some(tmo) = attribute::AttrTmoValue::new_checked(timeout_ms) {
                instr.set_attr(tmo).map_err(|e| {
                    DaqError::Connection(format!("Failed to set VISA timeout: {}", e))
                })?;
            }
            Ok::<Instrument, DaqError>(instr)
        })
        .await
        .map_err(|e| DaqError::Connection(format!("VISA open task panicked: {}", e)))??;

        debug!("VISA resource '{}' opened with {}ms timeout", resource, timeout_ms);
        Ok(Self {
            resource: resource.to_string(),
            timeout,
            write_terminator: config.write_terminator.clone(),
            instrument: Some(Arc::new(Mutex::new(instrument))),
        })
    }

    /// Always fails: VISA support is compiled out.
    #[cfg(not(feature = "instrument_visa"))]
    pub async fn open(_resource: &str, _config: &AdapterConfig) -> AppResult<Self> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    #[cfg(feature = "instrument_visa")]
    fn handle(&self) -> AppResult<Arc<Mutex<Instrument>>> {
        self.instrument
            .clone()
            .ok_or_else(|| DaqError::Instrument(format!("VISA session '{}' is closed", self.resource)))
    }

    #[cfg(feature = "instrument_visa")]
    async fn exchange(&self, command: &str, expects_response: bool) -> AppResult<String> {
        let instrument = self.handle()?;
        let payload = format!("{}{}", command, self.write_terminator);
        let command_for_log = command.to_string();

        let task = tokio::task::spawn_blocking(move || {
            let mut guard = instrument.blocking_lock();
            guard.write_all(payload.as_bytes()).map_err(|e| {
                DaqError::Instrument(format!("VISA write failed for '{}': {}", command_for_log, e))
            })?;
            if !expects_response {
                return Ok(String::new());
            }
            let mut response = String::new();
            BufReader::new(&*guard).read_line(&mut response).map_err(|e| {
                DaqError::Instrument(format!("VISA read failed for '{}': {}", command_for_log, e))
            })?;
            Ok(response)
        });

        bounded(&self.resource, command, self.timeout, async {
            task.await
                .map_err(|e| DaqError::Instrument(format!("VISA I/O task panicked: {}", e)))?
        })
        .await
    }
}

#[async_trait]
impl InstrumentSession for VisaAdapter {
    fn resource(&self) -> &str {
        &self.resource
    }

    #[cfg(feature = "instrument_visa")]
    async fn write(&mut self, command: &str) -> AppResult<()> {
        self.exchange(command, false).await?;
        debug!("VISA write {}: {}", self.resource, command);
        Ok(())
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn write(&mut self, _command: &str) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    #[cfg(feature = "instrument_visa")]
    async fn query(&mut self, command: &str) -> AppResult<String> {
        let response = self.exchange(command, true).await?;
        debug!("VISA query {}: '{}' -> '{}'", self.resource, command, response.trim());
        Ok(response)
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn query(&mut self, _command: &str) -> AppResult<String> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    async fn close(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_visa")]
        {
            if self.instrument.take().is_some() {
                debug!("VISA resource '{}' closed", self.resource);
            }
        }
        Ok(())
    }
}
