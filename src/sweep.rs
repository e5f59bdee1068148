//! Sweep definitions and runners.
//!
//! A [`LinearSweep`] walks from `start` toward `stop` in increments of `step`
//! and has ⌊|stop − start| / step⌋ + 1 points. The runners drive one
//! controller through a sweep, stream each point over an `mpsc` channel as it
//! is taken, and always release the instrument afterwards, whether the sweep
//! finished, failed or was cancelled.
//!
//! Several runners can be spawned as independent tasks sharing one event
//! channel, since the two instruments share no state.

use crate::adapters::InstrumentSession;
use crate::error::{AppResult, DaqError};
use crate::instrument::{ImpedanceReading, LcrMeter, ParameterAnalyzer, TerminalCurrents};
use crate::shutdown::ShutdownSignal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Largest number of points a single sweep may have.
pub const MAX_SWEEP_POINTS: usize = 1_000_000;

/// Evenly spaced values from `start` toward `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearSweep {
    /// First value.
    pub start: f64,
    /// Last value bound.
    pub stop: f64,
    /// Positive increment.
    pub step: f64,
}

impl LinearSweep {
    /// Builds a validated sweep.
    pub fn new(start: f64, stop: f64, step: f64) -> AppResult<Self> {
        let sweep = Self { start, stop, step };
        sweep.validate()?;
        Ok(sweep)
    }

    /// A single point at `value`.
    pub fn single(value: f64) -> Self {
        Self {
            start: value,
            stop: value,
            step: 1.0,
        }
    }

    /// Bounds must be finite, the step finite and positive, and the sweep no
    /// longer than [`MAX_SWEEP_POINTS`].
    pub fn validate(&self) -> AppResult<()> {
        if !(self.start.is_finite() && self.stop.is_finite()) {
            return Err(DaqError::InvalidValue(format!(
                "sweep bounds {}..{} must be finite",
                self.start, self.stop
            )));
        }
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(DaqError::InvalidValue(format!(
                "sweep step {} must be > 0",
                self.step
            )));
        }
        let intervals = ((self.stop - self.start).abs() / self.step).floor();
        if !intervals.is_finite() || intervals >= MAX_SWEEP_POINTS as f64 {
            return Err(DaqError::InvalidValue(format!(
                "sweep {}..{} with step {} exceeds {} points",
                self.start, self.stop, self.step, MAX_SWEEP_POINTS
            )));
        }
        Ok(())
    }

    /// ⌊|stop − start| / step⌋ + 1.
    ///
    /// # Errors
    /// `InvalidValue` if the sweep fails [`validate`](Self::validate).
    pub fn step_count(&self) -> AppResult<usize> {
        self.validate()?;
        // Bounded by MAX_SWEEP_POINTS after validation.
        Ok(((self.stop - self.start).abs() / self.step).floor() as usize + 1)
    }

    /// The sweep values, starting at `start`, produced lazily.
    pub fn values(&self) -> AppResult<impl Iterator<Item = f64>> {
        let count = self.step_count()?;
        let start = self.start;
        let step = if self.stop < self.start {
            -self.step
        } else {
            self.step
        };
        Ok((0..count).map(move |i| start + step * i as f64))
    }

    /// True when a nonzero range collapses to a single point.
    pub fn is_collapsed(&self) -> bool {
        matches!(self.step_count(), Ok(1)) && self.start != self.stop
    }
}

/// Gate voltage range in absolute volts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSweep {
    /// First gate voltage.
    pub vg_start: f64,
    /// Last gate voltage bound.
    pub vg_stop: f64,
    /// Gate voltage increment.
    pub step: f64,
}

impl Default for GateSweep {
    fn default() -> Self {
        Self {
            vg_start: 0.0,
            vg_stop: 1.0,
            step: 100.0,
        }
    }
}

impl GateSweep {
    /// Gate-source voltages with the source at `vs`.
    pub fn gate_source(&self, vs: f64) -> AppResult<LinearSweep> {
        LinearSweep::new(self.vg_start - vs, self.vg_stop - vs, self.step)
    }
}

/// Bias range for a C-V sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasSweep {
    /// First bias voltage.
    pub start: f64,
    /// Last bias voltage bound.
    pub stop: f64,
    /// Bias increment.
    pub step: f64,
}

impl Default for BiasSweep {
    fn default() -> Self {
        Self {
            start: 0.0,
            stop: 0.0,
            step: 1.0,
        }
    }
}

impl BiasSweep {
    /// As a [`LinearSweep`].
    pub fn linear(&self) -> AppResult<LinearSweep> {
        LinearSweep::new(self.start, self.stop, self.step)
    }
}

/// One point of a transfer (Id-Vg) sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransferPoint {
    /// When the currents were read.
    pub timestamp: DateTime<Utc>,
    /// Gate-source voltage programmed on the gate.
    pub gate_voltage: f64,
    /// Terminal currents.
    pub currents: TerminalCurrents,
}

/// One point of a C-V sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CvPoint {
    /// When the reading was fetched.
    pub timestamp: DateTime<Utc>,
    /// DC bias during the reading.
    pub bias_voltage: f64,
    /// Capacitance/resistance pair.
    pub reading: ImpedanceReading,
}

/// Point emitted by a running sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SweepEvent {
    /// LCR meter reading.
    Capacitance(CvPoint),
    /// Parameter analyzer reading.
    Transfer(TransferPoint),
}

struct EventSink<'a> {
    events: &'a mpsc::Sender<SweepEvent>,
    warned: bool,
}

impl<'a> EventSink<'a> {
    fn new(events: &'a mpsc::Sender<SweepEvent>) -> Self {
        Self {
            events,
            warned: false,
        }
    }

    async fn emit(&mut self, event: SweepEvent) {
        if self.events.send(event).await.is_err() && !self.warned {
            warn!("No active receivers for sweep events");
            self.warned = true;
        }
    }
}

fn warn_if_collapsed(name: &str, sweep: &LinearSweep) {
    if sweep.is_collapsed() {
        warn!(
            "{} sweep {}..{} with step {} has a single point",
            name, sweep.start, sweep.stop, sweep.step
        );
    }
}

/// The sweep error takes precedence; a release failure after a successful
/// sweep is returned on its own.
fn settle<T>(outcome: AppResult<T>, released: AppResult<()>) -> AppResult<T> {
    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release_err)) => Err(release_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            warn!("Release after failed sweep also failed: {}", release_err);
            Err(err)
        }
    }
}

/// Applies the static bias, steps the gate through `sweep` and reads the
/// four currents at every point. The analyzer is released on every exit path.
///
/// The analyzer must already be configured (see
/// [`ParameterAnalyzer::configure`]).
pub async fn run_transfer_sweep<S: InstrumentSession>(
    analyzer: &mut ParameterAnalyzer<S>,
    sweep: &LinearSweep,
    shutdown: &ShutdownSignal,
    events: &mpsc::Sender<SweepEvent>,
) -> AppResult<Vec<TransferPoint>> {
    let outcome = transfer_points(analyzer, sweep, shutdown, events).await;
    let released = analyzer.release().await;
    settle(outcome, released)
}

async fn transfer_points<S: InstrumentSession>(
    analyzer: &mut ParameterAnalyzer<S>,
    sweep: &LinearSweep,
    shutdown: &ShutdownSignal,
    events: &mpsc::Sender<SweepEvent>,
) -> AppResult<Vec<TransferPoint>> {
    let count = sweep.step_count()?;
    warn_if_collapsed("Gate", sweep);
    info!(
        "Transfer sweep on {}: Vgs {}..{} step {} ({} points)",
        analyzer.resource(),
        sweep.start,
        sweep.stop,
        sweep.step,
        count
    );

    let mut sink = EventSink::new(events);
    let mut points = Vec::new();
    shutdown.check()?;
    analyzer.apply_bias().await?;

    for gate_voltage in sweep.values()? {
        shutdown.check()?;
        analyzer.step_gate_voltage(gate_voltage).await?;
        let currents = analyzer.measure_currents().await?;
        let point = TransferPoint {
            timestamp: Utc::now(),
            gate_voltage,
            currents,
        };
        sink.emit(SweepEvent::Transfer(point)).await;
        points.push(point);
    }
    Ok(points)
}

/// Enables the bias output, steps the DC bias through `sweep` and takes one
/// reading per point. The meter is released on every exit path.
///
/// The meter must already be configured (see [`LcrMeter::configure`]).
pub async fn run_cv_sweep<S: InstrumentSession>(
    meter: &mut LcrMeter<S>,
    sweep: &LinearSweep,
    shutdown: &ShutdownSignal,
    events: &mpsc::Sender<SweepEvent>,
) -> AppResult<Vec<CvPoint>> {
    let outcome = cv_points(meter, sweep, shutdown, events).await;
    let released = meter.release().await;
    settle(outcome, released)
}

async fn cv_points<S: InstrumentSession>(
    meter: &mut LcrMeter<S>,
    sweep: &LinearSweep,
    shutdown: &ShutdownSignal,
    events: &mpsc::Sender<SweepEvent>,
) -> AppResult<Vec<CvPoint>> {
    let count = sweep.step_count()?;
    warn_if_collapsed("Bias", sweep);
    info!(
        "C-V sweep on {}: bias {}..{} step {} ({} points)",
        meter.resource(),
        sweep.start,
        sweep.stop,
        sweep.step,
        count
    );

    let mut sink = EventSink::new(events);
    let mut points = Vec::new();
    shutdown.check()?;
    meter.apply_bias().await?;

    for bias_voltage in sweep.values()? {
        shutdown.check()?;
        meter.set_bias_voltage(bias_voltage).await?;
        let reading = meter.measure_rc().await?;
        let point = CvPoint {
            timestamp: Utc::now(),
            bias_voltage,
            reading,
        };
        sink.emit(SweepEvent::Capacitance(point)).await;
        points.push(point);
    }
    Ok(points)
}
