//! End-to-end sweeps against scripted sessions.

use keysight_daq::adapters::{AdapterConfig, MockAdapter, Transcript, MOCK_UNREACHABLE_RESOURCE};
use keysight_daq::instrument::{
    AnalyzerConfig, BiasState, Compliance, LcrConfig, LcrMeter, OutputState, ParameterAnalyzer,
    TerminalRoles, TriggerSource,
};
use keysight_daq::shutdown::ShutdownSignal;
use keysight_daq::sweep::{run_cv_sweep, run_transfer_sweep, LinearSweep, SweepEvent};
use keysight_daq::DaqError;
use std::time::Duration;
use tokio::sync::mpsc;

const LCR_RELEASE: [&str; 4] = ["BIAS:VOLT 0V", "BIAS:STAT ON", "BIAS:STAT OFF", "TRIG:SOURCE INT"];

async fn configured_analyzer(adapter: MockAdapter) -> (ParameterAnalyzer<MockAdapter>, Transcript) {
    let transcript = adapter.transcript();
    let mut analyzer = ParameterAnalyzer::initialize(adapter, AnalyzerConfig::default())
        .await
        .unwrap();
    analyzer.define_terminal_roles(TerminalRoles::default()).unwrap();
    analyzer.set_compliance(Compliance::default()).unwrap();
    analyzer.configure().await.unwrap();
    (analyzer, transcript)
}

async fn configured_meter(
    adapter: MockAdapter,
    shutdown: &ShutdownSignal,
) -> (LcrMeter<MockAdapter>, Transcript) {
    let transcript = adapter.transcript();
    let mut meter = LcrMeter::initialize(adapter, LcrConfig::default())
        .await
        .unwrap()
        .with_shutdown(shutdown.clone());
    meter.configure().await.unwrap();
    (meter, transcript)
}

fn tail(transcript: &Transcript, n: usize) -> Vec<String> {
    let commands = transcript.commands();
    commands[commands.len() - n..].to_vec()
}

#[tokio::test(start_paused = true)]
async fn test_transfer_sweep_full_sequence() {
    let adapter = MockAdapter::new("MOCK::ANALYZER")
        .with_response("RMD?", "+2.0E-06\n")
        .with_response("RMD?", "-2.0E-06\n")
        .with_response("RMD?", "+1.0E-12\n")
        .with_response("RMD?", "+0.0E+00\n")
        .with_default_response("RMD?", "NAI+5.0E-06\n");
    let (mut analyzer, transcript) = configured_analyzer(adapter).await;
    transcript.clear();

    let (tx, mut rx) = mpsc::channel(16);
    let sweep = LinearSweep::new(0.0, 0.2, 0.1).unwrap();
    let points = run_transfer_sweep(&mut analyzer, &sweep, &ShutdownSignal::new(), &tx)
        .await
        .unwrap();

    assert_eq!(points.len(), 3);
    assert_eq!(points[0].gate_voltage, 0.0);
    assert_eq!(points[0].currents.drain, 2.0e-6);
    assert_eq!(points[0].currents.source, -2.0e-6);
    assert_eq!(points[0].currents.gate, 1.0e-12);
    assert_eq!(points[1].currents.drain, 5.0e-6);

    let commands = transcript.commands();
    assert_eq!(
        &commands[..4],
        ["DV 2,12,0,0.015", "DV 1,12,0.025,0.015", "DV 4,12,0,0.015", "DV 3,0,0,0.0001"]
    );
    assert_eq!(
        &commands[4..12],
        ["TI 1,11", "RMD?", "TI 2,11", "RMD?", "TI 3,11", "RMD?", "TI 4,11", "RMD?"]
    );
    assert!(transcript.position("DV 3,0,0.1,0.0001").is_some());
    assert_eq!(tail(&transcript, 2), ["DZ", "CL"]);
    assert_eq!(analyzer.output_state(), OutputState::Disconnected);

    drop(tx);
    let mut events = 0;
    while let Some(event) = rx.recv().await {
        assert!(matches!(event, SweepEvent::Transfer(_)));
        events += 1;
    }
    assert_eq!(events, 3);
}

#[tokio::test(start_paused = true)]
async fn test_transfer_sweep_releases_after_failure() {
    let adapter = MockAdapter::simulated("MOCK::ANALYZER").fail_on("DV 3,0,0.1,0.0001");
    let (mut analyzer, transcript) = configured_analyzer(adapter).await;

    let (tx, _rx) = mpsc::channel(16);
    let sweep = LinearSweep::new(0.0, 0.5, 0.1).unwrap();
    let result = run_transfer_sweep(&mut analyzer, &sweep, &ShutdownSignal::new(), &tx).await;

    assert!(matches!(result, Err(DaqError::Instrument(_))));
    assert_eq!(tail(&transcript, 2), ["DZ", "CL"]);
    assert_eq!(analyzer.output_state(), OutputState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_transfer_sweep_cancelled_before_bias() {
    let adapter = MockAdapter::simulated("MOCK::ANALYZER");
    let (mut analyzer, transcript) = configured_analyzer(adapter).await;
    transcript.clear();

    let shutdown = ShutdownSignal::new();
    shutdown.trigger();
    let (tx, _rx) = mpsc::channel(16);
    let sweep = LinearSweep::new(0.0, 1.0, 0.1).unwrap();
    let result = run_transfer_sweep(&mut analyzer, &sweep, &shutdown, &tx).await;

    assert!(matches!(result, Err(DaqError::Cancelled)));
    // Nothing was energized; only the release went out.
    assert_eq!(transcript.commands(), ["DZ", "CL"]);
}

#[tokio::test(start_paused = true)]
async fn test_transfer_sweep_requires_configuration() {
    let adapter = MockAdapter::simulated("MOCK::ANALYZER");
    let transcript = adapter.transcript();
    let mut analyzer = ParameterAnalyzer::initialize(adapter, AnalyzerConfig::default())
        .await
        .unwrap();

    let (tx, _rx) = mpsc::channel(16);
    let result = run_transfer_sweep(
        &mut analyzer,
        &LinearSweep::single(0.0),
        &ShutdownSignal::new(),
        &tx,
    )
    .await;

    assert!(matches!(result, Err(DaqError::InvalidState(_))));
    assert!(transcript.position("DZ").is_some());
    assert!(transcript.commands().iter().all(|c| !c.starts_with("DV")));
}

#[tokio::test(start_paused = true)]
async fn test_analyzer_channels_connected_before_bias() {
    let adapter = MockAdapter::simulated("MOCK::ANALYZER");
    let (mut analyzer, transcript) = configured_analyzer(adapter).await;

    let (tx, _rx) = mpsc::channel(16);
    run_transfer_sweep(
        &mut analyzer,
        &LinearSweep::single(0.0),
        &ShutdownSignal::new(),
        &tx,
    )
    .await
    .unwrap();

    let rst = transcript.position("*RST").unwrap();
    let cn = transcript.position("CN").unwrap();
    let first_dv = transcript
        .commands()
        .iter()
        .position(|c| c.starts_with("DV"))
        .unwrap();
    let dz = transcript.position("DZ").unwrap();
    assert!(rst < cn && cn < first_dv && first_dv < dz);
}

#[tokio::test(start_paused = true)]
async fn test_cv_sweep_steps_bias_and_releases() {
    let shutdown = ShutdownSignal::new();
    let adapter = MockAdapter::simulated("MOCK::LCR");
    let (mut meter, transcript) = configured_meter(adapter, &shutdown).await;
    transcript.clear();

    let (tx, mut rx) = mpsc::channel(16);
    let sweep = LinearSweep::new(-1.0, 1.0, 1.0).unwrap();
    let points = run_cv_sweep(&mut meter, &sweep, &shutdown, &tx).await.unwrap();

    let biases: Vec<f64> = points.iter().map(|p| p.bias_voltage).collect();
    assert_eq!(biases, vec![-1.0, 0.0, 1.0]);
    assert_eq!(points[0].reading.capacitance, 1e-12);
    assert_eq!(points[0].reading.resistance, 340.0);

    let commands = transcript.commands();
    assert_eq!(&commands[..3], ["BIAS:VOLT 0V", "BIAS:STAT ON", "BIAS:VOLT -1V"]);
    assert_eq!(&commands[3..5], ["TRIGGER", "FETC?"]);
    assert!(transcript.position("BIAS:VOLT 1V").is_some());
    assert_eq!(tail(&transcript, 4), LCR_RELEASE);
    assert_eq!(meter.bias_state(), BiasState::Off);
    assert_eq!(meter.trigger_source(), TriggerSource::Internal);

    drop(tx);
    let mut events = 0;
    while let Some(event) = rx.recv().await {
        assert!(matches!(event, SweepEvent::Capacitance(_)));
        events += 1;
    }
    assert_eq!(events, 3);
}

#[tokio::test(start_paused = true)]
async fn test_cv_sweep_bias_off_after_bad_reading() {
    let shutdown = ShutdownSignal::new();
    let adapter = MockAdapter::new("MOCK::LCR")
        .with_response("FETC?", "+2.5E-12,+1.0E+02\n")
        .with_response("FETC?", "+2.5E-12\n");
    let (mut meter, transcript) = configured_meter(adapter, &shutdown).await;

    let (tx, _rx) = mpsc::channel(16);
    let sweep = LinearSweep::new(0.0, 2.0, 1.0).unwrap();
    let result = run_cv_sweep(&mut meter, &sweep, &shutdown, &tx).await;

    assert!(matches!(result, Err(DaqError::Parse(_))));
    assert_eq!(tail(&transcript, 4), LCR_RELEASE);
    assert_eq!(meter.bias_state(), BiasState::Off);
}

#[tokio::test(start_paused = true)]
async fn test_cv_sweep_cancelled_mid_sweep() {
    let shutdown = ShutdownSignal::new();
    let adapter = MockAdapter::simulated("MOCK::LCR");
    let (mut meter, transcript) = configured_meter(adapter, &shutdown).await;

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.trigger();
    });

    let (tx, mut rx) = mpsc::channel(64);
    let sweep = LinearSweep::new(0.0, 10.0, 1.0).unwrap();
    let result = run_cv_sweep(&mut meter, &sweep, &shutdown, &tx).await;

    assert!(matches!(result, Err(DaqError::Cancelled)));
    assert_eq!(tail(&transcript, 4), LCR_RELEASE);
    assert_eq!(meter.bias_state(), BiasState::Off);

    drop(tx);
    let mut events = 0;
    while rx.recv().await.is_some() {
        events += 1;
    }
    assert!(events < 11, "sweep ran to completion: {} points", events);
}

#[tokio::test(start_paused = true)]
async fn test_lcr_bias_zeroed_before_enable() {
    let shutdown = ShutdownSignal::new();
    let adapter = MockAdapter::simulated("MOCK::LCR");
    let (mut meter, transcript) = configured_meter(adapter, &shutdown).await;
    transcript.clear();

    meter.apply_bias().await.unwrap();
    assert_eq!(transcript.commands(), ["BIAS:VOLT 0V", "BIAS:STAT ON"]);
    assert_eq!(meter.bias_state(), BiasState::OnZero);
    meter.release().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_sweep_without_receiver_still_completes() {
    let shutdown = ShutdownSignal::new();
    let adapter = MockAdapter::simulated("MOCK::LCR");
    let (mut meter, _transcript) = configured_meter(adapter, &shutdown).await;

    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let sweep = LinearSweep::new(0.0, 1.0, 0.5).unwrap();
    let points = run_cv_sweep(&mut meter, &sweep, &shutdown, &tx).await.unwrap();
    assert_eq!(points.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_simulated_resources_through_connect() {
    let shutdown = ShutdownSignal::new();
    let adapter = AdapterConfig::default();

    let mut meter = LcrMeter::connect("MOCK::LCR", &adapter, LcrConfig::default())
        .await
        .unwrap()
        .with_shutdown(shutdown.clone());
    meter.configure().await.unwrap();
    let (tx, _rx) = mpsc::channel(4);
    let points = run_cv_sweep(&mut meter, &LinearSweep::single(0.0), &shutdown, &tx)
        .await
        .unwrap();
    assert_eq!(points.len(), 1);
    meter.close().await.unwrap();

    let mut analyzer =
        ParameterAnalyzer::connect("MOCK::ANALYZER", &adapter, AnalyzerConfig::default())
            .await
            .unwrap();
    analyzer.define_terminal_roles(TerminalRoles::default()).unwrap();
    analyzer.set_compliance(Compliance::default()).unwrap();
    analyzer.configure().await.unwrap();
    let points = run_transfer_sweep(&mut analyzer, &LinearSweep::single(0.0), &shutdown, &tx)
        .await
        .unwrap();
    assert_eq!(points[0].currents.drain, 1.0e-6);
    analyzer.close().await.unwrap();
}

#[tokio::test]
async fn test_connect_unreachable_address() {
    let adapter = AdapterConfig::default();

    let meter = LcrMeter::connect(MOCK_UNREACHABLE_RESOURCE, &adapter, LcrConfig::default()).await;
    assert!(matches!(meter, Err(DaqError::Connection(_))));

    let analyzer = ParameterAnalyzer::connect(
        MOCK_UNREACHABLE_RESOURCE,
        &adapter,
        AnalyzerConfig::default(),
    )
    .await;
    assert!(matches!(analyzer, Err(DaqError::Connection(_))));
}
