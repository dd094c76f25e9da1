//! End-to-end exercise of the full pipeline over an in-memory channel
//!
//! Plays the role of the fixture on one end of a duplex stream and drives the engine on the
//! other: configuration and stages come out of a store, telemetry flows over the link, the
//! sequencer produces a run, and the run lands back in the store.

use std::time::Duration;

use tokio::io::AsyncWriteExt;

use jigtest::{
    link::SerialLink,
    sequence::{ run_plan, TelemetrySource },
    store::{ persist, ConfigStore, MemoryStore },
    telemetry::TelemetryDecoder,
    RangeLimits,
    StageDefinition,
};

/// Routes engine logs to the test output, filtered by `RUST_LOG`
fn init_tracing()
{
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn three_stage_plan() -> Vec<StageDefinition>
{
    vec![
        StageDefinition {
            sequence_index: 1,
            name: String::from("Input rail"),
            voltage: RangeLimits::new(11.5, 12.5),
            current: RangeLimits::new(0.0, 2.0),
            resistance: RangeLimits::new(0.0, 10.0),
        },
        StageDefinition {
            sequence_index: 2,
            name: String::from("Logic rail"),
            voltage: RangeLimits::new(3.2, 3.4),
            current: RangeLimits::new(0.0, 0.5),
            resistance: RangeLimits::new(0.0, 10.0),
        },
        StageDefinition {
            sequence_index: 3,
            name: String::from("Isolation"),
            voltage: RangeLimits::new(0.0, 0.1),
            current: RangeLimits::new(0.0, 0.01),
            resistance: RangeLimits::new(1000.0, 1e9),
        },
    ]
}

/// Writes one full set of readings per stage, in the order the sequencer will ask for them
async fn play_fixture<W>(mut port: W)
    where W: tokio::io::AsyncWrite + Unpin
{
    let per_stage = [
        (12.0, 1.5, 5.0),
        (3.3, 0.2, 4.0),
        (0.05, 0.001, 2_000_000.0),
    ];

    for (voltage, current, resistance) in per_stage {
        let block = format!(
            "235,Voltage,{}\n235,current,{}\n235,Resistance,{}\n",
            voltage, current, resistance
        );
        port.write_all(block.as_bytes()).await.unwrap();
    }
}

#[tokio::test]
async fn full_run_over_duplex_link_round_trips_through_store()
{
    init_tracing();

    let mut store = MemoryStore::new();
    store.set_plan(1, three_stage_plan());
    let stages = store.stages_for_plan(1).unwrap();

    let (station, fixture) = tokio::io::duplex(1024);
    let feeder = tokio::spawn(play_fixture(fixture));

    let link = SerialLink::over(station);
    let decoder = TelemetryDecoder {
        per_line_deadline: Duration::from_millis(500),
        max_attempts: 10,
    };
    let mut source = TelemetrySource::new(decoder, link);

    let result = run_plan("PCB-235", "op1", &stages, &mut source).await;
    feeder.await.unwrap();

    assert!(result.overall_passed);
    assert_eq!(result.stage_outcomes.len(), 3);
    assert!(result.notes.is_empty());

    let measured = result.stage_outcomes[2].measurement.unwrap();
    assert_eq!(measured.voltage, 0.05);
    assert_eq!(measured.resistance, 2_000_000.0);
    assert!(!measured.partial);

    let report = persist(&result, &mut store).unwrap();
    assert!(report.warnings.is_empty());

    assert_eq!(store.runs().len(), 1);
    let run_row = &store.runs()[0];
    assert_eq!(run_row.unit_id, "PCB-235");
    assert!(run_row.overall_passed);

    let stage_rows = store.stage_results_for(report.run_id);
    assert_eq!(stage_rows.len(), 3);
    assert!(stage_rows.iter().all(|row| row.passed));

    source.into_inner().disconnect().await;
}

#[tokio::test]
async fn silent_fixture_records_every_stage_as_failed()
{
    init_tracing();

    let mut store = MemoryStore::new();
    store.set_plan(1, three_stage_plan());
    let stages = store.stages_for_plan(1).unwrap();

    // the fixture end stays open but never transmits
    let (station, _fixture) = tokio::io::duplex(64);
    let link = SerialLink::over(station);
    let decoder = TelemetryDecoder {
        per_line_deadline: Duration::from_millis(10),
        max_attempts: 2,
    };
    let mut source = TelemetrySource::new(decoder, link);

    let result = run_plan("PCB-236", "op1", &stages, &mut source).await;

    assert!(!result.overall_passed);
    assert_eq!(result.stage_outcomes.len(), 3);
    assert!(result.stage_outcomes.iter().all(|outcome| {
        !outcome.passed && outcome.measurement.is_none()
    }));
    assert!(result.notes.contains("Stage 1"));
    assert!(result.notes.contains("Stage 3"));

    let report = persist(&result, &mut store).unwrap();
    let stage_rows = store.stage_results_for(report.run_id);
    assert!(stage_rows.iter().all(|row| row.failure_reason.contains("acquisition failed")));

    source.into_inner().disconnect().await;
}

#[tokio::test]
async fn connect_to_absent_channel_reports_not_found()
{
    use jigtest::link::{ CommunicationConfig, ConnectError, DataBits, Parity, StopBits };

    init_tracing();

    let config = CommunicationConfig {
        channel_id: String::from("definitely-not-a-real-channel"),
        baud_rate: 9600,
        data_bits: DataBits::Eight,
        parity: Parity::None,
        stop_bits: StopBits::One,
        timeout: Duration::from_secs(1),
    };

    match SerialLink::connect(&config) {
        Err(ConnectError::ChannelNotFound { requested, .. }) => {
            assert_eq!(requested, "definitely-not-a-real-channel");
        }
        Err(other) => panic!("expected ChannelNotFound, got {}", other),
        Ok(_) => panic!("connected to a channel that should not exist"),
    }
}
