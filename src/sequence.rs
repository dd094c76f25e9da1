//! Plan sequencing: run an ordered list of stages against one unit under test
//!
//! # Purpose
//! The sequencer drives the whole acquisition pipeline. For each stage of a plan it asks a
//! [`MeasurementSource`] for a measurement, validates it against the stage's acceptance ranges,
//! and accumulates one [`StageOutcome`] per stage -- strictly in plan order, one at a time,
//! because each stage depends on the operator or fixture having physically moved to the next
//! measurement point.
//!
//! # Acquisition Substitution
//! The sequencer does not know whether measurements come off a serial link or out of an
//! operator's keyboard. [`TelemetrySource`] binds the telemetry decoder to a live line source;
//! [`ManualEntry`] replays operator-typed values. Swapping one for the other touches neither
//! sequencing nor validation.
//!
//! # Best-Effort Runs
//! A stage whose acquisition fails is recorded as a failed outcome with the acquisition error as
//! its reason, and the run continues with the next stage. A hard transport loss therefore shows
//! up as a tail of failed stages rather than an aborted run; partial work is always reported,
//! never dropped.

use tracing::{ info, warn };

use crate::{
    stages::{ validate, StageDefinition },
    telemetry::{ AcquireError, LineSource, Measurement, TelemetryDecoder },
};

/// Anything that can produce one measurement per stage
#[async_trait::async_trait]
pub trait MeasurementSource: Send
{
    /// Acquires the measurement for the stage with the given 1-based sequence index
    async fn acquire_for_stage(&mut self, sequence_index: u32) -> Result<Measurement, AcquireError>;
}

/// Live acquisition: the telemetry decoder bound to a line source
pub struct TelemetrySource<S>
{
    decoder: TelemetryDecoder,
    link: S,
}

impl <S> TelemetrySource<S>
    where S: LineSource
{
    pub fn new(decoder: TelemetryDecoder, link: S) -> Self
    {
        Self {
            decoder: decoder,
            link: link,
        }
    }

    /// Gives the line source back, e.g. to disconnect it after the run
    pub fn into_inner(self) -> S
    {
        self.link
    }
}

#[async_trait::async_trait]
impl <S> MeasurementSource for TelemetrySource<S>
    where S: LineSource
{
    async fn acquire_for_stage(&mut self, _sequence_index: u32) -> Result<Measurement, AcquireError>
    {
        // the fixture streams whatever is on the probes right now; stage identity is the
        // sequencer's concern
        self.decoder.acquire(&mut self.link).await
    }
}

/// Manual acquisition: operator-typed measurements staged ahead of the run
///
/// The keyboard-entry substitute used when no fixture is attached. One measurement is staged per
/// stage index; asking for a stage that was never staged yields an acquisition error, the same
/// way a silent fixture would.
#[derive(Debug, Default)]
pub struct ManualEntry
{
    entries: Vec<(u32, Measurement)>,
}

impl ManualEntry
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Stages the operator-entered measurement for one stage, replacing any earlier entry
    pub fn enter(mut self, sequence_index: u32, measurement: Measurement) -> Self
    {
        self.entries.retain(|(index, _)| *index != sequence_index);
        self.entries.push((sequence_index, measurement));
        self
    }
}

#[async_trait::async_trait]
impl MeasurementSource for ManualEntry
{
    async fn acquire_for_stage(&mut self, sequence_index: u32) -> Result<Measurement, AcquireError>
    {
        self.entries
            .iter()
            .find(|(index, _)| *index == sequence_index)
            .map(|(_, measurement)| *measurement)
            .ok_or_else(|| {
                AcquireError::SourceUnavailable(format!(
                    "no manual entry staged for stage {}",
                    sequence_index
                ))
            })
    }
}

/// The recorded result of one executed stage
///
/// Immutable once produced. `measurement` is `None` only when acquisition itself failed; a
/// measurement that merely failed validation is still present alongside its failure reasons.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome
{
    pub stage_index: u32,
    pub measurement: Option<Measurement>,
    pub passed: bool,
    pub failure_reasons: Vec<String>,
}

/// The complete result of running one plan against one unit
///
/// `overall_passed` is the logical AND over all stage outcomes, and `stage_outcomes` always has
/// one entry per stage of the executed plan -- stages that could not acquire are failed entries,
/// not gaps.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult
{
    pub unit_id: String,
    pub operator_id: String,
    pub stage_outcomes: Vec<StageOutcome>,
    pub overall_passed: bool,
    pub notes: String,
}

/// Runs every stage of `stages`, in the order supplied, against one unit
///
/// Stages are expected in ascending `sequence_index` order as the config store returns them;
/// the sequencer never reorders and never retries. An acquisition failure marks that stage
/// failed and the run moves on. The returned notes summarize any failed stages, matching what
/// the operator console shows.
pub async fn run_plan<S>(
    unit_id: &str,
    operator_id: &str,
    stages: &[StageDefinition],
    source: &mut S,
)
    -> RunResult

    where S: MeasurementSource + ?Sized
{
    info!(unit = unit_id, operator = operator_id, stages = stages.len(), "starting test run");

    let mut stage_outcomes = Vec::with_capacity(stages.len());
    let mut failed_stages = Vec::new();

    for stage in stages {
        let outcome = match source.acquire_for_stage(stage.sequence_index).await {
            Ok(measurement) => {
                let verdict = validate(&measurement, stage);

                StageOutcome {
                    stage_index: stage.sequence_index,
                    measurement: Some(measurement),
                    passed: verdict.passed,
                    failure_reasons: verdict.reasons,
                }
            }
            Err(err) => {
                warn!(stage = stage.sequence_index, "stage acquisition failed: {}", err);

                StageOutcome {
                    stage_index: stage.sequence_index,
                    measurement: None,
                    passed: false,
                    failure_reasons: vec![format!("acquisition failed: {}", err)],
                }
            }
        };

        if outcome.passed {
            info!(stage = stage.sequence_index, name = %stage.name, "stage passed");
        }
        else {
            info!(stage = stage.sequence_index, name = %stage.name, "stage failed");
            failed_stages.push(format!("Stage {}: {}", stage.sequence_index, stage.name));
        }

        stage_outcomes.push(outcome);
    }

    let overall_passed = stage_outcomes.iter().all(|outcome| outcome.passed);
    let notes = if failed_stages.is_empty() {
        String::new()
    }
    else {
        format!("Failed stages: {}", failed_stages.join(", "))
    };

    info!(unit = unit_id, passed = overall_passed, "test run complete");

    RunResult {
        unit_id: unit_id.to_owned(),
        operator_id: operator_id.to_owned(),
        stage_outcomes: stage_outcomes,
        overall_passed: overall_passed,
        notes: notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::RangeLimits;

    fn plan() -> Vec<StageDefinition>
    {
        (1..=3)
            .map(|index| StageDefinition {
                sequence_index: index,
                name: format!("Stage {}", index),
                voltage: RangeLimits::new(4.5, 5.5),
                current: RangeLimits::new(0.1, 1.0),
                resistance: RangeLimits::new(90.0, 110.0),
            })
            .collect()
    }

    /// Scripted per-stage acquisition results
    struct ScriptedSource
    {
        results: Vec<(u32, Result<Measurement, AcquireError>)>,
    }

    #[async_trait::async_trait]
    impl MeasurementSource for ScriptedSource
    {
        async fn acquire_for_stage(&mut self, sequence_index: u32)
            -> Result<Measurement, AcquireError>
        {
            let position = self
                .results
                .iter()
                .position(|(index, _)| *index == sequence_index)
                .expect("unscripted stage requested");

            self.results.remove(position).1
        }
    }

    #[tokio::test]
    async fn all_stages_passing_yields_overall_pass()
    {
        let mut source = ManualEntry::new()
            .enter(1, Measurement::new(5.0, 0.5, 100.0))
            .enter(2, Measurement::new(4.9, 0.4, 101.0))
            .enter(3, Measurement::new(5.1, 0.6, 99.0));

        let result = run_plan("PCB-001", "tester", &plan(), &mut source).await;

        assert!(result.overall_passed);
        assert_eq!(result.stage_outcomes.len(), 3);
        assert!(result.notes.is_empty());
        assert!(result.stage_outcomes.iter().all(|outcome| outcome.passed));
    }

    #[tokio::test]
    async fn failed_acquisition_does_not_abort_the_run()
    {
        let mut source = ScriptedSource {
            results: vec![
                (1, Ok(Measurement::new(5.0, 0.5, 100.0))),
                (2, Err(AcquireError::NoDataReceived)),
                (3, Ok(Measurement::new(5.1, 0.6, 99.0))),
            ],
        };

        let result = run_plan("PCB-002", "tester", &plan(), &mut source).await;

        assert!(!result.overall_passed);
        assert_eq!(result.stage_outcomes.len(), 3);

        assert!(result.stage_outcomes[0].passed);
        assert!(result.stage_outcomes[2].passed);

        let failed = &result.stage_outcomes[1];
        assert!(!failed.passed);
        assert_eq!(failed.measurement, None);
        assert_eq!(failed.failure_reasons.len(), 1);
        assert!(failed.failure_reasons[0].contains("acquisition failed"));

        assert!(result.notes.contains("Stage 2"));
        assert!(!result.notes.contains("Stage 1"));
    }

    #[tokio::test]
    async fn out_of_range_stage_fails_run_but_keeps_measurement()
    {
        let mut source = ManualEntry::new()
            .enter(1, Measurement::new(5.0, 0.5, 100.0))
            .enter(2, Measurement::new(6.2, 0.5, 100.0))
            .enter(3, Measurement::new(5.0, 0.5, 100.0));

        let result = run_plan("PCB-003", "tester", &plan(), &mut source).await;

        assert!(!result.overall_passed);

        let failed = &result.stage_outcomes[1];
        assert!(!failed.passed);
        assert_eq!(failed.measurement, Some(Measurement::new(6.2, 0.5, 100.0)));
        assert!(failed.failure_reasons[0].contains("voltage"));

        assert_eq!(result.notes, "Failed stages: Stage 2: Stage 2");
    }

    #[tokio::test]
    async fn outcomes_follow_supplied_stage_order()
    {
        let mut source = ManualEntry::new()
            .enter(1, Measurement::new(5.0, 0.5, 100.0))
            .enter(2, Measurement::new(5.0, 0.5, 100.0))
            .enter(3, Measurement::new(5.0, 0.5, 100.0));

        let result = run_plan("PCB-004", "tester", &plan(), &mut source).await;

        let indices: Vec<u32> = result
            .stage_outcomes
            .iter()
            .map(|outcome| outcome.stage_index)
            .collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn empty_plan_passes_vacuously()
    {
        let mut source = ManualEntry::new();
        let result = run_plan("PCB-005", "tester", &[], &mut source).await;

        assert!(result.overall_passed);
        assert!(result.stage_outcomes.is_empty());
    }

    #[tokio::test]
    async fn manual_entry_missing_stage_reads_as_acquisition_failure()
    {
        let mut source = ManualEntry::new().enter(1, Measurement::new(5.0, 0.5, 100.0));
        let stages = plan();

        let result = run_plan("PCB-006", "tester", &stages, &mut source).await;

        assert!(!result.overall_passed);
        assert!(result.stage_outcomes[0].passed);
        assert!(!result.stage_outcomes[1].passed);
        assert!(result.stage_outcomes[1].failure_reasons[0].contains("no manual entry"));
    }
}
