//! Persistence contracts and the run result assembler
//!
//! # Purpose
//! The station keeps its communication settings and stage plans in an external store and writes
//! finished runs back to it. This module owns only the contracts ([`ConfigStore`],
//! [`ResultStore`]) and the assembly logic that maps a [`RunResult`] onto store rows; the store
//! itself belongs to whoever operates the station. [`MemoryStore`] is the in-memory stand-in
//! used by tests and demos.
//!
//! # The Run Row Is Authoritative
//! [`persist`] writes the run row first. If that write fails, nothing was persisted and the
//! caller gets an error. Once the run row exists the run is considered recorded: a stage row
//! that fails to write is reported as a warning, never by unwinding the run.

use std::fmt;

use tracing::{ info, warn };

use crate::{
    link::CommunicationConfig,
    sequence::RunResult,
    stages::StageDefinition,
    telemetry::Measurement,
};

/// Errors raised by store implementations, which own their error types
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Row identifier of a persisted run
pub type RunId = u64;

/// Row identifier of a persisted stage result
pub type StageResultId = u64;

/// Read-only access to station configuration
///
/// Implementations wrap whatever database the station runs against. Configuration is written by
/// separate tooling; this engine only ever reads it.
pub trait ConfigStore
{
    /// The communication settings currently selected for the station, if any
    ///
    /// `None` means no serial acquisition is possible until an operator configures a channel;
    /// manual entry is unaffected.
    fn active_comm_config(&self) -> Result<Option<CommunicationConfig>, StoreError>;

    /// The stages of one plan, in ascending sequence order
    fn stages_for_plan(&self, plan_id: u32) -> Result<Vec<StageDefinition>, StoreError>;
}

/// Write access for finished runs
pub trait ResultStore
{
    /// Creates the run row and returns its identifier
    fn create_run(
        &mut self,
        unit_id: &str,
        operator_id: &str,
        overall_passed: bool,
        notes: &str,
    )
        -> Result<RunId, StoreError>;

    /// Creates one stage result row under an existing run
    fn create_stage_result(
        &mut self,
        run_id: RunId,
        stage_index: u32,
        measurement: Option<Measurement>,
        passed: bool,
        failure_reason: &str,
    )
        -> Result<StageResultId, StoreError>;
}

/// The run row itself could not be written
#[derive(Debug)]
pub struct PersistError
{
    pub cause: StoreError,
}

impl fmt::Display for PersistError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "failed to persist run record. Caused by: {}", self.cause)
    }
}

impl std::error::Error for PersistError
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)>
    {
        Some(self.cause.as_ref())
    }
}

/// What [`persist`] managed to write
///
/// `warnings` holds one entry per stage row that failed to write. The run row behind `run_id`
/// exists even when warnings are present.
#[derive(Debug)]
pub struct PersistReport
{
    pub run_id: RunId,
    pub warnings: Vec<String>,
}

/// Writes a finished run to a result store
///
/// The run row goes in first and its failure aborts the whole persist. Stage rows follow in
/// outcome order; each failed stage write is logged, collected as a warning, and does not stop
/// the remaining rows.
pub fn persist(result: &RunResult, store: &mut dyn ResultStore) -> Result<PersistReport, PersistError>
{
    let run_id = store
        .create_run(&result.unit_id, &result.operator_id, result.overall_passed, &result.notes)
        .map_err(|cause| PersistError { cause: cause })?;

    let mut warnings = Vec::new();

    for outcome in &result.stage_outcomes {
        let failure_reason = outcome.failure_reasons.join("; ");
        let written = store.create_stage_result(
            run_id,
            outcome.stage_index,
            outcome.measurement,
            outcome.passed,
            &failure_reason,
        );

        if let Err(cause) = written {
            warn!(run = run_id, stage = outcome.stage_index, "stage result not persisted: {}", cause);
            warnings.push(format!("stage {} result not persisted: {}", outcome.stage_index, cause));
        }
    }

    info!(
        run = run_id,
        unit = %result.unit_id,
        stages = result.stage_outcomes.len(),
        warnings = warnings.len(),
        "run persisted"
    );

    Ok(PersistReport {
        run_id: run_id,
        warnings: warnings,
    })
}

/// A persisted run row
#[derive(Debug, Clone, PartialEq)]
pub struct RunRow
{
    pub run_id: RunId,
    pub unit_id: String,
    pub operator_id: String,
    pub overall_passed: bool,
    pub notes: String,
}

/// A persisted stage result row
#[derive(Debug, Clone, PartialEq)]
pub struct StageResultRow
{
    pub stage_result_id: StageResultId,
    pub run_id: RunId,
    pub stage_index: u32,
    pub measurement: Option<Measurement>,
    pub passed: bool,
    pub failure_reason: String,
}

/// In-memory store for tests and demo setups
///
/// Holds configuration and rows in plain vectors with sequential identifiers. Never used in
/// production but shaped like the real tables so round-trip assertions read naturally.
#[derive(Debug, Default)]
pub struct MemoryStore
{
    comm_config: Option<CommunicationConfig>,
    plans: Vec<(u32, Vec<StageDefinition>)>,
    runs: Vec<RunRow>,
    stage_results: Vec<StageResultRow>,
    next_run_id: RunId,
    next_stage_result_id: StageResultId,
}

impl MemoryStore
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn set_comm_config(&mut self, config: CommunicationConfig)
    {
        self.comm_config = Some(config);
    }

    /// Replaces the stage list of one plan
    pub fn set_plan(&mut self, plan_id: u32, stages: Vec<StageDefinition>)
    {
        self.plans.retain(|(id, _)| *id != plan_id);
        self.plans.push((plan_id, stages));
    }

    pub fn runs(&self) -> &[RunRow]
    {
        &self.runs
    }

    pub fn stage_results_for(&self, run_id: RunId) -> Vec<&StageResultRow>
    {
        self.stage_results
            .iter()
            .filter(|row| row.run_id == run_id)
            .collect()
    }
}

impl ConfigStore for MemoryStore
{
    fn active_comm_config(&self) -> Result<Option<CommunicationConfig>, StoreError>
    {
        Ok(self.comm_config.clone())
    }

    fn stages_for_plan(&self, plan_id: u32) -> Result<Vec<StageDefinition>, StoreError>
    {
        let mut stages = self
            .plans
            .iter()
            .find(|(id, _)| *id == plan_id)
            .map(|(_, stages)| stages.clone())
            .unwrap_or_default();

        stages.sort_by_key(|stage| stage.sequence_index);

        Ok(stages)
    }
}

impl ResultStore for MemoryStore
{
    fn create_run(
        &mut self,
        unit_id: &str,
        operator_id: &str,
        overall_passed: bool,
        notes: &str,
    )
        -> Result<RunId, StoreError>
    {
        self.next_run_id += 1;
        self.runs.push(RunRow {
            run_id: self.next_run_id,
            unit_id: unit_id.to_owned(),
            operator_id: operator_id.to_owned(),
            overall_passed: overall_passed,
            notes: notes.to_owned(),
        });

        Ok(self.next_run_id)
    }

    fn create_stage_result(
        &mut self,
        run_id: RunId,
        stage_index: u32,
        measurement: Option<Measurement>,
        passed: bool,
        failure_reason: &str,
    )
        -> Result<StageResultId, StoreError>
    {
        self.next_stage_result_id += 1;
        self.stage_results.push(StageResultRow {
            stage_result_id: self.next_stage_result_id,
            run_id: run_id,
            stage_index: stage_index,
            measurement: measurement,
            passed: passed,
            failure_reason: failure_reason.to_owned(),
        });

        Ok(self.next_stage_result_id)
    }
}
