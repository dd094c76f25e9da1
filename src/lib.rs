//! Acquisition and multi-stage validation engine for serial-linked PCB test jigs
//!
//! A bench station probes a freshly assembled PCB through a test fixture. The fixture streams
//! voltage, current, and resistance readings over a serial channel; an operator steps the unit
//! through an ordered plan of validation stages and the finished run is written to an external
//! store. This crate is the engine between the wire and the store:
//!
//! * [`link`] — the serial transport with its background line reader
//! * [`telemetry`] — wire line parsing and measurement acquisition under deadlines
//! * [`stages`] — stage definitions and the pure range validator
//! * [`sequence`] — the plan sequencer and its pluggable measurement sources
//! * [`store`] — persistence contracts and the run result assembler
//!
//! Operator UI, configuration tooling, and the database itself live outside this crate; the
//! engine only reads configuration through [`store::ConfigStore`] and writes results through
//! [`store::ResultStore`].
//!
//! ```no_run
//! use jigtest::{
//!     link::{ CommunicationConfig, SerialLink },
//!     sequence::{ run_plan, TelemetrySource },
//!     store::{ persist, ConfigStore, MemoryStore },
//!     telemetry::TelemetryDecoder,
//! };
//!
//! # async fn demo(store: &mut MemoryStore) -> Result<(), jigtest::store::StoreError> {
//! let config = store.active_comm_config()?.ok_or("no channel configured")?;
//! let stages = store.stages_for_plan(1)?;
//!
//! let link = SerialLink::connect(&config)?;
//! let mut source = TelemetrySource::new(TelemetryDecoder::default(), link);
//!
//! let result = run_plan("PCB-042", "op7", &stages, &mut source).await;
//! let report = persist(&result, store)?;
//!
//! source.into_inner().disconnect().await;
//! println!("run {} recorded, passed: {}", report.run_id, result.overall_passed);
//! # Ok(())
//! # }
//! ```

pub mod link;
pub mod sequence;
pub mod stages;
pub mod store;
pub mod telemetry;

pub use link::{ CommunicationConfig, ConnectError, SerialLink };
pub use sequence::{ run_plan, ManualEntry, RunResult, StageOutcome, TelemetrySource };
pub use stages::{ validate, RangeLimits, StageDefinition, StageVerdict };
pub use store::{ persist, ConfigStore, MemoryStore, PersistReport, ResultStore };
pub use telemetry::{ AcquireError, LineSource, Measurement, TelemetryDecoder };
