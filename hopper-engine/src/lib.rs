//! # Hopper Import Engine
//!
//! Directory-fed batch import pipeline. Files dropped into a pipeline's
//! `input` directory are claimed into a work area, broken into records,
//! and synchronized with persisted entities under a per-field overwrite
//! policy; each file then lands in `done` or `error`.
//!
//! Module map, leaf first:
//! - [`matching`] - declarative rule tables mapping record attributes to
//!   output values
//! - [`record`] - the record and mapper abstractions over file content
//! - [`populator`] - the per-field update decision and mutation logic
//! - [`builder`] - per-file record processing with record-level
//!   transaction isolation
//! - [`queue`] - the input/work/done/error directory state machine
//! - [`pipeline`] - the controller walking `input` and routing files

pub mod builder;
pub mod matching;
pub mod pipeline;
pub mod populator;
pub mod queue;
pub mod record;

pub use builder::{BuildOutput, BuildStatus, Builder, BuilderSpec, RecordOutcome};
pub use matching::{JsonTableStore, MatchingEngine, MatchingTable, TableStore};
pub use pipeline::{BuilderLoader, Pipeline, RunReport};
pub use populator::{FieldPolicy, FieldSource, PopulateContext, PopulationPlan, Populator};
pub use queue::{DirQueue, Location, WorkSet};
pub use record::{Mapper, Record, RecordIter, ValueRecord};
