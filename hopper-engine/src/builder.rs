//! Per-file record processing
//!
//! A builder drives every record extracted from one file through entity
//! resolution, the field-update policy and the store, isolating
//! failures to the offending record. Stop signals raised by populate
//! methods unwind one record, the rest of the file, or the whole run
//! without counting as failures.

use std::path::Path;

use hopper_common::store::{Entity, EntityStore, TxnScope};
use hopper_common::{Error, Result, Stop};

use crate::matching::MatchingEngine;
use crate::populator::{FieldPolicy, FieldSource, PopulateContext};
use crate::queue::WorkSet;
use crate::record::{Mapper, Record};

/// Per-import pieces a builder needs: what to extract, what entity type
/// to target and how to populate it.
pub trait BuilderSpec {
    /// Entity type records of this file synchronize into.
    fn entity_type(&self) -> &str;

    fn mapper(&self) -> &dyn Mapper;

    fn populator(&self) -> &dyn crate::populator::Populator;

    /// Records answering true are dropped before any entity is touched.
    fn skip(&self, _record: &dyn Record) -> bool {
        false
    }

    /// Whether the entity was changed outside the importer since the
    /// last run; selects the allow-list branch for updates.
    fn locally_modified(&self, entity: &dyn Entity) -> bool;
}

/// Terminal outcome of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Persisted,
    Skipped,
    /// The record gave up voluntarily; its changes were discarded
    StoppedRecord,
    /// The record asked to stop the file; earlier commits are kept
    StoppedBuilder,
    /// The record asked to stop the whole run
    StoppedPipeline,
    /// Unexpected failure, rolled back and logged
    RecordError,
}

/// Summary over all records of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Ok,
    HadErrors,
    StoppedPipeline,
}

/// What one file's processing produced.
pub struct BuildOutput {
    /// Entities persisted, in record order
    pub entities: Vec<Box<dyn Entity>>,
    /// Outcome of every record that was reached
    pub outcomes: Vec<RecordOutcome>,
    pub status: BuildStatus,
}

impl std::fmt::Debug for BuildOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOutput")
            .field(
                "entities",
                &self
                    .entities
                    .iter()
                    .map(|e| (e.entity_type(), e.key()))
                    .collect::<Vec<_>>(),
            )
            .field("outcomes", &self.outcomes)
            .field("status", &self.status)
            .finish()
    }
}

pub struct Builder<'a> {
    spec: &'a dyn BuilderSpec,
    store: &'a dyn EntityStore,
    matching: &'a MatchingEngine,
    txn: TxnScope<'a>,
    work: Option<&'a WorkSet<'a>>,
}

impl<'a> Builder<'a> {
    /// Builder owning its transaction scope; one transaction per record.
    pub fn new(
        spec: &'a dyn BuilderSpec,
        store: &'a dyn EntityStore,
        matching: &'a MatchingEngine,
    ) -> Self {
        Self {
            spec,
            store,
            matching,
            txn: TxnScope::owner(store),
            work: None,
        }
    }

    /// Builder participating in an enclosing transaction scope.
    ///
    /// Nested builders never commit or roll back themselves; a failing
    /// record marks the enclosing unit aborted and propagates.
    pub fn nested(
        spec: &'a dyn BuilderSpec,
        store: &'a dyn EntityStore,
        matching: &'a MatchingEngine,
        txn: TxnScope<'a>,
    ) -> Self {
        Self {
            spec,
            store,
            matching,
            txn,
            work: None,
        }
    }

    /// Attach the work area so populate methods can claim related files.
    pub fn with_work(mut self, work: &'a WorkSet<'a>) -> Self {
        self.work = Some(work);
        self
    }

    /// Process every record of `content`, persisting as it goes.
    ///
    /// `Err` is returned only when no records could be produced at all
    /// (file-level failure) or, for nested builders, when the enclosing
    /// transaction unit must abort. Everything else is folded into the
    /// returned [`BuildOutput`].
    pub fn process_and_save(&self, path: &Path, content: String) -> Result<BuildOutput> {
        let records = self.spec.mapper().produce(path, content)?;

        let mut entities: Vec<Box<dyn Entity>> = Vec::new();
        let mut outcomes = Vec::new();
        let mut had_errors = false;
        let mut stopped_pipeline = false;

        for item in records {
            let (label, step) = match item {
                Ok(record) => (record.describe(), self.process_record(path, record.as_ref())),
                Err(err) => ("<unproduced record>".to_string(), Err(err)),
            };

            match step {
                Ok(Some(entity)) => {
                    outcomes.push(RecordOutcome::Persisted);
                    entities.push(entity);
                }
                Ok(None) => outcomes.push(RecordOutcome::Skipped),
                Err(err) => {
                    if !self.txn.owns() {
                        // no private transaction to unwind here; the
                        // owning unit decides what the failure means
                        return Err(err);
                    }
                    match err.stop() {
                        Some(Stop::Record) => {
                            tracing::debug!(path = %path.display(), record = %label, "record stop requested");
                            outcomes.push(RecordOutcome::StoppedRecord);
                        }
                        Some(Stop::Builder) => {
                            tracing::info!(path = %path.display(), record = %label, "builder stop requested");
                            outcomes.push(RecordOutcome::StoppedBuilder);
                            break;
                        }
                        Some(Stop::Pipeline) => {
                            tracing::info!(path = %path.display(), record = %label, "pipeline stop requested");
                            outcomes.push(RecordOutcome::StoppedPipeline);
                            stopped_pipeline = true;
                            break;
                        }
                        None => {
                            tracing::error!(
                                path = %path.display(),
                                record = %label,
                                error = %err,
                                "record failed, continuing with the next one"
                            );
                            outcomes.push(RecordOutcome::RecordError);
                            had_errors = true;
                        }
                    }
                }
            }
        }

        let status = if stopped_pipeline {
            BuildStatus::StoppedPipeline
        } else if had_errors {
            BuildStatus::HadErrors
        } else {
            BuildStatus::Ok
        };
        Ok(BuildOutput {
            entities,
            outcomes,
            status,
        })
    }

    /// One record, one unit of work. `Ok(None)` means skipped.
    fn process_record(&self, path: &Path, record: &dyn Record) -> Result<Option<Box<dyn Entity>>> {
        if self.spec.skip(record) {
            tracing::debug!(record = %record.describe(), "skipped");
            return Ok(None);
        }

        self.txn.begin()?;
        match self.populate_record(path, record) {
            Ok(entity) => {
                if self.txn.abort_requested() {
                    self.txn.rollback()?;
                    return Err(Error::Stop(Stop::Record));
                }
                self.txn.commit()?;
                Ok(Some(entity))
            }
            Err(err) => {
                self.txn.rollback()?;
                if !self.txn.owns() {
                    self.txn.request_abort();
                }
                Err(err)
            }
        }
    }

    fn populate_record(&self, path: &Path, record: &dyn Record) -> Result<Box<dyn Entity>> {
        let key = record.instance_key()?;
        let fetched = self.store.fetch_one(self.spec.entity_type(), &key)?;
        let is_update = fetched.is_some();
        let mut entity = match fetched {
            Some(entity) => entity,
            None => self.store.create(self.spec.entity_type(), &key)?,
        };
        let locally_modified = is_update && self.spec.locally_modified(entity.as_ref());

        let populator = self.spec.populator();
        let plan = populator.plan();
        let policy = FieldPolicy::new(plan, is_update, locally_modified);

        tracing::debug!(
            record = %record.describe(),
            is_update,
            locally_modified,
            "populating"
        );

        // scalars first, then save, so the entity exists before
        // anything links to it
        for field in entity.scalar_fields() {
            if !policy.should_set(&field) {
                continue;
            }
            match plan.source_for(&field) {
                Some(FieldSource::FromRecord) => {
                    let value = record.attr(&field)?;
                    entity.set_scalar(&field, value)?;
                }
                Some(FieldSource::ViaMethod) => {
                    let mut ctx = self.context(path, record, entity.as_mut());
                    populator.populate(&field, &mut ctx)?;
                }
                None => {
                    return Err(Error::Config(format!(
                        "no source for field '{}' on {}",
                        field,
                        self.spec.entity_type()
                    )));
                }
            }
        }
        self.store.save(entity.as_mut())?;

        // relations only ever come from populate methods; cleared first
        // so a re-import ends up with the same links, not duplicates
        for field in entity.relation_fields() {
            if !policy.should_set(&field) {
                continue;
            }
            match plan.source_for(&field) {
                Some(FieldSource::ViaMethod) => {
                    self.store.clear_relation(entity.as_ref(), &field)?;
                    let mut ctx = self.context(path, record, entity.as_mut());
                    populator.populate(&field, &mut ctx)?;
                }
                Some(FieldSource::FromRecord) => {
                    return Err(Error::Config(format!(
                        "relation field '{}' on {} cannot be one-to-one",
                        field,
                        self.spec.entity_type()
                    )));
                }
                None => {
                    return Err(Error::Config(format!(
                        "no source for relation field '{}' on {}",
                        field,
                        self.spec.entity_type()
                    )));
                }
            }
        }

        Ok(entity)
    }

    fn context<'b>(
        &'b self,
        path: &'b Path,
        record: &'b dyn Record,
        entity: &'b mut dyn Entity,
    ) -> PopulateContext<'b> {
        PopulateContext {
            record,
            entity,
            path,
            store: self.store,
            matching: self.matching,
            txn: &self.txn,
            work: self.work,
        }
    }
}
