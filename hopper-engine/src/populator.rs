//! Field-update policy
//!
//! Decides per field whether an import may overwrite it and where the
//! new value comes from. The field layout is resolved once per import
//! into a [`PopulationPlan`]; the per-record decision state lives in
//! [`FieldPolicy`].

use std::collections::BTreeSet;
use std::path::Path;

use hopper_common::store::{Entity, EntityStore, TxnScope};
use hopper_common::{Error, Result, Value};

use crate::builder::{Builder, BuilderSpec};
use crate::matching::MatchingEngine;
use crate::queue::WorkSet;
use crate::record::Record;

/// Where a field's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    /// Copied from the record attribute of the same name
    FromRecord,
    /// Computed by the populator's `populate` method
    ViaMethod,
}

/// Field layout and allow-lists for one entity type.
///
/// Built once when the import is assembled, shared across records. The
/// allow-lists distinguish "not configured" (`None`, everything may
/// change) from "configured empty" (nothing may change).
#[derive(Debug, Clone, Default)]
pub struct PopulationPlan {
    one_to_one: BTreeSet<String>,
    via_method: BTreeSet<String>,
    fields_if_exists: Option<BTreeSet<String>>,
    fields_if_modified: Option<BTreeSet<String>>,
}

impl PopulationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fields copied verbatim from the record.
    pub fn one_to_one<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.one_to_one = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Fields computed by [`Populator::populate`].
    pub fn via_method<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.via_method = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Allow-list applied when the entity pre-exists untouched.
    pub fn fields_if_exists<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields_if_exists = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Allow-list applied when the entity was modified outside the
    /// importer since the last run.
    pub fn fields_if_modified<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields_if_modified = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Resolve the source for one field, `None` when the plan does not
    /// cover it.
    pub fn source_for(&self, field: &str) -> Option<FieldSource> {
        if self.one_to_one.contains(field) {
            Some(FieldSource::FromRecord)
        } else if self.via_method.contains(field) {
            Some(FieldSource::ViaMethod)
        } else {
            None
        }
    }
}

/// Per-record update decision state.
#[derive(Debug, Clone, Copy)]
pub struct FieldPolicy<'a> {
    plan: &'a PopulationPlan,
    is_update: bool,
    locally_modified: bool,
}

impl<'a> FieldPolicy<'a> {
    pub fn new(plan: &'a PopulationPlan, is_update: bool, locally_modified: bool) -> Self {
        Self {
            plan,
            is_update,
            locally_modified,
        }
    }

    /// Whether this import may write `field` on the current entity.
    ///
    /// Creates populate every field. Updates consult the allow-list for
    /// the branch: `fields_if_exists` when the entity was untouched
    /// since the last import, `fields_if_modified` when it was changed
    /// locally. A missing allow-list means everything may change.
    pub fn should_set(&self, field: &str) -> bool {
        if !self.is_update {
            return true;
        }
        let allow = if self.locally_modified {
            &self.plan.fields_if_modified
        } else {
            &self.plan.fields_if_exists
        };
        match allow {
            None => true,
            Some(fields) => fields.contains(field),
        }
    }
}

/// Field-level mutation logic for one entity type.
pub trait Populator {
    /// Field layout; resolved once, shared across records.
    fn plan(&self) -> &PopulationPlan;

    /// Populate one `ViaMethod` field on `ctx.entity`.
    ///
    /// Relation fields arrive already cleared. The method may consult
    /// the matching engine, claim related input files, or run a nested
    /// builder through `ctx`.
    fn populate(&self, field: &str, ctx: &mut PopulateContext<'_>) -> Result<()>;
}

/// Everything a populate method may reach while one record is being
/// processed.
pub struct PopulateContext<'a> {
    pub record: &'a dyn Record,
    pub entity: &'a mut dyn Entity,
    /// File the current record came from
    pub path: &'a Path,
    pub(crate) store: &'a dyn EntityStore,
    pub(crate) matching: &'a MatchingEngine,
    pub(crate) txn: &'a TxnScope<'a>,
    pub(crate) work: Option<&'a WorkSet<'a>>,
}

impl<'a> PopulateContext<'a> {
    pub fn matching(&self) -> &MatchingEngine {
        self.matching
    }

    pub fn store(&self) -> &dyn EntityStore {
        self.store
    }

    /// Link `related` into a multi-valued relation of the entity.
    pub fn add_relation(&mut self, field: &str, related: &dyn Entity) -> Result<()> {
        self.store.add_relation(self.entity, field, related)?;
        Ok(())
    }

    /// Set a scalar field to the first value the table yields for this
    /// record. No match and no table default leaves the field untouched.
    pub fn set_scalar_from_matching(&mut self, table: &str, field: &str) -> Result<()> {
        match self.matching.match_first(table, self.record)? {
            Some(value) => {
                self.entity.set_scalar(field, value)?;
            }
            None => {
                tracing::debug!(table, field, "no matching value, field left as is");
            }
        }
        Ok(())
    }

    /// Resolve each table output to a related entity and link it into
    /// the named relation.
    ///
    /// `get_or_create` receives the store and the matched value;
    /// entities it creates must be saved before they are returned.
    pub fn populate_relation_from_matching(
        &mut self,
        table: &str,
        field: &str,
        first_only: bool,
        get_or_create: &mut dyn FnMut(&dyn EntityStore, &Value) -> Result<Box<dyn Entity>>,
    ) -> Result<()> {
        let values = if first_only {
            self.matching
                .match_first(table, self.record)?
                .map(|v| vec![v])
                .unwrap_or_default()
        } else {
            self.matching.match_all(table, self.record)?
        };

        for value in values {
            let related = get_or_create(self.store, &value)?;
            self.store.add_relation(self.entity, field, related.as_ref())?;
        }
        Ok(())
    }

    /// Run a child builder over related content inside the current
    /// transaction unit and hand its entities back to the caller.
    pub fn run_nested(
        &mut self,
        spec: &dyn BuilderSpec,
        path: &Path,
        content: String,
    ) -> Result<Vec<Box<dyn Entity>>> {
        let mut builder = Builder::nested(spec, self.store, self.matching, self.txn.child());
        if let Some(work) = self.work {
            builder = builder.with_work(work);
        }
        let output = builder.process_and_save(path, content)?;
        Ok(output.entities)
    }

    /// Claim a sibling input file into the work area and return its
    /// content. The claimed file travels with the endpoint file to its
    /// terminal directory.
    pub fn claim_related(&self, rel_path: &Path) -> Result<String> {
        match self.work {
            Some(work) => work.claim(rel_path),
            None => Err(Error::Config(
                "no work area attached to this builder".to_string(),
            )),
        }
    }
}
