//! Entity store collaborator traits
//!
//! The engine never persists anything itself; it drives an external
//! store through these traits. Identity is the `InstanceKey` alone:
//! `fetch_one` either finds the entity behind a key or the builder asks
//! `create` for a transient one, populates it, and hands it to `save`.

use std::cell::Cell;
use std::rc::Rc;

use thiserror::Error;

use crate::value::{InstanceKey, Value};

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the entity store boundary.
///
/// `Conflict` must be used for uniqueness and integrity violations so
/// the builder can classify them as record errors rather than aborting
/// the file.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No entity behind the given key
    #[error("no {entity_type} for {key}")]
    NotFound { entity_type: String, key: String },

    /// Uniqueness or integrity violation on save
    #[error("integrity conflict: {0}")]
    Conflict(String),

    /// Field name the entity does not carry
    #[error("unknown field: {0}")]
    UnknownField(String),

    /// Any other backend failure
    #[error("backend error: {0}")]
    Backend(String),
}

/// One persisted (or about to be persisted) domain object.
///
/// Field enumeration drives population: the builder iterates
/// `scalar_fields` and `relation_fields` and asks the policy what to do
/// with each. Store-managed identity fields are not enumerated.
pub trait Entity {
    /// Entity type name as the store knows it
    fn entity_type(&self) -> &str;

    /// Identity this entity was resolved with
    fn key(&self) -> &InstanceKey;

    /// True once the entity exists in the store
    fn is_persisted(&self) -> bool;

    /// Writable scalar field names
    fn scalar_fields(&self) -> Vec<String>;

    /// Multi-valued relation field names
    fn relation_fields(&self) -> Vec<String>;

    /// Current value of a scalar field
    fn scalar(&self, field: &str) -> StoreResult<Value>;

    /// Set a scalar field; not visible to readers until `save`
    fn set_scalar(&mut self, field: &str, value: Value) -> StoreResult<()>;

    /// Escape hatch for stores to recover their concrete entity type.
    fn as_any(&self) -> &dyn std::any::Any;

    /// Mutable variant of [`Entity::as_any`].
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Persistence operations the engine needs from the outside world.
pub trait EntityStore {
    /// Fetch the entity behind `key`, if any.
    fn fetch_one(
        &self,
        entity_type: &str,
        key: &InstanceKey,
    ) -> StoreResult<Option<Box<dyn Entity>>>;

    /// Construct a transient, unsaved entity carrying `key`.
    fn create(&self, entity_type: &str, key: &InstanceKey) -> StoreResult<Box<dyn Entity>>;

    /// Persist all scalar fields of `entity`.
    fn save(&self, entity: &mut dyn Entity) -> StoreResult<()>;

    /// Empty a multi-valued relation.
    fn clear_relation(&self, entity: &dyn Entity, field: &str) -> StoreResult<()>;

    /// Link `related` into a multi-valued relation.
    fn add_relation(&self, entity: &dyn Entity, field: &str, related: &dyn Entity)
        -> StoreResult<()>;

    /// Open the unit of work for one record.
    fn begin(&self) -> StoreResult<()>;

    /// Make the current unit of work durable.
    fn commit(&self) -> StoreResult<()>;

    /// Discard every change of the current unit of work.
    fn rollback(&self) -> StoreResult<()>;
}

/// Per-record transaction scope.
///
/// The outermost builder owns the scope and drives begin/commit/rollback
/// around each record. Nested builders receive a child scope whose
/// transaction calls are no-ops; a child may only request an abort of
/// the owning unit.
pub struct TxnScope<'a> {
    store: &'a dyn EntityStore,
    owns: bool,
    abort: Rc<Cell<bool>>,
}

impl<'a> TxnScope<'a> {
    /// Scope that owns commit and rollback.
    pub fn owner(store: &'a dyn EntityStore) -> Self {
        Self {
            store,
            owns: true,
            abort: Rc::new(Cell::new(false)),
        }
    }

    /// Scope participating in this one's unit of work.
    pub fn child(&self) -> TxnScope<'a> {
        TxnScope {
            store: self.store,
            owns: false,
            abort: Rc::clone(&self.abort),
        }
    }

    pub fn owns(&self) -> bool {
        self.owns
    }

    pub fn begin(&self) -> StoreResult<()> {
        if self.owns {
            self.abort.set(false);
            self.store.begin()?;
        }
        Ok(())
    }

    pub fn commit(&self) -> StoreResult<()> {
        if self.owns {
            self.store.commit()?;
        }
        Ok(())
    }

    pub fn rollback(&self) -> StoreResult<()> {
        if self.owns {
            self.store.rollback()?;
        }
        Ok(())
    }

    /// Ask the owning scope to roll the current unit back.
    pub fn request_abort(&self) {
        self.abort.set(true);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.get()
    }
}
