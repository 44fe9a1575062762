//! Record and mapper abstractions
//!
//! A mapper walks one file's content and yields records; a record is a
//! read-only view over one extracted unit (one row, entry or node)
//! exposing named attributes.

use std::collections::BTreeMap;
use std::path::Path;

use hopper_common::{Error, InstanceKey, Result, Value};

/// One extracted unit of file content.
///
/// Concrete records declare their attributes explicitly: `attr` answers
/// only names the record knows about and errors on anything else, so a
/// typo in a matching table or population plan surfaces instead of
/// silently matching nothing.
pub trait Record {
    /// Look up a named attribute.
    ///
    /// Unknown names are `Error::NotFound`; malformed content behind a
    /// known name is a record-scoped error and must not abort sibling
    /// records.
    fn attr(&self, name: &str) -> Result<Value>;

    /// Field name to value map uniquely identifying the target entity.
    ///
    /// Must be stable and deterministic for identical content; it is the
    /// sole identity used for fetch-or-create.
    fn instance_key(&self) -> Result<InstanceKey>;

    /// Short identity for log lines.
    fn describe(&self) -> String {
        match self.instance_key() {
            Ok(key) => hopper_common::value::key_display(&key),
            Err(_) => "<unidentified record>".to_string(),
        }
    }
}

/// One-shot, finite sequence of records extracted from a single file.
pub type RecordIter = Box<dyn Iterator<Item = Result<Box<dyn Record>>>>;

/// Extracts records from file content.
pub trait Mapper {
    /// Walk `content` and yield one record per logical row.
    ///
    /// The sequence is not restartable; re-scanning requires calling
    /// `produce` again with fresh content. A wholesale parse failure is
    /// returned as `Err` (file-level); a single bad row surfaces as an
    /// `Err` item (record-level).
    fn produce(&self, path: &Path, content: String) -> Result<RecordIter>;
}

/// Record over already-extracted values.
///
/// Useful for validating matching tables against hand-built attribute
/// sets; real imports implement [`Record`] over their parsed content.
#[derive(Debug, Clone, Default)]
pub struct ValueRecord {
    attrs: BTreeMap<String, Value>,
    key_fields: Vec<String>,
}

impl ValueRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one named attribute.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    /// Declare which attributes form the instance key.
    pub fn key_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_fields = fields.into_iter().map(Into::into).collect();
        self
    }
}

impl Record for ValueRecord {
    fn attr(&self, name: &str) -> Result<Value> {
        self.attrs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("record attribute '{}'", name)))
    }

    fn instance_key(&self) -> Result<InstanceKey> {
        let mut key = InstanceKey::new();
        for field in &self.key_fields {
            key.insert(field.clone(), self.attr(field)?);
        }
        Ok(key)
    }
}
