//! Rule-based matching engine
//!
//! A matching table is a named, ordered list of candidate outputs, each
//! guarded by one or more rule sets over record attributes. Within one
//! rule set, rules sharing an attribute are OR'd and distinct attributes
//! are AND'd; rule sets of the same entry are OR'd. Evaluating a table
//! against a record yields zero, one or many output values.
//!
//! Tables load lazily on first use and stay cached for the lifetime of
//! the engine; edits to the backing store are not picked up mid-run.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use hopper_common::{Error, Result, Value};

use crate::record::Record;

/// A single constraint on one record attribute.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchRule {
    pub attribute: String,
    pub expected: Value,

    /// Compare case-folded and diacritic-stripped
    #[serde(default)]
    pub loose: bool,
}

/// Constraints that must hold together.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<MatchRule>,
}

/// One candidate output with the rule sets that can produce it.
#[derive(Debug, Clone, Deserialize)]
pub struct TableEntry {
    pub output: Value,
    pub rule_sets: Vec<RuleSet>,
}

/// Named, ordered rule table.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchingTable {
    /// Returned when no entry matched at all
    #[serde(default)]
    pub default: Option<Value>,

    pub entries: Vec<TableEntry>,
}

/// Backing storage for matching tables.
pub trait TableStore {
    /// Load a table by name; `None` when the store has no such table.
    fn load(&self, name: &str) -> Result<Option<MatchingTable>>;
}

/// Table store reading `<dir>/<name>.json`.
pub struct JsonTableStore {
    dir: PathBuf,
}

impl JsonTableStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl TableStore for JsonTableStore {
    fn load(&self, name: &str) -> Result<Option<MatchingTable>> {
        let path = self.dir.join(format!("{}.json", name));
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let table = serde_json::from_str(&content)
            .map_err(|e| Error::Content(format!("matching table {}: {}", path.display(), e)))?;
        Ok(Some(table))
    }
}

/// Evaluates matching tables against records.
pub struct MatchingEngine {
    store: Box<dyn TableStore>,
    cache: RwLock<HashMap<String, Arc<MatchingTable>>>,
}

impl MatchingEngine {
    pub fn new(store: Box<dyn TableStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Every entry output with at least one matching rule set, in table
    /// order; the table default when nothing matched.
    pub fn match_all(&self, table: &str, record: &dyn Record) -> Result<Vec<Value>> {
        self.scan(table, record, false)
    }

    /// First matching entry output, or the table default, or `None`.
    ///
    /// `None` is an explicit non-match signal, not an error; callers
    /// decide whether a value is required.
    pub fn match_first(&self, table: &str, record: &dyn Record) -> Result<Option<Value>> {
        Ok(self.scan(table, record, true)?.into_iter().next())
    }

    fn scan(&self, name: &str, record: &dyn Record, first_only: bool) -> Result<Vec<Value>> {
        let table = self.table(name)?;
        let mut output = Vec::new();

        for entry in &table.entries {
            for rule_set in &entry.rule_sets {
                if rule_set_matches(rule_set, record)? {
                    // one matching set is enough for this entry
                    output.push(entry.output.clone());
                    if first_only {
                        return Ok(output);
                    }
                    break;
                }
            }
        }

        if output.is_empty() {
            if let Some(default) = &table.default {
                output.push(default.clone());
            }
        }
        Ok(output)
    }

    fn table(&self, name: &str) -> Result<Arc<MatchingTable>> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(table) = cache.get(name) {
                return Ok(Arc::clone(table));
            }
        }

        let table = self
            .store
            .load(name)?
            .ok_or_else(|| Error::NotFound(format!("matching table '{}'", name)))?;
        tracing::debug!(table = name, entries = table.entries.len(), "table loaded");

        let table = Arc::new(table);
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(
            cache.entry(name.to_string()).or_insert(table),
        ))
    }
}

/// Every distinct attribute in the set needs at least one satisfied rule.
fn rule_set_matches(rule_set: &RuleSet, record: &dyn Record) -> Result<bool> {
    let mut satisfied: BTreeMap<&str, bool> = BTreeMap::new();
    for rule in &rule_set.rules {
        let hit = rule_satisfied(rule, record)?;
        let slot = satisfied.entry(rule.attribute.as_str()).or_insert(false);
        *slot = *slot || hit;
    }
    Ok(satisfied.values().all(|v| *v))
}

fn rule_satisfied(rule: &MatchRule, record: &dyn Record) -> Result<bool> {
    let actual = record.attr(&rule.attribute)?;
    if rule.loose {
        if let (Some(expected), Some(actual)) = (rule.expected.as_str(), actual.as_str()) {
            return Ok(normalize(expected) == normalize(actual));
        }
    }
    Ok(actual == rule.expected)
}

/// Case-folded, diacritic-stripped comparison form.
fn normalize(s: &str) -> String {
    s.to_lowercase().nfkd().filter(|c| !is_combining_mark(*c)).collect()
}
