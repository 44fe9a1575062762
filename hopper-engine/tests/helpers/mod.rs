//! Shared fixtures for the integration tests: an in-memory entity
//! store with snapshot transactions, an article import definition and
//! canned matching tables.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde_json::json;

use hopper_common::store::{Entity, EntityStore, StoreError, StoreResult};
use hopper_common::{Error, InstanceKey, Result, Stop, Value};
use hopper_engine::builder::BuilderSpec;
use hopper_engine::matching::{
    MatchRule, MatchingEngine, MatchingTable, RuleSet, TableEntry, TableStore,
};
use hopper_engine::pipeline::BuilderLoader;
use hopper_engine::populator::{PopulateContext, PopulationPlan, Populator};
use hopper_engine::record::{Mapper, Record, RecordIter};

/// Route engine logs into the test harness; `RUST_LOG` filters apply.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------
// In-memory entity store
// ---------------------------------------------------------------------

type StoredKey = (String, String);

#[derive(Debug, Clone, Default)]
struct StoredEntity {
    key: InstanceKey,
    scalars: BTreeMap<String, Value>,
    relations: BTreeMap<String, Vec<StoredKey>>,
}

#[derive(Debug, Clone)]
struct Schema {
    scalars: Vec<String>,
    relations: Vec<String>,
}

/// Entity handed out by [`MemoryStore`].
pub struct MemEntity {
    entity_type: String,
    key: InstanceKey,
    scalar_names: Vec<String>,
    relation_names: Vec<String>,
    scalars: BTreeMap<String, Value>,
    persisted: bool,
}

impl Entity for MemEntity {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn key(&self) -> &InstanceKey {
        &self.key
    }

    fn is_persisted(&self) -> bool {
        self.persisted
    }

    fn scalar_fields(&self) -> Vec<String> {
        self.scalar_names.clone()
    }

    fn relation_fields(&self) -> Vec<String> {
        self.relation_names.clone()
    }

    fn scalar(&self, field: &str) -> StoreResult<Value> {
        if !self.scalar_names.iter().any(|f| f == field) {
            return Err(StoreError::UnknownField(field.to_string()));
        }
        Ok(self.scalars.get(field).cloned().unwrap_or(Value::Null))
    }

    fn set_scalar(&mut self, field: &str, value: Value) -> StoreResult<()> {
        if !self.scalar_names.iter().any(|f| f == field) {
            return Err(StoreError::UnknownField(field.to_string()));
        }
        self.scalars.insert(field.to_string(), value);
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Single-process entity store with snapshot-based transactions.
pub struct MemoryStore {
    schemas: HashMap<String, Schema>,
    data: RefCell<HashMap<StoredKey, StoredEntity>>,
    snapshot: RefCell<Option<HashMap<StoredKey, StoredEntity>>>,
    conflicts: RefCell<HashSet<StoredKey>>,
    saves: Cell<usize>,
}

fn canonical(key: &InstanceKey) -> String {
    serde_json::to_string(key).expect("instance key serializes")
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            schemas: HashMap::new(),
            data: RefCell::new(HashMap::new()),
            snapshot: RefCell::new(None),
            conflicts: RefCell::new(HashSet::new()),
            saves: Cell::new(0),
        }
    }

    pub fn with_schema(
        mut self,
        entity_type: &str,
        scalars: &[&str],
        relations: &[&str],
    ) -> Self {
        self.schemas.insert(
            entity_type.to_string(),
            Schema {
                scalars: scalars.iter().map(|s| s.to_string()).collect(),
                relations: relations.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }

    fn schema(&self, entity_type: &str) -> StoreResult<&Schema> {
        self.schemas
            .get(entity_type)
            .ok_or_else(|| StoreError::Backend(format!("no schema for '{}'", entity_type)))
    }

    /// Make the next `save` of this entity fail with a conflict.
    pub fn conflict_on(&self, entity_type: &str, key: &InstanceKey) {
        self.conflicts
            .borrow_mut()
            .insert((entity_type.to_string(), canonical(key)));
    }

    pub fn count(&self, entity_type: &str) -> usize {
        self.data
            .borrow()
            .keys()
            .filter(|(t, _)| t == entity_type)
            .count()
    }

    pub fn saves(&self) -> usize {
        self.saves.get()
    }

    pub fn get_scalar(&self, entity_type: &str, key: &InstanceKey, field: &str) -> Option<Value> {
        self.data
            .borrow()
            .get(&(entity_type.to_string(), canonical(key)))
            .and_then(|stored| stored.scalars.get(field).cloned())
    }

    /// First scalar of every entity linked through `field`, in link
    /// order.
    pub fn relation_values(
        &self,
        entity_type: &str,
        key: &InstanceKey,
        field: &str,
    ) -> Vec<String> {
        let data = self.data.borrow();
        let Some(stored) = data.get(&(entity_type.to_string(), canonical(key))) else {
            return Vec::new();
        };
        stored
            .relations
            .get(field)
            .map(|links| {
                links
                    .iter()
                    .filter_map(|link| data.get(link))
                    .map(|related| {
                        related
                            .scalars
                            .values()
                            .next()
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn relation_len(&self, entity_type: &str, key: &InstanceKey, field: &str) -> usize {
        self.data
            .borrow()
            .get(&(entity_type.to_string(), canonical(key)))
            .and_then(|stored| stored.relations.get(field))
            .map(|links| links.len())
            .unwrap_or(0)
    }

    /// Poke a stored scalar directly, simulating an edit made outside
    /// the importer.
    pub fn set_scalar_raw(&self, entity_type: &str, key: &InstanceKey, field: &str, value: Value) {
        if let Some(stored) = self
            .data
            .borrow_mut()
            .get_mut(&(entity_type.to_string(), canonical(key)))
        {
            stored.scalars.insert(field.to_string(), value);
        }
    }
}

impl EntityStore for MemoryStore {
    fn fetch_one(
        &self,
        entity_type: &str,
        key: &InstanceKey,
    ) -> StoreResult<Option<Box<dyn Entity>>> {
        let schema = self.schema(entity_type)?;
        let data = self.data.borrow();
        let Some(stored) = data.get(&(entity_type.to_string(), canonical(key))) else {
            return Ok(None);
        };
        Ok(Some(Box::new(MemEntity {
            entity_type: entity_type.to_string(),
            key: key.clone(),
            scalar_names: schema.scalars.clone(),
            relation_names: schema.relations.clone(),
            scalars: stored.scalars.clone(),
            persisted: true,
        })))
    }

    fn create(&self, entity_type: &str, key: &InstanceKey) -> StoreResult<Box<dyn Entity>> {
        let schema = self.schema(entity_type)?;
        let mut scalars = BTreeMap::new();
        // key fields double as regular scalar fields
        for (field, value) in key {
            if schema.scalars.iter().any(|f| f == field) {
                scalars.insert(field.clone(), value.clone());
            }
        }
        Ok(Box::new(MemEntity {
            entity_type: entity_type.to_string(),
            key: key.clone(),
            scalar_names: schema.scalars.clone(),
            relation_names: schema.relations.clone(),
            scalars,
            persisted: false,
        }))
    }

    fn save(&self, entity: &mut dyn Entity) -> StoreResult<()> {
        let stored_key = (entity.entity_type().to_string(), canonical(entity.key()));
        if self.conflicts.borrow_mut().remove(&stored_key) {
            return Err(StoreError::Conflict(format!(
                "duplicate {}",
                stored_key.1
            )));
        }

        let mem = entity
            .as_any_mut()
            .downcast_mut::<MemEntity>()
            .ok_or_else(|| StoreError::Backend("foreign entity type".to_string()))?;

        let mut data = self.data.borrow_mut();
        let stored = data.entry(stored_key).or_default();
        stored.key = mem.key.clone();
        stored.scalars = mem.scalars.clone();
        mem.persisted = true;
        self.saves.set(self.saves.get() + 1);
        Ok(())
    }

    fn clear_relation(&self, entity: &dyn Entity, field: &str) -> StoreResult<()> {
        let stored_key = (entity.entity_type().to_string(), canonical(entity.key()));
        let mut data = self.data.borrow_mut();
        let stored = data
            .get_mut(&stored_key)
            .ok_or_else(|| StoreError::Backend("relation on unsaved entity".to_string()))?;
        stored.relations.insert(field.to_string(), Vec::new());
        Ok(())
    }

    fn add_relation(
        &self,
        entity: &dyn Entity,
        field: &str,
        related: &dyn Entity,
    ) -> StoreResult<()> {
        let stored_key = (entity.entity_type().to_string(), canonical(entity.key()));
        let related_key = (related.entity_type().to_string(), canonical(related.key()));
        let mut data = self.data.borrow_mut();
        if !data.contains_key(&related_key) {
            return Err(StoreError::Backend(format!(
                "related {} not saved",
                related_key.1
            )));
        }
        let stored = data
            .get_mut(&stored_key)
            .ok_or_else(|| StoreError::Backend("relation on unsaved entity".to_string()))?;
        stored
            .relations
            .entry(field.to_string())
            .or_default()
            .push(related_key);
        Ok(())
    }

    fn begin(&self) -> StoreResult<()> {
        *self.snapshot.borrow_mut() = Some(self.data.borrow().clone());
        Ok(())
    }

    fn commit(&self) -> StoreResult<()> {
        *self.snapshot.borrow_mut() = None;
        Ok(())
    }

    fn rollback(&self) -> StoreResult<()> {
        if let Some(snapshot) = self.snapshot.borrow_mut().take() {
            *self.data.borrow_mut() = snapshot;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Article import definition
// ---------------------------------------------------------------------

/// Record over one article row, with an optional poisoned attribute to
/// exercise record-scoped failures.
pub struct ArticleRecord {
    attrs: BTreeMap<String, Value>,
    poison: Option<String>,
}

impl Record for ArticleRecord {
    fn attr(&self, name: &str) -> Result<Value> {
        if self.poison.as_deref() == Some(name) {
            return Err(Error::Content(format!("unreadable '{}' element", name)));
        }
        self.attrs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("record attribute '{}'", name)))
    }

    fn instance_key(&self) -> Result<InstanceKey> {
        let mut key = InstanceKey::new();
        key.insert("title".to_string(), self.attr("title")?);
        Ok(key)
    }
}

/// Parses a JSON array of article objects.
#[derive(Debug, Clone, Default)]
pub struct ArticleMapper {
    /// Poison one attribute of the record bearing this title
    pub poison: Option<(String, String)>,
}

impl Mapper for ArticleMapper {
    fn produce(&self, _path: &Path, content: String) -> Result<RecordIter> {
        let rows: Vec<BTreeMap<String, Value>> = serde_json::from_str(&content)
            .map_err(|e| Error::Content(format!("article feed: {}", e)))?;
        let poison = self.poison.clone();
        Ok(Box::new(rows.into_iter().map(move |mut attrs| {
            attrs.insert("modified_by".to_string(), json!("hopper"));
            let poisoned = match &poison {
                Some((title, attr)) if attrs.get("title") == Some(&json!(title.as_str())) => {
                    Some(attr.clone())
                }
                _ => None,
            };
            Ok(Box::new(ArticleRecord {
                attrs,
                poison: poisoned,
            }) as Box<dyn Record>)
        })))
    }
}

// ---------------------------------------------------------------------
// Section import definition (used standalone and as a nested builder)
// ---------------------------------------------------------------------

/// Parses a JSON array of section objects (`{"name": ...}`).
#[derive(Debug, Clone, Default)]
pub struct SectionMapper {
    /// Yield a broken record for the section bearing this name
    pub fail_on: Option<String>,
}

impl Mapper for SectionMapper {
    fn produce(&self, _path: &Path, content: String) -> Result<RecordIter> {
        let rows: Vec<BTreeMap<String, Value>> = serde_json::from_str(&content)
            .map_err(|e| Error::Content(format!("section feed: {}", e)))?;
        let fail_on = self.fail_on.clone();
        Ok(Box::new(rows.into_iter().map(move |attrs| {
            if let Some(name) = &fail_on {
                if attrs.get("name") == Some(&json!(name.as_str())) {
                    return Err(Error::Content(format!("broken section '{}'", name)));
                }
            }
            let mut record = hopper_engine::record::ValueRecord::new().key_fields(["name"]);
            for (name, value) in attrs {
                record = record.with(name, value);
            }
            Ok(Box::new(record) as Box<dyn Record>)
        })))
    }
}

#[derive(Clone)]
pub struct SectionPopulator {
    plan: PopulationPlan,
}

impl Populator for SectionPopulator {
    fn plan(&self) -> &PopulationPlan {
        &self.plan
    }

    fn populate(&self, field: &str, _ctx: &mut PopulateContext<'_>) -> Result<()> {
        Err(Error::Config(format!("no populate method for '{}'", field)))
    }
}

#[derive(Clone)]
pub struct SectionSpec {
    mapper: SectionMapper,
    populator: SectionPopulator,
}

impl SectionSpec {
    pub fn new() -> Self {
        Self {
            mapper: SectionMapper::default(),
            populator: SectionPopulator {
                plan: PopulationPlan::new().one_to_one(["name"]),
            },
        }
    }

    pub fn failing_on(mut self, name: &str) -> Self {
        self.mapper.fail_on = Some(name.to_string());
        self
    }
}

impl BuilderSpec for SectionSpec {
    fn entity_type(&self) -> &str {
        "section"
    }

    fn mapper(&self) -> &dyn Mapper {
        &self.mapper
    }

    fn populator(&self) -> &dyn Populator {
        &self.populator
    }

    fn locally_modified(&self, _entity: &dyn Entity) -> bool {
        false
    }
}

/// Where article sections come from.
#[derive(Clone)]
pub enum SectionsFrom {
    /// The SECTIONS matching table
    Matching,
    /// A nested builder over inline content
    Nested(String),
    /// A nested builder over the claimed `<stem>.sections.json` sibling
    ClaimedFile,
}

/// Populator for article entities.
pub struct ArticlePopulator {
    plan: PopulationPlan,
    /// Raise this stop signal while populating `kind` of the record
    /// bearing this title
    pub stop_on: Option<(String, Stop)>,
    pub sections_from: SectionsFrom,
    pub section_spec: SectionSpec,
}

impl ArticlePopulator {
    pub fn new() -> Self {
        Self {
            plan: PopulationPlan::new()
                .one_to_one(["title", "author", "weight", "modified_by"])
                .via_method(["kind", "primary_section", "sections"]),
            stop_on: None,
            sections_from: SectionsFrom::Matching,
            section_spec: SectionSpec::new(),
        }
    }

    pub fn with_allow_lists(mut self) -> Self {
        self.plan = self
            .plan
            .fields_if_exists(["kind", "author", "primary_section", "sections"])
            .fields_if_modified(["primary_section", "sections"]);
        self
    }

    pub fn stop_on(mut self, title: &str, stop: Stop) -> Self {
        self.stop_on = Some((title.to_string(), stop));
        self
    }

    pub fn sections_from(mut self, from: SectionsFrom) -> Self {
        self.sections_from = from;
        self
    }

    pub fn with_section_spec(mut self, spec: SectionSpec) -> Self {
        self.section_spec = spec;
        self
    }
}

pub fn get_or_create_section(
    store: &dyn EntityStore,
    value: &Value,
) -> Result<Box<dyn Entity>> {
    let mut key = InstanceKey::new();
    key.insert("name".to_string(), value.clone());
    if let Some(existing) = store.fetch_one("section", &key)? {
        return Ok(existing);
    }
    let mut section = store.create("section", &key)?;
    section.set_scalar("name", value.clone())?;
    store.save(section.as_mut())?;
    Ok(section)
}

impl Populator for ArticlePopulator {
    fn plan(&self) -> &PopulationPlan {
        &self.plan
    }

    fn populate(&self, field: &str, ctx: &mut PopulateContext<'_>) -> Result<()> {
        match field {
            "kind" => {
                if let Some((title, stop)) = &self.stop_on {
                    if ctx.record.attr("title")? == json!(title.as_str()) {
                        return Err(Error::Stop(*stop));
                    }
                }
                ctx.set_scalar_from_matching("SOURCES", "kind")
            }
            "primary_section" => ctx.set_scalar_from_matching("SECTIONS", "primary_section"),
            "sections" => match &self.sections_from {
                SectionsFrom::Matching => ctx.populate_relation_from_matching(
                    "SECTIONS",
                    "sections",
                    false,
                    &mut get_or_create_section,
                ),
                SectionsFrom::Nested(content) => {
                    let related = ctx.run_nested(
                        &self.section_spec,
                        Path::new("<inline>"),
                        content.clone(),
                    )?;
                    for section in &related {
                        ctx.add_relation("sections", section.as_ref())?;
                    }
                    Ok(())
                }
                SectionsFrom::ClaimedFile => {
                    let dep = ctx.path.with_extension("sections.json");
                    let content = ctx.claim_related(&dep)?;
                    let related = ctx.run_nested(&self.section_spec, &dep, content)?;
                    for section in &related {
                        ctx.add_relation("sections", section.as_ref())?;
                    }
                    Ok(())
                }
            },
            other => Err(Error::Config(format!("no populate method for '{}'", other))),
        }
    }
}

/// Import definition binding mapper, populator and entity type.
pub struct ArticleSpec {
    mapper: ArticleMapper,
    populator: ArticlePopulator,
    pub skip_titles: HashSet<String>,
}

impl ArticleSpec {
    pub fn new() -> Self {
        Self {
            mapper: ArticleMapper::default(),
            populator: ArticlePopulator::new(),
            skip_titles: HashSet::new(),
        }
    }

    pub fn with_mapper(mut self, mapper: ArticleMapper) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_populator(mut self, populator: ArticlePopulator) -> Self {
        self.populator = populator;
        self
    }

    pub fn skipping(mut self, title: &str) -> Self {
        self.skip_titles.insert(title.to_string());
        self
    }
}

impl BuilderSpec for ArticleSpec {
    fn entity_type(&self) -> &str {
        "article"
    }

    fn mapper(&self) -> &dyn Mapper {
        &self.mapper
    }

    fn populator(&self) -> &dyn Populator {
        &self.populator
    }

    fn skip(&self, record: &dyn Record) -> bool {
        record
            .attr("title")
            .ok()
            .and_then(|v| v.as_str().map(|s| self.skip_titles.contains(s)))
            .unwrap_or(false)
    }

    fn locally_modified(&self, entity: &dyn Entity) -> bool {
        match entity.scalar("modified_by") {
            Ok(Value::String(by)) => by != "hopper",
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------
// Matching tables
// ---------------------------------------------------------------------

/// Table store over tables built in code.
pub struct FixedTableStore {
    tables: HashMap<String, MatchingTable>,
}

impl FixedTableStore {
    pub fn new(tables: Vec<(&str, MatchingTable)>) -> Self {
        Self {
            tables: tables
                .into_iter()
                .map(|(name, table)| (name.to_string(), table))
                .collect(),
        }
    }
}

impl TableStore for FixedTableStore {
    fn load(&self, name: &str) -> Result<Option<MatchingTable>> {
        Ok(self.tables.get(name).cloned())
    }
}

fn rule(attribute: &str, expected: &str) -> MatchRule {
    MatchRule {
        attribute: attribute.to_string(),
        expected: json!(expected),
        loose: false,
    }
}

fn entry(output: &str, sections: &[&str]) -> TableEntry {
    TableEntry {
        output: json!(output),
        rule_sets: vec![RuleSet {
            rules: sections.iter().map(|s| rule("section", s)).collect(),
        }],
    }
}

/// SOURCES maps the wire source to an article kind; SECTIONS fans one
/// section code out to the section tree it belongs to.
pub fn article_tables() -> MatchingEngine {
    let sources = MatchingTable {
        default: Some(json!("ARTICLE")),
        entries: vec![TableEntry {
            output: json!("DEPECHE"),
            rule_sets: vec![RuleSet {
                rules: vec![rule("source", "AFP"), rule("source", "Reuters")],
            }],
        }],
    };
    let sections = MatchingTable {
        default: None,
        entries: vec![
            entry("SPORT", &["SKI", "BOXE", "BILBOQUET"]),
            entry("SPORT INDIVIDUEL", &["SKI", "BOXE"]),
            entry("SPORT DE GLISSE", &["SKI"]),
            entry("FUN", &["JEU"]),
        ],
    };
    MatchingEngine::new(Box::new(FixedTableStore::new(vec![
        ("SOURCES", sources),
        ("SECTIONS", sections),
    ])))
}

/// Store with the article and section schemas registered.
pub fn article_store() -> MemoryStore {
    MemoryStore::new()
        .with_schema(
            "article",
            &[
                "title",
                "author",
                "kind",
                "weight",
                "modified_by",
                "primary_section",
            ],
            &["sections"],
        )
        .with_schema("section", &["name"], &[])
}

pub fn article_key(title: &str) -> InstanceKey {
    let mut key = InstanceKey::new();
    key.insert("title".to_string(), json!(title));
    key
}

/// Three-article feed mirroring the canonical fixture.
pub fn feed() -> String {
    json!([
        {"title": "Article Bilboquet", "author": "MrFoo", "source": "Le Blog", "section": "BILBOQUET", "weight": 30},
        {"title": "Article Boxe", "author": "MrFoo", "source": "AFP", "section": "BOXE", "weight": 20},
        {"title": "Article Ski", "author": "MrFoo", "source": "AFP", "section": "SKI", "weight": 10},
    ])
    .to_string()
}

/// Loader used by the pipeline tests.
pub struct ArticleLoader {
    /// Configures the spec handed out per file
    pub poison: Option<(String, String)>,
    pub stop_on: Option<(String, Stop)>,
    pub with_allow_lists: bool,
    pub sections_from: SectionsFrom,
    pub section_spec: SectionSpec,
    /// Entity count seen by `postprocess`
    pub postprocessed: Cell<Option<usize>>,
}

impl ArticleLoader {
    pub fn new() -> Self {
        Self {
            poison: None,
            stop_on: None,
            with_allow_lists: false,
            sections_from: SectionsFrom::Matching,
            section_spec: SectionSpec::new(),
            postprocessed: Cell::new(None),
        }
    }
}

impl BuilderLoader for ArticleLoader {
    fn load_builder(&self, rel_path: &Path) -> Option<Box<dyn BuilderSpec>> {
        let name = rel_path.file_name()?.to_str()?;
        if !name.ends_with(".json") || name.contains(".sections.") {
            return None;
        }
        let mut populator = ArticlePopulator::new()
            .sections_from(self.sections_from.clone())
            .with_section_spec(self.section_spec.clone());
        if self.with_allow_lists {
            populator = populator.with_allow_lists();
        }
        if let Some((title, stop)) = &self.stop_on {
            populator = populator.stop_on(title, *stop);
        }
        let mut mapper = ArticleMapper::default();
        mapper.poison = self.poison.clone();
        Some(Box::new(
            ArticleSpec::new()
                .with_mapper(mapper)
                .with_populator(populator),
        ))
    }

    fn postprocess(&self, entities: &[Box<dyn Entity>]) {
        self.postprocessed.set(Some(entities.len()));
    }
}
