//! The metadata store.
//!
//! Owns the databases → schemas → (tables | views) namespace together with
//! per-name tombstone stacks that make UNDROP possible. The whole state is
//! serialized to `<data-dir>/catalog.json` inside every mutating
//! transaction; a mutation is only reported successful once the snapshot is
//! on disk.
//!
//! The catalog never talks to the engine. Mutations that also need engine
//! work (relation renames, creates) are sequenced by the executor, which
//! performs the engine step first and then commits here.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::translator::{ColumnSpec, ObjectName};
use crate::{Result, SnowglobeError};

/// Quote an identifier for the engine, doubling embedded quotes.
pub fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// The engine schema payload for a Snowflake database/schema pair. One
/// DuckDB schema carries the whole pair; its name contains the dot.
pub fn engine_schema(database: &str, schema: &str) -> String {
    format!("{database}.{schema}")
}

/// Fully quoted engine name for a relation.
pub fn engine_relation(database: &str, schema: &str, relation: &str) -> String {
    format!(
        "{}.{}",
        quote_ident(&engine_schema(database, schema)),
        quote_ident(relation)
    )
}

/// Generated relation name that parks a dropped table's data out of the
/// live namespace while keeping it restorable.
pub fn tombstone_relation(name: &str) -> String {
    let tag = uuid::Uuid::new_v4().simple().to_string();
    format!("{name}$dropped${}", &tag[..8])
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    /// Snowflake-facing type, e.g. `NUMBER(10,2)`.
    pub data_type: String,
    /// Engine declaration, e.g. `DECIMAL(10,2)`.
    pub engine_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
}

impl From<ColumnSpec> for ColumnDef {
    fn from(c: ColumnSpec) -> Self {
        Self {
            name: c.name,
            data_type: c.sf_type,
            engine_type: c.engine_type,
            nullable: c.nullable,
            primary_key: c.primary_key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseRecord {
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub transient: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub database: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl SchemaRecord {
    pub fn key(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRecord {
    pub database: String,
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub created_at: DateTime<Utc>,
    /// Engine relation backing this table. Equals `name` while live;
    /// a generated park name while tombstoned.
    pub relation: String,
    #[serde(default)]
    pub row_count: Option<u64>,
}

impl TableRecord {
    pub fn object_name(&self) -> ObjectName {
        ObjectName {
            database: self.database.clone(),
            schema: self.schema.clone(),
            name: self.name.clone(),
        }
    }

    pub fn fqn(&self) -> String {
        self.object_name().fqn()
    }

    pub fn engine_name(&self) -> String {
        engine_relation(&self.database, &self.schema, &self.relation)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewRecord {
    pub database: String,
    pub schema: String,
    pub name: String,
    /// The SELECT text exactly as the client wrote it.
    pub text: String,
    #[serde(default)]
    pub secure: bool,
    pub created_at: DateTime<Utc>,
}

impl ViewRecord {
    pub fn object_name(&self) -> ObjectName {
        ObjectName {
            database: self.database.clone(),
            schema: self.schema.clone(),
            name: self.name.clone(),
        }
    }

    pub fn fqn(&self) -> String {
        self.object_name().fqn()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub database: String,
    pub schema: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableTombstone {
    pub record: TableRecord,
    pub dropped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewTombstone {
    pub record: ViewRecord,
    pub dropped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaTombstone {
    pub record: SchemaRecord,
    pub dropped_at: DateTime<Utc>,
    pub tables: Vec<TableRecord>,
    pub views: Vec<ViewRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseTombstone {
    pub record: DatabaseRecord,
    pub dropped_at: DateTime<Utc>,
    pub schemas: Vec<SchemaRecord>,
    pub tables: Vec<TableRecord>,
    pub views: Vec<ViewRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TombstoneSet {
    #[serde(default)]
    pub databases: BTreeMap<String, Vec<DatabaseTombstone>>,
    #[serde(default)]
    pub schemas: BTreeMap<String, Vec<SchemaTombstone>>,
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<TableTombstone>>,
    #[serde(default)]
    pub views: BTreeMap<String, Vec<ViewTombstone>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogState {
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseRecord>,
    /// Keyed by `D.S`.
    #[serde(default)]
    pub schemas: BTreeMap<String, SchemaRecord>,
    /// Keyed by `D.S.T`.
    #[serde(default)]
    pub tables: BTreeMap<String, TableRecord>,
    #[serde(default)]
    pub views: BTreeMap<String, ViewRecord>,
    #[serde(default)]
    pub stages: BTreeMap<String, StageRecord>,
    /// Missing in old snapshots; defaults to empty.
    #[serde(default)]
    pub tombstones: TombstoneSet,
}

pub struct Catalog {
    path: Option<PathBuf>,
    state: CatalogState,
}

impl Catalog {
    /// Load the snapshot, or start empty when it is missing or unreadable.
    pub fn load(path: PathBuf) -> Self {
        let state = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<CatalogState>(&bytes) {
                Ok(state) => {
                    tracing::info!(
                        databases = state.databases.len(),
                        tables = state.tables.len(),
                        "catalog loaded from {}",
                        path.display()
                    );
                    state
                }
                Err(e) => {
                    tracing::warn!("catalog snapshot at {} is invalid ({e}); starting empty", path.display());
                    CatalogState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no catalog snapshot at {}; starting empty", path.display());
                CatalogState::default()
            }
            Err(e) => {
                tracing::warn!("cannot read catalog snapshot at {} ({e}); starting empty", path.display());
                CatalogState::default()
            }
        };
        Self {
            path: Some(path),
            state,
        }
    }

    /// A catalog with no backing file; used by tests.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: CatalogState::default(),
        }
    }

    /// Run a mutation transactionally: the change is applied to a copy,
    /// persisted, and only then becomes visible.
    fn txn<T>(&mut self, f: impl FnOnce(&mut CatalogState) -> Result<T>) -> Result<T> {
        let mut next = self.state.clone();
        let out = f(&mut next)?;
        if let Some(path) = &self.path {
            persist(path, &next)?;
        }
        self.state = next;
        Ok(out)
    }

    // -- reads ------------------------------------------------------------

    pub fn database(&self, name: &str) -> Option<&DatabaseRecord> {
        self.state.databases.get(name)
    }

    pub fn schema(&self, database: &str, name: &str) -> Option<&SchemaRecord> {
        self.state.schemas.get(&engine_schema(database, name))
    }

    pub fn table(&self, name: &ObjectName) -> Option<&TableRecord> {
        self.state.tables.get(&name.fqn())
    }

    pub fn view(&self, name: &ObjectName) -> Option<&ViewRecord> {
        self.state.views.get(&name.fqn())
    }

    pub fn stage(&self, name: &ObjectName) -> Option<&StageRecord> {
        self.state.stages.get(&name.fqn())
    }

    pub fn list_databases(&self) -> Vec<&DatabaseRecord> {
        let mut v: Vec<_> = self.state.databases.values().collect();
        v.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        v
    }

    pub fn list_schemas(&self, database: &str) -> Vec<&SchemaRecord> {
        let mut v: Vec<_> = self
            .state
            .schemas
            .values()
            .filter(|s| s.database == database)
            .collect();
        v.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        v
    }

    pub fn list_tables(&self, database: &str, schema: Option<&str>) -> Vec<&TableRecord> {
        let mut v: Vec<_> = self
            .state
            .tables
            .values()
            .filter(|t| t.database == database && schema.is_none_or(|s| t.schema == s))
            .collect();
        v.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        v
    }

    pub fn list_views(&self, database: &str, schema: Option<&str>) -> Vec<&ViewRecord> {
        let mut v: Vec<_> = self
            .state
            .views
            .values()
            .filter(|t| t.database == database && schema.is_none_or(|s| t.schema == s))
            .collect();
        v.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        v
    }

    pub fn list_stages(&self, database: &str, schema: Option<&str>) -> Vec<&StageRecord> {
        let mut v: Vec<_> = self
            .state
            .stages
            .values()
            .filter(|t| t.database == database && schema.is_none_or(|s| t.schema == s))
            .collect();
        v.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        v
    }

    pub fn dropped_databases(&self) -> Vec<&DatabaseTombstone> {
        let mut v: Vec<_> = self.state.tombstones.databases.values().flatten().collect();
        v.sort_by_key(|t| t.dropped_at);
        v
    }

    pub fn dropped_schemas(&self, database: Option<&str>) -> Vec<&SchemaTombstone> {
        let mut v: Vec<_> = self
            .state
            .tombstones
            .schemas
            .values()
            .flatten()
            .filter(|t| database.is_none_or(|d| t.record.database == d))
            .collect();
        v.sort_by_key(|t| t.dropped_at);
        v
    }

    pub fn dropped_tables(
        &self,
        database: Option<&str>,
        schema: Option<&str>,
    ) -> Vec<&TableTombstone> {
        let mut v: Vec<_> = self
            .state
            .tombstones
            .tables
            .values()
            .flatten()
            .filter(|t| {
                database.is_none_or(|d| t.record.database == d)
                    && schema.is_none_or(|s| t.record.schema == s)
            })
            .collect();
        v.sort_by_key(|t| t.dropped_at);
        v
    }

    pub fn dropped_views(
        &self,
        database: Option<&str>,
        schema: Option<&str>,
    ) -> Vec<&ViewTombstone> {
        let mut v: Vec<_> = self
            .state
            .tombstones
            .views
            .values()
            .flatten()
            .filter(|t| {
                database.is_none_or(|d| t.record.database == d)
                    && schema.is_none_or(|s| t.record.schema == s)
            })
            .collect();
        v.sort_by_key(|t| t.dropped_at);
        v
    }

    pub fn peek_dropped_database(&self, name: &str) -> Option<&DatabaseTombstone> {
        self.state.tombstones.databases.get(name)?.last()
    }

    pub fn peek_dropped_schema(&self, database: &str, name: &str) -> Option<&SchemaTombstone> {
        self.state
            .tombstones
            .schemas
            .get(&engine_schema(database, name))?
            .last()
    }

    pub fn peek_dropped_table(&self, name: &ObjectName) -> Option<&TableTombstone> {
        self.state.tombstones.tables.get(&name.fqn())?.last()
    }

    pub fn peek_dropped_view(&self, name: &ObjectName) -> Option<&ViewTombstone> {
        self.state.tombstones.views.get(&name.fqn())?.last()
    }

    // -- commits ----------------------------------------------------------

    pub fn create_database(&mut self, rec: DatabaseRecord, public_schema: SchemaRecord) -> Result<()> {
        self.txn(|s| {
            s.schemas.insert(public_schema.key(), public_schema);
            s.databases.insert(rec.name.clone(), rec);
            Ok(())
        })
    }

    /// Move a live database and everything in it onto tombstone stacks.
    /// `relation_park` maps a table FQN to the engine relation the executor
    /// already renamed its data to.
    pub fn drop_database(
        &mut self,
        name: &str,
        dropped_at: DateTime<Utc>,
        relation_park: &BTreeMap<String, String>,
    ) -> Result<()> {
        let name = name.to_owned();
        self.txn(move |s| {
            let record = s
                .databases
                .remove(&name)
                .ok_or_else(|| SnowglobeError::NotFound(format!("Database {name}")))?;
            let schemas: Vec<SchemaRecord> = extract_matching(&mut s.schemas, |r| r.database == name);
            let mut tables: Vec<TableRecord> = extract_matching(&mut s.tables, |r| r.database == name);
            let views: Vec<ViewRecord> = extract_matching(&mut s.views, |r| r.database == name);
            s.stages.retain(|_, r| r.database != name);
            for t in &mut tables {
                if let Some(parked) = relation_park.get(&t.fqn()) {
                    t.relation = parked.clone();
                }
            }
            s.tombstones
                .databases
                .entry(name)
                .or_default()
                .push(DatabaseTombstone {
                    record,
                    dropped_at,
                    schemas,
                    tables,
                    views,
                });
            Ok(())
        })
    }

    /// Restore the most recent tombstone of `name`. The executor has
    /// already moved the parked relations back to their live names.
    pub fn undrop_database(&mut self, name: &str) -> Result<DatabaseRecord> {
        let name = name.to_owned();
        self.txn(move |s| {
            let stack = s
                .tombstones
                .databases
                .get_mut(&name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| SnowglobeError::NotFound(format!("Dropped database {name}")))?;
            let tomb = stack.pop().expect("non-empty tombstone stack");
            if stack.is_empty() {
                s.tombstones.databases.remove(&name);
            }
            let record = tomb.record.clone();
            for sc in tomb.schemas {
                s.schemas.insert(sc.key(), sc);
            }
            for mut t in tomb.tables {
                t.relation = t.name.clone();
                s.tables.insert(t.fqn(), t);
            }
            for v in tomb.views {
                s.views.insert(v.fqn(), v);
            }
            s.databases.insert(record.name.clone(), record.clone());
            Ok(record)
        })
    }

    pub fn create_schema(&mut self, rec: SchemaRecord) -> Result<()> {
        self.txn(|s| {
            s.schemas.insert(rec.key(), rec);
            Ok(())
        })
    }

    pub fn drop_schema(
        &mut self,
        database: &str,
        name: &str,
        dropped_at: DateTime<Utc>,
        relation_park: &BTreeMap<String, String>,
    ) -> Result<()> {
        let key = engine_schema(database, name);
        self.txn(move |s| {
            let record = s
                .schemas
                .remove(&key)
                .ok_or_else(|| SnowglobeError::NotFound(format!("Schema {key}")))?;
            let mut tables: Vec<TableRecord> = extract_matching(&mut s.tables, |r| {
                r.database == record.database && r.schema == record.name
            });
            let views: Vec<ViewRecord> = extract_matching(&mut s.views, |r| {
                r.database == record.database && r.schema == record.name
            });
            s.stages
                .retain(|_, r| !(r.database == record.database && r.schema == record.name));
            for t in &mut tables {
                if let Some(parked) = relation_park.get(&t.fqn()) {
                    t.relation = parked.clone();
                }
            }
            s.tombstones
                .schemas
                .entry(key)
                .or_default()
                .push(SchemaTombstone {
                    record,
                    dropped_at,
                    tables,
                    views,
                });
            Ok(())
        })
    }

    pub fn undrop_schema(&mut self, database: &str, name: &str) -> Result<SchemaRecord> {
        let key = engine_schema(database, name);
        self.txn(move |s| {
            let stack = s
                .tombstones
                .schemas
                .get_mut(&key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| SnowglobeError::NotFound(format!("Dropped schema {key}")))?;
            let tomb = stack.pop().expect("non-empty tombstone stack");
            if stack.is_empty() {
                s.tombstones.schemas.remove(&key);
            }
            let record = tomb.record.clone();
            for mut t in tomb.tables {
                t.relation = t.name.clone();
                s.tables.insert(t.fqn(), t);
            }
            for v in tomb.views {
                s.views.insert(v.fqn(), v);
            }
            s.schemas.insert(record.key(), record.clone());
            Ok(record)
        })
    }

    pub fn create_table(&mut self, rec: TableRecord) -> Result<()> {
        self.txn(|s| {
            s.tables.insert(rec.fqn(), rec);
            Ok(())
        })
    }

    /// `CREATE OR REPLACE`: the replaced table goes onto the tombstone
    /// stack with its data parked under `old_relation`.
    pub fn replace_table(
        &mut self,
        rec: TableRecord,
        dropped_at: DateTime<Utc>,
        old_relation: String,
    ) -> Result<()> {
        self.txn(move |s| {
            let fqn = rec.fqn();
            if let Some(mut old) = s.tables.remove(&fqn) {
                old.relation = old_relation;
                s.tombstones
                    .tables
                    .entry(fqn.clone())
                    .or_default()
                    .push(TableTombstone {
                        record: old,
                        dropped_at,
                    });
            }
            s.tables.insert(fqn, rec);
            Ok(())
        })
    }

    pub fn drop_table(
        &mut self,
        name: &ObjectName,
        dropped_at: DateTime<Utc>,
        parked_relation: String,
    ) -> Result<()> {
        let fqn = name.fqn();
        self.txn(move |s| {
            let mut record = s
                .tables
                .remove(&fqn)
                .ok_or_else(|| SnowglobeError::NotFound(format!("Table {fqn}")))?;
            record.relation = parked_relation;
            s.tombstones
                .tables
                .entry(fqn)
                .or_default()
                .push(TableTombstone { record, dropped_at });
            Ok(())
        })
    }

    pub fn undrop_table(&mut self, name: &ObjectName) -> Result<TableRecord> {
        let fqn = name.fqn();
        self.txn(move |s| {
            let stack = s
                .tombstones
                .tables
                .get_mut(&fqn)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| SnowglobeError::NotFound(format!("Dropped table {fqn}")))?;
            let mut record = stack.pop().expect("non-empty tombstone stack").record;
            if stack.is_empty() {
                s.tombstones.tables.remove(&fqn);
            }
            record.relation = record.name.clone();
            s.tables.insert(fqn, record.clone());
            Ok(record)
        })
    }

    pub fn rename_table(&mut self, name: &ObjectName, to: &ObjectName) -> Result<()> {
        let from_fqn = name.fqn();
        let to_name = to.clone();
        self.txn(move |s| {
            let mut record = s
                .tables
                .remove(&from_fqn)
                .ok_or_else(|| SnowglobeError::NotFound(format!("Table {from_fqn}")))?;
            record.database = to_name.database.clone();
            record.schema = to_name.schema.clone();
            record.name = to_name.name.clone();
            record.relation = to_name.name.clone();
            s.tables.insert(record.fqn(), record);
            Ok(())
        })
    }

    pub fn set_row_count(&mut self, name: &ObjectName, rows: Option<u64>) -> Result<()> {
        let fqn = name.fqn();
        self.txn(move |s| {
            if let Some(t) = s.tables.get_mut(&fqn) {
                t.row_count = rows;
            }
            Ok(())
        })
    }

    pub fn create_view(&mut self, rec: ViewRecord) -> Result<()> {
        self.txn(|s| {
            s.views.insert(rec.fqn(), rec);
            Ok(())
        })
    }

    pub fn replace_view(&mut self, rec: ViewRecord, dropped_at: DateTime<Utc>) -> Result<()> {
        self.txn(move |s| {
            let fqn = rec.fqn();
            if let Some(old) = s.views.remove(&fqn) {
                s.tombstones
                    .views
                    .entry(fqn.clone())
                    .or_default()
                    .push(ViewTombstone {
                        record: old,
                        dropped_at,
                    });
            }
            s.views.insert(fqn, rec);
            Ok(())
        })
    }

    pub fn drop_view(&mut self, name: &ObjectName, dropped_at: DateTime<Utc>) -> Result<()> {
        let fqn = name.fqn();
        self.txn(move |s| {
            let record = s
                .views
                .remove(&fqn)
                .ok_or_else(|| SnowglobeError::NotFound(format!("View {fqn}")))?;
            s.tombstones
                .views
                .entry(fqn)
                .or_default()
                .push(ViewTombstone { record, dropped_at });
            Ok(())
        })
    }

    pub fn undrop_view(&mut self, name: &ObjectName) -> Result<ViewRecord> {
        let fqn = name.fqn();
        self.txn(move |s| {
            let stack = s
                .tombstones
                .views
                .get_mut(&fqn)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| SnowglobeError::NotFound(format!("Dropped view {fqn}")))?;
            let record = stack.pop().expect("non-empty tombstone stack").record;
            if stack.is_empty() {
                s.tombstones.views.remove(&fqn);
            }
            s.views.insert(fqn, record.clone());
            Ok(record)
        })
    }

    pub fn create_stage(&mut self, rec: StageRecord) -> Result<()> {
        self.txn(|s| {
            let fqn = format!("{}.{}.{}", rec.database, rec.schema, rec.name);
            s.stages.insert(fqn, rec);
            Ok(())
        })
    }

    pub fn drop_stage(&mut self, name: &ObjectName) -> Result<()> {
        let fqn = name.fqn();
        self.txn(move |s| {
            s.stages
                .remove(&fqn)
                .ok_or_else(|| SnowglobeError::NotFound(format!("Stage {fqn}")))?;
            Ok(())
        })
    }

    /// Persist the current state unconditionally; used at shutdown.
    pub fn flush(&self) -> Result<()> {
        if let Some(path) = &self.path {
            persist(path, &self.state)?;
        }
        Ok(())
    }
}

fn extract_matching<R: Clone>(map: &mut BTreeMap<String, R>, pred: impl Fn(&R) -> bool) -> Vec<R> {
    let keys: Vec<String> = map
        .iter()
        .filter(|(_, r)| pred(r))
        .map(|(k, _)| k.clone())
        .collect();
    keys.into_iter().filter_map(|k| map.remove(&k)).collect()
}

/// Write the snapshot atomically: temp file, fsync, rename.
fn persist(path: &Path, state: &CatalogState) -> Result<()> {
    let io_err =
        |e: std::io::Error| SnowglobeError::InternalInconsistency(format!("catalog persistence failed: {e}"));
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(io_err)?;
    }
    let bytes = serde_json::to_vec_pretty(state)
        .map_err(|e| SnowglobeError::InternalInconsistency(format!("catalog serialization failed: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    let mut f = fs::File::create(&tmp).map_err(io_err)?;
    f.write_all(&bytes).map_err(io_err)?;
    f.sync_all().map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

/// Snowflake `LIKE` pattern match: `%` and `_` wildcards, case-insensitive.
pub fn like_match(pattern: &str, name: &str) -> bool {
    let mut re = String::from("(?i)^");
    for c in pattern.chars() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    regex::Regex::new(&re).map(|r| r.is_match(name)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(d: &str, s: &str, n: &str) -> ObjectName {
        ObjectName {
            database: d.into(),
            schema: s.into(),
            name: n.into(),
        }
    }

    fn table_rec(d: &str, s: &str, n: &str) -> TableRecord {
        TableRecord {
            database: d.into(),
            schema: s.into(),
            name: n.into(),
            columns: vec![ColumnDef {
                name: "ID".into(),
                data_type: "NUMBER(38,0)".into(),
                engine_type: "BIGINT".into(),
                nullable: true,
                primary_key: false,
            }],
            created_at: Utc::now(),
            relation: n.into(),
            row_count: None,
        }
    }

    #[test]
    fn drop_then_undrop_restores_the_table() {
        let mut c = Catalog::in_memory();
        let name = obj("DB", "PUBLIC", "T");
        c.create_table(table_rec("DB", "PUBLIC", "T")).unwrap();
        c.drop_table(&name, Utc::now(), "T$dropped$abc".into()).unwrap();
        assert!(c.table(&name).is_none());
        assert_eq!(c.peek_dropped_table(&name).unwrap().record.relation, "T$dropped$abc");

        let restored = c.undrop_table(&name).unwrap();
        assert_eq!(restored.relation, "T");
        assert!(c.table(&name).is_some());
        assert!(c.peek_dropped_table(&name).is_none());
    }

    #[test]
    fn tombstone_stack_is_lifo() {
        let mut c = Catalog::in_memory();
        let name = obj("DB", "PUBLIC", "T");
        c.create_table(table_rec("DB", "PUBLIC", "T")).unwrap();
        c.drop_table(&name, Utc::now(), "park1".into()).unwrap();
        c.create_table(table_rec("DB", "PUBLIC", "T")).unwrap();
        c.drop_table(&name, Utc::now(), "park2".into()).unwrap();

        assert_eq!(c.peek_dropped_table(&name).unwrap().record.relation, "park2");
        c.undrop_table(&name).unwrap();
        // The older tombstone is still there underneath.
        assert_eq!(c.peek_dropped_table(&name).unwrap().record.relation, "park1");
    }

    #[test]
    fn database_drop_carries_children() {
        let mut c = Catalog::in_memory();
        let now = Utc::now();
        c.create_database(
            DatabaseRecord {
                name: "DB".into(),
                created_at: now,
                comment: None,
                transient: false,
            },
            SchemaRecord {
                database: "DB".into(),
                name: "PUBLIC".into(),
                created_at: now,
            },
        )
        .unwrap();
        c.create_table(table_rec("DB", "PUBLIC", "T")).unwrap();

        let mut park = BTreeMap::new();
        park.insert("DB.PUBLIC.T".to_owned(), "T$dropped$xyz".to_owned());
        c.drop_database("DB", Utc::now(), &park).unwrap();

        assert!(c.database("DB").is_none());
        assert!(c.table(&obj("DB", "PUBLIC", "T")).is_none());
        let tomb = c.peek_dropped_database("DB").unwrap();
        assert_eq!(tomb.tables.len(), 1);
        assert_eq!(tomb.tables[0].relation, "T$dropped$xyz");

        c.undrop_database("DB").unwrap();
        assert!(c.database("DB").is_some());
        let t = c.table(&obj("DB", "PUBLIC", "T")).unwrap();
        assert_eq!(t.relation, "T");
    }

    #[test]
    fn persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        {
            let mut c = Catalog::load(path.clone());
            c.create_table(table_rec("DB", "PUBLIC", "T")).unwrap();
            c.drop_table(&obj("DB", "PUBLIC", "T"), Utc::now(), "park".into())
                .unwrap();
        }
        let c = Catalog::load(path);
        assert!(c.table(&obj("DB", "PUBLIC", "T")).is_none());
        assert_eq!(c.peek_dropped_table(&obj("DB", "PUBLIC", "T")).unwrap().record.relation, "park");
    }

    #[test]
    fn missing_tombstones_section_defaults_empty() {
        let state: CatalogState = serde_json::from_str(r#"{"databases": {}}"#).unwrap();
        assert!(state.tombstones.tables.is_empty());
    }

    #[test]
    fn like_patterns() {
        assert!(like_match("TEST%", "TESTDB"));
        assert!(like_match("test%", "TESTDB"));
        assert!(like_match("T_ST", "TEST"));
        assert!(!like_match("TEST", "TESTDB"));
        assert!(!like_match("%x%", "TESTDB"));
    }

    #[test]
    fn engine_names_are_quoted() {
        assert_eq!(engine_relation("DB", "PUBLIC", "T"), "\"DB.PUBLIC\".\"T\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
