//! The query dispatcher.
//!
//! Every statement funnels through [`Dispatcher::execute`]: translate,
//! route to the catalog or the engine, shape the Snowflake envelope, and
//! append to history. Operations that touch both catalog and engine run
//! engine-first under the catalog's exclusive lock, with a best-effort
//! engine rollback when the catalog commit fails.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::catalog::{
    self, Catalog, ColumnDef, DatabaseRecord, SchemaRecord, StageRecord, TableRecord, ViewRecord,
};
use crate::engine::{self, EngineHandle, QueryOutput};
use crate::history::{History, QueryRecord};
use crate::responses::{QueryResponseData, RowType, SnowflakeType};
use crate::session::SessionContext;
use crate::tokenizer;
use crate::translator::{
    self, ConstantFn, DataStatement, DescribeKind, Directive, NameContext, ObjectName, Show,
    ShowKind, ShowScope, StatementClass, Translated, UseTarget,
};
use crate::{Result, SnowglobeError};

/// Identity of the caller, for history and constant functions.
#[derive(Debug, Clone)]
pub struct ExecEnv {
    pub session_id: String,
    pub user: String,
}

pub struct Dispatcher {
    pub catalog: RwLock<Catalog>,
    pub engine: EngineHandle,
    pub history: Arc<History>,
    deadline: Duration,
}

impl Dispatcher {
    pub fn new(catalog: Catalog, engine: EngineHandle, history: Arc<History>, deadline: Duration) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            engine,
            history,
            deadline,
        }
    }

    /// Make sure the default namespace and all cataloged engine schemas
    /// exist; called once at startup.
    pub async fn bootstrap(&self) -> Result<()> {
        let mut cat = self.catalog.write().await;
        let mut ddl = String::new();
        for s in cat
            .list_databases()
            .iter()
            .flat_map(|d| cat.list_schemas(&d.name))
        {
            ddl.push_str(&format!(
                "CREATE SCHEMA IF NOT EXISTS {};",
                catalog::quote_ident(&s.key())
            ));
        }
        if !ddl.is_empty() {
            self.engine.batch(ddl).await?;
        }
        if cat.database(crate::session::DEFAULT_DATABASE).is_none() {
            let now = Utc::now();
            self.engine
                .batch(format!(
                    "CREATE SCHEMA IF NOT EXISTS {};",
                    catalog::quote_ident(&catalog::engine_schema(
                        crate::session::DEFAULT_DATABASE,
                        crate::session::DEFAULT_SCHEMA
                    ))
                ))
                .await?;
            cat.create_database(
                DatabaseRecord {
                    name: crate::session::DEFAULT_DATABASE.to_owned(),
                    created_at: now,
                    comment: Some("Default database".to_owned()),
                    transient: false,
                },
                SchemaRecord {
                    database: crate::session::DEFAULT_DATABASE.to_owned(),
                    name: crate::session::DEFAULT_SCHEMA.to_owned(),
                    created_at: now,
                },
            )?;
        }
        Ok(())
    }

    /// Execute a request body, which may hold several `;`-separated
    /// statements; the envelope of the last one is returned.
    pub async fn execute(
        &self,
        env: &ExecEnv,
        ctx: &mut SessionContext,
        sql: &str,
    ) -> Result<QueryResponseData> {
        let statements = tokenizer::split_statements(sql)?;
        if statements.is_empty() {
            return Err(SnowglobeError::Translation("empty statement".to_owned()));
        }
        let mut last = None;
        for stmt in statements {
            last = Some(self.execute_one(env, ctx, &stmt).await?);
        }
        Ok(last.expect("at least one statement"))
    }

    async fn execute_one(
        &self,
        env: &ExecEnv,
        ctx: &mut SessionContext,
        sql: &str,
    ) -> Result<QueryResponseData> {
        let started = Instant::now();
        let submitted_at = Utc::now();
        let outcome = self.dispatch(env, ctx, sql).await;

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let (text, result) = match outcome {
            Ok((text, data)) => (text, Ok(data)),
            Err(e) => (sql.to_owned(), Err(e)),
        };
        let rec = QueryRecord {
            id: Uuid::new_v4().to_string(),
            session_id: env.session_id.clone(),
            text,
            submitted_at,
            duration_ms,
            success: result.is_ok(),
            rowcount: result
                .as_ref()
                .map(|d| d.total)
                .unwrap_or_default(),
            error: result.as_ref().err().map(|e| e.code().to_owned()),
        };
        self.history.record(rec);

        let mut data = result?;
        data.final_database_name = Some(ctx.database.clone());
        data.final_schema_name = Some(ctx.schema.clone());
        data.final_warehouse_name = Some(ctx.warehouse.clone());
        data.final_role_name = Some(ctx.role.clone());
        Ok(data)
    }

    /// Returns the executed text (post-translation for data statements)
    /// along with the result envelope.
    async fn dispatch(
        &self,
        env: &ExecEnv,
        ctx: &mut SessionContext,
        sql: &str,
    ) -> Result<(String, QueryResponseData)> {
        let name_ctx = NameContext::new(&ctx.database, &ctx.schema);
        match translator::translate(sql, &name_ctx)? {
            Translated::Constant(c) => Ok((sql.to_owned(), self.constant(c, env, ctx))),
            Translated::Directive(d) => {
                let data = self.directive(d, ctx).await?;
                Ok((sql.to_owned(), data))
            }
            Translated::Data(d) => {
                let data = self.data_statement(&d).await?;
                Ok((d.sql, data))
            }
        }
    }

    async fn with_deadline<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(r) => r,
            Err(_) => Err(SnowglobeError::Timeout(self.deadline.as_secs())),
        }
    }

    // -- constants ---------------------------------------------------------

    #[allow(clippy::unused_self)]
    fn constant(&self, c: ConstantFn, env: &ExecEnv, ctx: &SessionContext) -> QueryResponseData {
        let (value, type_) = match c {
            ConstantFn::Version => (env!("CARGO_PKG_VERSION").to_owned(), SnowflakeType::Text),
            ConstantFn::Timestamp => (
                Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                SnowflakeType::TimestampLtz,
            ),
            ConstantFn::Account => ("SNOWGLOBE".to_owned(), SnowflakeType::Text),
            ConstantFn::Region => ("LOCAL".to_owned(), SnowflakeType::Text),
            ConstantFn::User => (env.user.clone(), SnowflakeType::Text),
            ConstantFn::Role => (ctx.role.clone(), SnowflakeType::Text),
            ConstantFn::Warehouse => (ctx.warehouse.clone(), SnowflakeType::Text),
            ConstantFn::Database => (ctx.database.clone(), SnowflakeType::Text),
            ConstantFn::Schema => (ctx.schema.clone(), SnowflakeType::Text),
        };
        envelope(
            vec![RowType::new(c.column_name(), type_)],
            vec![vec![serde_json::Value::String(value)]],
            StatementClass::Select,
        )
    }

    // -- data --------------------------------------------------------------

    async fn data_statement(&self, d: &DataStatement) -> Result<QueryResponseData> {
        self.materialize_views(&d.tables).await?;
        match d.class {
            StatementClass::Insert | StatementClass::Update | StatementClass::Delete => {
                let n = self.with_deadline(self.engine.execute(d.sql.clone())).await?;
                let column = match d.class {
                    StatementClass::Insert => "number of rows inserted",
                    StatementClass::Update => "number of rows updated",
                    _ => "number of rows deleted",
                };
                Ok(envelope(
                    vec![RowType {
                        nullable: false,
                        ..RowType::new(column, SnowflakeType::Fixed)
                    }],
                    vec![vec![serde_json::Value::String(n.to_string())]],
                    d.class,
                ))
            }
            _ => {
                let out = self.with_deadline(self.engine.query(d.sql.clone())).await?;
                Ok(query_envelope(out, d.class))
            }
        }
    }

    /// Create any views a statement references in the engine, from their
    /// stored definitions, transitively.
    async fn materialize_views(&self, tables: &[ObjectName]) -> Result<()> {
        let ddl = {
            let cat = self.catalog.read().await;
            view_ddl(&cat, tables)?
        };
        if !ddl.is_empty() {
            self.engine.batch(ddl).await?;
        }
        Ok(())
    }

    // -- directives --------------------------------------------------------

    #[allow(clippy::too_many_lines)]
    async fn directive(&self, d: Directive, ctx: &mut SessionContext) -> Result<QueryResponseData> {
        let class = d.class();
        match d {
            Directive::CreateDatabase {
                name,
                if_not_exists,
                or_replace,
                transient,
                comment,
            } => {
                let mut cat = self.catalog.write().await;
                if cat.database(&name).is_some() {
                    if if_not_exists {
                        return Ok(status(
                            format!("{name} already exists, statement succeeded."),
                            class,
                        ));
                    }
                    if or_replace {
                        let park = self.park_database_tables(&cat, &name).await?;
                        cat.drop_database(&name, Utc::now(), &park)?;
                    } else {
                        return Err(SnowglobeError::AlreadyExists(format!("Database {name}")));
                    }
                }
                let now = Utc::now();
                self.engine
                    .batch(format!(
                        "CREATE SCHEMA IF NOT EXISTS {};",
                        catalog::quote_ident(&catalog::engine_schema(
                            &name,
                            crate::session::DEFAULT_SCHEMA
                        ))
                    ))
                    .await?;
                cat.create_database(
                    DatabaseRecord {
                        name: name.clone(),
                        created_at: now,
                        comment,
                        transient,
                    },
                    SchemaRecord {
                        database: name.clone(),
                        name: crate::session::DEFAULT_SCHEMA.to_owned(),
                        created_at: now,
                    },
                )?;
                Ok(status(format!("Database {name} successfully created."), class))
            }

            Directive::DropDatabase {
                name,
                if_exists,
                cascade,
            } => {
                let mut cat = self.catalog.write().await;
                if cat.database(&name).is_none() {
                    if if_exists {
                        return Ok(status("Drop statement executed successfully.".to_owned(), class));
                    }
                    return Err(SnowglobeError::NotFound(format!("Database {name}")));
                }
                if !cascade
                    && (!cat.list_tables(&name, None).is_empty()
                        || !cat.list_views(&name, None).is_empty())
                {
                    return Err(SnowglobeError::NotEmpty(format!("Database {name}")));
                }
                self.drop_engine_views(&cat, &name, None).await?;
                let park = self.park_database_tables(&cat, &name).await?;
                cat.drop_database(&name, Utc::now(), &park)?;
                Ok(status(format!("{name} successfully dropped."), class))
            }

            Directive::UndropDatabase { name } => {
                let mut cat = self.catalog.write().await;
                if cat.database(&name).is_some() {
                    return Err(SnowglobeError::NameInUse(format!("Database {name}")));
                }
                let tomb = cat
                    .peek_dropped_database(&name)
                    .ok_or_else(|| SnowglobeError::NotFound(format!("Dropped database {name}")))?;
                let mut ddl = String::new();
                for s in &tomb.schemas {
                    ddl.push_str(&format!(
                        "CREATE SCHEMA IF NOT EXISTS {};",
                        catalog::quote_ident(&s.key())
                    ));
                }
                for t in &tomb.tables {
                    ddl.push_str(&format!(
                        "ALTER TABLE {} RENAME TO {};",
                        t.engine_name(),
                        catalog::quote_ident(&t.name)
                    ));
                }
                if !ddl.is_empty() {
                    self.engine.batch(ddl).await?;
                }
                cat.undrop_database(&name)?;
                Ok(status(format!("Database {name} successfully restored."), class))
            }

            Directive::CreateSchema {
                database,
                name,
                if_not_exists,
                or_replace,
            } => {
                let mut cat = self.catalog.write().await;
                if cat.database(&database).is_none() {
                    return Err(SnowglobeError::NotFound(format!("Database {database}")));
                }
                if cat.schema(&database, &name).is_some() {
                    if if_not_exists {
                        return Ok(status(
                            format!("{name} already exists, statement succeeded."),
                            class,
                        ));
                    }
                    if or_replace {
                        let park = self.park_schema_tables(&cat, &database, &name).await?;
                        self.drop_engine_views(&cat, &database, Some(&name)).await?;
                        cat.drop_schema(&database, &name, Utc::now(), &park)?;
                    } else {
                        return Err(SnowglobeError::AlreadyExists(format!("Schema {name}")));
                    }
                }
                self.engine
                    .batch(format!(
                        "CREATE SCHEMA IF NOT EXISTS {};",
                        catalog::quote_ident(&catalog::engine_schema(&database, &name))
                    ))
                    .await?;
                cat.create_schema(SchemaRecord {
                    database,
                    name: name.clone(),
                    created_at: Utc::now(),
                })?;
                Ok(status(format!("Schema {name} successfully created."), class))
            }

            Directive::DropSchema {
                database,
                name,
                if_exists,
                cascade,
            } => {
                let mut cat = self.catalog.write().await;
                if cat.schema(&database, &name).is_none() {
                    if if_exists {
                        return Ok(status("Drop statement executed successfully.".to_owned(), class));
                    }
                    return Err(SnowglobeError::NotFound(format!("Schema {name}")));
                }
                if !cascade
                    && (!cat.list_tables(&database, Some(&name)).is_empty()
                        || !cat.list_views(&database, Some(&name)).is_empty())
                {
                    return Err(SnowglobeError::NotEmpty(format!("Schema {name}")));
                }
                self.drop_engine_views(&cat, &database, Some(&name)).await?;
                let park = self.park_schema_tables(&cat, &database, &name).await?;
                cat.drop_schema(&database, &name, Utc::now(), &park)?;
                Ok(status(format!("{name} successfully dropped."), class))
            }

            Directive::UndropSchema { database, name } => {
                let mut cat = self.catalog.write().await;
                if cat.schema(&database, &name).is_some() {
                    return Err(SnowglobeError::NameInUse(format!("Schema {name}")));
                }
                if cat.database(&database).is_none() {
                    return Err(SnowglobeError::NotFound(format!("Database {database}")));
                }
                let tomb = cat
                    .peek_dropped_schema(&database, &name)
                    .ok_or_else(|| SnowglobeError::NotFound(format!("Dropped schema {name}")))?;
                let mut ddl = format!(
                    "CREATE SCHEMA IF NOT EXISTS {};",
                    catalog::quote_ident(&catalog::engine_schema(&database, &name))
                );
                for t in &tomb.tables {
                    ddl.push_str(&format!(
                        "ALTER TABLE {} RENAME TO {};",
                        t.engine_name(),
                        catalog::quote_ident(&t.name)
                    ));
                }
                self.engine.batch(ddl).await?;
                cat.undrop_schema(&database, &name)?;
                Ok(status(format!("Schema {name} successfully restored."), class))
            }

            Directive::CreateTable {
                name,
                columns,
                if_not_exists,
                or_replace,
            } => {
                let mut cat = self.catalog.write().await;
                self.require_schema(&cat, &name)?;
                if let Some(outcome) = self
                    .handle_existing_table(&mut cat, &name, if_not_exists, or_replace, class)
                    .await?
                {
                    return Ok(outcome);
                }
                let decls: Vec<String> = columns
                    .iter()
                    .map(|c| {
                        format!(
                            "{} {}{}",
                            catalog::quote_ident(&c.name),
                            c.engine_type,
                            if c.nullable { "" } else { " NOT NULL" }
                        )
                    })
                    .collect();
                let engine_name = catalog::engine_relation(&name.database, &name.schema, &name.name);
                self.engine
                    .execute(format!("CREATE TABLE {} ({})", engine_name, decls.join(", ")))
                    .await?;
                let rec = TableRecord {
                    database: name.database.clone(),
                    schema: name.schema.clone(),
                    name: name.name.clone(),
                    columns: columns.into_iter().map(ColumnDef::from).collect(),
                    created_at: Utc::now(),
                    relation: name.name.clone(),
                    row_count: Some(0),
                };
                if let Err(e) = cat.create_table(rec) {
                    return Err(self
                        .rollback_engine(format!("DROP TABLE IF EXISTS {engine_name}"), e)
                        .await);
                }
                Ok(status(format!("Table {} successfully created.", name.name), class))
            }

            Directive::CreateTableAs {
                name,
                or_replace,
                query,
            } => {
                let mut cat = self.catalog.write().await;
                self.require_schema(&cat, &name)?;
                if let Some(outcome) = self
                    .handle_existing_table(&mut cat, &name, false, or_replace, class)
                    .await?
                {
                    return Ok(outcome);
                }
                let views = view_ddl(&cat, &query.tables)?;
                if !views.is_empty() {
                    self.engine.batch(views).await?;
                }
                let engine_name = catalog::engine_relation(&name.database, &name.schema, &name.name);
                self.with_deadline(
                    self.engine
                        .execute(format!("CREATE TABLE {} AS {}", engine_name, query.sql)),
                )
                .await?;
                let columns = self.read_back_columns(&name).await?;
                let rows = self.count_rows(&name).await.ok();
                let rec = TableRecord {
                    database: name.database.clone(),
                    schema: name.schema.clone(),
                    name: name.name.clone(),
                    columns,
                    created_at: Utc::now(),
                    relation: name.name.clone(),
                    row_count: rows,
                };
                if let Err(e) = cat.create_table(rec) {
                    return Err(self
                        .rollback_engine(format!("DROP TABLE IF EXISTS {engine_name}"), e)
                        .await);
                }
                Ok(status(format!("Table {} successfully created.", name.name), class))
            }

            Directive::CloneTable {
                name,
                source,
                if_not_exists,
                or_replace,
            } => {
                let mut cat = self.catalog.write().await;
                self.require_schema(&cat, &name)?;
                let src = cat
                    .table(&source)
                    .ok_or_else(|| SnowglobeError::NotFound(format!("Table {source}")))?
                    .clone();
                if let Some(outcome) = self
                    .handle_existing_table(&mut cat, &name, if_not_exists, or_replace, class)
                    .await?
                {
                    return Ok(outcome);
                }
                let engine_name = catalog::engine_relation(&name.database, &name.schema, &name.name);
                let decls: Vec<String> = src
                    .columns
                    .iter()
                    .map(|c| format!("{} {}", catalog::quote_ident(&c.name), c.engine_type))
                    .collect();
                self.engine
                    .execute(format!("CREATE TABLE {} ({})", engine_name, decls.join(", ")))
                    .await?;
                let copied = self
                    .with_deadline(self.engine.execute(format!(
                        "INSERT INTO {} SELECT * FROM {}",
                        engine_name,
                        src.engine_name()
                    )))
                    .await?;
                let rec = TableRecord {
                    database: name.database.clone(),
                    schema: name.schema.clone(),
                    name: name.name.clone(),
                    columns: src.columns.clone(),
                    created_at: Utc::now(),
                    relation: name.name.clone(),
                    row_count: Some(u64::try_from(copied).unwrap_or(u64::MAX)),
                };
                if let Err(e) = cat.create_table(rec) {
                    return Err(self
                        .rollback_engine(format!("DROP TABLE IF EXISTS {engine_name}"), e)
                        .await);
                }
                Ok(status(format!("Table {} successfully created.", name.name), class))
            }

            Directive::DropTable { name, if_exists } => {
                let mut cat = self.catalog.write().await;
                let Some(table) = cat.table(&name).cloned() else {
                    if if_exists {
                        return Ok(status("Drop statement executed successfully.".to_owned(), class));
                    }
                    return Err(SnowglobeError::NotFound(format!("Table {name}")));
                };
                let parked = catalog::tombstone_relation(&name.name);
                self.engine
                    .execute(format!(
                        "ALTER TABLE {} RENAME TO {}",
                        table.engine_name(),
                        catalog::quote_ident(&parked)
                    ))
                    .await?;
                if let Err(e) = cat.drop_table(&name, Utc::now(), parked.clone()) {
                    let undo = format!(
                        "ALTER TABLE {} RENAME TO {}",
                        catalog::engine_relation(&name.database, &name.schema, &parked),
                        catalog::quote_ident(&name.name)
                    );
                    return Err(self.rollback_engine(undo, e).await);
                }
                Ok(status(format!("{} successfully dropped.", name.name), class))
            }

            Directive::UndropTable { name } => {
                let mut cat = self.catalog.write().await;
                if cat.table(&name).is_some() || cat.view(&name).is_some() {
                    return Err(SnowglobeError::NameInUse(format!("Table {name}")));
                }
                let tomb = cat
                    .peek_dropped_table(&name)
                    .ok_or_else(|| SnowglobeError::NotFound(format!("Dropped table {name}")))?;
                let parked = tomb.record.relation.clone();
                self.engine
                    .execute(format!(
                        "ALTER TABLE {} RENAME TO {}",
                        catalog::engine_relation(&name.database, &name.schema, &parked),
                        catalog::quote_ident(&name.name)
                    ))
                    .await?;
                if let Err(e) = cat.undrop_table(&name) {
                    let undo = format!(
                        "ALTER TABLE {} RENAME TO {}",
                        catalog::engine_relation(&name.database, &name.schema, &name.name),
                        catalog::quote_ident(&parked)
                    );
                    return Err(self.rollback_engine(undo, e).await);
                }
                Ok(status(format!("Table {} successfully restored.", name.name), class))
            }

            Directive::TruncateTable { name, if_exists } => {
                let mut cat = self.catalog.write().await;
                let Some(table) = cat.table(&name).cloned() else {
                    if if_exists {
                        return Ok(status("Statement executed successfully.".to_owned(), class));
                    }
                    return Err(SnowglobeError::NotFound(format!("Table {name}")));
                };
                self.with_deadline(
                    self.engine
                        .execute(format!("DELETE FROM {}", table.engine_name())),
                )
                .await?;
                cat.set_row_count(&name, Some(0))?;
                Ok(status("Statement executed successfully.".to_owned(), class))
            }

            Directive::RenameTable {
                name,
                to,
                if_exists,
            } => {
                let mut cat = self.catalog.write().await;
                let Some(table) = cat.table(&name).cloned() else {
                    if if_exists {
                        return Ok(status("Statement executed successfully.".to_owned(), class));
                    }
                    return Err(SnowglobeError::NotFound(format!("Table {name}")));
                };
                if cat.table(&to).is_some() || cat.view(&to).is_some() {
                    return Err(SnowglobeError::AlreadyExists(format!("Table {to}")));
                }
                self.require_schema(&cat, &to)?;
                let target = catalog::engine_relation(&to.database, &to.schema, &to.name);
                if name.engine_schema() == to.engine_schema() {
                    self.engine
                        .execute(format!(
                            "ALTER TABLE {} RENAME TO {}",
                            table.engine_name(),
                            catalog::quote_ident(&to.name)
                        ))
                        .await?;
                } else {
                    // DuckDB renames only within a schema; a cross-schema
                    // move is a copy followed by a drop.
                    self.engine
                        .batch(format!(
                            "CREATE TABLE {} AS SELECT * FROM {}; DROP TABLE {};",
                            target,
                            table.engine_name(),
                            table.engine_name()
                        ))
                        .await?;
                }
                cat.rename_table(&name, &to)?;
                Ok(status("Statement executed successfully.".to_owned(), class))
            }

            Directive::CreateView {
                name,
                text,
                secure,
                if_not_exists,
                or_replace,
            } => {
                let mut cat = self.catalog.write().await;
                self.require_schema(&cat, &name)?;
                if cat.table(&name).is_some() {
                    return Err(SnowglobeError::AlreadyExists(format!("Table {name}")));
                }
                if cat.view(&name).is_some() {
                    if if_not_exists {
                        return Ok(status(
                            format!("{} already exists, statement succeeded.", name.name),
                            class,
                        ));
                    }
                    if !or_replace {
                        return Err(SnowglobeError::AlreadyExists(format!("View {name}")));
                    }
                }
                let rec = ViewRecord {
                    database: name.database.clone(),
                    schema: name.schema.clone(),
                    name: name.name.clone(),
                    text,
                    secure,
                    created_at: Utc::now(),
                };
                if cat.view(&name).is_some() {
                    // The replaced definition goes onto the tombstone stack;
                    // any stale engine materialization is removed.
                    self.engine
                        .execute(format!(
                            "DROP VIEW IF EXISTS {}",
                            catalog::engine_relation(&name.database, &name.schema, &name.name)
                        ))
                        .await?;
                    cat.replace_view(rec, Utc::now())?;
                } else {
                    cat.create_view(rec)?;
                }
                Ok(status(format!("View {} successfully created.", name.name), class))
            }

            Directive::DropView { name, if_exists } => {
                let mut cat = self.catalog.write().await;
                if cat.view(&name).is_none() {
                    if if_exists {
                        return Ok(status("Drop statement executed successfully.".to_owned(), class));
                    }
                    return Err(SnowglobeError::NotFound(format!("View {name}")));
                }
                self.engine
                    .execute(format!(
                        "DROP VIEW IF EXISTS {}",
                        catalog::engine_relation(&name.database, &name.schema, &name.name)
                    ))
                    .await?;
                cat.drop_view(&name, Utc::now())?;
                Ok(status(format!("{} successfully dropped.", name.name), class))
            }

            Directive::UndropView { name } => {
                let mut cat = self.catalog.write().await;
                if cat.table(&name).is_some() || cat.view(&name).is_some() {
                    return Err(SnowglobeError::NameInUse(format!("View {name}")));
                }
                cat.peek_dropped_view(&name)
                    .ok_or_else(|| SnowglobeError::NotFound(format!("Dropped view {name}")))?;
                cat.undrop_view(&name)?;
                Ok(status(format!("View {} successfully restored.", name.name), class))
            }

            Directive::CreateStage {
                name,
                if_not_exists,
                or_replace: _,
            } => {
                let mut cat = self.catalog.write().await;
                self.require_schema(&cat, &name)?;
                if cat.stage(&name).is_some() && if_not_exists {
                    return Ok(status(
                        format!("{} already exists, statement succeeded.", name.name),
                        class,
                    ));
                }
                cat.create_stage(StageRecord {
                    database: name.database.clone(),
                    schema: name.schema.clone(),
                    name: name.name.clone(),
                    created_at: Utc::now(),
                })?;
                Ok(status(format!("Stage area {} successfully created.", name.name), class))
            }

            Directive::DropStage { name, if_exists } => {
                let mut cat = self.catalog.write().await;
                if cat.stage(&name).is_none() && if_exists {
                    return Ok(status("Drop statement executed successfully.".to_owned(), class));
                }
                cat.drop_stage(&name)?;
                Ok(status(format!("{} successfully dropped.", name.name), class))
            }

            Directive::Use { target, name } => {
                let cat = self.catalog.read().await;
                match target {
                    UseTarget::Database => {
                        if cat.database(&name).is_none() {
                            return Err(SnowglobeError::NotFound(format!("Database {name}")));
                        }
                        ctx.database = name;
                        ctx.schema = crate::session::DEFAULT_SCHEMA.to_owned();
                    }
                    UseTarget::Schema => {
                        let (db, schema) = match name.split_once('.') {
                            Some((d, s)) => (d.to_owned(), s.to_owned()),
                            None => (ctx.database.clone(), name),
                        };
                        if cat.schema(&db, &schema).is_none() {
                            return Err(SnowglobeError::NotFound(format!("Schema {schema}")));
                        }
                        ctx.database = db;
                        ctx.schema = schema;
                    }
                    UseTarget::Warehouse => ctx.warehouse = name,
                    UseTarget::Role => ctx.role = name,
                }
                Ok(status("Statement executed successfully.".to_owned(), class))
            }

            Directive::Show(show) => self.show(&show, ctx).await,

            Directive::Describe { kind, name } => self.describe(kind, &name).await,

            Directive::AlterSession => {
                Ok(status("Statement executed successfully.".to_owned(), class))
            }
        }
    }

    // -- directive helpers -------------------------------------------------

    fn require_schema(&self, cat: &Catalog, name: &ObjectName) -> Result<()> {
        if cat.database(&name.database).is_none() {
            return Err(SnowglobeError::NotFound(format!("Database {}", name.database)));
        }
        if cat.schema(&name.database, &name.schema).is_none() {
            return Err(SnowglobeError::NotFound(format!("Schema {}", name.schema)));
        }
        Ok(())
    }

    /// Shared conflict handling for the CREATE TABLE family. Returns an
    /// early success envelope for IF NOT EXISTS; parks the old relation for
    /// OR REPLACE (the caller then creates the fresh one).
    async fn handle_existing_table(
        &self,
        cat: &mut Catalog,
        name: &ObjectName,
        if_not_exists: bool,
        or_replace: bool,
        class: StatementClass,
    ) -> Result<Option<QueryResponseData>> {
        if cat.view(name).is_some() {
            return Err(SnowglobeError::AlreadyExists(format!("View {name}")));
        }
        let Some(existing) = cat.table(name).cloned() else {
            return Ok(None);
        };
        if if_not_exists {
            return Ok(Some(status(
                format!("{} already exists, statement succeeded.", name.name),
                class,
            )));
        }
        if !or_replace {
            return Err(SnowglobeError::AlreadyExists(format!("Table {name}")));
        }
        // The replaced object moves onto the tombstone stack with its data
        // parked under a generated relation name.
        let parked = catalog::tombstone_relation(&name.name);
        self.engine
            .execute(format!(
                "ALTER TABLE {} RENAME TO {}",
                existing.engine_name(),
                catalog::quote_ident(&parked)
            ))
            .await?;
        cat.drop_table(name, Utc::now(), parked)?;
        Ok(None)
    }

    /// Rename every live table of a database (or schema) out of the way;
    /// returns the FQN→parked-relation map for the catalog commit.
    async fn park_database_tables(
        &self,
        cat: &Catalog,
        database: &str,
    ) -> Result<BTreeMap<String, String>> {
        let tables: Vec<TableRecord> = cat.list_tables(database, None).into_iter().cloned().collect();
        self.park_tables(tables).await
    }

    async fn park_schema_tables(
        &self,
        cat: &Catalog,
        database: &str,
        schema: &str,
    ) -> Result<BTreeMap<String, String>> {
        let tables: Vec<TableRecord> = cat
            .list_tables(database, Some(schema))
            .into_iter()
            .cloned()
            .collect();
        self.park_tables(tables).await
    }

    async fn park_tables(&self, tables: Vec<TableRecord>) -> Result<BTreeMap<String, String>> {
        let mut park = BTreeMap::new();
        let mut ddl = String::new();
        for t in &tables {
            let parked = catalog::tombstone_relation(&t.name);
            ddl.push_str(&format!(
                "ALTER TABLE {} RENAME TO {};",
                t.engine_name(),
                catalog::quote_ident(&parked)
            ));
            park.insert(t.fqn(), parked);
        }
        if !ddl.is_empty() {
            self.engine.batch(ddl).await?;
        }
        Ok(park)
    }

    /// Remove engine materializations of the views in a database/schema.
    async fn drop_engine_views(
        &self,
        cat: &Catalog,
        database: &str,
        schema: Option<&str>,
    ) -> Result<()> {
        let mut ddl = String::new();
        for v in cat.list_views(database, schema) {
            ddl.push_str(&format!(
                "DROP VIEW IF EXISTS {};",
                catalog::engine_relation(&v.database, &v.schema, &v.name)
            ));
        }
        if !ddl.is_empty() {
            self.engine.batch(ddl).await?;
        }
        Ok(())
    }

    /// Attempt an engine rollback after a failed catalog commit. When the
    /// rollback itself fails, the original error escalates.
    async fn rollback_engine(&self, undo_sql: String, original: SnowglobeError) -> SnowglobeError {
        match self.engine.batch(undo_sql).await {
            Ok(()) => original,
            Err(rollback_err) => {
                tracing::error!(
                    "engine rollback failed after catalog error ({original}): {rollback_err}; object is orphaned"
                );
                SnowglobeError::InternalInconsistency(format!(
                    "{original}; engine rollback also failed: {rollback_err}"
                ))
            }
        }
    }

    async fn read_back_columns(&self, name: &ObjectName) -> Result<Vec<ColumnDef>> {
        let out = self
            .engine
            .query(engine::columns_query(&name.engine_schema(), &name.name))
            .await?;
        let columns = out
            .rows
            .iter()
            .map(|row| {
                let get = |i: usize| {
                    row.get(i)
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_owned()
                };
                let engine_type = get(1);
                ColumnDef {
                    name: get(0),
                    data_type: sf_decl_of_engine(&engine_type),
                    engine_type,
                    nullable: get(2).eq_ignore_ascii_case("yes"),
                    primary_key: false,
                }
            })
            .collect();
        Ok(columns)
    }

    async fn count_rows(&self, name: &ObjectName) -> Result<u64> {
        let out = self
            .engine
            .query(format!(
                "SELECT count(*) FROM {}",
                catalog::engine_relation(&name.database, &name.schema, &name.name)
            ))
            .await?;
        Ok(out
            .rows
            .first()
            .and_then(|r| r.first())
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }

    // -- SHOW / DESCRIBE ---------------------------------------------------

    #[allow(clippy::too_many_lines)]
    async fn show(&self, show: &Show, ctx: &SessionContext) -> Result<QueryResponseData> {
        let cat = self.catalog.read().await;
        let (db_scope, schema_scope) = match &show.scope {
            Some(ShowScope::Database(d)) => (Some(d.clone()), None),
            Some(ShowScope::Schema { database, schema }) => {
                (Some(database.clone()), Some(schema.clone()))
            }
            None => match show.kind {
                ShowKind::Databases | ShowKind::Warehouses | ShowKind::Roles => (None, None),
                ShowKind::Schemas => (Some(ctx.database.clone()), None),
                _ => (Some(ctx.database.clone()), Some(ctx.schema.clone())),
            },
        };
        let keep = |name: &str| show.like.as_deref().is_none_or(|p| catalog::like_match(p, name));
        let ts = |t: chrono::DateTime<Utc>| {
            serde_json::Value::String(t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        };
        let s = |v: &str| serde_json::Value::String(v.to_owned());

        let (rowtype, rowset): (Vec<RowType>, Vec<Vec<serde_json::Value>>) = match (show.kind, show.dropped) {
            (ShowKind::Databases, false) => (
                vec![
                    RowType::new("created_on", SnowflakeType::TimestampLtz),
                    RowType::new("name", SnowflakeType::Text),
                    RowType::new("origin", SnowflakeType::Text),
                    RowType::new("owner", SnowflakeType::Text),
                    RowType::new("comment", SnowflakeType::Text),
                ],
                cat.list_databases()
                    .iter()
                    .filter(|d| keep(&d.name))
                    .map(|d| {
                        vec![
                            ts(d.created_at),
                            s(&d.name),
                            s(""),
                            s(crate::session::DEFAULT_ROLE),
                            s(d.comment.as_deref().unwrap_or_default()),
                        ]
                    })
                    .collect(),
            ),
            (ShowKind::Databases, true) => (
                vec![
                    RowType::new("created_on", SnowflakeType::TimestampLtz),
                    RowType::new("dropped_on", SnowflakeType::TimestampLtz),
                    RowType::new("name", SnowflakeType::Text),
                ],
                cat.dropped_databases()
                    .iter()
                    .filter(|t| keep(&t.record.name))
                    .map(|t| vec![ts(t.record.created_at), ts(t.dropped_at), s(&t.record.name)])
                    .collect(),
            ),
            (ShowKind::Schemas, false) => {
                let db = db_scope.unwrap_or_else(|| ctx.database.clone());
                (
                    vec![
                        RowType::new("created_on", SnowflakeType::TimestampLtz),
                        RowType::new("name", SnowflakeType::Text),
                        RowType::new("database_name", SnowflakeType::Text),
                    ],
                    cat.list_schemas(&db)
                        .iter()
                        .filter(|r| keep(&r.name))
                        .map(|r| vec![ts(r.created_at), s(&r.name), s(&r.database)])
                        .collect(),
                )
            }
            (ShowKind::Schemas, true) => (
                vec![
                    RowType::new("created_on", SnowflakeType::TimestampLtz),
                    RowType::new("dropped_on", SnowflakeType::TimestampLtz),
                    RowType::new("name", SnowflakeType::Text),
                    RowType::new("database_name", SnowflakeType::Text),
                ],
                cat.dropped_schemas(db_scope.as_deref())
                    .iter()
                    .filter(|t| keep(&t.record.name))
                    .map(|t| {
                        vec![
                            ts(t.record.created_at),
                            ts(t.dropped_at),
                            s(&t.record.name),
                            s(&t.record.database),
                        ]
                    })
                    .collect(),
            ),
            (ShowKind::Tables, false) => {
                let db = db_scope.unwrap_or_else(|| ctx.database.clone());
                let tables: Vec<TableRecord> = cat
                    .list_tables(&db, schema_scope.as_deref())
                    .into_iter()
                    .filter(|t| keep(&t.name))
                    .cloned()
                    .collect();
                let mut rows = Vec::with_capacity(tables.len());
                for t in &tables {
                    let count = self.count_rows(&t.object_name()).await.unwrap_or(0);
                    rows.push(vec![
                        ts(t.created_at),
                        s(&t.name),
                        s(&t.database),
                        s(&t.schema),
                        s("TABLE"),
                        s(""),
                        serde_json::Value::String(count.to_string()),
                    ]);
                }
                (
                    vec![
                        RowType::new("created_on", SnowflakeType::TimestampLtz),
                        RowType::new("name", SnowflakeType::Text),
                        RowType::new("database_name", SnowflakeType::Text),
                        RowType::new("schema_name", SnowflakeType::Text),
                        RowType::new("kind", SnowflakeType::Text),
                        RowType::new("comment", SnowflakeType::Text),
                        RowType::new("rows", SnowflakeType::Fixed),
                    ],
                    rows,
                )
            }
            (ShowKind::Tables, true) => (
                vec![
                    RowType::new("created_on", SnowflakeType::TimestampLtz),
                    RowType::new("dropped_on", SnowflakeType::TimestampLtz),
                    RowType::new("name", SnowflakeType::Text),
                    RowType::new("database_name", SnowflakeType::Text),
                    RowType::new("schema_name", SnowflakeType::Text),
                ],
                cat.dropped_tables(db_scope.as_deref(), schema_scope.as_deref())
                    .iter()
                    .filter(|t| keep(&t.record.name))
                    .map(|t| {
                        vec![
                            ts(t.record.created_at),
                            ts(t.dropped_at),
                            s(&t.record.name),
                            s(&t.record.database),
                            s(&t.record.schema),
                        ]
                    })
                    .collect(),
            ),
            (ShowKind::Views, false) => {
                let db = db_scope.unwrap_or_else(|| ctx.database.clone());
                (
                    vec![
                        RowType::new("created_on", SnowflakeType::TimestampLtz),
                        RowType::new("name", SnowflakeType::Text),
                        RowType::new("database_name", SnowflakeType::Text),
                        RowType::new("schema_name", SnowflakeType::Text),
                        RowType::new("is_secure", SnowflakeType::Text),
                        RowType::new("text", SnowflakeType::Text),
                    ],
                    cat.list_views(&db, schema_scope.as_deref())
                        .iter()
                        .filter(|v| keep(&v.name))
                        .map(|v| {
                            vec![
                                ts(v.created_at),
                                s(&v.name),
                                s(&v.database),
                                s(&v.schema),
                                s(if v.secure { "true" } else { "false" }),
                                s(&v.text),
                            ]
                        })
                        .collect(),
                )
            }
            (ShowKind::Views, true) => (
                vec![
                    RowType::new("created_on", SnowflakeType::TimestampLtz),
                    RowType::new("dropped_on", SnowflakeType::TimestampLtz),
                    RowType::new("name", SnowflakeType::Text),
                    RowType::new("database_name", SnowflakeType::Text),
                    RowType::new("schema_name", SnowflakeType::Text),
                ],
                cat.dropped_views(db_scope.as_deref(), schema_scope.as_deref())
                    .iter()
                    .filter(|t| keep(&t.record.name))
                    .map(|t| {
                        vec![
                            ts(t.record.created_at),
                            ts(t.dropped_at),
                            s(&t.record.name),
                            s(&t.record.database),
                            s(&t.record.schema),
                        ]
                    })
                    .collect(),
            ),
            (ShowKind::Stages, _) => {
                let db = db_scope.unwrap_or_else(|| ctx.database.clone());
                (
                    vec![
                        RowType::new("created_on", SnowflakeType::TimestampLtz),
                        RowType::new("name", SnowflakeType::Text),
                        RowType::new("database_name", SnowflakeType::Text),
                        RowType::new("schema_name", SnowflakeType::Text),
                    ],
                    cat.list_stages(&db, schema_scope.as_deref())
                        .iter()
                        .filter(|r| keep(&r.name))
                        .map(|r| vec![ts(r.created_at), s(&r.name), s(&r.database), s(&r.schema)])
                        .collect(),
                )
            }
            (ShowKind::Warehouses, _) => (
                vec![
                    RowType::new("name", SnowflakeType::Text),
                    RowType::new("state", SnowflakeType::Text),
                    RowType::new("size", SnowflakeType::Text),
                ],
                vec![vec![
                    s(crate::session::DEFAULT_WAREHOUSE),
                    s("STARTED"),
                    s("X-Small"),
                ]],
            ),
            (ShowKind::Roles, _) => (
                vec![RowType::new("name", SnowflakeType::Text)],
                vec![vec![s(crate::session::DEFAULT_ROLE)]],
            ),
        };

        Ok(envelope(rowtype, rowset, StatementClass::Show))
    }

    async fn describe(&self, kind: DescribeKind, name: &ObjectName) -> Result<QueryResponseData> {
        let columns: Vec<ColumnDef> = match kind {
            DescribeKind::Table => {
                let cat = self.catalog.read().await;
                cat.table(name)
                    .ok_or_else(|| SnowglobeError::NotFound(format!("Table {name}")))?
                    .columns
                    .clone()
            }
            DescribeKind::View => {
                {
                    let cat = self.catalog.read().await;
                    cat.view(name)
                        .ok_or_else(|| SnowglobeError::NotFound(format!("View {name}")))?;
                }
                self.materialize_views(std::slice::from_ref(name)).await?;
                self.read_back_columns(name).await?
            }
        };
        let s = |v: &str| serde_json::Value::String(v.to_owned());
        let rows = columns
            .iter()
            .map(|c| {
                vec![
                    s(&c.name),
                    s(&c.data_type),
                    s("COLUMN"),
                    s(if c.nullable { "Y" } else { "N" }),
                    serde_json::Value::Null,
                    s(if c.primary_key { "Y" } else { "N" }),
                ]
            })
            .collect();
        Ok(envelope(
            vec![
                RowType::new("name", SnowflakeType::Text),
                RowType::new("type", SnowflakeType::Text),
                RowType::new("kind", SnowflakeType::Text),
                RowType::new("null?", SnowflakeType::Text),
                RowType::new("default", SnowflakeType::Text),
                RowType::new("primary key", SnowflakeType::Text),
            ],
            rows,
            StatementClass::Show,
        ))
    }
}

/// Engine DDL that (re)creates every view the statement references, from
/// stored definitions, following view-on-view references transitively.
fn view_ddl(cat: &Catalog, tables: &[ObjectName]) -> Result<String> {
    let mut pending: Vec<ObjectName> = tables.to_vec();
    let mut seen: HashSet<String> = HashSet::new();
    let mut ddl = String::new();
    while let Some(name) = pending.pop() {
        if !seen.insert(name.fqn()) {
            continue;
        }
        let Some(view) = cat.view(&name) else { continue };
        let view_ctx = NameContext::new(&view.database, &view.schema);
        let body = translator::rewrite_query(&view.text, &view_ctx)?;
        ddl.push_str(&format!(
            "CREATE OR REPLACE VIEW {} AS {};",
            catalog::engine_relation(&view.database, &view.schema, &view.name),
            body.sql
        ));
        pending.extend(body.tables);
    }
    Ok(ddl)
}

/// Snowflake-facing type name for an engine declaration (CTAS read-back).
fn sf_decl_of_engine(decl: &str) -> String {
    let upper = decl.to_ascii_uppercase();
    let base: String = upper
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == ' ')
        .collect();
    match base.trim() {
        "TINYINT" | "SMALLINT" | "INTEGER" | "INT" | "BIGINT" | "HUGEINT" | "UBIGINT"
        | "UINTEGER" | "USMALLINT" | "UTINYINT" => "NUMBER(38,0)".to_owned(),
        "DECIMAL" | "NUMERIC" => upper.replacen("DECIMAL", "NUMBER", 1).replacen("NUMERIC", "NUMBER", 1),
        "FLOAT" | "DOUBLE" | "REAL" => "FLOAT".to_owned(),
        "VARCHAR" | "TEXT" | "STRING" => "VARCHAR".to_owned(),
        "BOOLEAN" => "BOOLEAN".to_owned(),
        "DATE" => "DATE".to_owned(),
        "TIME" => "TIME".to_owned(),
        "TIMESTAMP" | "TIMESTAMP WITHOUT TIME ZONE" => "TIMESTAMP_NTZ".to_owned(),
        "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" => "TIMESTAMP_TZ".to_owned(),
        "JSON" => "VARIANT".to_owned(),
        "BLOB" => "BINARY".to_owned(),
        _ => upper,
    }
}

fn envelope(
    rowtype: Vec<RowType>,
    rowset: Vec<Vec<serde_json::Value>>,
    class: StatementClass,
) -> QueryResponseData {
    let total = i64::try_from(rowset.len()).unwrap_or(i64::MAX);
    QueryResponseData {
        rowtype,
        rowset,
        total,
        returned: total,
        query_id: Uuid::new_v4().to_string(),
        statement_type_id: class.type_id(),
        parameters: Vec::new(),
        final_database_name: None,
        final_schema_name: None,
        final_warehouse_name: None,
        final_role_name: None,
    }
}

fn query_envelope(out: QueryOutput, class: StatementClass) -> QueryResponseData {
    let rowtype = out
        .columns
        .iter()
        .map(|c| RowType::new(&c.name, c.type_))
        .collect();
    envelope(rowtype, out.rows, class)
}

/// Single status-row envelope used by DDL directives.
fn status(message: String, class: StatementClass) -> QueryResponseData {
    envelope(
        vec![RowType {
            nullable: false,
            ..RowType::new("status", SnowflakeType::Text)
        }],
        vec![vec![serde_json::Value::String(message)]],
        class,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_decl_mapping() {
        assert_eq!(sf_decl_of_engine("BIGINT"), "NUMBER(38,0)");
        assert_eq!(sf_decl_of_engine("DECIMAL(10,2)"), "NUMBER(10,2)");
        assert_eq!(sf_decl_of_engine("VARCHAR"), "VARCHAR");
        assert_eq!(sf_decl_of_engine("JSON"), "VARIANT");
        assert_eq!(sf_decl_of_engine("TIMESTAMP WITH TIME ZONE"), "TIMESTAMP_TZ");
    }

    #[test]
    fn status_envelope_shape() {
        let d = status("Database TESTDB successfully created.".into(), StatementClass::Create);
        assert_eq!(d.rowtype[0].name, "status");
        assert_eq!(d.statement_type_id, 8192);
        assert_eq!(d.total, 1);
        assert_eq!(
            d.rowset,
            vec![vec![serde_json::Value::String(
                "Database TESTDB successfully created.".into()
            )]]
        );
    }
}
