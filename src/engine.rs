//! Engine adapter: a single DuckDB connection behind a worker thread.
//!
//! All executions funnel through one channel, so concurrent callers queue
//! FIFO and the engine only ever sees one statement at a time. The adapter
//! also owns the mapping from engine values and types to the Snowflake wire
//! shape: every value serializes as a string (NULL stays JSON null).

use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use duckdb::types::{TimeUnit, Value};
use duckdb::Connection;
use tokio::sync::oneshot;

use crate::responses::SnowflakeType;
use crate::{Result, SnowglobeError};

#[derive(Debug, Clone)]
pub struct EngineColumn {
    pub name: String,
    pub type_: SnowflakeType,
}

#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    pub columns: Vec<EngineColumn>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

enum Job {
    Query {
        sql: String,
        reply: oneshot::Sender<Result<QueryOutput>>,
    },
    Execute {
        sql: String,
        reply: oneshot::Sender<Result<usize>>,
    },
    Batch {
        sql: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cheap clonable handle; all clones feed the same worker.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Job>,
}

impl EngineHandle {
    /// Open the database file and start the worker. Fails with
    /// `Unavailable` when the engine cannot initialize.
    pub fn start(path: PathBuf) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();

        thread::Builder::new()
            .name("engine-worker".to_owned())
            .spawn(move || {
                let conn = match Connection::open(&path) {
                    Ok(c) => {
                        let _ = ready_tx.send(Ok(()));
                        c
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                worker_loop(&conn, &rx);
            })
            .map_err(|e| SnowglobeError::Unavailable(format!("cannot spawn engine worker: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { tx }),
            Ok(Err(e)) => Err(SnowglobeError::Unavailable(format!(
                "engine failed to initialize: {e}"
            ))),
            Err(_) => Err(SnowglobeError::Unavailable(
                "engine worker exited during startup".to_owned(),
            )),
        }
    }

    pub async fn query(&self, sql: String) -> Result<QueryOutput> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Query { sql, reply })?;
        rx.await
            .map_err(|_| SnowglobeError::Unavailable("engine worker exited".to_owned()))?
    }

    pub async fn execute(&self, sql: String) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Execute { sql, reply })?;
        rx.await
            .map_err(|_| SnowglobeError::Unavailable("engine worker exited".to_owned()))?
    }

    pub async fn batch(&self, sql: String) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Batch { sql, reply })?;
        rx.await
            .map_err(|_| SnowglobeError::Unavailable("engine worker exited".to_owned()))?
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.tx
            .send(job)
            .map_err(|_| SnowglobeError::Unavailable("engine worker exited".to_owned()))
    }
}

fn worker_loop(conn: &Connection, rx: &mpsc::Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Query { sql, reply } => {
                tracing::debug!(target: "snowglobe::engine", "query: {sql}");
                let _ = reply.send(run_query(conn, &sql));
            }
            Job::Execute { sql, reply } => {
                tracing::debug!(target: "snowglobe::engine", "execute: {sql}");
                let _ = reply.send(
                    conn.execute(&sql, [])
                        .map_err(|e| SnowglobeError::Engine(e.to_string())),
                );
            }
            Job::Batch { sql, reply } => {
                tracing::debug!(target: "snowglobe::engine", "batch: {sql}");
                let _ = reply.send(
                    conn.execute_batch(&sql)
                        .map_err(|e| SnowglobeError::Engine(e.to_string())),
                );
            }
        }
    }
}

fn run_query(conn: &Connection, sql: &str) -> Result<QueryOutput> {
    let engine_err = |e: duckdb::Error| SnowglobeError::Engine(e.to_string());

    let mut stmt = conn.prepare(sql).map_err(engine_err)?;
    let mut out_rows: Vec<Vec<serde_json::Value>> = Vec::new();
    let mut types: Vec<Option<SnowflakeType>> = Vec::new();
    {
        let mut rows = stmt.query([]).map_err(engine_err)?;
        while let Some(row) = rows.next().map_err(engine_err)? {
            let ncols = row.as_ref().column_count();
            if types.is_empty() {
                types = vec![None; ncols];
            }
            let mut out = Vec::with_capacity(ncols);
            for i in 0..ncols {
                let v: Value = row.get(i).map_err(engine_err)?;
                let (rendered, ty) = render_value(v);
                if types[i].is_none() {
                    types[i] = ty;
                }
                out.push(rendered);
            }
            out_rows.push(out);
        }
    }

    let names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(|n| n.to_string())
        .collect();
    if types.is_empty() {
        types = vec![None; names.len()];
    }
    let columns = names
        .into_iter()
        .zip(types)
        .map(|(name, ty)| EngineColumn {
            name,
            type_: ty.unwrap_or(SnowflakeType::Text),
        })
        .collect();

    Ok(QueryOutput {
        columns,
        rows: out_rows,
    })
}

/// Introspection query for reading a relation's column list back after CTAS.
pub fn columns_query(engine_schema: &str, relation: &str) -> String {
    format!(
        "SELECT column_name, data_type, is_nullable FROM information_schema.columns \
         WHERE table_schema = '{}' AND table_name = '{}' ORDER BY ordinal_position",
        escape_str(engine_schema),
        escape_str(relation)
    )
}

pub fn escape_str(s: &str) -> String {
    s.replace('\'', "''")
}

fn unit_to_micros(unit: &TimeUnit, v: i64) -> i64 {
    match unit {
        TimeUnit::Second => v.saturating_mul(1_000_000),
        TimeUnit::Millisecond => v.saturating_mul(1_000),
        TimeUnit::Microsecond => v,
        TimeUnit::Nanosecond => v / 1_000,
    }
}

fn json_str(s: impl Into<String>) -> serde_json::Value {
    serde_json::Value::String(s.into())
}

/// Render an engine value the way Snowflake's JSON result format does:
/// strings for everything, ISO-8601 with a Z suffix for timestamps, JSON
/// null for NULL.
fn render_value(v: Value) -> (serde_json::Value, Option<SnowflakeType>) {
    match v {
        Value::Null => (serde_json::Value::Null, None),
        Value::Boolean(b) => (json_str(if b { "true" } else { "false" }), Some(SnowflakeType::Boolean)),
        Value::TinyInt(i) => (json_str(i.to_string()), Some(SnowflakeType::Fixed)),
        Value::SmallInt(i) => (json_str(i.to_string()), Some(SnowflakeType::Fixed)),
        Value::Int(i) => (json_str(i.to_string()), Some(SnowflakeType::Fixed)),
        Value::BigInt(i) => (json_str(i.to_string()), Some(SnowflakeType::Fixed)),
        Value::HugeInt(i) => (json_str(i.to_string()), Some(SnowflakeType::Fixed)),
        Value::UTinyInt(i) => (json_str(i.to_string()), Some(SnowflakeType::Fixed)),
        Value::USmallInt(i) => (json_str(i.to_string()), Some(SnowflakeType::Fixed)),
        Value::UInt(i) => (json_str(i.to_string()), Some(SnowflakeType::Fixed)),
        Value::UBigInt(i) => (json_str(i.to_string()), Some(SnowflakeType::Fixed)),
        Value::Float(f) => (json_str(f.to_string()), Some(SnowflakeType::Real)),
        Value::Double(f) => (json_str(f.to_string()), Some(SnowflakeType::Real)),
        Value::Decimal(d) => (json_str(d.to_string()), Some(SnowflakeType::Fixed)),
        Value::Text(s) => (json_str(s), Some(SnowflakeType::Text)),
        Value::Blob(b) => {
            let hex: String = b.iter().map(|x| format!("{x:02X}")).collect();
            (json_str(hex), Some(SnowflakeType::Binary))
        }
        Value::Date32(days) => {
            let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch date");
            let date = epoch
                .checked_add_signed(TimeDelta::days(i64::from(days)))
                .unwrap_or(epoch);
            (json_str(date.format("%Y-%m-%d").to_string()), Some(SnowflakeType::Date))
        }
        Value::Timestamp(unit, v) => {
            let micros = unit_to_micros(&unit, v);
            let rendered = DateTime::<Utc>::from_timestamp_micros(micros)
                .map_or_else(|| micros.to_string(), |dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string());
            (json_str(rendered), Some(SnowflakeType::TimestampNtz))
        }
        Value::Time64(unit, v) => {
            let micros = unit_to_micros(&unit, v);
            let secs = u32::try_from(micros / 1_000_000).unwrap_or(0);
            let nanos = u32::try_from((micros % 1_000_000) * 1_000).unwrap_or(0);
            let time = NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
                .unwrap_or(NaiveTime::MIN);
            (json_str(time.format("%H:%M:%S").to_string()), Some(SnowflakeType::Time))
        }
        other => (json_str(format!("{other:?}")), Some(SnowflakeType::Text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_rendering() {
        assert_eq!(render_value(Value::BigInt(2)).0, json_str("2"));
        assert_eq!(render_value(Value::Boolean(true)).0, json_str("true"));
        assert_eq!(render_value(Value::Null).0, serde_json::Value::Null);
        assert_eq!(
            render_value(Value::Text("A".into())).1,
            Some(SnowflakeType::Text)
        );
    }

    #[test]
    fn date_and_timestamp_rendering() {
        let (d, ty) = render_value(Value::Date32(19_723));
        assert_eq!(d, json_str("2024-01-01"));
        assert_eq!(ty, Some(SnowflakeType::Date));

        let (ts, ty) = render_value(Value::Timestamp(TimeUnit::Microsecond, 1_700_000_000_000_000));
        assert_eq!(ts, json_str("2023-11-14T22:13:20.000Z"));
        assert_eq!(ty, Some(SnowflakeType::TimestampNtz));
    }

    #[test]
    fn worker_round_trip() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let engine = EngineHandle::start(dir.path().join("t.duckdb")).unwrap();
            engine
                .batch("CREATE SCHEMA \"DB.PUBLIC\"; CREATE TABLE \"DB.PUBLIC\".\"T\" (ID BIGINT, NAME VARCHAR);".into())
                .await
                .unwrap();
            let n = engine
                .execute("INSERT INTO \"DB.PUBLIC\".\"T\" VALUES (1, 'A'), (2, 'B')".into())
                .await
                .unwrap();
            assert_eq!(n, 2);
            let out = engine
                .query("SELECT * FROM \"DB.PUBLIC\".\"T\" ORDER BY ID".into())
                .await
                .unwrap();
            assert_eq!(out.columns.len(), 2);
            assert_eq!(out.columns[0].name, "ID");
            assert_eq!(out.columns[0].type_, SnowflakeType::Fixed);
            assert_eq!(out.rows, vec![
                vec![json_str("1"), json_str("A")],
                vec![json_str("2"), json_str("B")],
            ]);
        });
    }

    #[test]
    fn engine_errors_carry_the_message() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let engine = EngineHandle::start(dir.path().join("t.duckdb")).unwrap();
            let err = engine.query("SELECT * FROM missing_table".into()).await.unwrap_err();
            assert_eq!(err.code(), "Engine");
        });
    }
}
