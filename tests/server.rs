//! End-to-end protocol tests against a live server on an ephemeral port.

use std::io::Write;

use serde_json::{json, Value};

use snowglobe::config::Config;
use snowglobe::executor::ExecEnv;
use snowglobe::logsink::LogSink;
use snowglobe::session::SessionContext;
use snowglobe::wire;

struct TestServer {
    base: String,
    client: reqwest::Client,
    // Dropped last; keeps the data dir alive for the server's lifetime.
    _dir: tempfile::TempDir,
}

async fn spawn_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let state = wire::build_state(&config, LogSink::default()).await.unwrap();
    let app = wire::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer {
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        _dir: dir,
    }
}

fn test_config(dir: &std::path::Path) -> Config {
    use clap::Parser;
    Config::parse_from([
        "snowglobe",
        "--data-dir",
        dir.to_str().unwrap(),
        "--query-deadline-seconds",
        "30",
    ])
}

impl TestServer {
    async fn login(&self) -> String {
        let body = json!({
            "data": {
                "LOGIN_NAME": "dev",
                "PASSWORD": "dev",
                "ACCOUNT_NAME": "localhost"
            }
        });
        let resp: Value = self
            .client
            .post(format!("{}/session/v1/login-request", self.base))
            .json(&body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["success"], true, "login failed: {resp}");
        resp["data"]["token"].as_str().unwrap().to_owned()
    }

    async fn query(&self, token: &str, sql: &str) -> Value {
        self.client
            .post(format!("{}/queries/v1/query-request", self.base))
            .header("Authorization", format!("Snowflake Token=\"{token}\""))
            .json(&json!({ "sqlText": sql, "sequenceId": 1 }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn query_ok(&self, token: &str, sql: &str) -> Value {
        let resp = self.query(token, sql).await;
        assert_eq!(resp["success"], true, "query `{sql}` failed: {resp}");
        resp["data"].clone()
    }
}

fn rowset(data: &Value) -> &Vec<Value> {
    data["rowset"].as_array().unwrap()
}

#[tokio::test]
async fn s1_login_yields_token_and_defaults() {
    let server = spawn_server().await;
    let body = json!({
        "data": { "LOGIN_NAME": "dev", "PASSWORD": "dev", "ACCOUNT_NAME": "localhost" }
    });
    let resp: Value = server
        .client
        .post(format!("{}/session/v1/login-request", server.base))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["success"], true);
    assert!(!resp["data"]["token"].as_str().unwrap().is_empty());
    assert!(!resp["data"]["masterToken"].as_str().unwrap().is_empty());
    assert_eq!(resp["data"]["sessionInfo"]["databaseName"], "SNOWGLOBE");
    assert_eq!(resp["data"]["sessionInfo"]["schemaName"], "PUBLIC");
    assert_eq!(resp["data"]["sessionInfo"]["warehouseName"], "COMPUTE_WH");
    assert_eq!(resp["data"]["sessionInfo"]["roleName"], "ACCOUNTADMIN");
}

#[tokio::test]
async fn s2_create_database_status_row() {
    let server = spawn_server().await;
    let token = server.login().await;
    let data = server.query_ok(&token, "CREATE DATABASE TESTDB").await;
    assert_eq!(data["rowtype"][0]["name"], "status");
    assert_eq!(
        rowset(&data)[0][0],
        "Database TESTDB successfully created."
    );
    assert_eq!(data["statementTypeId"], 8192);
}

#[tokio::test]
async fn s3_ddl_dml_select_round_trip() {
    let server = spawn_server().await;
    let token = server.login().await;
    server.query_ok(&token, "CREATE DATABASE TESTDB").await;
    server.query_ok(&token, "USE DATABASE TESTDB").await;
    server.query_ok(&token, "USE SCHEMA PUBLIC").await;
    server
        .query_ok(&token, "CREATE TABLE T (ID INT, NAME VARCHAR)")
        .await;
    let ins = server
        .query_ok(&token, "INSERT INTO T VALUES (1,'A'),(2,'B')")
        .await;
    assert_eq!(rowset(&ins)[0][0], "2");

    let sel = server.query_ok(&token, "SELECT * FROM T ORDER BY ID").await;
    assert_eq!(sel["rowtype"][0]["name"], "ID");
    assert_eq!(sel["rowtype"][0]["type"], "FIXED");
    assert_eq!(sel["rowtype"][1]["name"], "NAME");
    assert_eq!(sel["rowtype"][1]["type"], "TEXT");
    assert_eq!(rowset(&sel), &vec![json!(["1", "A"]), json!(["2", "B"])]);
    assert_eq!(sel["total"], 2);
}

#[tokio::test]
async fn s3_multi_statement_body() {
    let server = spawn_server().await;
    let token = server.login().await;
    let sel = server
        .query_ok(
            &token,
            "CREATE DATABASE M1; USE DATABASE M1; CREATE TABLE T (ID INT); \
             INSERT INTO T VALUES (7); SELECT * FROM T;",
        )
        .await;
    assert_eq!(rowset(&sel), &vec![json!(["7"])]);
}

#[tokio::test]
async fn s4_undrop_restores_data() {
    let server = spawn_server().await;
    let token = server.login().await;
    server.query_ok(&token, "CREATE DATABASE TESTDB").await;
    server.query_ok(&token, "USE DATABASE TESTDB").await;
    server
        .query_ok(&token, "CREATE TABLE T (ID INT, NAME VARCHAR)")
        .await;
    server
        .query_ok(&token, "INSERT INTO T VALUES (1,'A'),(2,'B')")
        .await;

    server.query_ok(&token, "DROP TABLE T").await;
    let dropped = server.query_ok(&token, "SHOW DROPPED TABLES").await;
    let names: Vec<&str> = rowset(&dropped)
        .iter()
        .map(|r| r[2].as_str().unwrap())
        .collect();
    assert!(names.contains(&"T"), "dropped tables: {names:?}");

    // While dropped, the table is invisible.
    let gone = server.query(&token, "SELECT * FROM T").await;
    assert_eq!(gone["success"], false);

    server.query_ok(&token, "UNDROP TABLE T").await;
    let count = server.query_ok(&token, "SELECT COUNT(*) FROM T").await;
    assert_eq!(rowset(&count)[0][0], "2");
}

#[tokio::test]
async fn s5_undrop_blocked_by_live_namesake() {
    let server = spawn_server().await;
    let token = server.login().await;
    server.query_ok(&token, "CREATE DATABASE TESTDB").await;
    server.query_ok(&token, "USE DATABASE TESTDB").await;
    server.query_ok(&token, "CREATE TABLE T (ID INT)").await;
    server.query_ok(&token, "DROP TABLE T").await;
    server.query_ok(&token, "CREATE TABLE T (ID INT)").await;

    let resp = server.query(&token, "UNDROP TABLE T").await;
    assert_eq!(resp["success"], false);
    assert_eq!(resp["code"], "NameInUse");
}

#[tokio::test]
async fn s6_clone_preserves_data() {
    let server = spawn_server().await;
    let token = server.login().await;
    server.query_ok(&token, "CREATE DATABASE TESTDB").await;
    server.query_ok(&token, "USE DATABASE TESTDB").await;
    server.query_ok(&token, "CREATE TABLE T (ID INT)").await;
    server
        .query_ok(&token, "INSERT INTO T VALUES (1),(2),(3)")
        .await;
    server.query_ok(&token, "CREATE TABLE T2 CLONE T").await;

    let a = server.query_ok(&token, "SELECT COUNT(*) FROM T").await;
    let b = server.query_ok(&token, "SELECT COUNT(*) FROM T2").await;
    assert_eq!(rowset(&a)[0][0], rowset(&b)[0][0]);
    assert_eq!(rowset(&b)[0][0], "3");

    // The clone is independent of the source.
    server.query_ok(&token, "INSERT INTO T VALUES (4)").await;
    let b2 = server.query_ok(&token, "SELECT COUNT(*) FROM T2").await;
    assert_eq!(rowset(&b2)[0][0], "3");
}

#[tokio::test]
async fn s7_restart_preserves_catalog_and_data() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    {
        let state = wire::build_state(&config, LogSink::default()).await.unwrap();
        let env = ExecEnv {
            session_id: "test".into(),
            user: "dev".into(),
        };
        let mut ctx = SessionContext::default();
        for sql in [
            "CREATE DATABASE TESTDB",
            "USE DATABASE TESTDB",
            "CREATE TABLE T (ID INT, NAME VARCHAR)",
            "INSERT INTO T VALUES (1,'A'),(2,'B')",
        ] {
            state.dispatcher.execute(&env, &mut ctx, sql).await.unwrap();
        }
    }
    // The engine worker releases the database file once every handle is
    // gone; reopening may need a moment.
    let state = {
        let mut attempt = 0;
        loop {
            match wire::build_state(&config, LogSink::default()).await {
                Ok(s) => break s,
                Err(e) if attempt < 20 => {
                    attempt += 1;
                    let _ = e;
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                Err(e) => panic!("restart failed: {e}"),
            }
        }
    };
    let env = ExecEnv {
        session_id: "test2".into(),
        user: "dev".into(),
    };
    let mut ctx = SessionContext::default();
    let data = state
        .dispatcher
        .execute(&env, &mut ctx, "SELECT COUNT(*) FROM TESTDB.PUBLIC.T")
        .await
        .unwrap();
    assert_eq!(data.rowset[0][0], json!("2"));
}

#[tokio::test]
async fn login_query_close_round_trip() {
    let server = spawn_server().await;
    let token = server.login().await;
    server.query_ok(&token, "SELECT 1").await;

    let close: Value = server
        .client
        .post(format!("{}/session", server.base))
        .header("Authorization", format!("Snowflake Token=\"{token}\""))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(close["success"], true);

    let resp = server
        .client
        .post(format!("{}/queries/v1/query-request", server.base))
        .header("Authorization", format!("Snowflake Token=\"{token}\""))
        .json(&json!({ "sqlText": "SELECT 1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "Unauthenticated");
}

#[tokio::test]
async fn token_renew_invalidates_old_token() {
    let server = spawn_server().await;
    let token = server.login().await;

    let resp: Value = server
        .client
        .post(format!("{}/session/token-request", server.base))
        .json(&json!({ "oldSessionToken": token, "requestType": "RENEW" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["success"], true);
    let new_token = resp["data"]["sessionToken"].as_str().unwrap().to_owned();

    let old = server.query(&token, "SELECT 1").await;
    assert_eq!(old["success"], false);
    server.query_ok(&new_token, "SELECT 1").await;
}

#[tokio::test]
async fn name_folding_and_quoted_identifiers() {
    let server = spawn_server().await;
    let token = server.login().await;
    server.query_ok(&token, "CREATE TABLE t (ID INT)").await;
    server.query_ok(&token, "INSERT INTO T VALUES (1)").await;

    // Unquoted lower-case and quoted upper-case resolve to the same object.
    let a = server.query_ok(&token, "SELECT * FROM t").await;
    let b = server.query_ok(&token, "SELECT * FROM \"T\"").await;
    assert_eq!(rowset(&a), rowset(&b));

    // Quoted lower-case is a different object.
    let missing = server.query(&token, "SELECT * FROM \"t\"").await;
    assert_eq!(missing["success"], false);
}

#[tokio::test]
async fn statement_type_codes_match_the_table() {
    let server = spawn_server().await;
    let token = server.login().await;
    server.query_ok(&token, "CREATE DATABASE CODES").await;
    server.query_ok(&token, "USE DATABASE CODES").await;

    for (sql, code) in [
        ("CREATE TABLE C (ID INT)", 8192),
        ("INSERT INTO C VALUES (1)", 32768),
        ("UPDATE C SET ID = 2", 65536),
        ("SELECT * FROM C", 4096),
        ("DELETE FROM C", 131_072),
        ("TRUNCATE TABLE C", 524_288),
        ("ALTER SESSION SET TZ='UTC'", 262_144),
        ("USE SCHEMA PUBLIC", 1_048_576),
        ("SHOW TABLES", 2_097_152),
        ("DROP TABLE C", 16384),
    ] {
        let data = server.query_ok(&token, sql).await;
        assert_eq!(data["statementTypeId"], code, "for `{sql}`");
    }
}

#[tokio::test]
async fn gzip_request_body_is_transparent() {
    let server = spawn_server().await;
    let token = server.login().await;

    let payload = serde_json::to_vec(&json!({ "sqlText": "SELECT 1" })).unwrap();
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&payload).unwrap();
    let compressed = encoder.finish().unwrap();

    let resp: Value = server
        .client
        .post(format!("{}/queries/v1/query-request", server.base))
        .header("Authorization", format!("Snowflake Token=\"{token}\""))
        .header("Content-Type", "application/json")
        .header("Content-Encoding", "gzip")
        .body(compressed)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["success"], true, "gzip body rejected: {resp}");
    assert_eq!(resp["data"]["rowset"][0][0], "1");
}

#[tokio::test]
async fn views_are_created_lazily_and_survive_restarts_of_interest() {
    let server = spawn_server().await;
    let token = server.login().await;
    server.query_ok(&token, "CREATE TABLE B (ID INT)").await;
    server.query_ok(&token, "INSERT INTO B VALUES (1),(2)").await;
    server
        .query_ok(&token, "CREATE VIEW V AS SELECT ID * 2 AS D FROM B")
        .await;
    let sel = server.query_ok(&token, "SELECT * FROM V ORDER BY D").await;
    assert_eq!(rowset(&sel), &vec![json!(["2"]), json!(["4"])]);

    server.query_ok(&token, "DROP VIEW V").await;
    let gone = server.query(&token, "SELECT * FROM V").await;
    assert_eq!(gone["success"], false);
    server.query_ok(&token, "UNDROP VIEW V").await;
    let back = server.query_ok(&token, "SELECT COUNT(*) FROM V").await;
    assert_eq!(rowset(&back)[0][0], "2");
}

#[tokio::test]
async fn translated_dialect_executes() {
    let server = spawn_server().await;
    let token = server.login().await;
    server
        .query_ok(&token, "CREATE TABLE D (A INT, B VARCHAR)")
        .await;
    server
        .query_ok(&token, "INSERT INTO D VALUES (1, NULL), (NULL, 'x')")
        .await;
    let sel = server
        .query_ok(
            &token,
            "SELECT IFF(A IS NULL, 'no-a', 'has-a'), NVL(B, 'none') FROM D ORDER BY A",
        )
        .await;
    assert_eq!(rowset(&sel)[0], json!(["has-a", "none"]));
    assert_eq!(rowset(&sel)[1], json!(["no-a", "x"]));
}

#[tokio::test]
async fn current_constants_reflect_session_context() {
    let server = spawn_server().await;
    let token = server.login().await;
    let db = server.query_ok(&token, "SELECT CURRENT_DATABASE()").await;
    assert_eq!(rowset(&db)[0][0], "SNOWGLOBE");
    let role = server.query_ok(&token, "SELECT CURRENT_ROLE()").await;
    assert_eq!(rowset(&role)[0][0], "ACCOUNTADMIN");

    server.query_ok(&token, "CREATE DATABASE CTXDB").await;
    server.query_ok(&token, "USE DATABASE CTXDB").await;
    let db2 = server.query_ok(&token, "SELECT CURRENT_DATABASE()").await;
    assert_eq!(rowset(&db2)[0][0], "CTXDB");
}

#[tokio::test]
async fn concurrent_sessions_keep_catalog_consistent() {
    let server = spawn_server().await;
    let setup = server.login().await;
    server.query_ok(&setup, "CREATE DATABASE CONC").await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let base = server.base.clone();
        let client = server.client.clone();
        handles.push(tokio::spawn(async move {
            let login: Value = client
                .post(format!("{base}/session/v1/login-request"))
                .json(&json!({ "data": { "LOGIN_NAME": format!("user{i}") } }))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            let token = login["data"]["token"].as_str().unwrap().to_owned();
            let run = |sql: String| {
                let client = client.clone();
                let base = base.clone();
                let token = token.clone();
                async move {
                    let v: Value = client
                        .post(format!("{base}/queries/v1/query-request"))
                        .header("Authorization", format!("Snowflake Token=\"{token}\""))
                        .json(&json!({ "sqlText": sql }))
                        .send()
                        .await
                        .unwrap()
                        .json()
                        .await
                        .unwrap();
                    v
                }
            };
            let t = format!("CONC.PUBLIC.T{i}");
            assert_eq!(run(format!("CREATE TABLE {t} (ID INT)")).await["success"], true);
            assert_eq!(run(format!("INSERT INTO {t} VALUES ({i})")).await["success"], true);
            assert_eq!(run(format!("SELECT * FROM {t}")).await["success"], true);
            if i % 2 == 0 {
                assert_eq!(run(format!("DROP TABLE {t}")).await["success"], true);
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let show = server.query_ok(&setup, "SHOW TABLES IN DATABASE CONC").await;
    let names: Vec<&str> = rowset(&show).iter().map(|r| r[1].as_str().unwrap()).collect();
    let mut unique = names.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(names.len(), unique.len(), "duplicate live names: {names:?}");
    assert_eq!(names.len(), 4, "odd-numbered tables survive: {names:?}");
}

#[tokio::test]
async fn operator_surface_exposes_state() {
    let server = spawn_server().await;
    let token = server.login().await;
    server.query_ok(&token, "SELECT 1").await;

    let stats: Value = server
        .client
        .get(format!("{}/api/stats", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["success"], true);
    assert!(stats["data"]["total_queries"].as_u64().unwrap() >= 1);
    assert_eq!(stats["data"]["active_sessions"], 1);

    let sessions: Value = server
        .client
        .get(format!("{}/api/sessions", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let suffix = sessions["data"][0]["token_suffix"].as_str().unwrap();
    assert_eq!(suffix.len(), 8);
    assert!(token.ends_with(suffix));

    let queries: Value = server
        .client
        .get(format!("{}/api/queries?limit=5", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(!queries["data"].as_array().unwrap().is_empty());

    let dbs: Value = server
        .client
        .get(format!("{}/api/databases", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = dbs["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"SNOWGLOBE"));

    let health: Value = server
        .client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["data"]["status"], "ok");
    assert_eq!(health["data"]["engine"], "duckdb");
}

#[tokio::test]
async fn api_execute_without_token() {
    let server = spawn_server().await;
    let resp: Value = server
        .client
        .post(format!("{}/api/execute", server.base))
        .json(&json!({ "sql": "SELECT CURRENT_VERSION()" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["success"], true);
    assert!(!resp["data"]["rowset"][0][0].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn abort_is_acknowledged() {
    let server = spawn_server().await;
    let token = server.login().await;
    let resp: Value = server
        .client
        .post(format!("{}/queries/v1/abort-request", server.base))
        .header("Authorization", format!("Snowflake Token=\"{token}\""))
        .json(&json!({ "requestId": "r1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["success"], true);
}

#[tokio::test]
async fn engine_errors_surface_with_prefix() {
    let server = spawn_server().await;
    let token = server.login().await;
    let resp = server.query(&token, "SELECT * FROM NOT_A_TABLE").await;
    assert_eq!(resp["success"], false);
    assert_eq!(resp["code"], "Engine");
    assert!(resp["message"].as_str().unwrap().starts_with("Engine:"));
}

#[tokio::test]
async fn create_or_replace_tombstones_the_replaced_table() {
    let server = spawn_server().await;
    let token = server.login().await;
    server.query_ok(&token, "CREATE TABLE R (ID INT)").await;
    server.query_ok(&token, "INSERT INTO R VALUES (1)").await;
    server
        .query_ok(&token, "CREATE OR REPLACE TABLE R (ID INT, X INT)")
        .await;

    let dropped = server.query_ok(&token, "SHOW DROPPED TABLES").await;
    let names: Vec<&str> = rowset(&dropped)
        .iter()
        .map(|r| r[2].as_str().unwrap())
        .collect();
    assert!(names.contains(&"R"), "dropped tables: {names:?}");

    // The replacement is live and empty; the tombstone blocks UNDROP.
    let count = server.query_ok(&token, "SELECT COUNT(*) FROM R").await;
    assert_eq!(rowset(&count)[0][0], "0");
    let undrop = server.query(&token, "UNDROP TABLE R").await;
    assert_eq!(undrop["code"], "NameInUse");
}
