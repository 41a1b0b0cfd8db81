//! Scriptable in-process engine for exercising the pool and executor without
//! a database server.
//!
//! Understands just enough SQL for replication (`CREATE TABLE`, `INSERT`,
//! `SELECT * FROM`) and otherwise answers with canned results.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use regex::Regex;

use pgrquery::db::{Connection, Connector, PlaceholderStyle, RawResult};
use pgrquery::{EngineError, EngineErrorKind, Value};

#[derive(Debug, Clone, Default)]
pub struct FakeTable {
    pub columns: Vec<(String, String)>,
    pub rows: Vec<Vec<Value>>,
}

type Tables = IndexMap<String, FakeTable>;

#[derive(Default)]
struct EngineState {
    tables: Tables,
    failures: VecDeque<EngineError>,
    canned: Vec<(String, RawResult)>,
    unreadable: HashSet<String>,
    log: Vec<String>,
    query_delay: Option<Duration>,
    fail_connect: bool,
    fail_list_tables: bool,
}

/// Shared handle to one fake database.
#[derive(Clone, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<EngineState>>,
    queries: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }

    pub fn add_table(&self, name: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        self.state().tables.insert(
            name.to_string(),
            FakeTable {
                columns: columns
                    .iter()
                    .map(|c| (c.to_string(), "VARCHAR".to_string()))
                    .collect(),
                rows,
            },
        );
    }

    /// Listed by the engine, but `SELECT` on it fails.
    pub fn add_unreadable_table(&self, name: &str) {
        self.add_table(name, &["x"], Vec::new());
        self.state().unreadable.insert(name.to_string());
    }

    /// The next `count` queries fail with `kind`.
    pub fn fail_next(&self, count: usize, kind: EngineErrorKind, message: &str) {
        let mut state = self.state();
        for _ in 0..count {
            state.failures.push_back(EngineError::new(kind, message));
        }
    }

    /// Answer any query containing `fragment` with `result`.
    pub fn respond(&self, fragment: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        self.state().canned.push((
            fragment.to_string(),
            RawResult {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
            },
        ));
    }

    pub fn set_query_delay(&self, delay: Duration) {
        self.state().query_delay = Some(delay);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    /// Make table listing fail on every connection.
    pub fn set_fail_list_tables(&self, fail: bool) {
        self.state().fail_list_tables = fail;
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Every statement received, across all connections, in arrival order.
    pub fn log(&self) -> Vec<String> {
        self.state().log.clone()
    }
}

pub struct FakeConnector {
    pub engine: FakeEngine,
    pub in_memory: bool,
    pub style: PlaceholderStyle,
}

impl FakeConnector {
    pub fn shared(engine: &FakeEngine) -> Self {
        Self {
            engine: engine.clone(),
            in_memory: false,
            style: PlaceholderStyle::Dollar,
        }
    }

    /// Every connection gets its own empty database.
    pub fn in_memory(engine: &FakeEngine) -> Self {
        Self {
            engine: engine.clone(),
            in_memory: true,
            style: PlaceholderStyle::Question,
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Conn = FakeConnection;

    async fn connect(&self) -> Result<FakeConnection, EngineError> {
        if self.engine.state().fail_connect {
            return Err(EngineError::new(
                EngineErrorKind::Connection,
                "connection refused",
            ));
        }
        self.engine.connects.fetch_add(1, Ordering::SeqCst);
        Ok(FakeConnection {
            engine: self.engine.clone(),
            private: self.in_memory.then(Tables::new),
        })
    }

    fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        self.style
    }

    fn describe(&self) -> String {
        if self.in_memory {
            "fake://memory".to_string()
        } else {
            "fake://shared".to_string()
        }
    }
}

pub struct FakeConnection {
    engine: FakeEngine,
    private: Option<Tables>,
}

impl FakeConnection {
    /// A connection to the shared database, usable as a replication origin.
    pub fn origin(engine: &FakeEngine) -> Self {
        Self {
            engine: engine.clone(),
            private: None,
        }
    }

    fn run(&mut self, sql: &str, params: &[Value]) -> Result<RawResult, EngineError> {
        let mut state = self.engine.state();
        state.log.push(sql.to_string());

        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }

        if let Some(caps) = create_re().captures(sql) {
            let columns = column_def_re()
                .captures_iter(&caps[2])
                .map(|c| (c[1].to_string(), c[2].to_string()))
                .collect();
            let tables = self.private.as_mut().unwrap_or(&mut state.tables);
            tables.entry(caps[1].to_string()).or_insert(FakeTable {
                columns,
                rows: Vec::new(),
            });
            return Ok(RawResult::default());
        }

        if let Some(caps) = insert_re().captures(sql) {
            let name = caps[1].to_string();
            let tables = self.private.as_mut().unwrap_or(&mut state.tables);
            let table = tables.get_mut(&name).ok_or_else(|| missing_table(&name))?;
            table.rows.push(params.to_vec());
            return Ok(RawResult::default());
        }

        if let Some(caps) = select_all_re().captures(sql) {
            let name = caps[1].to_string();
            if state.unreadable.contains(&name) {
                return Err(EngineError::new(
                    EngineErrorKind::Other,
                    format!("permission denied for table {}", name),
                ));
            }
            let tables = self.private.as_ref().unwrap_or(&state.tables);
            let table = tables.get(&name).ok_or_else(|| missing_table(&name))?;
            return Ok(RawResult {
                columns: table.columns.iter().map(|(c, _)| c.clone()).collect(),
                rows: table.rows.clone(),
            });
        }

        Ok(state
            .canned
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_default())
    }

    pub fn tables(&self) -> Vec<String> {
        match &self.private {
            Some(tables) => tables.keys().cloned().collect(),
            None => self.engine.state().tables.keys().cloned().collect(),
        }
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<RawResult, EngineError> {
        self.engine.queries.fetch_add(1, Ordering::SeqCst);
        let delay = self.engine.state().query_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.run(sql, params)
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, EngineError> {
        self.run(sql, params).map(|r| r.row_count() as u64)
    }

    async fn list_tables(&mut self) -> Result<Vec<String>, EngineError> {
        if self.engine.state().fail_list_tables {
            return Err(EngineError::new(
                EngineErrorKind::Other,
                "permission denied for schema main",
            ));
        }
        Ok(self.tables())
    }

    async fn ping(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

fn missing_table(name: &str) -> EngineError {
    EngineError::new(
        EngineErrorKind::UndefinedTable,
        format!("relation \"{}\" does not exist", name),
    )
}

fn create_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^CREATE TABLE IF NOT EXISTS "([^"]+)" \((.*)\)$"#).unwrap()
    })
}

fn column_def_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""([^"]+)" ([A-Z]+(?:\[\])?)"#).unwrap())
}

fn insert_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^INSERT INTO "([^"]+)""#).unwrap())
}

fn select_all_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^SELECT \* FROM "([^"]+)"$"#).unwrap())
}

/// Route `tracing` output to the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
