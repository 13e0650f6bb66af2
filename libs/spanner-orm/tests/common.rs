#![allow(clippy::unwrap_used, clippy::expect_used)]
#![allow(dead_code)]
//! In-memory stand-in for the Spanner client.
//!
//! Tables are maps keyed by primary key. DML and queries are interpreted with
//! the crate's own statement recognizer; mutations are buffered per
//! transaction and applied on commit. Every call is recorded.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sea_orm::Value;
use spanner_orm::sql_shape::{self, Operand, Predicate, Projection, SqlLiteral, StatementShape};
use spanner_orm::{
    BatchingConfig, ClientError, ColumnValue, DmlStatement, EntityMapping, FixedColumn, Mutation,
    ReadContext, Row, SpannerClient, SpannerSession, TimestampBound, TransactionHandle,
    TransactionId, TransactionMode, TransactionOptions, WriteKind,
};

/// Value stored for `PENDING_COMMIT_TIMESTAMP()`.
pub const COMMIT_TIMESTAMP: &str = "spanner.commit_timestamp()";

pub type Record = BTreeMap<String, Value>;
type Table = BTreeMap<String, Record>;
type Tables = HashMap<String, Table>;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Begin {
        tag: Option<String>,
        retry_aborts: bool,
        read_only: bool,
    },
    Commit {
        tx: TransactionId,
        retry_aborts: bool,
    },
    RetryAfterAbort {
        tx: TransactionId,
    },
    Rollback {
        tx: TransactionId,
    },
    ExecuteDml {
        sql: String,
    },
    ExecuteBatchDml {
        sql: Vec<String>,
    },
    BufferMutation(Mutation),
    Query {
        sql: String,
        single_use: Option<TimestampBound>,
    },
}

struct TxState {
    read_only: bool,
    working: Tables,
    touched: HashSet<(String, String)>,
    mutations: Vec<Mutation>,
}

#[derive(Default)]
struct State {
    keys: HashMap<String, Vec<String>>,
    committed: Tables,
    open: HashMap<TransactionId, TxState>,
    calls: Vec<Call>,
    pending_aborts: u32,
    fail_next_dml: Option<ClientError>,
}

#[derive(Default)]
pub struct InMemorySpanner {
    state: Mutex<State>,
}

impl InMemorySpanner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create_table(&self, name: &str, key_columns: &[&str]) {
        let mut st = self.state.lock();
        st.keys.insert(
            name.to_ascii_lowercase(),
            key_columns.iter().map(|k| k.to_ascii_lowercase()).collect(),
        );
        st.committed.entry(name.to_ascii_lowercase()).or_default();
    }

    /// Write a row outside any transaction, as a concurrent writer would.
    pub fn put_row(&self, table: &str, values: &[(&str, Value)]) {
        let mut st = self.state.lock();
        let rec: Record = values
            .iter()
            .map(|(c, v)| (c.to_ascii_lowercase(), v.clone()))
            .collect();
        let table = table.to_ascii_lowercase();
        let key = record_key(keys_for(&st.keys, &table).unwrap(), &rec).unwrap();
        st.committed.entry(table).or_default().insert(key, rec);
    }

    pub fn row(&self, table: &str, key: &[Value]) -> Option<Record> {
        let st = self.state.lock();
        let key = key_string(&key.iter().collect::<Vec<_>>());
        st.committed
            .get(&table.to_ascii_lowercase())
            .and_then(|t| t.get(&key))
            .cloned()
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        let st = self.state.lock();
        st.committed
            .get(&table.to_ascii_lowercase())
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn mutations_sent(&self) -> usize {
        self.count(|c| matches!(c, Call::BufferMutation(_)))
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn open_transactions(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Abort the next `n` commits. With internal retries enabled the client
    /// retries transparently; otherwise the commit fails with `Aborted`.
    pub fn abort_next_commits(&self, n: u32) {
        self.state.lock().pending_aborts = n;
    }

    pub fn fail_next_dml(&self, err: ClientError) {
        self.state.lock().fail_next_dml = Some(err);
    }
}

fn keys_for<'k>(keys: &'k HashMap<String, Vec<String>>, table: &str) -> Result<&'k [String], ClientError> {
    keys.get(table)
        .map(Vec::as_slice)
        .ok_or_else(|| ClientError::NotFound(format!("table '{table}'")))
}

fn key_string(values: &[&Value]) -> String {
    format!("{values:?}")
}

fn record_key(keys: &[String], rec: &Record) -> Result<String, ClientError> {
    let values = keys
        .iter()
        .map(|k| {
            rec.get(k)
                .ok_or_else(|| ClientError::FailedPrecondition(format!("missing key column '{k}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(key_string(&values))
}

fn literal_value(lit: &SqlLiteral) -> Option<Value> {
    match lit {
        SqlLiteral::Null => None,
        SqlLiteral::Bool(b) => Some(Value::from(*b)),
        SqlLiteral::Integer(i) => Some(Value::from(*i)),
        SqlLiteral::Float(f) => f.parse::<f64>().ok().map(Value::from),
        SqlLiteral::String(s) => Some(Value::from(s.clone())),
        SqlLiteral::PendingCommitTimestamp => Some(Value::from(COMMIT_TIMESTAMP)),
    }
}

fn bound(stmt: &DmlStatement) -> Result<Vec<Value>, ClientError> {
    stmt.bound_params()
        .map_err(|i| ClientError::FailedPrecondition(format!("parameter {i} is not bound")))
}

fn operand_value(op: &Operand, params: &[Value]) -> Result<Option<Value>, ClientError> {
    match op {
        Operand::Param(i) => params
            .get(*i)
            .cloned()
            .map(Some)
            .ok_or_else(|| ClientError::FailedPrecondition(format!("no parameter {i}"))),
        Operand::Literal(lit) => Ok(literal_value(lit)),
    }
}

fn matches(rec: &Record, predicates: &[Predicate], params: &[Value]) -> Result<bool, ClientError> {
    for p in predicates {
        let stored = rec.get(&p.column().to_ascii_lowercase());
        let ok = match p {
            Predicate::IsNull { .. } => stored.is_none(),
            Predicate::Eq { value, .. } => match operand_value(value, params)? {
                Some(v) => stored == Some(&v),
                None => false,
            },
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn parse(sql: &str) -> Result<StatementShape, ClientError> {
    sql_shape::parse(sql).map_err(|e| ClientError::Permanent(format!("syntax error: {e}")))
}

fn exec_dml(
    tables: &mut Tables,
    keys: &HashMap<String, Vec<String>>,
    touched: &mut HashSet<(String, String)>,
    stmt: &DmlStatement,
) -> Result<i64, ClientError> {
    let params = bound(stmt)?;
    match parse(&stmt.sql)? {
        StatementShape::Insert {
            table,
            columns,
            values,
        } => {
            let table = table.to_ascii_lowercase();
            let mut rec = Record::new();
            for (c, v) in columns.iter().zip(&values) {
                if let Some(v) = operand_value(v, &params)? {
                    rec.insert(c.to_ascii_lowercase(), v);
                }
            }
            let key = record_key(keys_for(keys, &table)?, &rec)?;
            let t = tables.entry(table.clone()).or_default();
            if t.contains_key(&key) {
                return Err(ClientError::AlreadyExists(format!("{table} {key}")));
            }
            t.insert(key.clone(), rec);
            touched.insert((table, key));
            Ok(1)
        }
        StatementShape::Update {
            table,
            assignments,
            predicates,
        } => {
            let table = table.to_ascii_lowercase();
            keys_for(keys, &table)?;
            let mut n = 0;
            for (key, rec) in tables.entry(table.clone()).or_default() {
                if !matches(rec, &predicates, &params)? {
                    continue;
                }
                for a in &assignments {
                    let column = a.column.to_ascii_lowercase();
                    match operand_value(&a.value, &params)? {
                        Some(v) => rec.insert(column, v),
                        None => rec.remove(&column),
                    };
                }
                touched.insert((table.clone(), key.clone()));
                n += 1;
            }
            Ok(n)
        }
        StatementShape::Delete { table, predicates } => {
            let table = table.to_ascii_lowercase();
            keys_for(keys, &table)?;
            let t = tables.entry(table.clone()).or_default();
            let mut doomed = Vec::new();
            for (key, rec) in &*t {
                if matches(rec, &predicates, &params)? {
                    doomed.push(key.clone());
                }
            }
            for key in &doomed {
                t.remove(key);
                touched.insert((table.clone(), key.clone()));
            }
            Ok(i64::try_from(doomed.len()).unwrap())
        }
        StatementShape::Select { .. } => Err(ClientError::Permanent(
            "SELECT is not a DML statement".to_owned(),
        )),
    }
}

fn run_query(tables: &Tables, stmt: &DmlStatement) -> Result<Vec<Row>, ClientError> {
    let params = bound(stmt)?;
    let StatementShape::Select {
        table,
        projection,
        predicates,
    } = parse(&stmt.sql)?
    else {
        return Err(ClientError::Permanent("expected a SELECT".to_owned()));
    };
    let Some(t) = tables.get(&table.to_ascii_lowercase()) else {
        return Err(ClientError::NotFound(format!("table '{table}'")));
    };
    let mut out = Vec::new();
    for rec in t.values() {
        if !matches(rec, &predicates, &params)? {
            continue;
        }
        out.push(match &projection {
            Projection::Exists => vec![Value::from(1_i64)],
            Projection::All => rec.values().cloned().collect(),
            Projection::Columns(cols) => cols
                .iter()
                .map(|c| {
                    rec.get(&c.to_ascii_lowercase())
                        .cloned()
                        .unwrap_or(Value::String(None))
                })
                .collect(),
        });
    }
    Ok(out)
}

fn apply_mutation(
    tables: &mut Tables,
    keys: &HashMap<String, Vec<String>>,
    m: &Mutation,
) -> Result<(), ClientError> {
    let table = m.table.to_ascii_lowercase();
    let mut rec = Record::new();
    for (c, v) in m.columns.iter().zip(&m.values) {
        let v = match v {
            ColumnValue::Value(v) => v.clone(),
            ColumnValue::Null => continue,
            ColumnValue::PendingCommitTimestamp => Value::from(COMMIT_TIMESTAMP),
        };
        rec.insert(c.to_ascii_lowercase(), v);
    }
    let key = record_key(keys_for(keys, &table)?, &rec)?;
    let t = tables.entry(table.clone()).or_default();
    match m.op {
        WriteKind::Insert => {
            if t.contains_key(&key) {
                return Err(ClientError::AlreadyExists(format!("{table} {key}")));
            }
            t.insert(key, rec);
        }
        WriteKind::Update => {
            let Some(existing) = t.get_mut(&key) else {
                return Err(ClientError::NotFound(format!("{table} {key}")));
            };
            // Null columns in an update clear the stored value.
            for (c, v) in m.columns.iter().zip(&m.values) {
                if *v == ColumnValue::Null {
                    existing.remove(&c.to_ascii_lowercase());
                }
            }
            existing.extend(rec);
        }
        WriteKind::Delete => {
            t.remove(&key);
        }
    }
    Ok(())
}

#[async_trait]
impl SpannerClient for InMemorySpanner {
    async fn begin_transaction(
        &self,
        options: &TransactionOptions,
    ) -> Result<TransactionId, ClientError> {
        let mut st = self.state.lock();
        let read_only = matches!(options.mode, TransactionMode::ReadOnly(_));
        st.calls.push(Call::Begin {
            tag: options.tag.clone(),
            retry_aborts: options.retry_aborts,
            read_only,
        });
        let id = TransactionId::new_v4();
        let working = st.committed.clone();
        st.open.insert(
            id,
            TxState {
                read_only,
                working,
                touched: HashSet::new(),
                mutations: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn commit(&self, tx: &TransactionHandle) -> Result<(), ClientError> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.calls.push(Call::Commit {
            tx: tx.id(),
            retry_aborts: tx.retries_enabled(),
        });
        if st.pending_aborts > 0 {
            st.pending_aborts -= 1;
            if !tx.retries_enabled() {
                st.open.remove(&tx.id());
                return Err(ClientError::Aborted(format!("transaction {} aborted", tx.id())));
            }
            st.calls.push(Call::RetryAfterAbort { tx: tx.id() });
        }
        let Some(txs) = st.open.remove(&tx.id()) else {
            return Err(ClientError::FailedPrecondition(format!(
                "transaction {} is not open",
                tx.id()
            )));
        };
        let mut next = st.committed.clone();
        for (table, key) in &txs.touched {
            match txs.working.get(table).and_then(|t| t.get(key)) {
                Some(rec) => {
                    next.entry(table.clone())
                        .or_default()
                        .insert(key.clone(), rec.clone());
                }
                None => {
                    if let Some(t) = next.get_mut(table) {
                        t.remove(key);
                    }
                }
            }
        }
        for m in &txs.mutations {
            apply_mutation(&mut next, &st.keys, m)?;
        }
        st.committed = next;
        Ok(())
    }

    async fn rollback(&self, tx: &TransactionHandle) -> Result<(), ClientError> {
        let mut st = self.state.lock();
        st.calls.push(Call::Rollback { tx: tx.id() });
        st.open.remove(&tx.id());
        Ok(())
    }

    async fn execute_dml(
        &self,
        tx: &TransactionHandle,
        stmt: &DmlStatement,
    ) -> Result<i64, ClientError> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.calls.push(Call::ExecuteDml {
            sql: stmt.sql.clone(),
        });
        if let Some(err) = st.fail_next_dml.take() {
            return Err(err);
        }
        let txs = open_tx(&mut st.open, tx)?;
        exec_dml(&mut txs.working, &st.keys, &mut txs.touched, stmt)
    }

    async fn execute_batch_dml(
        &self,
        tx: &TransactionHandle,
        stmts: &[DmlStatement],
    ) -> Result<Vec<i64>, ClientError> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.calls.push(Call::ExecuteBatchDml {
            sql: stmts.iter().map(|s| s.sql.clone()).collect(),
        });
        if let Some(err) = st.fail_next_dml.take() {
            return Err(err);
        }
        let txs = open_tx(&mut st.open, tx)?;
        stmts
            .iter()
            .map(|s| exec_dml(&mut txs.working, &st.keys, &mut txs.touched, s))
            .collect()
    }

    async fn buffer_mutation(
        &self,
        tx: &TransactionHandle,
        mutation: &Mutation,
    ) -> Result<(), ClientError> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.calls.push(Call::BufferMutation(mutation.clone()));
        let txs = open_tx(&mut st.open, tx)?;
        txs.mutations.push(mutation.clone());
        Ok(())
    }

    async fn query(
        &self,
        ctx: ReadContext<'_>,
        stmt: &DmlStatement,
    ) -> Result<Vec<Row>, ClientError> {
        let mut st = self.state.lock();
        match ctx {
            ReadContext::Transaction(tx) => {
                st.calls.push(Call::Query {
                    sql: stmt.sql.clone(),
                    single_use: None,
                });
                let txs = st
                    .open
                    .get(&tx.id())
                    .ok_or_else(|| ClientError::FailedPrecondition("transaction is not open".to_owned()))?;
                run_query(&txs.working, stmt)
            }
            ReadContext::SingleUse(bound) => {
                st.calls.push(Call::Query {
                    sql: stmt.sql.clone(),
                    single_use: Some(bound),
                });
                run_query(&st.committed, stmt)
            }
        }
    }
}

fn open_tx<'s>(
    open: &'s mut HashMap<TransactionId, TxState>,
    tx: &TransactionHandle,
) -> Result<&'s mut TxState, ClientError> {
    let txs = open
        .get_mut(&tx.id())
        .ok_or_else(|| ClientError::FailedPrecondition(format!("transaction {} is not open", tx.id())))?;
    if txs.read_only {
        return Err(ClientError::FailedPrecondition(
            "read-only transactions cannot write".to_owned(),
        ));
    }
    Ok(txs)
}

/// `Singers(SingerId, FirstName, LastName, Version, LastUpdated)`.
pub fn singers() -> EntityMapping {
    EntityMapping::new("Singers")
        .key("SingerId")
        .column("FirstName")
        .column("LastName")
        .version("Version")
        .fixed(FixedColumn::commit_timestamp("LastUpdated"))
}

/// `Albums(AlbumId, Title)`: no version column.
pub fn albums() -> EntityMapping {
    EntityMapping::new("Albums").key("AlbumId").column("Title")
}

pub fn spanner() -> Arc<InMemorySpanner> {
    let client = InMemorySpanner::new();
    client.create_table("Singers", &["SingerId"]);
    client.create_table("Albums", &["AlbumId"]);
    client
}

pub fn session(
    client: &Arc<InMemorySpanner>,
    config: BatchingConfig,
) -> SpannerSession<InMemorySpanner> {
    SpannerSession::new(Arc::clone(client), config).unwrap()
}
