//! Script-facing SQL handle
//!
//! `sql::open(driver, dsn, opts)` yields a chainable handle. Chainable
//! verbs mutate the accumulated builder state and return the handle;
//! terminal verbs snapshot-and-reset the state, run on the pool (or the
//! transaction connection) and bridge rows back as maps keyed by column
//! name. Transactions wrap a script callback: commit on normal return,
//! rollback on script error, rollback-and-rethrow on panic.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rhai::{Array, Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Map, Module, NativeCallContext};
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Column, Row, TypeInfo, ValueRef};
use tokio::time::timeout;

use crate::error::{Error, ErrorKind, Result};
use crate::interp::kit;
use crate::sql::builder::{rewrite_placeholders, BuilderState, Driver, SqlArg};
use crate::sql::registry::{self, RegistryKey};

struct TxShared {
    conn: tokio::sync::Mutex<Option<PoolConnection<Any>>>,
    finished: AtomicBool,
}

enum Executor {
    Pool(AnyPool),
    Tx(Arc<TxShared>),
}

struct DbInner {
    executor: Executor,
    driver: Driver,
    shared_key: Option<RegistryKey>,
    state: Mutex<BuilderState>,
    closed: AtomicBool,
}

/// Script-facing database handle
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

fn bind_query<'q>(sql: &'q str, args: &'q [SqlArg]) -> Query<'q, Any, AnyArguments<'q>> {
    let mut query = sqlx::query(sql);
    for arg in args {
        query = match arg {
            SqlArg::Null => query.bind(None::<String>),
            SqlArg::Int(i) => query.bind(*i),
            SqlArg::Float(f) => query.bind(*f),
            SqlArg::Bool(b) => query.bind(*b),
            SqlArg::Text(s) => query.bind(s.as_str()),
            SqlArg::Bytes(b) => query.bind(b.as_slice()),
        };
    }
    query
}

fn decode_column(row: &AnyRow, index: usize) -> Dynamic {
    let Ok(raw) = row.try_get_raw(index) else {
        return Dynamic::UNIT;
    };
    if raw.is_null() {
        return Dynamic::UNIT;
    }
    let type_name = raw.type_info().name().to_ascii_uppercase();

    if type_name.contains("INT") {
        if let Ok(value) = row.try_get::<i64, _>(index) {
            return Dynamic::from(value);
        }
    }
    if ["REAL", "FLOAT", "DOUBLE", "NUMERIC", "DECIMAL"]
        .iter()
        .any(|name| type_name.contains(name))
    {
        if let Ok(value) = row.try_get::<f64, _>(index) {
            return Dynamic::from(value);
        }
    }
    if type_name.contains("BOOL") {
        if let Ok(value) = row.try_get::<bool, _>(index) {
            return Dynamic::from(value);
        }
    }
    if ["BLOB", "BYTEA", "BINARY"].iter().any(|name| type_name.contains(name)) {
        // byte columns coerce to strings
        if let Ok(value) = row.try_get::<Vec<u8>, _>(index) {
            return Dynamic::from(String::from_utf8_lossy(&value).into_owned());
        }
    }
    if let Ok(value) = row.try_get::<String, _>(index) {
        return Dynamic::from(value);
    }
    if let Ok(value) = row.try_get::<i64, _>(index) {
        return Dynamic::from(value);
    }
    if let Ok(value) = row.try_get::<f64, _>(index) {
        return Dynamic::from(value);
    }
    Dynamic::UNIT
}

fn row_to_map(row: &AnyRow) -> Map {
    let mut map = Map::new();
    for column in row.columns() {
        map.insert(column.name().into(), decode_column(row, column.ordinal()));
    }
    map
}

impl DbInner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::IOError, "database handle is closed"));
        }
        Ok(())
    }

    async fn fetch_rows(&self, sql: &str, args: &[SqlArg]) -> Result<Vec<AnyRow>> {
        let sql = rewrite_placeholders(sql, self.driver);
        match &self.executor {
            Executor::Pool(pool) => Ok(bind_query(&sql, args).fetch_all(pool).await?),
            Executor::Tx(shared) => {
                let mut guard = shared.conn.lock().await;
                let conn = guard
                    .as_mut()
                    .ok_or_else(|| Error::new(ErrorKind::TxError, "transaction already finished"))?;
                Ok(bind_query(&sql, args).fetch_all(&mut **conn).await?)
            }
        }
    }

    async fn execute(&self, sql: &str, args: &[SqlArg]) -> Result<u64> {
        let sql = rewrite_placeholders(sql, self.driver);
        match &self.executor {
            Executor::Pool(pool) => Ok(bind_query(&sql, args).execute(pool).await?.rows_affected()),
            Executor::Tx(shared) => {
                let mut guard = shared.conn.lock().await;
                let conn = guard
                    .as_mut()
                    .ok_or_else(|| Error::new(ErrorKind::TxError, "transaction already finished"))?;
                Ok(bind_query(&sql, args).execute(&mut **conn).await?.rows_affected())
            }
        }
    }
}

impl Db {
    fn with_state<R>(&self, f: impl FnOnce(&mut BuilderState) -> R) -> R {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    fn take_state(&self) -> BuilderState {
        self.with_state(std::mem::take)
    }

    fn fetch_all_blocking(&self, sql: &str, args: &[SqlArg]) -> std::result::Result<Array, Box<EvalAltResult>> {
        self.inner.check_open().map_err(Error::into_script)?;
        let rows = kit::block_on(self.inner.fetch_rows(sql, args))?.map_err(Error::into_script)?;
        Ok(rows.iter().map(|row| Dynamic::from_map(row_to_map(row))).collect())
    }

    fn execute_blocking(&self, sql: &str, args: &[SqlArg]) -> std::result::Result<i64, Box<EvalAltResult>> {
        self.inner.check_open().map_err(Error::into_script)?;
        let affected = kit::block_on(self.inner.execute(sql, args))?.map_err(Error::into_script)?;
        Ok(affected as i64)
    }

    fn close(&self) -> std::result::Result<(), Box<EvalAltResult>> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match (&self.inner.executor, &self.inner.shared_key) {
            (Executor::Tx(shared), _) => {
                finish_tx(self.inner.driver, shared, false).map_err(Error::into_script)
            }
            (Executor::Pool(_), Some(key)) => {
                registry::release_shared(key).map(|_| ()).map_err(Error::into_script)
            }
            (Executor::Pool(pool), None) => {
                let pool = pool.clone();
                tokio::spawn(async move { pool.close().await });
                Ok(())
            }
        }
    }
}

fn data_map(fn_name: &str, mapping: &Map) -> std::result::Result<BTreeMap<String, SqlArg>, Box<EvalAltResult>> {
    if mapping.is_empty() {
        return Err(kit::runtime_error(
            ErrorKind::ArgumentError,
            format!("{fn_name} requires a non-empty mapping"),
        ));
    }
    Ok(mapping
        .iter()
        .map(|(key, value)| (key.to_string(), SqlArg::from_dynamic(value)))
        .collect())
}

fn spread_args(arg: &Dynamic) -> Vec<SqlArg> {
    if arg.is_array() {
        arg.clone()
            .into_array()
            .unwrap_or_default()
            .iter()
            .map(SqlArg::from_dynamic)
            .collect()
    } else {
        vec![SqlArg::from_dynamic(arg)]
    }
}

// ---- transactions ----------------------------------------------------------

fn isolation_name(level: i64) -> Result<Option<&'static str>> {
    match level {
        0 => Ok(None),
        1 => Ok(Some("READ UNCOMMITTED")),
        2 => Ok(Some("READ COMMITTED")),
        4 => Ok(Some("REPEATABLE READ")),
        6 => Ok(Some("SERIALIZABLE")),
        3 | 5 | 7 => Err(Error::new(
            ErrorKind::TxError,
            format!("isolation level {level} is not supported by the compiled drivers"),
        )),
        other => Err(Error::new(
            ErrorKind::ArgumentError,
            format!("isolation level {other} outside 0..=7"),
        )),
    }
}

fn begin_statements(driver: Driver, isolation: i64, read_only: bool) -> Result<Vec<String>> {
    let name = isolation_name(isolation)?;
    match driver {
        Driver::Sqlite => match name {
            // sqlite transactions are always serializable
            None | Some("SERIALIZABLE") => Ok(vec!["BEGIN".to_string()]),
            Some(other) => Err(Error::new(
                ErrorKind::TxError,
                format!("sqlite does not support isolation level {other}"),
            )),
        },
        Driver::Postgres => {
            let mut begin = "BEGIN".to_string();
            if let Some(name) = name {
                begin.push_str(&format!(" ISOLATION LEVEL {name}"));
            }
            if read_only {
                begin.push_str(" READ ONLY");
            }
            Ok(vec![begin])
        }
        Driver::Mysql => {
            let mut statements = Vec::new();
            if let Some(name) = name {
                statements.push(format!("SET TRANSACTION ISOLATION LEVEL {name}"));
            }
            let mut begin = "START TRANSACTION".to_string();
            if read_only {
                begin.push_str(" READ ONLY");
            }
            statements.push(begin);
            Ok(statements)
        }
    }
}

fn finish_tx(_driver: Driver, shared: &Arc<TxShared>, commit: bool) -> Result<()> {
    if shared.finished.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    let shared = shared.clone();
    let result = kit::block_on(async move {
        let mut guard = shared.conn.lock().await;
        let Some(mut conn) = guard.take() else {
            return Ok(());
        };
        let verb = if commit { "COMMIT" } else { "ROLLBACK" };
        sqlx::query(verb)
            .execute(&mut *conn)
            .await
            .map(|_| ())
            .map_err(Error::from)
    });
    match result {
        Ok(inner) => inner.map_err(|e| Error::new(ErrorKind::TxError, e.to_string())),
        Err(script_err) => Err(Error::new(ErrorKind::TxError, script_err.to_string())),
    }
}

fn run_transaction(
    ncc: &NativeCallContext,
    db: &Db,
    callback: &FnPtr,
    opts: &Map,
) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
    db.inner.check_open().map_err(Error::into_script)?;
    let pool = match &db.inner.executor {
        Executor::Pool(pool) => pool.clone(),
        Executor::Tx(_) => {
            return Err(kit::runtime_error(ErrorKind::TxError, "transactions do not nest"));
        }
    };

    let isolation = opts.get("isolation").and_then(|v| v.as_int().ok()).unwrap_or(0);
    let read_only = opts.get("readOnly").and_then(|v| v.as_bool().ok()).unwrap_or(false);
    let begin_budget = match opts.get("timeout") {
        Some(value) if !value.is_unit() => kit::check_duration("transaction", 2, value)?,
        _ => Duration::from_millis(100),
    };
    let statements = begin_statements(db.inner.driver, isolation, read_only).map_err(Error::into_script)?;

    let driver = db.inner.driver;
    let conn = kit::block_on(async move {
        timeout(begin_budget, async {
            let mut conn = pool.acquire().await.map_err(Error::from)?;
            for statement in &statements {
                sqlx::query(statement).execute(&mut *conn).await.map_err(Error::from)?;
            }
            Ok::<_, Error>(conn)
        })
        .await
    })?
    .map_err(|_| Error::new(ErrorKind::TxError, "transaction begin timed out").into_script())?
    .map_err(Error::into_script)?;

    let shared = Arc::new(TxShared {
        conn: tokio::sync::Mutex::new(Some(conn)),
        finished: AtomicBool::new(false),
    });
    let tx_db = Db {
        inner: Arc::new(DbInner {
            executor: Executor::Tx(shared.clone()),
            driver,
            shared_key: None,
            state: Mutex::new(BuilderState::default()),
            closed: AtomicBool::new(false),
        }),
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        callback.call_within_context::<Dynamic>(ncc, (tx_db.clone(),))
    }));

    match outcome {
        Ok(Ok(value)) => {
            finish_tx(driver, &shared, true).map_err(Error::into_script)?;
            Ok(value)
        }
        Ok(Err(script_err)) => {
            if let Err(rollback_err) = finish_tx(driver, &shared, false) {
                tracing::warn!("rollback after script error failed: {rollback_err}");
            }
            Err(script_err)
        }
        Err(payload) => {
            if let Err(rollback_err) = finish_tx(driver, &shared, false) {
                tracing::warn!("rollback after panic failed: {rollback_err}");
            }
            panic::resume_unwind(payload)
        }
    }
}

// ---- open ------------------------------------------------------------------

fn open_db(driver: ImmutableString, dsn: ImmutableString, opts: Map) -> std::result::Result<Db, Box<EvalAltResult>> {
    let driver = Driver::parse(&driver).map_err(Error::into_script)?;
    let shared = opts.get("shared").and_then(|v| v.as_bool().ok()).unwrap_or(false);
    let max_open = opts
        .get("maxOpenConns")
        .and_then(|v| v.as_int().ok())
        .unwrap_or(10)
        .max(1) as u32;
    let max_idle = opts
        .get("maxIdleConns")
        .and_then(|v| v.as_int().ok())
        .unwrap_or(2)
        .max(0) as u32;

    let key = RegistryKey { driver, dsn: dsn.to_string() };
    let (pool, shared_key) = if shared {
        let pool = kit::block_on(registry::open_shared(key.clone(), max_open, max_idle))?
            .map_err(Error::into_script)?;
        (pool, Some(key))
    } else {
        let pool = kit::block_on(registry::connect(driver, &dsn, max_open, max_idle))?
            .map_err(Error::into_script)?;
        (pool, None)
    };

    Ok(Db {
        inner: Arc::new(DbInner {
            executor: Executor::Pool(pool),
            driver,
            shared_key,
            state: Mutex::new(BuilderState::default()),
            closed: AtomicBool::new(false),
        }),
    })
}

/// Register the `sql` module and the database handle type
pub fn register(engine: &mut Engine) {
    engine.register_type_with_name::<Db>("Db");

    // chainable verbs
    engine.register_fn("table", |db: &mut Db, name: ImmutableString| -> Db {
        db.with_state(|state| state.table = name.to_string());
        db.clone()
    });
    engine.register_fn("fields", |db: &mut Db, fields: ImmutableString| -> Db {
        db.with_state(|state| state.fields.push(fields.to_string()));
        db.clone()
    });
    engine.register_fn("fields", |db: &mut Db, fields: Array| -> Db {
        db.with_state(|state| {
            state.fields.extend(fields.iter().map(|f| f.to_string()));
        });
        db.clone()
    });
    engine.register_fn("where", |db: &mut Db, sql: ImmutableString| -> Db {
        db.with_state(|state| state.add_where(&sql, Vec::new()));
        db.clone()
    });
    engine.register_fn("where", |db: &mut Db, sql: ImmutableString, args: Dynamic| -> Db {
        db.with_state(|state| state.add_where(&sql, spread_args(&args)));
        db.clone()
    });
    engine.register_fn(
        "where",
        |db: &mut Db, sql: ImmutableString, a: Dynamic, b: Dynamic| -> Db {
            db.with_state(|state| {
                state.add_where(&sql, vec![SqlArg::from_dynamic(&a), SqlArg::from_dynamic(&b)]);
            });
            db.clone()
        },
    );
    engine.register_fn(
        "where",
        |db: &mut Db, sql: ImmutableString, a: Dynamic, b: Dynamic, c: Dynamic| -> Db {
            db.with_state(|state| {
                state.add_where(
                    &sql,
                    vec![
                        SqlArg::from_dynamic(&a),
                        SqlArg::from_dynamic(&b),
                        SqlArg::from_dynamic(&c),
                    ],
                );
            });
            db.clone()
        },
    );
    engine.register_fn("group", |db: &mut Db, group: ImmutableString| -> Db {
        db.with_state(|state| state.group = group.to_string());
        db.clone()
    });
    engine.register_fn("having", |db: &mut Db, having: ImmutableString| -> Db {
        db.with_state(|state| state.having = having.to_string());
        db.clone()
    });
    engine.register_fn("order", |db: &mut Db, order: ImmutableString| -> Db {
        db.with_state(|state| state.order = order.to_string());
        db.clone()
    });
    engine.register_fn("limit", |db: &mut Db, limit: i64| -> Db {
        db.with_state(|state| state.limit = Some(limit));
        db.clone()
    });
    engine.register_fn("offset", |db: &mut Db, offset: i64| -> Db {
        db.with_state(|state| state.offset = Some(offset));
        db.clone()
    });

    // terminal verbs
    engine.register_fn("fetchAll", |db: &mut Db| -> std::result::Result<Array, Box<EvalAltResult>> {
        let state = db.take_state();
        let (sql, args) = state.select_sql().map_err(Error::into_script)?;
        db.fetch_all_blocking(&sql, &args)
    });
    engine.register_fn("fetch", |db: &mut Db| -> std::result::Result<Map, Box<EvalAltResult>> {
        let mut state = db.take_state();
        state.limit = Some(1);
        let (sql, args) = state.select_sql().map_err(Error::into_script)?;
        let rows = db.fetch_all_blocking(&sql, &args)?;
        rows.into_iter()
            .next()
            .and_then(|row| row.try_cast::<Map>())
            .ok_or_else(|| kit::runtime_error(ErrorKind::NoRows, "fetch matched no rows"))
    });
    engine.register_fn("count", |db: &mut Db| -> std::result::Result<i64, Box<EvalAltResult>> {
        let state = db.take_state();
        let (sql, args) = state.count_sql().map_err(Error::into_script)?;
        let rows = db.fetch_all_blocking(&sql, &args)?;
        let row = rows
            .into_iter()
            .next()
            .and_then(|row| row.try_cast::<Map>())
            .ok_or_else(|| kit::runtime_error(ErrorKind::NoRows, "count returned no rows"))?;
        row.values()
            .next()
            .and_then(|value| value.as_int().ok())
            .ok_or_else(|| kit::runtime_error(ErrorKind::ScriptError, "count column was not an integer"))
    });
    engine.register_fn("insert", |db: &mut Db, mapping: Map| -> std::result::Result<i64, Box<EvalAltResult>> {
        let state = db.take_state();
        let data = data_map("insert", &mapping)?;
        let (sql, args) = state.insert_sql(&data).map_err(Error::into_script)?;
        db.execute_blocking(&sql, &args)
    });
    engine.register_fn("update", |db: &mut Db, mapping: Map| -> std::result::Result<i64, Box<EvalAltResult>> {
        let state = db.take_state();
        let data = data_map("update", &mapping)?;
        let (sql, args) = state.update_sql(&data).map_err(Error::into_script)?;
        db.execute_blocking(&sql, &args)
    });
    engine.register_fn("delete", |db: &mut Db| -> std::result::Result<i64, Box<EvalAltResult>> {
        let state = db.take_state();
        let (sql, args) = state.delete_sql().map_err(Error::into_script)?;
        db.execute_blocking(&sql, &args)
    });

    // raw statements
    engine.register_fn("query", |db: &mut Db, sql: ImmutableString| -> std::result::Result<Array, Box<EvalAltResult>> {
        db.fetch_all_blocking(&sql, &[])
    });
    engine.register_fn(
        "query",
        |db: &mut Db, sql: ImmutableString, args: Dynamic| -> std::result::Result<Array, Box<EvalAltResult>> {
            db.fetch_all_blocking(&sql, &spread_args(&args))
        },
    );
    engine.register_fn("exec", |db: &mut Db, sql: ImmutableString| -> std::result::Result<i64, Box<EvalAltResult>> {
        db.execute_blocking(&sql, &[])
    });
    engine.register_fn(
        "exec",
        |db: &mut Db, sql: ImmutableString, args: Dynamic| -> std::result::Result<i64, Box<EvalAltResult>> {
            db.execute_blocking(&sql, &spread_args(&args))
        },
    );

    // transactions
    engine.register_fn(
        "transaction",
        |ncc: NativeCallContext, db: &mut Db, callback: FnPtr| -> std::result::Result<Dynamic, Box<EvalAltResult>> {
            run_transaction(&ncc, db, &callback, &Map::new())
        },
    );
    engine.register_fn(
        "transaction",
        |ncc: NativeCallContext, db: &mut Db, callback: FnPtr, opts: Map| -> std::result::Result<Dynamic, Box<EvalAltResult>> {
            run_transaction(&ncc, db, &callback, &opts)
        },
    );
    engine.register_fn("commit", |db: &mut Db| -> std::result::Result<(), Box<EvalAltResult>> {
        match &db.inner.executor {
            Executor::Tx(shared) => finish_tx(db.inner.driver, shared, true).map_err(Error::into_script),
            Executor::Pool(_) => Err(kit::runtime_error(ErrorKind::TxError, "commit outside a transaction")),
        }
    });
    engine.register_fn("rollback", |db: &mut Db| -> std::result::Result<(), Box<EvalAltResult>> {
        match &db.inner.executor {
            Executor::Tx(shared) => finish_tx(db.inner.driver, shared, false).map_err(Error::into_script),
            Executor::Pool(_) => Err(kit::runtime_error(ErrorKind::TxError, "rollback outside a transaction")),
        }
    });

    engine.register_fn("close", |db: &mut Db| -> std::result::Result<(), Box<EvalAltResult>> {
        db.close()
    });

    let mut module = Module::new();
    module.set_native_fn("open", |driver: ImmutableString, dsn: ImmutableString| {
        open_db(driver, dsn, Map::new())
    });
    module.set_native_fn("open", open_db);
    engine.register_static_module("sql", module.into());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_names() {
        assert_eq!(isolation_name(0).unwrap(), None);
        assert_eq!(isolation_name(6).unwrap(), Some("SERIALIZABLE"));
        assert_eq!(isolation_name(2).unwrap(), Some("READ COMMITTED"));
        assert_eq!(isolation_name(5).unwrap_err().kind(), ErrorKind::TxError);
        assert_eq!(isolation_name(9).unwrap_err().kind(), ErrorKind::ArgumentError);
    }

    #[test]
    fn test_begin_statements() {
        assert_eq!(begin_statements(Driver::Sqlite, 0, false).unwrap(), vec!["BEGIN"]);
        assert_eq!(begin_statements(Driver::Sqlite, 6, true).unwrap(), vec!["BEGIN"]);
        assert!(begin_statements(Driver::Sqlite, 2, false).is_err());
        assert_eq!(
            begin_statements(Driver::Postgres, 6, true).unwrap(),
            vec!["BEGIN ISOLATION LEVEL SERIALIZABLE READ ONLY"]
        );
        assert_eq!(
            begin_statements(Driver::Mysql, 2, false).unwrap(),
            vec!["SET TRANSACTION ISOLATION LEVEL READ COMMITTED", "START TRANSACTION"]
        );
    }
}
