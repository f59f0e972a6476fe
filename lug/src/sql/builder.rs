//! Chainable query builder state and SQL assembly
//!
//! The builder accumulates fragments (table, fields, where + bound args,
//! group, having, order, limit, offset). Terminal verbs assemble the full
//! conditional statement, after which the state resets. Placeholders are
//! written as `?` and rewritten to `$n` for backends that number their
//! parameters.

use std::collections::BTreeMap;

use rhai::Dynamic;

use crate::error::{Error, ErrorKind, Result};

/// Compiled-in database drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Driver {
    Sqlite,
    Postgres,
    Mysql,
}

impl Driver {
    /// Parse a driver name; unsupported names error at open time
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "postgres" | "pgx" => Ok(Self::Postgres),
            "mysql" => Ok(Self::Mysql),
            other => Err(Error::new(
                ErrorKind::DriverUnsupported,
                format!("driver {other:?} is not compiled in"),
            )),
        }
    }

    /// URL scheme expected by the connection pool
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
        }
    }

    /// Whether the backend numbers its placeholders (`$1`, `$2`, ...)
    pub fn numbered_placeholders(self) -> bool {
        matches!(self, Self::Postgres)
    }
}

/// One bound statement argument
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlArg {
    /// Convert a script value into a bindable argument
    pub fn from_dynamic(value: &Dynamic) -> Self {
        if value.is_unit() {
            Self::Null
        } else if let Ok(i) = value.as_int() {
            Self::Int(i)
        } else if let Ok(f) = value.as_float() {
            Self::Float(f)
        } else if let Ok(b) = value.as_bool() {
            Self::Bool(b)
        } else if let Some(blob) = value.clone().try_cast::<rhai::Blob>() {
            Self::Bytes(blob)
        } else {
            Self::Text(value.to_string())
        }
    }
}

/// Accumulated builder fragments
#[derive(Debug, Clone, Default)]
pub struct BuilderState {
    pub table: String,
    pub fields: Vec<String>,
    pub where_sql: String,
    pub where_args: Vec<SqlArg>,
    pub group: String,
    pub having: String,
    pub order: String,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl BuilderState {
    /// Clear all fragments (after a terminal verb)
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Append a where clause; multiple calls combine with `AND`
    pub fn add_where(&mut self, sql: &str, args: Vec<SqlArg>) {
        if self.where_sql.is_empty() {
            self.where_sql = sql.to_string();
        } else {
            self.where_sql = format!("{} AND ({sql})", self.where_sql);
        }
        self.where_args.extend(args);
    }

    fn require_table(&self, verb: &str) -> Result<()> {
        if self.table.is_empty() {
            return Err(Error::new(
                ErrorKind::MissingTable,
                format!("{verb} requires a table"),
            ));
        }
        Ok(())
    }

    fn conditional_tail(&self, sql: &mut String) {
        if !self.where_sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.where_sql);
        }
        if !self.group.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group);
        }
        if !self.having.is_empty() {
            sql.push_str(" HAVING ");
            sql.push_str(&self.having);
        }
        if !self.order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order);
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
    }

    /// `SELECT <fields or *> FROM <table> [WHERE ...] ...`
    pub fn select_sql(&self) -> Result<(String, Vec<SqlArg>)> {
        self.require_table("select")?;
        let fields = if self.fields.is_empty() {
            "*".to_string()
        } else {
            self.fields.join(", ")
        };
        let mut sql = format!("SELECT {fields} FROM {}", self.table);
        self.conditional_tail(&mut sql);
        Ok((sql, self.where_args.clone()))
    }

    /// `SELECT COUNT(*) FROM <table> [WHERE ...] ...`
    pub fn count_sql(&self) -> Result<(String, Vec<SqlArg>)> {
        self.require_table("count")?;
        let mut sql = format!("SELECT COUNT(*) FROM {}", self.table);
        self.conditional_tail(&mut sql);
        Ok((sql, self.where_args.clone()))
    }

    /// `INSERT INTO <table> (...) VALUES (...)`
    pub fn insert_sql(&self, data: &BTreeMap<String, SqlArg>) -> Result<(String, Vec<SqlArg>)> {
        self.require_table("insert")?;
        if data.is_empty() {
            return Err(Error::new(ErrorKind::ArgumentError, "insert requires a non-empty mapping"));
        }
        let columns: Vec<&str> = data.keys().map(String::as_str).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            self.table,
            columns.join(", ")
        );
        Ok((sql, data.values().cloned().collect()))
    }

    /// `UPDATE <table> SET ... WHERE ...`; data args bind before where args
    pub fn update_sql(&self, data: &BTreeMap<String, SqlArg>) -> Result<(String, Vec<SqlArg>)> {
        self.require_table("update")?;
        if self.where_sql.is_empty() {
            return Err(Error::new(
                ErrorKind::MissingWhere,
                "update requires a where clause",
            ));
        }
        if data.is_empty() {
            return Err(Error::new(ErrorKind::ArgumentError, "update requires a non-empty mapping"));
        }
        let assignments: Vec<String> = data.keys().map(|column| format!("{column} = ?")).collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.table,
            assignments.join(", "),
            self.where_sql
        );
        let mut args: Vec<SqlArg> = data.values().cloned().collect();
        args.extend(self.where_args.iter().cloned());
        Ok((sql, args))
    }

    /// `DELETE FROM <table> WHERE ...`
    pub fn delete_sql(&self) -> Result<(String, Vec<SqlArg>)> {
        self.require_table("delete")?;
        if self.where_sql.is_empty() {
            return Err(Error::new(
                ErrorKind::MissingWhere,
                "delete requires a where clause",
            ));
        }
        let sql = format!("DELETE FROM {} WHERE {}", self.table, self.where_sql);
        Ok((sql, self.where_args.clone()))
    }
}

/// Rewrite `?` placeholders to `$1 ... $n` for numbering backends
///
/// Skips string literals in single or double quotes.
pub fn rewrite_placeholders(sql: &str, driver: Driver) -> String {
    if !driver.numbered_placeholders() {
        return sql.to_string();
    }
    let mut out = String::with_capacity(sql.len() + 8);
    let mut index = 0;
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match (c, quote) {
            ('\'' | '"', None) => {
                quote = Some(c);
                out.push(c);
            }
            (c, Some(q)) if c == q => {
                quote = None;
                out.push(c);
            }
            ('?', None) => {
                index += 1;
                out.push('$');
                out.push_str(&index.to_string());
            }
            (c, _) => out.push(c),
        }
    }
    out
}
