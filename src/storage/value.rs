use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::error::StorageError;
use super::schema::Table;
use super::sql;

/// A positional statement parameter. Callers never see backend-native types.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Integer(value.into())
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        SqlValue::Text(value.clone())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Builds a `Vec<SqlValue>` from heterogeneous expressions.
#[macro_export]
macro_rules! params {
    () => { Vec::<$crate::storage::SqlValue>::new() };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::storage::SqlValue::from($value)),+]
    };
}

/// One result row as an ordered column name to value mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Row(Map<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.0.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.0.get(column).and_then(Value::as_i64)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.0.get(column).and_then(Value::as_str)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn decode<T: DeserializeOwned>(self) -> Result<T, StorageError> {
        serde_json::from_value(Value::Object(self.0)).map_err(|e| StorageError::Decode(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// All rows for row-returning statements, nothing otherwise.
    #[default]
    Auto,
    None,
    One,
    All,
}

impl FetchMode {
    pub fn resolve(self, statement: &str) -> FetchMode {
        match self {
            FetchMode::Auto if sql::returns_rows(statement) => FetchMode::All,
            FetchMode::Auto => FetchMode::None,
            explicit => explicit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Query {
        sql: String,
        params: Vec<SqlValue>,
        fetch: FetchMode,
    },
    /// Insert into an auto-identity table; the adapter owns the id column.
    Insert {
        table: Table,
        columns: Vec<(&'static str, SqlValue)>,
    },
}

impl Statement {
    pub fn query(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Statement::Query {
            sql: sql.into(),
            params,
            fetch: FetchMode::Auto,
        }
    }

    pub fn insert(table: Table, columns: Vec<(&'static str, SqlValue)>) -> Self {
        Statement::Insert { table, columns }
    }

    pub fn with_fetch(self, mode: FetchMode) -> Self {
        match self {
            Statement::Query { sql, params, .. } => Statement::Query {
                sql,
                params,
                fetch: mode,
            },
            insert => insert,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Statement::Insert { .. })
    }

    /// Whether the statement changes data and should trigger sync and backup.
    pub fn changes_data(&self) -> bool {
        match self {
            Statement::Insert { .. } => true,
            Statement::Query { sql, .. } => sql::is_data_change(sql),
        }
    }

    pub fn touched_table(&self) -> Option<Table> {
        match self {
            Statement::Insert { table, .. } => Some(*table),
            Statement::Query { sql, .. } => sql::touched_table(sql),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Rows(Vec<Row>),
    Inserted(i64),
}

impl Outcome {
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Outcome::Rows(rows) => rows,
            Outcome::Inserted(_) => Vec::new(),
        }
    }

    pub fn inserted_id(&self) -> Option<i64> {
        match self {
            Outcome::Inserted(id) => Some(*id),
            Outcome::Rows(_) => None,
        }
    }
}
