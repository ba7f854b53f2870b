//-
// Copyright (c) 2024, the Arcmail Developers
//
// This file is part of Arcmail.
//
// Arcmail is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public License as  published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Arcmail is distributed in the hope that  it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Arcmail. If not, see <http://www.gnu.org/licenses/>.

//! Asynchronously-completed database statements.
//!
//! A `Query` is a statement with `$1`-style placeholders and bound
//! parameters. It is enqueued on a `Transaction` (or run directly on a
//! `Connection`), buffers the rows the store streams back, and reaches a
//! terminal `done` state. Owners drain rows with `next_row` and must not
//! assume the query is restartable.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use log::warn;
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};

/// A dynamically-typed SQL parameter or column value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match *self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Int(n) => ToSqlOutput::Borrowed(ValueRef::Integer(n)),
            Value::Text(ref s) => {
                ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes()))
            },
            Value::Bytes(ref b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl Value {
    pub(super) fn from_ref(r: ValueRef<'_>) -> Self {
        match r {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(n) => Value::Int(n),
            ValueRef::Real(f) => Value::Int(f as i64),
            ValueRef::Text(t) => {
                Value::Text(String::from_utf8_lossy(t).into_owned())
            },
            ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Int(n as i64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Int(b as i64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One materialised result row.
///
/// The accessors are forgiving the way the wire protocol reader was: a
/// missing or mistyped column logs and yields a zero value rather than
/// aborting the decoder that asked.
#[derive(Clone, Debug)]
pub struct Row {
    names: Rc<Vec<String>>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(names: Rc<Vec<String>>, values: Vec<Value>) -> Self {
        Row { names, values }
    }

    fn index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index(name).is_some()
    }

    pub fn is_null(&self, name: &str) -> bool {
        match self.index(name) {
            Some(ix) => matches!(self.values[ix], Value::Null),
            None => true,
        }
    }

    pub fn get_i64(&self, name: &str) -> i64 {
        match self.index(name).map(|ix| &self.values[ix]) {
            Some(&Value::Int(n)) => n,
            Some(Value::Text(s)) => s.parse().unwrap_or(0),
            Some(Value::Null) | None => 0,
            Some(v) => {
                warn!("column {} is not an integer: {:?}", name, v);
                0
            },
        }
    }

    pub fn get_u32(&self, name: &str) -> u32 {
        self.get_i64(name) as u32
    }

    pub fn get_bool(&self, name: &str) -> bool {
        0 != self.get_i64(name)
    }

    pub fn get_str(&self, name: &str) -> &str {
        match self.index(name).map(|ix| &self.values[ix]) {
            Some(Value::Text(s)) => s,
            _ => "",
        }
    }

    pub fn get_string(&self, name: &str) -> String {
        self.get_str(name).to_owned()
    }

    pub fn get_bytes(&self, name: &str) -> &[u8] {
        match self.index(name).map(|ix| &self.values[ix]) {
            Some(Value::Bytes(b)) => b,
            Some(Value::Text(s)) => s.as_bytes(),
            _ => b"",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum QueryState {
    Pending,
    Done,
    Failed(String),
}

/// A single SQL statement queued for execution.
#[derive(Debug)]
pub struct Query {
    sql: String,
    params: Vec<Value>,
    allow_failure: bool,
    state: QueryState,
    rows: VecDeque<Row>,
}

/// Shared handle to a `Query`.
///
/// Both the enqueuing transaction and the owner that will consume the rows
/// hold one; everything runs on the loop thread.
pub type QueryRef = Rc<RefCell<Query>>;

impl Query {
    pub fn new(sql: impl Into<String>) -> QueryRef {
        Rc::new(RefCell::new(Query {
            sql: sql.into(),
            params: Vec::new(),
            allow_failure: false,
            state: QueryState::Pending,
            rows: VecDeque::new(),
        }))
    }

    /// Appends a positional parameter; the first `bind` corresponds to `$1`.
    pub fn bind(&mut self, v: impl Into<Value>) -> &mut Self {
        self.params.push(v.into());
        self
    }

    /// Marks that this query failing must not poison the enclosing
    /// transaction.
    pub fn set_allow_failure(&mut self) -> &mut Self {
        self.allow_failure = true;
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Replaces the statement text. Only legal before execution; the sort
    /// planner uses this to splice into a rendered query.
    pub fn set_sql(&mut self, sql: String) {
        debug_assert!(QueryState::Pending == self.state);
        self.sql = sql;
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn allows_failure(&self) -> bool {
        self.allow_failure
    }

    pub fn done(&self) -> bool {
        QueryState::Pending != self.state
    }

    pub fn failed(&self) -> bool {
        matches!(self.state, QueryState::Failed(_))
    }

    pub fn error(&self) -> Option<&str> {
        match self.state {
            QueryState::Failed(ref e) => Some(e),
            _ => None,
        }
    }

    pub fn has_results(&self) -> bool {
        !self.rows.is_empty()
    }

    pub fn next_row(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub(super) fn push_row(&mut self, row: Row) {
        self.rows.push_back(row);
    }

    pub(super) fn set_done(&mut self) {
        self.state = QueryState::Done;
    }

    pub(super) fn set_failed(&mut self, error: String) {
        self.state = QueryState::Failed(error);
    }
}
