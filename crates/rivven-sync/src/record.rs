//! Records and column values
//!
//! A [`Record`] is the unit of transfer between a reader and a writer. It
//! keeps a running byte size (payload only) and memory size (payload plus
//! per-record and per-column overhead) so channels and exchangers can
//! enforce byte budgets without walking the columns again.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Estimated fixed overhead of one record
pub const RECORD_HEAD_BYTES: usize = 48;

/// Estimated fixed overhead of one column
pub const COLUMN_HEAD_BYTES: usize = 24;

/// Number of columns preallocated by [`RecordKind::Default`]
pub const DEFAULT_COLUMN_CAPACITY: usize = 16;

/// A typed column value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Column {
    Null,
    Long(i64),
    Double(f64),
    String(String),
    Bool(bool),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Column {
    /// Payload size in bytes
    pub fn byte_size(&self) -> usize {
        match self {
            Column::Null => 0,
            Column::Long(_) | Column::Double(_) => 8,
            Column::Date(_) | Column::Timestamp(_) => 8,
            Column::Bool(_) => 1,
            Column::String(s) => s.len(),
            Column::Bytes(b) => b.len(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Column::Null)
    }

    /// Short type name used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Column::Null => "null",
            Column::Long(_) => "long",
            Column::Double(_) => "double",
            Column::String(_) => "string",
            Column::Bool(_) => "bool",
            Column::Bytes(_) => "bytes",
            Column::Date(_) => "date",
            Column::Timestamp(_) => "timestamp",
        }
    }

    /// String rendering, `None` for null
    pub fn as_string(&self) -> Option<String> {
        match self {
            Column::Null => None,
            Column::String(s) => Some(s.clone()),
            Column::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            other => Some(other.to_string()),
        }
    }

    /// Integer view; dates and timestamps map to epoch days and millis
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Column::Long(v) => Some(*v),
            Column::Bool(b) => Some(i64::from(*b)),
            Column::Date(d) => Some(
                d.signed_duration_since(DateTime::UNIX_EPOCH.date_naive())
                    .num_days(),
            ),
            Column::Timestamp(ts) => Some(ts.timestamp_millis()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Column::Double(v) => Some(*v),
            Column::Long(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Column::Null => write!(f, "null"),
            Column::Long(v) => write!(f, "{}", v),
            Column::Double(v) => write!(f, "{}", v),
            Column::String(s) => write!(f, "{}", s),
            Column::Bool(b) => write!(f, "{}", b),
            Column::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            Column::Date(d) => write!(f, "{}", d),
            Column::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

impl From<i64> for Column {
    fn from(v: i64) -> Self {
        Column::Long(v)
    }
}

impl From<f64> for Column {
    fn from(v: f64) -> Self {
        Column::Double(v)
    }
}

impl From<bool> for Column {
    fn from(v: bool) -> Self {
        Column::Bool(v)
    }
}

impl From<&str> for Column {
    fn from(v: &str) -> Self {
        Column::String(v.to_string())
    }
}

impl From<String> for Column {
    fn from(v: String) -> Self {
        Column::String(v)
    }
}

/// Selects how records are laid out and accounted.
///
/// The set of representations is closed, so the factory is a plain match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Preallocated columns, memory size includes header overhead
    #[default]
    Default,
    /// No preallocation, memory size equals byte size
    Lean,
}

impl RecordKind {
    /// Create an empty record of this kind
    pub fn create(self) -> Record {
        let capacity = match self {
            RecordKind::Default => DEFAULT_COLUMN_CAPACITY,
            RecordKind::Lean => 0,
        };
        Record {
            columns: Vec::with_capacity(capacity),
            byte_size: 0,
            kind: self,
        }
    }

    fn record_head(self) -> usize {
        match self {
            RecordKind::Default => RECORD_HEAD_BYTES,
            RecordKind::Lean => 0,
        }
    }

    fn column_head(self) -> usize {
        match self {
            RecordKind::Default => COLUMN_HEAD_BYTES,
            RecordKind::Lean => 0,
        }
    }
}

/// An ordered sequence of column values
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    columns: Vec<Column>,
    byte_size: usize,
    kind: RecordKind,
}

impl Default for Record {
    fn default() -> Self {
        RecordKind::Default.create()
    }
}

impl Record {
    /// Create an empty default record
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a default record from columns
    pub fn from_columns(columns: Vec<Column>) -> Self {
        let byte_size = columns.iter().map(Column::byte_size).sum();
        Self {
            columns,
            byte_size,
            kind: RecordKind::Default,
        }
    }

    pub fn add_column(&mut self, column: Column) {
        self.byte_size += column.byte_size();
        self.columns.push(column);
    }

    /// Replace the column at `index`, growing the record with nulls if needed
    pub fn set_column(&mut self, index: usize, column: Column) {
        if index >= self.columns.len() {
            self.columns.resize(index + 1, Column::Null);
        }
        self.byte_size -= self.columns[index].byte_size();
        self.byte_size += column.byte_size();
        self.columns[index] = column;
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Payload bytes of all columns
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Estimated in-memory footprint
    pub fn memory_size(&self) -> usize {
        self.kind.record_head() + self.columns.len() * self.kind.column_head() + self.byte_size
    }

    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.columns.iter().map(|c| c.to_string()).collect();
        write!(f, "[{}]", rendered.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_size_tracks_columns() {
        let mut record = Record::new();
        record.add_column(Column::from("hello"));
        record.add_column(Column::Long(42));
        record.add_column(Column::Null);
        assert_eq!(record.byte_size(), 5 + 8);
        assert_eq!(record.column_count(), 3);

        record.set_column(0, Column::from("hi"));
        assert_eq!(record.byte_size(), 2 + 8);
    }

    #[test]
    fn test_set_column_grows_record() {
        let mut record = Record::new();
        record.set_column(3, Column::Bool(true));
        assert_eq!(record.column_count(), 4);
        assert!(record.column(0).unwrap().is_null());
        assert_eq!(record.byte_size(), 1);
    }

    #[test]
    fn test_memory_size_by_kind() {
        let mut default = RecordKind::Default.create();
        default.add_column(Column::from("abcd"));
        assert_eq!(default.memory_size(), RECORD_HEAD_BYTES + COLUMN_HEAD_BYTES + 4);

        let mut lean = RecordKind::Lean.create();
        lean.add_column(Column::from("abcd"));
        assert_eq!(lean.memory_size(), 4);
        assert_eq!(lean.kind(), RecordKind::Lean);
    }

    #[test]
    fn test_column_views() {
        assert_eq!(Column::Long(7).as_f64(), Some(7.0));
        assert_eq!(Column::Double(1.5).as_i64(), None);
        assert_eq!(Column::Null.as_string(), None);
        assert_eq!(Column::Bytes(b"ab".to_vec()).as_string().as_deref(), Some("ab"));
        let date = NaiveDate::from_ymd_opt(1970, 1, 11).unwrap();
        assert_eq!(Column::Date(date).as_i64(), Some(10));
    }

    #[test]
    fn test_record_display() {
        let record = Record::from_columns(vec![Column::Long(1), Column::from("a"), Column::Null]);
        assert_eq!(record.to_string(), "[1, a, null]");
    }
}
