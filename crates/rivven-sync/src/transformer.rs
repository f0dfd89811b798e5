//! Record transformers
//!
//! Transformers run on the reader side before records enter the channel.
//! Each one inspects or rewrites a single column and may filter the record
//! out. A [`TransformChain`] runs them in order and keeps statistics that
//! exchangers publish into the task counters.
//!
//! A transformer failing on a record makes the record dirty. A column index
//! beyond the record's width is a configuration mistake and fails the task.

use crate::counters::{CounterKey, Counters};
use crate::error::{Result, SyncError};
use crate::record::{Column, Record};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::Instant;

/// Output of a transformer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformOutput {
    /// Keep the (possibly rewritten) record
    Keep,
    /// Drop the record silently
    Filtered,
}

/// A single transformation step
pub trait Transformer: Send + Sync + fmt::Debug {
    /// Registered name, e.g. `dx_substr`
    fn name(&self) -> &str;

    /// Column this transformer operates on
    fn column(&self) -> usize;

    /// Transform the record in place
    fn evaluate(&self, record: &mut Record) -> Result<TransformOutput>;
}

/// Comparison operator of the filter transformer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum FilterOp {
    #[serde(rename = "like")]
    Like,
    #[serde(rename = "not like")]
    NotLike,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "=", alias = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

/// Side of the pad transformer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum PadSide {
    #[serde(rename = "l", alias = "left")]
    Left,
    #[serde(rename = "r", alias = "right")]
    Right,
}

/// Built-in transformer configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformStep {
    /// Drop records whose column matches the condition
    Filter {
        column: usize,
        op: FilterOp,
        value: String,
    },
    /// Keep `length` characters starting at `start`
    Substr {
        column: usize,
        start: usize,
        length: usize,
    },
    /// Pad or truncate to exactly `length` characters
    Pad {
        column: usize,
        side: PadSide,
        length: usize,
        pad: String,
    },
    /// Replace `length` characters starting at `start`
    Replace {
        column: usize,
        start: usize,
        length: usize,
        with: String,
    },
}

impl TransformStep {
    /// Validate parameters that do not depend on record contents
    pub fn check(&self) -> Result<()> {
        match self {
            TransformStep::Filter { op, value, .. } => {
                if value.is_empty() {
                    return Err(SyncError::config("dx_filter value must not be empty"));
                }
                if matches!(op, FilterOp::Like | FilterOp::NotLike) {
                    anchored(value)?;
                }
            }
            TransformStep::Pad { pad, .. } if pad.is_empty() => {
                return Err(SyncError::config("dx_pad pad string must not be empty"));
            }
            _ => {}
        }
        Ok(())
    }

    /// Instantiate the transformer
    pub fn build(&self) -> Result<Box<dyn Transformer>> {
        self.check()?;
        let transformer: Box<dyn Transformer> = match self.clone() {
            TransformStep::Filter { column, op, value } => {
                let pattern = match op {
                    FilterOp::Like | FilterOp::NotLike => Some(anchored(&value)?),
                    _ => None,
                };
                Box::new(FilterTransformer {
                    column,
                    op,
                    value,
                    pattern,
                })
            }
            TransformStep::Substr {
                column,
                start,
                length,
            } => Box::new(SubstrTransformer {
                column,
                start,
                length,
            }),
            TransformStep::Pad {
                column,
                side,
                length,
                pad,
            } => Box::new(PadTransformer {
                column,
                side,
                length,
                pad,
            }),
            TransformStep::Replace {
                column,
                start,
                length,
                with,
            } => Box::new(ReplaceTransformer {
                column,
                start,
                length,
                with,
            }),
        };
        Ok(transformer)
    }
}

/// `like` matches the whole value
fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| SyncError::config(format!("invalid dx_filter pattern '{}': {}", pattern, e)))
}

fn column_of<'a>(name: &str, record: &'a Record, index: usize) -> Result<&'a Column> {
    record.column(index).ok_or_else(|| {
        SyncError::transformer(
            name,
            format!(
                "column index {} out of range, record has {} columns",
                index,
                record.column_count()
            ),
        )
    })
}

// ============================================================================
// dx_filter
// ============================================================================

#[derive(Debug)]
pub struct FilterTransformer {
    column: usize,
    op: FilterOp,
    value: String,
    pattern: Option<Regex>,
}

impl FilterTransformer {
    /// Ordering of the column against the literal, `None` for null columns
    fn compare(&self, column: &Column) -> Result<Option<Ordering>> {
        let parse_error = |e: String| {
            SyncError::transformer(
                self.name(),
                format!("cannot compare {} column with '{}': {}", column.type_name(), self.value, e),
            )
        };
        let ordering = match column {
            Column::Null => None,
            Column::Double(v) => {
                let rhs = self.value.parse::<f64>().map_err(|e| parse_error(e.to_string()))?;
                v.partial_cmp(&rhs)
            }
            Column::Long(_) | Column::Date(_) | Column::Timestamp(_) => {
                let rhs = self.value.parse::<i64>().map_err(|e| parse_error(e.to_string()))?;
                column.as_i64().map(|lhs| lhs.cmp(&rhs))
            }
            Column::String(_) | Column::Bytes(_) | Column::Bool(_) => column
                .as_string()
                .map(|lhs| lhs.as_str().cmp(self.value.as_str())),
        };
        Ok(ordering)
    }

    fn matches(&self, column: &Column) -> Result<bool> {
        match self.op {
            FilterOp::Like | FilterOp::NotLike => {
                let Some(value) = column.as_string() else {
                    return Ok(false);
                };
                let hit = self
                    .pattern
                    .as_ref()
                    .is_some_and(|pattern| pattern.is_match(&value));
                Ok(if self.op == FilterOp::Like { hit } else { !hit })
            }
            FilterOp::Eq | FilterOp::Ne => {
                let equal = if column.is_null() {
                    self.value.eq_ignore_ascii_case("null")
                } else {
                    self.compare(column)? == Some(Ordering::Equal)
                };
                Ok(if self.op == FilterOp::Eq { equal } else { !equal })
            }
            FilterOp::Gt => Ok(self.compare(column)? == Some(Ordering::Greater)),
            FilterOp::Lt => Ok(self.compare(column)? == Some(Ordering::Less)),
            FilterOp::Ge => Ok(matches!(
                self.compare(column)?,
                Some(Ordering::Greater | Ordering::Equal)
            )),
            FilterOp::Le => Ok(matches!(
                self.compare(column)?,
                Some(Ordering::Less | Ordering::Equal)
            )),
        }
    }
}

impl Transformer for FilterTransformer {
    fn name(&self) -> &str {
        "dx_filter"
    }

    fn column(&self) -> usize {
        self.column
    }

    fn evaluate(&self, record: &mut Record) -> Result<TransformOutput> {
        let column = column_of(self.name(), record, self.column)?;
        if self.matches(column)? {
            Ok(TransformOutput::Filtered)
        } else {
            Ok(TransformOutput::Keep)
        }
    }
}

// ============================================================================
// dx_substr
// ============================================================================

#[derive(Debug)]
pub struct SubstrTransformer {
    column: usize,
    start: usize,
    length: usize,
}

impl Transformer for SubstrTransformer {
    fn name(&self) -> &str {
        "dx_substr"
    }

    fn column(&self) -> usize {
        self.column
    }

    fn evaluate(&self, record: &mut Record) -> Result<TransformOutput> {
        let Some(value) = column_of(self.name(), record, self.column)?.as_string() else {
            return Ok(TransformOutput::Keep);
        };
        let chars: Vec<char> = value.chars().collect();
        if self.start > chars.len() {
            return Err(SyncError::transformer(
                self.name(),
                format!(
                    "start index {} out of range {} of '{}'",
                    self.start,
                    chars.len(),
                    value
                ),
            ));
        }
        let end = self.start.saturating_add(self.length).min(chars.len());
        let substr: String = chars[self.start..end].iter().collect();
        record.set_column(self.column, Column::String(substr));
        Ok(TransformOutput::Keep)
    }
}

// ============================================================================
// dx_pad
// ============================================================================

#[derive(Debug)]
pub struct PadTransformer {
    column: usize,
    side: PadSide,
    length: usize,
    pad: String,
}

impl Transformer for PadTransformer {
    fn name(&self) -> &str {
        "dx_pad"
    }

    fn column(&self) -> usize {
        self.column
    }

    fn evaluate(&self, record: &mut Record) -> Result<TransformOutput> {
        let value = column_of(self.name(), record, self.column)?
            .as_string()
            .unwrap_or_default();
        let current = value.chars().count();

        let padded = if self.length <= current {
            value.chars().take(self.length).collect()
        } else {
            let fill: String = self.pad.chars().cycle().take(self.length - current).collect();
            match self.side {
                PadSide::Left => fill + &value,
                PadSide::Right => value + &fill,
            }
        };
        record.set_column(self.column, Column::String(padded));
        Ok(TransformOutput::Keep)
    }
}

// ============================================================================
// dx_replace
// ============================================================================

#[derive(Debug)]
pub struct ReplaceTransformer {
    column: usize,
    start: usize,
    length: usize,
    with: String,
}

impl Transformer for ReplaceTransformer {
    fn name(&self) -> &str {
        "dx_replace"
    }

    fn column(&self) -> usize {
        self.column
    }

    fn evaluate(&self, record: &mut Record) -> Result<TransformOutput> {
        let Some(value) = column_of(self.name(), record, self.column)?.as_string() else {
            return Ok(TransformOutput::Keep);
        };
        let chars: Vec<char> = value.chars().collect();
        if self.start > chars.len() {
            return Err(SyncError::transformer(
                self.name(),
                format!("start index {} out of range {}", self.start, chars.len()),
            ));
        }
        let mut replaced: String = chars[..self.start].iter().collect();
        replaced.push_str(&self.with);
        let end = self.start.saturating_add(self.length);
        if end < chars.len() {
            replaced.extend(&chars[end..]);
        }
        record.set_column(self.column, Column::String(replaced));
        Ok(TransformOutput::Keep)
    }
}

// ============================================================================
// Chain
// ============================================================================

/// Result of running a record through a chain
#[derive(Debug)]
pub enum ChainOutcome {
    Pass,
    Filtered,
    /// A step failed; the record should be collected as dirty
    Dirty(SyncError),
}

/// Counts kept by a chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformStats {
    pub succeeded: u64,
    pub failed: u64,
    pub filtered: u64,
    pub used_nanos: u64,
}

/// Ordered transformers applied to every outgoing record
#[derive(Debug, Default)]
pub struct TransformChain {
    steps: Vec<Box<dyn Transformer>>,
    columns_checked: bool,
    stats: TransformStats,
}

impl TransformChain {
    pub fn new(steps: Vec<Box<dyn Transformer>>) -> Self {
        Self {
            steps,
            columns_checked: false,
            stats: TransformStats::default(),
        }
    }

    /// Build the built-in transformers from configuration
    pub fn from_steps(steps: &[TransformStep]) -> Result<Self> {
        let steps = steps
            .iter()
            .map(TransformStep::build)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(steps))
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn stats(&self) -> TransformStats {
        self.stats
    }

    /// Run every step on the record. Only a column index beyond the width of
    /// the first record is returned as an error.
    pub fn apply(&mut self, record: &mut Record) -> Result<ChainOutcome> {
        if self.steps.is_empty() {
            return Ok(ChainOutcome::Pass);
        }
        if !self.columns_checked {
            for step in &self.steps {
                if step.column() >= record.column_count() {
                    return Err(SyncError::illegal_argument(format!(
                        "transformer '{}' column index {} out of range, record has {} columns",
                        step.name(),
                        step.column(),
                        record.column_count()
                    )));
                }
            }
            self.columns_checked = true;
        }

        let start = Instant::now();
        let mut outcome = ChainOutcome::Pass;
        for step in &self.steps {
            match step.evaluate(record) {
                Ok(TransformOutput::Keep) => {}
                Ok(TransformOutput::Filtered) => {
                    outcome = ChainOutcome::Filtered;
                    break;
                }
                Err(e) => {
                    outcome = ChainOutcome::Dirty(e);
                    break;
                }
            }
        }
        self.stats.used_nanos += start.elapsed().as_nanos() as u64;

        match outcome {
            ChainOutcome::Pass => self.stats.succeeded += 1,
            ChainOutcome::Filtered => self.stats.filtered += 1,
            ChainOutcome::Dirty(_) => self.stats.failed += 1,
        }
        Ok(outcome)
    }

    /// Copy the chain's totals into the task counters
    pub fn publish(&self, counters: &Counters) {
        if self.steps.is_empty() {
            return;
        }
        counters.set(CounterKey::TransformerSucceedRecords, self.stats.succeeded);
        counters.set(CounterKey::TransformerFailedRecords, self.stats.failed);
        counters.set(CounterKey::TransformerFilterRecords, self.stats.filtered);
        counters.set(CounterKey::TransformerUsedTime, self.stats.used_nanos);
    }
}
