// Dot-separated field paths into JSON itinerary snapshots.

use std::{fmt, str::FromStr};

use serde_json::{Map, Value};
use thiserror::Error;

/// Maximum number of segments in a field path.
const MAX_FIELD_PATH_DEPTH: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldPathError {
    #[error("field path is empty")]
    Empty,

    #[error("field path contains an empty segment: {0}")]
    EmptySegment(String),

    #[error("field path exceeds maximum depth of {MAX_FIELD_PATH_DEPTH} segments")]
    TooDeep,

    #[error("cannot address `{0}` inside a scalar value")]
    NotAContainer(String),

    #[error("segment `{0}` is not a valid list index")]
    InvalidIndex(String),

    #[error("list index `{0}` is out of bounds")]
    IndexOutOfBounds(String),
}

/// A parsed, non-empty field path such as `days.0.activities`.
///
/// Mapping segments are object keys. A segment applied to a list must be a
/// decimal index; writing at `len` appends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn parse(input: &str) -> Result<Self, FieldPathError> {
        if input.is_empty() {
            return Err(FieldPathError::Empty);
        }

        let segments: Vec<String> = input.split('.').map(ToOwned::to_owned).collect();
        if segments.len() > MAX_FIELD_PATH_DEPTH {
            return Err(FieldPathError::TooDeep);
        }
        if segments.iter().any(|segment| segment.trim().is_empty()) {
            return Err(FieldPathError::EmptySegment(input.to_string()));
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Value at this path, or `None` when any segment is missing.
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.segments.iter().try_fold(root, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get(index)),
            _ => None,
        })
    }

    /// Write `value` at this path, creating missing (or `null`) intermediate
    /// mappings. Existing scalars are never overwritten by a mapping.
    pub fn set(&self, root: &mut Value, value: Value) -> Result<(), FieldPathError> {
        let Some((last, parents)) = self.segments.split_last() else {
            return Err(FieldPathError::Empty);
        };

        let mut current = root;
        for segment in parents {
            current = match current {
                Value::Object(map) => {
                    let slot = map.entry(segment.clone()).or_insert(Value::Null);
                    if slot.is_null() {
                        *slot = Value::Object(Map::new());
                    }
                    slot
                }
                Value::Array(items) => {
                    let index = parse_index(segment)?;
                    items
                        .get_mut(index)
                        .ok_or_else(|| FieldPathError::IndexOutOfBounds(segment.clone()))?
                }
                _ => return Err(FieldPathError::NotAContainer(segment.clone())),
            };
        }

        match current {
            Value::Object(map) => {
                map.insert(last.clone(), value);
                Ok(())
            }
            Value::Array(items) => {
                let index = parse_index(last)?;
                if index < items.len() {
                    items[index] = value;
                    Ok(())
                } else if index == items.len() {
                    items.push(value);
                    Ok(())
                } else {
                    Err(FieldPathError::IndexOutOfBounds(last.clone()))
                }
            }
            _ => Err(FieldPathError::NotAContainer(last.clone())),
        }
    }
}

fn parse_index(segment: &str) -> Result<usize, FieldPathError> {
    segment.parse::<usize>().map_err(|_| FieldPathError::InvalidIndex(segment.to_string()))
}

impl FromStr for FieldPath {
    type Err = FieldPathError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}
