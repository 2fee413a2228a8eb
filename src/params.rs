//! Parameter sets and the merge rules used by prepared statements.
//!
//! Two parameter sets can only be merged when they are the same kind: both
//! positional or both named. Positional merges overlay index by index, named
//! merges overlay key by key, and in both cases the later set wins.

use std::collections::{BTreeMap, HashMap};

use crate::error::SqlConduitError;
use crate::types::SqlValue;

/// Parameters bound to a SQL statement, either by position or by name.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParams {
    Positional(Vec<SqlValue>),
    Named(HashMap<String, SqlValue>),
}

impl SqlParams {
    /// An empty (positional) parameter set.
    #[must_use]
    pub fn empty() -> Self {
        SqlParams::Positional(Vec::new())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            SqlParams::Positional(values) => values.is_empty(),
            SqlParams::Named(values) => values.is_empty(),
        }
    }

    #[must_use]
    pub fn is_named(&self) -> bool {
        matches!(self, SqlParams::Named(_))
    }

    /// Number of bound values.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            SqlParams::Positional(values) => values.len(),
            SqlParams::Named(values) => values.len(),
        }
    }
}

impl Default for SqlParams {
    fn default() -> Self {
        SqlParams::empty()
    }
}

impl From<Vec<SqlValue>> for SqlParams {
    fn from(values: Vec<SqlValue>) -> Self {
        SqlParams::Positional(values)
    }
}

impl From<HashMap<String, SqlValue>> for SqlParams {
    fn from(values: HashMap<String, SqlValue>) -> Self {
        SqlParams::Named(values)
    }
}

fn mixed_kinds() -> SqlConduitError {
    SqlConduitError::ParameterError(
        "Cannot merge named parameters with positioned parameters".to_string(),
    )
}

/// Merge two parameter sets; `overlay` wins on conflicts.
///
/// An empty side leaves the other side unchanged. Mixing positional and named
/// sets is an error.
///
/// # Errors
/// Returns [`SqlConduitError::ParameterError`] when one set is positional and
/// the other is named.
pub fn merge_params(base: &SqlParams, overlay: &SqlParams) -> Result<SqlParams, SqlConduitError> {
    if base.is_empty() {
        return Ok(overlay.clone());
    }
    if overlay.is_empty() {
        return Ok(base.clone());
    }
    match (base, overlay) {
        (SqlParams::Positional(a), SqlParams::Positional(b)) => {
            let mut merged = a.clone();
            for (index, value) in b.iter().enumerate() {
                if index < merged.len() {
                    merged[index] = value.clone();
                } else {
                    merged.push(value.clone());
                }
            }
            Ok(SqlParams::Positional(merged))
        }
        (SqlParams::Named(a), SqlParams::Named(b)) => {
            let mut merged = a.clone();
            for (key, value) in b {
                merged.insert(key.clone(), value.clone());
            }
            Ok(SqlParams::Named(merged))
        }
        _ => Err(mixed_kinds()),
    }
}

/// Sparse bound-parameter store backing a prepared statement's `bind` API.
///
/// Positional binds are kept sparse so an unbound index falls through to the
/// call-time value. Unbinding removes the slot; binding an explicit
/// [`SqlValue::Null`] overwrites. Positional holes still unfilled at execution
/// time materialize as `Null`.
#[derive(Debug, Clone, Default)]
pub(crate) enum BoundParams {
    #[default]
    None,
    Positional(BTreeMap<usize, SqlValue>),
    Named(HashMap<String, SqlValue>),
}

impl BoundParams {
    /// Merge a whole parameter set into the bound store.
    pub(crate) fn bind_params(&mut self, params: &SqlParams) -> Result<(), SqlConduitError> {
        if params.is_empty() {
            return Ok(());
        }
        match (&mut *self, params) {
            (BoundParams::None, SqlParams::Positional(values)) => {
                *self = BoundParams::Positional(
                    values.iter().cloned().enumerate().collect::<BTreeMap<_, _>>(),
                );
                Ok(())
            }
            (BoundParams::None, SqlParams::Named(values)) => {
                *self = BoundParams::Named(values.clone());
                Ok(())
            }
            (BoundParams::Positional(bound), SqlParams::Positional(values)) => {
                for (index, value) in values.iter().enumerate() {
                    bound.insert(index, value.clone());
                }
                Ok(())
            }
            (BoundParams::Named(bound), SqlParams::Named(values)) => {
                for (key, value) in values {
                    bound.insert(key.clone(), value.clone());
                }
                Ok(())
            }
            _ => Err(mixed_kinds()),
        }
    }

    pub(crate) fn bind_index(&mut self, index: usize, value: SqlValue) -> Result<(), SqlConduitError> {
        match self {
            BoundParams::None => {
                let mut bound = BTreeMap::new();
                bound.insert(index, value);
                *self = BoundParams::Positional(bound);
                Ok(())
            }
            BoundParams::Positional(bound) => {
                bound.insert(index, value);
                Ok(())
            }
            BoundParams::Named(_) => Err(mixed_kinds()),
        }
    }

    pub(crate) fn bind_name(&mut self, name: &str, value: SqlValue) -> Result<(), SqlConduitError> {
        match self {
            BoundParams::None => {
                let mut bound = HashMap::new();
                bound.insert(name.to_string(), value);
                *self = BoundParams::Named(bound);
                Ok(())
            }
            BoundParams::Named(bound) => {
                bound.insert(name.to_string(), value);
                Ok(())
            }
            BoundParams::Positional(_) => Err(mixed_kinds()),
        }
    }

    pub(crate) fn unbind_index(&mut self, index: usize) -> Result<(), SqlConduitError> {
        match self {
            BoundParams::None => Ok(()),
            BoundParams::Positional(bound) => {
                bound.remove(&index);
                Ok(())
            }
            BoundParams::Named(_) => Err(mixed_kinds()),
        }
    }

    pub(crate) fn unbind_name(&mut self, name: &str) -> Result<(), SqlConduitError> {
        match self {
            BoundParams::None => Ok(()),
            BoundParams::Named(bound) => {
                bound.remove(name);
                Ok(())
            }
            BoundParams::Positional(_) => Err(mixed_kinds()),
        }
    }

    pub(crate) fn clear(&mut self) {
        *self = BoundParams::None;
    }

    /// Materialize the effective parameters for one execution: bound values
    /// overlaid by the call-time set, call-time winning per slot.
    pub(crate) fn effective(&self, call: &SqlParams) -> Result<SqlParams, SqlConduitError> {
        match self {
            BoundParams::None => Ok(call.clone()),
            BoundParams::Positional(bound) => {
                let call_values: &[SqlValue] = match call {
                    SqlParams::Positional(values) => values,
                    SqlParams::Named(values) if values.is_empty() => &[],
                    SqlParams::Named(_) => return Err(mixed_kinds()),
                };
                let bound_len = bound.keys().next_back().map_or(0, |last| last + 1);
                let mut merged = vec![SqlValue::Null; bound_len.max(call_values.len())];
                for (index, value) in bound {
                    merged[*index] = value.clone();
                }
                for (index, value) in call_values.iter().enumerate() {
                    merged[index] = value.clone();
                }
                Ok(SqlParams::Positional(merged))
            }
            BoundParams::Named(bound) => {
                let call_values = match call {
                    SqlParams::Named(values) => values.clone(),
                    SqlParams::Positional(values) if values.is_empty() => HashMap::new(),
                    SqlParams::Positional(_) => return Err(mixed_kinds()),
                };
                let mut merged = bound.clone();
                for (key, value) in call_values {
                    merged.insert(key, value);
                }
                Ok(SqlParams::Named(merged))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(pairs: &[(&str, i64)]) -> SqlParams {
        SqlParams::Named(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), SqlValue::Int(*v)))
                .collect(),
        )
    }

    #[test]
    fn positional_merge_overlays_index_by_index() {
        let base = SqlParams::Positional(vec![SqlValue::Int(1), SqlValue::Int(2)]);
        let overlay = SqlParams::Positional(vec![SqlValue::Int(7)]);
        let merged = merge_params(&base, &overlay).unwrap();
        assert_eq!(
            merged,
            SqlParams::Positional(vec![SqlValue::Int(7), SqlValue::Int(2)])
        );
    }

    #[test]
    fn named_merge_later_wins() {
        let merged = merge_params(&named(&[("a", 1)]), &named(&[("b", 2)])).unwrap();
        assert_eq!(merged, named(&[("a", 1), ("b", 2)]));

        let merged = merge_params(&named(&[("a", 1)]), &named(&[("a", 9)])).unwrap();
        assert_eq!(merged, named(&[("a", 9)]));
    }

    #[test]
    fn mixing_kinds_is_rejected() {
        let positional = SqlParams::Positional(vec![SqlValue::Int(1)]);
        let err = merge_params(&positional, &named(&[("a", 1)])).unwrap_err();
        assert!(matches!(err, SqlConduitError::ParameterError(_)));
    }

    #[test]
    fn empty_side_passes_through() {
        let positional = SqlParams::Positional(vec![SqlValue::Int(1)]);
        assert_eq!(
            merge_params(&SqlParams::empty(), &positional).unwrap(),
            positional
        );
        assert_eq!(
            merge_params(&positional, &SqlParams::empty()).unwrap(),
            positional
        );
        // An empty named set is kind-indeterminate and merges with anything.
        assert_eq!(
            merge_params(&positional, &SqlParams::Named(HashMap::new())).unwrap(),
            positional
        );
    }

    #[test]
    fn sparse_bind_falls_through_unbound_slots() {
        // Bind [1, 2], re-bind index 1 to 5: effective is [1, 5].
        let mut bound = BoundParams::default();
        bound
            .bind_params(&SqlParams::Positional(vec![SqlValue::Int(1), SqlValue::Int(2)]))
            .unwrap();
        bound.bind_index(1, SqlValue::Int(5)).unwrap();
        assert_eq!(
            bound.effective(&SqlParams::empty()).unwrap(),
            SqlParams::Positional(vec![SqlValue::Int(1), SqlValue::Int(5)])
        );

        // Unbinding removes the slot so the call-time value falls through.
        bound.unbind_index(0).unwrap();
        assert_eq!(
            bound
                .effective(&SqlParams::Positional(vec![SqlValue::Int(9)]))
                .unwrap(),
            SqlParams::Positional(vec![SqlValue::Int(9), SqlValue::Int(5)])
        );
    }

    #[test]
    fn unfilled_positional_holes_become_null() {
        let mut bound = BoundParams::default();
        bound.bind_index(2, SqlValue::Int(3)).unwrap();
        assert_eq!(
            bound.effective(&SqlParams::empty()).unwrap(),
            SqlParams::Positional(vec![SqlValue::Null, SqlValue::Null, SqlValue::Int(3)])
        );
    }

    #[test]
    fn call_time_params_win_over_bound() {
        let mut bound = BoundParams::default();
        bound.bind_name("a", SqlValue::Int(1)).unwrap();
        bound.bind_name("b", SqlValue::Int(2)).unwrap();
        let effective = bound.effective(&named(&[("b", 8)])).unwrap();
        assert_eq!(effective, named(&[("a", 1), ("b", 8)]));
    }

    #[test]
    fn bound_kind_is_sticky() {
        let mut bound = BoundParams::default();
        bound.bind_index(0, SqlValue::Int(1)).unwrap();
        assert!(bound.bind_name("a", SqlValue::Int(1)).is_err());
        assert!(bound.effective(&named(&[("a", 1)])).is_err());
        bound.clear();
        assert!(bound.bind_name("a", SqlValue::Int(1)).is_ok());
    }
}
