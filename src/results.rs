//! Uniform result shapes and the strict single-row / single-value reductions.

use std::sync::Arc;

use crate::error::SqlConduitError;
use crate::types::SqlValue;

/// A row from a database query result
///
/// Column names are shared across all rows of one result set through an `Arc`
/// so large result sets don't duplicate them per row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    column_names: Arc<Vec<String>>,
    values: Vec<SqlValue>,
}

impl Row {
    #[must_use]
    pub fn new(column_names: Arc<Vec<String>>, values: Vec<SqlValue>) -> Self {
        Self {
            column_names,
            values,
        }
    }

    /// Get a value from the row by column name
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<&SqlValue> {
        self.column_names
            .iter()
            .position(|col| col == column_name)
            .and_then(|index| self.values.get(index))
    }

    /// Get a value from the row by column index
    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    #[must_use]
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// Number of columns in the row.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }
}

/// Outcome of a DML statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecResult {
    /// The number of rows affected
    pub affected_rows: u64,
    /// The generated id of the inserted row, when the driver reports one
    pub inserted_id: Option<SqlValue>,
}

impl ExecResult {
    #[must_use]
    pub fn new(affected_rows: u64) -> Self {
        Self {
            affected_rows,
            inserted_id: None,
        }
    }

    #[must_use]
    pub fn with_inserted_id(affected_rows: u64, inserted_id: SqlValue) -> Self {
        Self {
            affected_rows,
            inserted_id: Some(inserted_id),
        }
    }

    /// The inserted id, erroring when the driver reported none.
    ///
    /// # Errors
    /// Returns [`SqlConduitError::MissingInsertedId`] when no id is present.
    pub fn require_inserted_id(&self) -> Result<&SqlValue, SqlConduitError> {
        self.inserted_id
            .as_ref()
            .ok_or(SqlConduitError::MissingInsertedId)
    }

    /// The inserted id as an `i64`, parsing a text id when necessary.
    ///
    /// # Errors
    /// Returns [`SqlConduitError::MissingInsertedId`] when no id is present, or
    /// [`SqlConduitError::ExecutionError`] when the id has an unexpected type.
    pub fn inserted_id_as_i64(&self) -> Result<i64, SqlConduitError> {
        match self.require_inserted_id()? {
            SqlValue::Int(value) => Ok(*value),
            SqlValue::Text(value) => value.parse::<i64>().map_err(|_| {
                SqlConduitError::ExecutionError(format!(
                    "Unexpected inserted ID value: {value}"
                ))
            }),
            other => Err(SqlConduitError::ExecutionError(format!(
                "Unexpected inserted ID type: {other:?}"
            ))),
        }
    }

    /// The inserted id rendered as a string.
    ///
    /// # Errors
    /// Returns [`SqlConduitError::MissingInsertedId`] when no id is present, or
    /// [`SqlConduitError::ExecutionError`] when the id has an unexpected type.
    pub fn inserted_id_as_string(&self) -> Result<String, SqlConduitError> {
        match self.require_inserted_id()? {
            SqlValue::Int(value) => Ok(value.to_string()),
            SqlValue::Text(value) => Ok(value.clone()),
            other => Err(SqlConduitError::ExecutionError(format!(
                "Unexpected inserted ID type: {other:?}"
            ))),
        }
    }
}

/// Reduce a result set to at most one row.
///
/// # Errors
/// Returns [`SqlConduitError::RowCardinality`] when more than one row came back.
pub fn to_single_row(mut rows: Vec<Row>) -> Result<Option<Row>, SqlConduitError> {
    match rows.len() {
        0 => Ok(None),
        1 => Ok(rows.pop()),
        n => Err(SqlConduitError::RowCardinality(n)),
    }
}

/// Reduce an optional row to its single value.
///
/// # Errors
/// Returns [`SqlConduitError::ValueCardinality`] when the row does not have
/// exactly one column.
pub fn to_single_value(row: Option<Row>) -> Result<Option<SqlValue>, SqlConduitError> {
    match row {
        None => Ok(None),
        Some(row) => {
            if row.len() != 1 {
                return Err(SqlConduitError::ValueCardinality(row.len()));
            }
            Ok(row.into_values().pop())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, i64)]) -> Row {
        Row::new(
            Arc::new(pairs.iter().map(|(k, _)| k.to_string()).collect()),
            pairs.iter().map(|(_, v)| SqlValue::Int(*v)).collect(),
        )
    }

    #[test]
    fn single_row_cardinality() {
        assert_eq!(to_single_row(vec![]).unwrap(), None);

        let only = row(&[("a", 1)]);
        assert_eq!(to_single_row(vec![only.clone()]).unwrap(), Some(only));

        let err = to_single_row(vec![row(&[("a", 1)]), row(&[("a", 2)])]).unwrap_err();
        assert!(matches!(err, SqlConduitError::RowCardinality(2)));
    }

    #[test]
    fn single_value_cardinality() {
        assert_eq!(to_single_value(None).unwrap(), None);
        assert_eq!(
            to_single_value(Some(row(&[("a", 1)]))).unwrap(),
            Some(SqlValue::Int(1))
        );
        let err = to_single_value(Some(row(&[("a", 1), ("b", 2)]))).unwrap_err();
        assert!(matches!(err, SqlConduitError::ValueCardinality(2)));
    }

    #[test]
    fn inserted_id_policy() {
        let res = ExecResult::new(1);
        assert!(matches!(
            res.require_inserted_id(),
            Err(SqlConduitError::MissingInsertedId)
        ));
        assert!(res.inserted_id.is_none());

        let res = ExecResult::with_inserted_id(1, SqlValue::Int(42));
        assert_eq!(res.inserted_id_as_i64().unwrap(), 42);
        assert_eq!(res.inserted_id_as_string().unwrap(), "42");

        let res = ExecResult::with_inserted_id(1, SqlValue::Text("7".into()));
        assert_eq!(res.inserted_id_as_i64().unwrap(), 7);

        let res = ExecResult::with_inserted_id(1, SqlValue::Bool(true));
        assert!(res.inserted_id_as_i64().is_err());
    }

    #[test]
    fn row_lookup_by_name_and_index() {
        let r = row(&[("id", 7), ("age", 30)]);
        assert_eq!(r.get("age"), Some(&SqlValue::Int(30)));
        assert_eq!(r.get("missing"), None);
        assert_eq!(r.get_by_index(0), Some(&SqlValue::Int(7)));
        assert_eq!(r.get_by_index(5), None);
    }
}
