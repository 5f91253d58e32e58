//! Table introspection for import and export adapters.
//!
//! Adapters expose an external tabular source through [`DataSource`];
//! [`describe`] turns one of its tables into a map from field name to type
//! name.

use std::collections::BTreeMap;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    /// Short type name, e.g. `Integer` or `MultiPolygon`.
    pub type_name: String,
}

impl Field {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Field {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// An external store of named tables.
pub trait DataSource {
    fn table_names(&self) -> Result<Vec<String>, BoxError>;

    fn fields(&self, table: &str) -> Result<Vec<Field>, BoxError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DescribeError {
    #[error("no data source given")]
    DataSourceNotDefined,
    #[error("no table given")]
    TableNotDefined,
    #[error("unable to list tables: {0}")]
    UnableToGetNames(#[source] BoxError),
    #[error("unable to read the fields of {table}: {source}")]
    UnableToGetFeatures {
        table: String,
        #[source]
        source: BoxError,
    },
}

/// Field names of `table` mapped to their type names, or `None` if the
/// source has no such table.
pub fn describe(
    source: Option<&dyn DataSource>,
    table: Option<&str>,
) -> Result<Option<BTreeMap<String, String>>, DescribeError> {
    let source = source.ok_or(DescribeError::DataSourceNotDefined)?;
    let table = match table {
        Some(table) if !table.is_empty() => table,
        _ => return Err(DescribeError::TableNotDefined),
    };
    let names = source
        .table_names()
        .map_err(DescribeError::UnableToGetNames)?;
    if !names.iter().any(|name| name == table) {
        return Ok(None);
    }
    let fields = source
        .fields(table)
        .map_err(|source| DescribeError::UnableToGetFeatures {
            table: table.to_owned(),
            source,
        })?;
    Ok(Some(
        fields
            .into_iter()
            .map(|field| (field.name, field.type_name))
            .collect(),
    ))
}
