//! The canonical column layout of enriched logs and its enforcement.
//!
//! Every table the pipeline writes or combines has exactly the columns of
//! [`COLUMNS`], in that order, with the Arrow types listed there. Categorical
//! columns are `Dictionary(Int8, Utf8)` whose dictionary is the full label
//! list of the corresponding enum, so codes are stable across files.
//!
//! Arrow fields are all declared nullable. Which columns may hold nulls, and
//! how nulls in related columns line up, is checked by [`validate`] instead:
//!
//! 1. the column set matches exactly;
//! 2. each column has its canonical type (categoricals: canonical dictionary);
//! 3. the non-null columns contain no nulls;
//! 4. the null-correlation rules of [`NULL_RULES`] hold.
//!
//! The first violated check is reported.

use std::sync::{Arc, LazyLock};

use arrow::{
    array::{Array, ArrayRef, AsArray, DictionaryArray, Int8Array, StringArray},
    compute::{cast, concat_batches},
    datatypes::{DataType, Field, Int8Type, Schema, SchemaRef, TimeUnit},
    error::ArrowError,
    record_batch::RecordBatch,
};
use snafu::prelude::*;

use crate::label::{Categorical, ContentType, HttpMethod, HttpProtocol, HttpScheme, StatusClass};

mod build;

pub use build::to_record_batch;

/// Errors raised when a table does not have the canonical layout.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ValidationError {
    /// The table lacks canonical columns.
    #[snafu(display("Table is missing column(s) {}", columns.join(", ")))]
    MissingColumns {
        /// The absent columns, in canonical order.
        columns: Vec<String>,
    },

    /// The table has columns outside the canonical set.
    #[snafu(display("Table has extra column(s) {}", columns.join(", ")))]
    ExtraColumns {
        /// The unexpected columns, in table order.
        columns: Vec<String>,
    },

    /// A column has the wrong Arrow type.
    #[snafu(display("Column {column} has type {actual}, expected {expected}"))]
    TypeMismatch {
        /// Offending column.
        column: String,
        /// Canonical type.
        expected: DataType,
        /// Type found in the table.
        actual: DataType,
    },

    /// A categorical column's dictionary differs from its label list.
    #[snafu(display("Categorical column {column} does not use the canonical categories"))]
    CategoriesMismatch {
        /// Offending column.
        column: String,
    },

    /// A column that must be complete holds nulls.
    #[snafu(display("Column {column} has {count} null value(s)"))]
    NullValues {
        /// Offending column.
        column: String,
        /// Number of nulls.
        count: usize,
    },

    /// Columns that must be null together are not.
    #[snafu(display(
        "Columns {} have different null patterns (first difference in row {row})",
        columns.join(", ")
    ))]
    NullPatternMismatch {
        /// The correlated columns.
        columns: Vec<String>,
        /// First row where the patterns disagree.
        row: usize,
    },

    /// A column has values where its reference column is null.
    #[snafu(display(
        "Column {column} has a value in row {row} although {reference} is null"
    ))]
    ValueWithoutReference {
        /// Offending column.
        column: String,
        /// The column it depends on.
        reference: String,
        /// First offending row.
        row: usize,
    },

    /// A best-effort conversion failed.
    #[snafu(display("Failed to convert column {column}: {source}"))]
    Cast {
        /// Column being converted.
        column: String,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// Assembling a table failed.
    #[snafu(display("Failed to assemble table: {source}"))]
    Assemble {
        /// Underlying Arrow error.
        source: ArrowError,
    },
}

/// Convenience alias for schema results.
pub type SchemaResult<T> = Result<T, ValidationError>;

/// Storage type of a canonical column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// UTF-8 text.
    Text,
    /// Nanosecond UTC timestamp.
    Timestamp,
    /// 16-bit integer.
    Int16,
    /// 32-bit integer.
    Int32,
    /// 64-bit float.
    Float64,
    /// Boolean.
    Bool,
    /// Dictionary-encoded text drawn from a fixed label list.
    Categorical(&'static [&'static str]),
}

impl ColumnKind {
    /// Arrow type used to store this kind.
    pub fn data_type(self) -> DataType {
        match self {
            ColumnKind::Text => DataType::Utf8,
            ColumnKind::Timestamp => DataType::Timestamp(TimeUnit::Nanosecond, Some("UTC".into())),
            ColumnKind::Int16 => DataType::Int16,
            ColumnKind::Int32 => DataType::Int32,
            ColumnKind::Float64 => DataType::Float64,
            ColumnKind::Bool => DataType::Boolean,
            ColumnKind::Categorical(_) => {
                DataType::Dictionary(Box::new(DataType::Int8), Box::new(DataType::Utf8))
            }
        }
    }
}

/// One canonical column.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    /// Column name.
    pub name: &'static str,
    /// Storage type.
    pub kind: ColumnKind,
    /// Whether nulls are forbidden.
    pub non_null: bool,
}

const fn column(name: &'static str, kind: ColumnKind, non_null: bool) -> ColumnSpec {
    ColumnSpec {
        name,
        kind,
        non_null,
    }
}

use ColumnKind::{Bool, Float64, Int16, Int32, Text, Timestamp};

/// The canonical columns, in order.
pub const COLUMNS: &[ColumnSpec] = &[
    // Fields of the log line
    column("client_address", Text, true),
    column("timestamp", Timestamp, true),
    column("method", ColumnKind::Categorical(HttpMethod::LABELS), true),
    column("path", Text, true),
    column("query", Text, false),
    column("fragment", Text, false),
    column("protocol", ColumnKind::Categorical(HttpProtocol::LABELS), true),
    column("status", Int16, true),
    column("size", Int32, true),
    column("referrer", Text, false),
    column("user_agent", Text, false),
    column("server_name", Text, false),
    column("server_address", Text, false),
    // Derived while parsing
    column("content_type", ColumnKind::Categorical(ContentType::LABELS), true),
    column("cool_path", Text, true),
    column("referrer_scheme", ColumnKind::Categorical(HttpScheme::LABELS), false),
    column("referrer_host", Text, false),
    column("referrer_path", Text, false),
    column("referrer_query", Text, false),
    column("referrer_fragment", Text, false),
    column("status_class", ColumnKind::Categorical(StatusClass::LABELS), true),
    // Enrichment
    column("client_name", Text, false),
    column("client_latitude", Float64, false),
    column("client_longitude", Float64, false),
    column("client_city", Text, false),
    column("client_country", Text, false),
    column("agent_family", Text, false),
    column("agent_version", Text, false),
    column("os_family", Text, false),
    column("os_version", Text, false),
    column("device_family", Text, false),
    column("device_brand", Text, false),
    column("device_model", Text, false),
    column("is_bot", Bool, true),
    column("is_bot2", Bool, true),
];

/// A constraint relating the nulls of several columns.
#[derive(Debug, Clone, Copy)]
pub enum NullRule {
    /// All listed columns are null in exactly the same rows.
    SameNulls(&'static [&'static str]),
    /// `column` may only hold a value where `reference` does.
    OnlyWhere {
        /// Dependent column.
        column: &'static str,
        /// Column it depends on.
        reference: &'static str,
    },
}

/// Null-correlation rules, checked in order.
pub const NULL_RULES: &[NullRule] = &[
    NullRule::SameNulls(&["server_name", "server_address"]),
    NullRule::OnlyWhere {
        column: "referrer_scheme",
        reference: "referrer",
    },
    NullRule::SameNulls(&["referrer_scheme", "referrer_host", "referrer_path"]),
    NullRule::OnlyWhere {
        column: "referrer_query",
        reference: "referrer_scheme",
    },
    NullRule::OnlyWhere {
        column: "referrer_fragment",
        reference: "referrer_scheme",
    },
    NullRule::SameNulls(&["client_latitude", "client_longitude"]),
    NullRule::SameNulls(&[
        "user_agent",
        "agent_family",
        "agent_version",
        "os_family",
        "os_version",
        "device_family",
        "device_brand",
        "device_model",
    ]),
];

static LOG_SCHEMA: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(
        COLUMNS
            .iter()
            .map(|c| Field::new(c.name, c.kind.data_type(), true))
            .collect::<Vec<_>>(),
    ))
});

/// The canonical Arrow schema.
pub fn log_schema() -> SchemaRef {
    Arc::clone(&LOG_SCHEMA)
}

/// Look up a canonical column by name.
pub fn column_spec(name: &str) -> Option<&'static ColumnSpec> {
    COLUMNS.iter().find(|c| c.name == name)
}

/// Dictionary array over the full `labels` list with the given codes.
pub(crate) fn categorical_array(
    labels: &'static [&'static str],
    codes: Vec<Option<i8>>,
) -> Result<ArrayRef, ArrowError> {
    let keys = Int8Array::from(codes);
    let values: ArrayRef = Arc::new(StringArray::from(labels.to_vec()));
    Ok(Arc::new(DictionaryArray::<Int8Type>::try_new(keys, values)?))
}

/// True if `array` is a dictionary over exactly `labels`, in order.
fn has_categories(array: &dyn Array, labels: &[&str]) -> bool {
    let Some(dict) = array.as_dictionary_opt::<Int8Type>() else {
        return false;
    };
    let Some(values) = dict.values().as_string_opt::<i32>() else {
        return false;
    };
    values.len() == labels.len()
        && values.null_count() == 0
        && values.iter().zip(labels).all(|(v, l)| v == Some(*l))
}

/// Re-encode any array as a dictionary over `labels`; unknown values become null.
fn to_categorical(
    name: &str,
    array: &ArrayRef,
    labels: &'static [&'static str],
) -> SchemaResult<ArrayRef> {
    let text = cast(array, &DataType::Utf8).context(CastSnafu { column: name })?;
    let text = text
        .as_string_opt::<i32>()
        .context(CategoriesMismatchSnafu { column: name })?;
    let codes = text
        .iter()
        .map(|value| {
            value
                .and_then(|v| labels.iter().position(|l| *l == v))
                .and_then(|i| i8::try_from(i).ok())
        })
        .collect();
    categorical_array(labels, codes).context(CastSnafu { column: name })
}

/// Best-effort conversion of `batch` to the canonical column types.
///
/// Columns outside the canonical set pass through untouched and no columns
/// are added, so [`validate`] still reports set mismatches afterwards. Nulls
/// are never filled in; values that do not convert become null. A batch that
/// already has the canonical types is returned unchanged.
pub fn coerce(batch: &RecordBatch) -> SchemaResult<RecordBatch> {
    let schema = batch.schema();
    let mut fields = Vec::with_capacity(schema.fields().len());
    let mut arrays = Vec::with_capacity(batch.num_columns());

    for (field, array) in schema.fields().iter().zip(batch.columns()) {
        let Some(spec) = column_spec(field.name()) else {
            fields.push(Arc::clone(field));
            arrays.push(Arc::clone(array));
            continue;
        };

        let target = spec.kind.data_type();
        let converted = match spec.kind {
            ColumnKind::Categorical(labels) if !has_categories(array.as_ref(), labels) => {
                Some(to_categorical(spec.name, array, labels)?)
            }
            ColumnKind::Categorical(_) => None,
            _ if array.data_type() != &target => {
                Some(cast(array, &target).context(CastSnafu { column: spec.name })?)
            }
            _ => None,
        };

        match converted {
            Some(converted) => {
                fields.push(Arc::new(
                    field.as_ref().clone().with_data_type(target).with_nullable(true),
                ));
                arrays.push(converted);
            }
            None => {
                fields.push(Arc::clone(field));
                arrays.push(Arc::clone(array));
            }
        }
    }

    let schema = Schema::new_with_metadata(fields, schema.metadata().clone());
    RecordBatch::try_new(Arc::new(schema), arrays).context(AssembleSnafu)
}

/// Check `batch` against the canonical layout; see the module docs.
pub fn validate(batch: &RecordBatch) -> SchemaResult<()> {
    let schema = batch.schema();

    let missing: Vec<String> = COLUMNS
        .iter()
        .filter(|c| schema.column_with_name(c.name).is_none())
        .map(|c| c.name.to_string())
        .collect();
    ensure!(missing.is_empty(), MissingColumnsSnafu { columns: missing });

    let extra: Vec<String> = schema
        .fields()
        .iter()
        .filter(|f| column_spec(f.name()).is_none())
        .map(|f| f.name().to_string())
        .collect();
    ensure!(extra.is_empty(), ExtraColumnsSnafu { columns: extra });

    for spec in COLUMNS {
        let array = named_column(batch, spec.name)?;
        let expected = spec.kind.data_type();
        ensure!(
            array.data_type() == &expected,
            TypeMismatchSnafu {
                column: spec.name,
                expected,
                actual: array.data_type().clone(),
            }
        );
        if let ColumnKind::Categorical(labels) = spec.kind {
            ensure!(
                has_categories(array.as_ref(), labels),
                CategoriesMismatchSnafu { column: spec.name }
            );
        }
    }

    for spec in COLUMNS.iter().filter(|c| c.non_null) {
        let count = named_column(batch, spec.name)?.null_count();
        ensure!(
            count == 0,
            NullValuesSnafu {
                column: spec.name,
                count,
            }
        );
    }

    for rule in NULL_RULES {
        check_rule(batch, rule)?;
    }

    Ok(())
}

fn named_column<'a>(batch: &'a RecordBatch, name: &str) -> SchemaResult<&'a ArrayRef> {
    batch.column_by_name(name).context(MissingColumnsSnafu {
        columns: vec![name.to_string()],
    })
}

fn check_rule(batch: &RecordBatch, rule: &NullRule) -> SchemaResult<()> {
    match *rule {
        NullRule::SameNulls(names) => {
            let arrays = names
                .iter()
                .map(|n| named_column(batch, n))
                .collect::<SchemaResult<Vec<_>>>()?;
            let Some((first, rest)) = arrays.split_first() else {
                return Ok(());
            };
            for row in 0..batch.num_rows() {
                let null = first.is_null(row);
                if rest.iter().any(|a| a.is_null(row) != null) {
                    return NullPatternMismatchSnafu {
                        columns: names.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
                        row,
                    }
                    .fail();
                }
            }
        }
        NullRule::OnlyWhere { column, reference } => {
            let dependent = named_column(batch, column)?;
            let reference_array = named_column(batch, reference)?;
            if let Some(row) =
                (0..batch.num_rows()).find(|&i| dependent.is_valid(i) && reference_array.is_null(i))
            {
                return ValueWithoutReferenceSnafu {
                    column,
                    reference,
                    row,
                }
                .fail();
            }
        }
    }
    Ok(())
}

/// Concatenate canonical tables in order into one canonical table.
///
/// Each input is coerced first. The result is coerced again because
/// concatenating dictionary columns may produce a merged dictionary.
pub fn concat(batches: &[RecordBatch]) -> SchemaResult<RecordBatch> {
    let schema = log_schema();
    let coerced = batches
        .iter()
        .map(|b| coerce(b).and_then(|b| reorder(&b)))
        .collect::<SchemaResult<Vec<_>>>()?;
    let combined = concat_batches(&schema, &coerced).context(AssembleSnafu)?;
    coerce(&combined)
}

/// Project a coerced batch onto the canonical schema, in canonical order.
fn reorder(batch: &RecordBatch) -> SchemaResult<RecordBatch> {
    validate_columns_only(batch)?;
    let arrays = COLUMNS
        .iter()
        .map(|c| named_column(batch, c.name).map(Arc::clone))
        .collect::<SchemaResult<Vec<_>>>()?;
    RecordBatch::try_new(log_schema(), arrays).context(AssembleSnafu)
}

fn validate_columns_only(batch: &RecordBatch) -> SchemaResult<()> {
    let schema = batch.schema();
    let extra: Vec<String> = schema
        .fields()
        .iter()
        .filter(|f| column_spec(f.name()).is_none())
        .map(|f| f.name().to_string())
        .collect();
    ensure!(extra.is_empty(), ExtraColumnsSnafu { columns: extra });
    Ok(())
}
