//! Streaming export source over the database export function.
//!
//! One function call per unit, no pagination. Rows are fetched on a spawned
//! task and handed over a bounded channel so the upload side applies
//! backpressure without holding a connection hostage to a slow network.

use futures::{SinkExt as _, StreamExt as _};
use sqlx::postgres::PgRow;
use sqlx::{Column as _, Executor as _, PgPool, Row as _, Statement as _, TypeInfo as _};

use hakobi_core::model::InputKey;
use hakobi_core::retry::ErrorClass;
use hakobi_core::store::{ExportSource, ExportStream, SourceError};

/// Rows buffered between the fetch task and the CSV encoder.
const ROW_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum SourceSetupError {
    #[error("invalid export function name {0:?}")]
    InvalidFunctionName(String),
}

/// Calls `SELECT * FROM <function>(key, effective_date, asof)` and streams
/// the result set.
#[derive(Debug, Clone)]
pub struct PgExportSource {
    pool: PgPool,
    function: String,
}

impl PgExportSource {
    /// The function name is interpolated into SQL, so it must be a plain
    /// (optionally schema-qualified) identifier.
    pub fn new(pool: PgPool, function: impl Into<String>) -> Result<Self, SourceSetupError> {
        let function = function.into();
        if !is_valid_function_name(&function) {
            return Err(SourceSetupError::InvalidFunctionName(function));
        }
        Ok(Self { pool, function })
    }
}

fn is_valid_function_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

impl ExportSource for PgExportSource {
    async fn export(&self, key: &InputKey) -> Result<ExportStream, SourceError> {
        let sql = format!("SELECT * FROM {}($1, $2, $3)", self.function);

        // Column names up front so the header can be written even for an
        // empty result set.
        let columns: Vec<String> = {
            let statement = self.pool.prepare(&sql).await.map_err(source_error)?;
            statement
                .columns()
                .iter()
                .map(|column| column.name().to_string())
                .collect()
        };

        let (mut tx, rx) = futures::channel::mpsc::channel(ROW_CHANNEL_CAPACITY);
        let pool = self.pool.clone();
        let index_key = key.index_key.clone();
        let effective_date = key.effective_date.date();
        let asof_indicator = key.asof_indicator.clone();

        tokio::spawn(async move {
            let mut rows = sqlx::query(&sql)
                .bind(&index_key)
                .bind(effective_date)
                .bind(&asof_indicator)
                .fetch(&pool);

            while let Some(fetched) = rows.next().await {
                let item = fetched.map_err(source_error).and_then(|row| render_row(&row));
                let failed = item.is_err();
                if tx.send(item).await.is_err() {
                    // Receiver dropped: the executor gave up on this unit.
                    break;
                }
                if failed {
                    break;
                }
            }
        });

        Ok(ExportStream {
            columns,
            rows: rx.boxed(),
        })
    }
}

/// Render every column of a row as text, in column order.
fn render_row(row: &PgRow) -> Result<Vec<Option<String>>, SourceError> {
    let mut fields = Vec::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        fields.push(render_value(row, idx, column.type_info().name())?);
    }
    Ok(fields)
}

fn render_value(row: &PgRow, idx: usize, type_name: &str) -> Result<Option<String>, SourceError> {
    let rendered = match type_name {
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" => row.try_get::<Option<String>, _>(idx),
        "INT2" => row.try_get::<Option<i16>, _>(idx).map(display),
        "INT4" => row.try_get::<Option<i32>, _>(idx).map(display),
        "INT8" => row.try_get::<Option<i64>, _>(idx).map(display),
        "FLOAT4" => row.try_get::<Option<f32>, _>(idx).map(display),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx).map(display),
        "NUMERIC" => row
            .try_get::<Option<sqlx::types::BigDecimal>, _>(idx)
            .map(display),
        "BOOL" => row.try_get::<Option<bool>, _>(idx).map(display),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(idx)
            .map(|v| v.map(|d| d.format("%Y-%m-%d").to_string())),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
            .map(|v| v.map(|t| t.format("%Y-%m-%d %H:%M:%S%.f").to_string())),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
            .map(|v| v.map(|t| t.to_rfc3339())),
        "UUID" => row.try_get::<Option<uuid::Uuid>, _>(idx).map(display),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(idx)
            .map(|v| v.map(|j| j.to_string())),
        _ => row.try_get::<Option<String>, _>(idx),
    };

    // A column the renderer cannot decode will fail identically on every
    // attempt; retrying is pointless.
    rendered.map_err(|error| SourceError::permanent(Box::new(error)))
}

fn display<T: std::fmt::Display>(value: Option<T>) -> Option<String> {
    value.map(|v| v.to_string())
}

/// Map a database failure onto the retry taxonomy via its SQLSTATE class.
fn source_error(error: sqlx::Error) -> SourceError {
    let class = match &error {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| class_for_sqlstate(code.as_ref()))
            .unwrap_or(ErrorClass::Transient),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorClass::Transient,
        sqlx::Error::RowNotFound
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_) => ErrorClass::Permanent,
        _ => ErrorClass::Transient,
    };
    match class {
        ErrorClass::Transient => SourceError::transient(Box::new(error)),
        ErrorClass::Permanent => SourceError::permanent(Box::new(error)),
    }
}

fn class_for_sqlstate(code: &str) -> ErrorClass {
    match code.get(..2) {
        // Connection failures, serialization/deadlock rollbacks, resource
        // exhaustion, operator intervention (incl. statement timeout).
        Some("08") | Some("40") | Some("53") | Some("57") => ErrorClass::Transient,
        // Data exceptions, constraint violations, invalid authorization,
        // undefined objects / bad arguments.
        Some("22") | Some("23") | Some("28") | Some("42") | Some("3D") | Some("3F") => {
            ErrorClass::Permanent
        }
        _ => ErrorClass::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_names_are_validated() {
        assert!(is_valid_function_name("export_rows"));
        assert!(is_valid_function_name("exports.export_rows"));
        assert!(is_valid_function_name("_private_fn"));
        assert!(!is_valid_function_name(""));
        assert!(!is_valid_function_name("1starts_with_digit"));
        assert!(!is_valid_function_name("fn(); DROP TABLE export_jobs"));
        assert!(!is_valid_function_name("a..b"));
    }

    #[test]
    fn sqlstate_classes_follow_the_taxonomy() {
        assert_eq!(class_for_sqlstate("08006"), ErrorClass::Transient); // connection failure
        assert_eq!(class_for_sqlstate("40P01"), ErrorClass::Transient); // deadlock
        assert_eq!(class_for_sqlstate("57014"), ErrorClass::Transient); // statement timeout
        assert_eq!(class_for_sqlstate("53300"), ErrorClass::Transient); // too many connections
        assert_eq!(class_for_sqlstate("22003"), ErrorClass::Permanent); // numeric out of range
        assert_eq!(class_for_sqlstate("28000"), ErrorClass::Permanent); // invalid authorization
        assert_eq!(class_for_sqlstate("42883"), ErrorClass::Permanent); // undefined function
    }
}
