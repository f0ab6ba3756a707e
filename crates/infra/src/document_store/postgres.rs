//! Postgres-backed document store.
//!
//! Every mutation runs in one transaction:
//! 1. `SELECT ... FOR UPDATE` locks the document row
//! 2. the transition from `docflow_core::Document` is applied in memory
//! 3. the row is written back and the transaction committed
//!
//! Any failure before the commit rolls back; nothing partial is ever visible.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | PersistError |
//! |------------|----------------------|--------------|
//! | Database (deadlock detected) | `40P01` | `Transient` |
//! | Database (serialization failure) | `40001` | `Transient` |
//! | Database (lock not available) | `55P03` | `Transient` |
//! | Database (connection exception) | `08xxx` | `Transient` |
//! | Database (other) | Any other | `Storage` |
//! | Io / PoolTimedOut / PoolClosed | N/A | `Transient` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use docflow_core::{
    Classification, Document, DocumentId, DocumentKind, DocumentStatus, DomainResult, TenantId,
};

use super::{CommittedClassification, DocumentStore, PersistError};

/// Idempotent DDL, executed one statement at a time by [`PostgresDocumentStore::ensure_schema`].
pub const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id              TEXT PRIMARY KEY,
        tenant_id       UUID NOT NULL,
        status          TEXT NOT NULL,
        kind            TEXT NULL,
        structured_data JSONB NOT NULL DEFAULT '{}'::jsonb,
        confidence      DOUBLE PRECISION NULL,
        quality_score   DOUBLE PRECISION NULL,
        error_message   TEXT NULL,
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT documents_status_check
            CHECK (status IN ('EXTRACTED', 'CLASSIFIED', 'PENDING_REVIEW', 'ERROR'))
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_documents_tenant_status
        ON documents (tenant_id, status)
    "#,
];

/// Postgres-backed document store.
///
/// `Send + Sync`; all access goes through the SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresDocumentStore {
    pool: Arc<PgPool>,
}

impl PostgresDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `documents` table and its indexes if they are missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), PersistError> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Insert (or replace) a document row. Used for seeding and by upstream stages.
    #[instrument(skip(self, document), fields(document_id = %document.id), err)]
    pub async fn upsert(&self, document: &Document) -> Result<(), PersistError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO documents (
                id, tenant_id, status, kind, structured_data,
                confidence, quality_score, error_message, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                tenant_id = EXCLUDED.tenant_id,
                status = EXCLUDED.status,
                kind = EXCLUDED.kind,
                structured_data = EXCLUDED.structured_data,
                confidence = EXCLUDED.confidence,
                quality_score = EXCLUDED.quality_score,
                error_message = EXCLUDED.error_message,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(document.id.as_str())
        .bind(document.tenant_id.as_uuid())
        .bind(document.status.as_str())
        .bind(document.kind.as_ref().map(|k| k.as_str()))
        .bind(Value::Object(document.structured_data.clone()))
        .bind(document.confidence)
        .bind(document.quality_score)
        .bind(document.error_message.as_deref())
        .bind(document.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_document", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    /// Lock the row, apply `op` to the loaded document, write it back and commit.
    ///
    /// The row is only rewritten when `op` actually changed the document.
    #[instrument(
        level = "debug",
        skip(self, operation, op),
        fields(operation = operation, document_id = %document_id)
    )]
    async fn locked_update<T, F>(
        &self,
        operation: &'static str,
        document_id: &DocumentId,
        op: F,
    ) -> Result<(T, Document), PersistError>
    where
        F: FnOnce(&mut Document) -> DomainResult<T> + Send,
        T: Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current = match lock_document(&mut tx, document_id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(PersistError::NotFound(document_id.clone()));
            }
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(err);
            }
        };

        let mut working = current.clone();
        let out = match op(&mut working) {
            Ok(out) => out,
            Err(err) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(PersistError::from_domain(document_id, err));
            }
        };

        if working != current {
            if let Err(err) = write_document(&mut tx, &working).await {
                let _ = tx.rollback().await;
                return Err(err);
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok((out, working))
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    #[instrument(skip(self, result), fields(document_id = %document_id, kind = %result.kind), err)]
    async fn apply_classification(
        &self,
        document_id: &DocumentId,
        result: &Classification,
    ) -> Result<CommittedClassification, PersistError> {
        let (outcome, document) = self
            .locked_update("apply_classification", document_id, |doc| {
                doc.apply_classification(result, Utc::now())
            })
            .await?;
        Ok(CommittedClassification::from_document(&document, result, outcome))
    }

    #[instrument(skip(self), err)]
    async fn mark_retrying(&self, document_id: &DocumentId, reason: &str) -> Result<(), PersistError> {
        self.locked_update("mark_retrying", document_id, |doc| {
            doc.mark_retrying(reason, Utc::now());
            Ok(())
        })
        .await
        .map(|_| ())
    }

    #[instrument(skip(self), err)]
    async fn mark_error(&self, document_id: &DocumentId, reason: &str) -> Result<(), PersistError> {
        self.locked_update("mark_error", document_id, |doc| {
            doc.mark_error(reason, Utc::now());
            Ok(())
        })
        .await
        .map(|_| ())
    }

    #[instrument(skip(self), err)]
    async fn mark_pending_review(&self, document_id: &DocumentId) -> Result<(), PersistError> {
        self.locked_update("mark_pending_review", document_id, |doc| {
            doc.mark_pending_review(Utc::now())
        })
        .await
        .map(|_| ())
    }

    #[instrument(skip(self), err)]
    async fn hold_for_posting(&self, document_id: &DocumentId, message: &str) -> Result<(), PersistError> {
        self.locked_update("hold_for_posting", document_id, |doc| {
            doc.hold(message, Utc::now());
            Ok(())
        })
        .await
        .map(|_| ())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, document_id: &DocumentId) -> Result<Option<Document>, PersistError> {
        let row = sqlx::query(SELECT_DOCUMENT)
            .bind(document_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_document", e))?;

        row.map(|r| document_from_row(&r)).transpose()
    }
}

const SELECT_DOCUMENT: &str = r#"
    SELECT
        id,
        tenant_id,
        status,
        kind,
        structured_data,
        confidence,
        quality_score,
        error_message,
        updated_at
    FROM documents
    WHERE id = $1
"#;

async fn lock_document(
    tx: &mut Transaction<'_, Postgres>,
    document_id: &DocumentId,
) -> Result<Option<Document>, PersistError> {
    let query = format!("{SELECT_DOCUMENT} FOR UPDATE");
    let row = sqlx::query(&query)
        .bind(document_id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_document", e))?;

    row.map(|r| document_from_row(&r)).transpose()
}

async fn write_document(
    tx: &mut Transaction<'_, Postgres>,
    document: &Document,
) -> Result<(), PersistError> {
    sqlx::query(
        r#"
        UPDATE documents SET
            status = $2,
            kind = $3,
            structured_data = $4,
            confidence = $5,
            error_message = $6,
            updated_at = $7
        WHERE id = $1
        "#,
    )
    .bind(document.id.as_str())
    .bind(document.status.as_str())
    .bind(document.kind.as_ref().map(|k| k.as_str()))
    .bind(Value::Object(document.structured_data.clone()))
    .bind(document.confidence)
    .bind(document.error_message.as_deref())
    .bind(document.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_document", e))?;
    Ok(())
}

fn document_from_row(row: &sqlx::postgres::PgRow) -> Result<Document, PersistError> {
    use sqlx::FromRow;

    DocumentRow::from_row(row)
        .map_err(|e| PersistError::Storage(format!("failed to deserialize document row: {e}")))?
        .try_into()
}

/// Map SQLx errors to `PersistError`, separating retryable failures from the rest.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PersistError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code() {
                Some(code) => match code.as_ref() {
                    // Deadlock detected / serialization failure / lock not available
                    "40P01" | "40001" | "55P03" => PersistError::Transient(msg),
                    c if c.starts_with("08") => PersistError::Transient(msg),
                    _ => PersistError::Storage(msg),
                },
                None => PersistError::Storage(msg),
            }
        }
        sqlx::Error::Io(e) => {
            PersistError::Transient(format!("io error in {}: {}", operation, e))
        }
        sqlx::Error::PoolTimedOut => {
            PersistError::Transient(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            PersistError::Transient(format!("connection pool closed in {}", operation))
        }
        _ => PersistError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct DocumentRow {
    id: String,
    tenant_id: uuid::Uuid,
    status: String,
    kind: Option<String>,
    structured_data: Value,
    confidence: Option<f64>,
    quality_score: Option<f64>,
    error_message: Option<String>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for DocumentRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(DocumentRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            status: row.try_get("status")?,
            kind: row.try_get("kind")?,
            structured_data: row.try_get("structured_data")?,
            confidence: row.try_get("confidence")?,
            quality_score: row.try_get("quality_score")?,
            error_message: row.try_get("error_message")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<DocumentRow> for Document {
    type Error = PersistError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        let corrupt = |e: docflow_core::DomainError| {
            PersistError::Storage(format!("corrupt document row {}: {e}", row.id))
        };

        let status: DocumentStatus = row.status.parse().map_err(corrupt)?;
        let kind = match row.kind.as_deref() {
            Some(k) => Some(k.parse::<DocumentKind>().map_err(corrupt)?),
            None => None,
        };
        let structured_data = match row.structured_data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(PersistError::Storage(format!(
                    "corrupt document row {}: structured_data is not an object: {other}",
                    row.id
                )));
            }
        };
        let id = DocumentId::parse(row.id.as_str()).map_err(corrupt)?;

        Ok(Document {
            id,
            tenant_id: TenantId::from_uuid(row.tenant_id),
            status,
            kind,
            structured_data,
            confidence: row.confidence,
            quality_score: row.quality_score,
            error_message: row.error_message,
            updated_at: row.updated_at,
        })
    }
}
