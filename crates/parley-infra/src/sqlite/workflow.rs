//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `parley-core` using sqlx with split
//! read/write pools. Definitions are stored as JSON blobs; execution records
//! are stored column-per-field with variables as a JSON object, so a turn's
//! write-back is a single UPDATE.

use chrono::{DateTime, SecondsFormat, Utc};
use parley_core::repository::workflow::WorkflowRepository;
use parley_types::error::RepositoryError;
use parley_types::workflow::{ExecutionStatus, Variables, WorkflowDefinition, WorkflowExecution};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
#[derive(Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const EXECUTION_COLUMNS: &str = "id, workflow_id, tenant_id, session_id, user_identifier, status, \
     steps_completed, total_steps, current_step_id, variables, error_message, \
     started_at, updated_at, completed_at";

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    workflow_id: String,
    tenant_id: String,
    session_id: String,
    user_identifier: String,
    status: String,
    steps_completed: i64,
    total_steps: i64,
    current_step_id: Option<String>,
    variables: String,
    error_message: Option<String>,
    started_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            tenant_id: row.try_get("tenant_id")?,
            session_id: row.try_get("session_id")?,
            user_identifier: row.try_get("user_identifier")?,
            status: row.try_get("status")?,
            steps_completed: row.try_get("steps_completed")?,
            total_steps: row.try_get("total_steps")?,
            current_step_id: row.try_get("current_step_id")?,
            variables: row.try_get("variables")?,
            error_message: row.try_get("error_message")?,
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_execution(self) -> Result<WorkflowExecution, RepositoryError> {
        let status: ExecutionStatus = self.status.parse().map_err(RepositoryError::Corrupt)?;
        let variables: Variables = serde_json::from_str(&self.variables)
            .map_err(|e| RepositoryError::Corrupt(format!("invalid variables JSON: {e}")))?;

        Ok(WorkflowExecution {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            tenant_id: self.tenant_id,
            session_id: self.session_id,
            user_identifier: self.user_identifier,
            status,
            steps_completed: to_u32("steps_completed", self.steps_completed)?,
            total_steps: to_u32("total_steps", self.total_steps)?,
            current_step_id: self.current_step_id,
            variables,
            error_message: self.error_message,
            started_at: parse_datetime(&self.started_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Corrupt(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Corrupt(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC timestamps so string comparison orders chronologically.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value)
        .map_err(|_| RepositoryError::Corrupt(format!("{column} out of range: {value}")))
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    match e.as_database_error() {
        Some(db) if db.is_unique_violation() => RepositoryError::Conflict(db.message().to_string()),
        _ => RepositoryError::Query(e.to_string()),
    }
}

fn rows_to_executions(
    rows: &[sqlx::sqlite::SqliteRow],
) -> Result<Vec<WorkflowExecution>, RepositoryError> {
    rows.iter()
        .map(|row| {
            ExecutionRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_execution()
        })
        .collect()
}

fn row_to_definition(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowDefinition, RepositoryError> {
    let json: String = row
        .try_get("definition")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    serde_json::from_str(&json)
        .map_err(|e| RepositoryError::Corrupt(format!("invalid workflow definition JSON: {e}")))
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflows (id, name, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.as_ref().map(row_to_definition).transpose()
    }

    async fn get_definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.as_ref().map(row_to_definition).transpose()
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM workflows ORDER BY name ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter().map(row_to_definition).collect()
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let variables = serde_json::to_string(&execution.variables)
            .map_err(|e| RepositoryError::Query(format!("serialize variables: {e}")))?;

        sqlx::query(&format!(
            "INSERT INTO workflow_executions ({EXECUTION_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(execution.id.to_string())
        .bind(execution.workflow_id.to_string())
        .bind(&execution.tenant_id)
        .bind(&execution.session_id)
        .bind(&execution.user_identifier)
        .bind(execution.status.as_str())
        .bind(i64::from(execution.steps_completed))
        .bind(i64::from(execution.total_steps))
        .bind(&execution.current_step_id)
        .bind(&variables)
        .bind(&execution.error_message)
        .bind(format_datetime(&execution.started_at))
        .bind(format_datetime(&execution.updated_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let variables = serde_json::to_string(&execution.variables)
            .map_err(|e| RepositoryError::Query(format!("serialize variables: {e}")))?;

        let result = sqlx::query(
            r#"UPDATE workflow_executions SET
                 status = ?,
                 steps_completed = ?,
                 current_step_id = ?,
                 variables = ?,
                 error_message = ?,
                 updated_at = ?,
                 completed_at = ?
               WHERE id = ?"#,
        )
        .bind(execution.status.as_str())
        .bind(i64::from(execution.steps_completed))
        .bind(&execution.current_step_id)
        .bind(&variables)
        .bind(&execution.error_message)
        .bind(format_datetime(&execution.updated_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(execution.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => Ok(Some(
                ExecutionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_execution()?,
            )),
            None => Ok(None),
        }
    }

    async fn find_active_execution(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
             WHERE tenant_id = ? AND session_id = ? AND status = 'RUNNING' \
             ORDER BY started_at DESC LIMIT 1"
        ))
        .bind(tenant_id)
        .bind(session_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        Ok(rows_to_executions(&rows)?.into_iter().next())
    }

    async fn list_executions(
        &self,
        tenant_id: &str,
        session_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = match session_id {
            Some(session_id) => {
                sqlx::query(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
                     WHERE tenant_id = ? AND session_id = ? \
                     ORDER BY started_at DESC LIMIT ?"
                ))
                .bind(tenant_id)
                .bind(session_id)
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
                     WHERE tenant_id = ? ORDER BY started_at DESC LIMIT ?"
                ))
                .bind(tenant_id)
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_error)?;

        rows_to_executions(&rows)
    }

    async fn list_idle_executions(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
             WHERE status = 'RUNNING' AND updated_at < ? ORDER BY updated_at ASC"
        ))
        .bind(format_datetime(&before))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows_to_executions(&rows)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
