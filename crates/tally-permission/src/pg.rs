//! PostgreSQL permission store.
//!
//! Uses runtime SQL queries to avoid requiring DATABASE_URL at compile
//! time. Model lists are persisted as comma-joined text; department
//! paths as `/`-joined text in `dept_full_level_names`.

use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use tally_common::{EmployeeNumber, TallyError, TallyResult};

use crate::store::PermissionStore;
use crate::types::{
    normalize_models, EmployeeDepartment, PermissionAudit, PermissionOperation, ScalarKind,
    TargetType,
};

/// Permission store backed by PostgreSQL.
pub struct PgPermissionStore {
    pool: PgPool,
}

impl PgPermissionStore {
    /// Create a store over the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn models_to_db(models: &[String]) -> String {
    models.join(",")
}

fn models_from_db(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

fn employee_from_row(row: &sqlx::postgres::PgRow) -> EmployeeDepartment {
    EmployeeDepartment {
        employee_number: EmployeeNumber::from(row.get::<String, _>("employee_number")),
        username: row.get("username"),
        dept_path: EmployeeDepartment::path_from_db(&row.get::<String, _>(
            "dept_full_level_names",
        )),
        update_time: row.get("update_time"),
    }
}

impl PermissionStore for PgPermissionStore {
    async fn upsert_employee(&self, entry: &EmployeeDepartment) -> TallyResult<()> {
        sqlx::query(
            r#"
            INSERT INTO employee_department (employee_number, username, dept_full_level_names, update_time)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (employee_number)
            DO UPDATE SET username = $2, dept_full_level_names = $3, update_time = $4
            "#,
        )
        .bind(entry.employee_number.as_str())
        .bind(&entry.username)
        .bind(entry.path_to_db())
        .bind(entry.update_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_employee(
        &self,
        employee: &EmployeeNumber,
    ) -> TallyResult<Option<EmployeeDepartment>> {
        let row = sqlx::query(
            r#"
            SELECT employee_number, username, dept_full_level_names, update_time
            FROM employee_department
            WHERE employee_number = $1
            "#,
        )
        .bind(employee.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(employee_from_row))
    }

    async fn delete_employee(&self, employee: &EmployeeNumber) -> TallyResult<()> {
        sqlx::query(r#"DELETE FROM employee_department WHERE employee_number = $1"#)
            .bind(employee.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_employees(&self) -> TallyResult<Vec<EmployeeDepartment>> {
        let rows = sqlx::query(
            r#"
            SELECT employee_number, username, dept_full_level_names, update_time
            FROM employee_department
            ORDER BY employee_number
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(employee_from_row).collect())
    }

    async fn employees_in_department(
        &self,
        department: &str,
    ) -> TallyResult<Vec<EmployeeDepartment>> {
        let rows = sqlx::query(
            r#"
            SELECT employee_number, username, dept_full_level_names, update_time
            FROM employee_department
            WHERE $1 = ANY(string_to_array(dept_full_level_names, '/'))
            ORDER BY employee_number
            "#,
        )
        .bind(department)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(employee_from_row).collect())
    }

    async fn department_exists(&self, department: &str) -> TallyResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM employee_department
                WHERE $1 = ANY(string_to_array(dept_full_level_names, '/'))
            ) AS present
            "#,
        )
        .bind(department)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("present"))
    }

    async fn upsert_whitelist(
        &self,
        target_type: TargetType,
        target: &str,
        models: &[String],
    ) -> TallyResult<()> {
        sqlx::query(
            r#"
            INSERT INTO model_whitelist (id, target_type, target_identifier, allowed_models, create_time, update_time)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (target_type, target_identifier)
            DO UPDATE SET allowed_models = $4, update_time = $5
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(target_type.as_db_str())
        .bind(target)
        .bind(models_to_db(&normalize_models(models)))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_whitelist(
        &self,
        target_type: TargetType,
        target: &str,
    ) -> TallyResult<Option<Vec<String>>> {
        let row = sqlx::query(
            r#"
            SELECT allowed_models FROM model_whitelist
            WHERE target_type = $1 AND target_identifier = $2
            "#,
        )
        .bind(target_type.as_db_str())
        .bind(target)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| models_from_db(&r.get::<String, _>("allowed_models"))))
    }

    async fn delete_whitelist(
        &self,
        target_type: TargetType,
        target: &str,
    ) -> TallyResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM model_whitelist
            WHERE target_type = $1 AND target_identifier = $2
            "#,
        )
        .bind(target_type.as_db_str())
        .bind(target)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_effective_models(
        &self,
        employee: &EmployeeNumber,
    ) -> TallyResult<Option<Vec<String>>> {
        let row = sqlx::query(
            r#"SELECT effective_models FROM effective_permissions WHERE employee_number = $1"#,
        )
        .bind(employee.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| models_from_db(&r.get::<String, _>("effective_models"))))
    }

    async fn upsert_effective_models(
        &self,
        employee: &EmployeeNumber,
        models: &[String],
    ) -> TallyResult<()> {
        sqlx::query(
            r#"
            INSERT INTO effective_permissions (id, employee_number, effective_models, update_time)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (employee_number)
            DO UPDATE SET effective_models = $3, update_time = $4
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(employee.as_str())
        .bind(models_to_db(models))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_effective_models(&self, employee: &EmployeeNumber) -> TallyResult<()> {
        sqlx::query(r#"DELETE FROM effective_permissions WHERE employee_number = $1"#)
            .bind(employee.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_setting(
        &self,
        kind: ScalarKind,
        target_type: TargetType,
        target: &str,
        enabled: bool,
    ) -> TallyResult<()> {
        let query = format!(
            r#"
            INSERT INTO {} (id, target_type, target_identifier, enabled, create_time, update_time)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (target_type, target_identifier)
            DO UPDATE SET enabled = $4, update_time = $5
            "#,
            kind.setting_table()
        );
        sqlx::query(&query)
            .bind(Uuid::now_v7())
            .bind(target_type.as_db_str())
            .bind(target)
            .bind(enabled)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_setting(
        &self,
        kind: ScalarKind,
        target_type: TargetType,
        target: &str,
    ) -> TallyResult<Option<bool>> {
        let query = format!(
            r#"SELECT enabled FROM {} WHERE target_type = $1 AND target_identifier = $2"#,
            kind.setting_table()
        );
        let row = sqlx::query(&query)
            .bind(target_type.as_db_str())
            .bind(target)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("enabled")))
    }

    async fn delete_setting(
        &self,
        kind: ScalarKind,
        target_type: TargetType,
        target: &str,
    ) -> TallyResult<bool> {
        let query = format!(
            r#"DELETE FROM {} WHERE target_type = $1 AND target_identifier = $2"#,
            kind.setting_table()
        );
        let result = sqlx::query(&query)
            .bind(target_type.as_db_str())
            .bind(target)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_effective_setting(
        &self,
        kind: ScalarKind,
        employee: &EmployeeNumber,
    ) -> TallyResult<Option<bool>> {
        let query = format!(
            r#"SELECT enabled FROM {} WHERE employee_number = $1"#,
            kind.effective_table()
        );
        let row = sqlx::query(&query)
            .bind(employee.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("enabled")))
    }

    async fn upsert_effective_setting(
        &self,
        kind: ScalarKind,
        employee: &EmployeeNumber,
        enabled: bool,
    ) -> TallyResult<()> {
        let query = format!(
            r#"
            INSERT INTO {} (id, employee_number, enabled, update_time)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (employee_number)
            DO UPDATE SET enabled = $3, update_time = $4
            "#,
            kind.effective_table()
        );
        sqlx::query(&query)
            .bind(Uuid::now_v7())
            .bind(employee.as_str())
            .bind(enabled)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_effective_setting(
        &self,
        kind: ScalarKind,
        employee: &EmployeeNumber,
    ) -> TallyResult<()> {
        let query = format!(
            r#"DELETE FROM {} WHERE employee_number = $1"#,
            kind.effective_table()
        );
        sqlx::query(&query)
            .bind(employee.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_audit(&self, entry: &PermissionAudit) -> TallyResult<()> {
        sqlx::query(
            r#"
            INSERT INTO permission_audit (id, employee_number, operation, detail, create_time)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.id)
        .bind(entry.employee_number.as_str())
        .bind(entry.operation.as_db_str())
        .bind(&entry.detail)
        .bind(entry.create_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn audits_for_employee(
        &self,
        employee: &EmployeeNumber,
        limit: i64,
    ) -> TallyResult<Vec<PermissionAudit>> {
        let rows = sqlx::query(
            r#"
            SELECT id, employee_number, operation, detail, create_time
            FROM permission_audit
            WHERE employee_number = $1
            ORDER BY create_time DESC
            LIMIT $2
            "#,
        )
        .bind(employee.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let operation_str: String = row.get("operation");
                let operation =
                    PermissionOperation::from_db_str(&operation_str).ok_or_else(|| {
                        TallyError::Database(format!(
                            "unknown permission operation: {operation_str}"
                        ))
                    })?;
                Ok(PermissionAudit {
                    id: row.get("id"),
                    employee_number: EmployeeNumber::from(
                        row.get::<String, _>("employee_number"),
                    ),
                    operation,
                    detail: row.get("detail"),
                    create_time: row.get("create_time"),
                })
            })
            .collect()
    }
}
