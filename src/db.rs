use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::error;

use crate::error::{Error, Result};
use crate::models::{Collection, Operation, StoredStudent};
use crate::store::{stored_student, DocumentStore};

/// Postgres-backed document store. Each collection is a table of JSONB
/// documents keyed by id.
pub struct PgStore {
    pool: PgPool,
}

fn table(collection: Collection) -> &'static str {
    match collection {
        Collection::Students => "expansivo.students",
        Collection::Grades => "expansivo.grades",
    }
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init_db(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn students_in_unit(&self, unit: &str) -> Result<Vec<StoredStudent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, data, created_at
            FROM expansivo.students
            WHERE unit = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(unit)
        .fetch_all(&self.pool)
        .await?;

        let mut students = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let created_at: DateTime<Utc> = row.get("created_at");
            let data = match row.get::<Value, _>("data") {
                Value::Object(map) => map,
                other => {
                    error!(storage_id = %id, document = %other, "skipping student document that is not a JSON object");
                    continue;
                }
            };
            students.extend(stored_student(id, Some(created_at), data));
        }

        Ok(students)
    }

    async fn grade_ids_for(&self, student_ids: &[String]) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let rows = sqlx::query("SELECT id, student_id FROM expansivo.grades WHERE student_id = ANY($1)")
            .bind(student_ids)
            .fetch_all(&self.pool)
            .await?;

        let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for row in rows {
            let student_id: String = row.get("student_id");
            out.entry(student_id).or_default().insert(row.get("id"));
        }
        Ok(out)
    }

    async fn apply_chunk(&self, ops: &[Operation]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for op in ops {
            let table = table(op.collection());
            match op {
                Operation::Create { id, document, .. } => {
                    sqlx::query(&format!(
                        "INSERT INTO {table} (id, data) VALUES ($1, $2) \
                         ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data, updated_at = now()"
                    ))
                    .bind(id)
                    .bind(Value::Object(document.clone()))
                    .execute(&mut *tx)
                    .await?;
                }
                Operation::Update { id, fields, .. } => {
                    sqlx::query(&format!(
                        "INSERT INTO {table} (id, data) VALUES ($1, $2) \
                         ON CONFLICT (id) DO UPDATE SET data = {table}.data || EXCLUDED.data, updated_at = now()"
                    ))
                    .bind(id)
                    .bind(Value::Object(fields.clone()))
                    .execute(&mut *tx)
                    .await?;
                }
                Operation::Delete { id, .. } => {
                    sqlx::query(&format!("DELETE FROM {table} WHERE id = $1"))
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, owner: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO expansivo.run_locks (lock_key, owner)
            VALUES ($1, $2)
            ON CONFLICT (lock_key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        let holder: String = sqlx::query("SELECT owner FROM expansivo.run_locks WHERE lock_key = $1")
            .bind(key)
            .fetch_one(&self.pool)
            .await?
            .get("owner");

        if holder != owner {
            return Err(Error::LockHeld {
                key: key.to_string(),
                owner: holder,
            });
        }
        Ok(())
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM expansivo.run_locks WHERE lock_key = $1 AND owner = $2")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn force_unlock(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM expansivo.run_locks WHERE lock_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
