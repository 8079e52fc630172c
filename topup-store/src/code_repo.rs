use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use topup_catalog::codes::{Code, CodeError, CodeGroup, CodeState, CodeStatus, CodeStore};
use topup_catalog::import::NewCode;
use uuid::Uuid;

const CODE_COLUMNS: &str =
    "id, group_id, pin, serial, cost, status, order_id, created_at, used_at";

const GROUP_COLUMNS: &str = "id, name, is_active, created_at";

/// Postgres-backed code store. Claims are a single conditional UPDATE so the
/// row itself arbitrates concurrent claimers.
pub struct PgCodeStore {
    pool: PgPool,
}

impl PgCodeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct CodeRow {
    id: Uuid,
    group_id: String,
    pin: Option<String>,
    serial: Option<String>,
    cost: f64,
    status: String,
    order_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    used_at: Option<DateTime<Utc>>,
}

impl TryFrom<CodeRow> for Code {
    type Error = CodeError;

    fn try_from(row: CodeRow) -> Result<Self, Self::Error> {
        Ok(Code {
            id: row.id,
            group_id: row.group_id,
            pin: row.pin,
            serial: row.serial,
            cost: row.cost,
            status: row.status.parse()?,
            order_id: row.order_id,
            created_at: row.created_at,
            used_at: row.used_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    id: String,
    name: String,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl From<GroupRow> for CodeGroup {
    fn from(row: GroupRow) -> Self {
        CodeGroup {
            id: row.id,
            name: row.name,
            is_active: row.is_active,
            created_at: row.created_at,
        }
    }
}

fn storage(e: sqlx::Error) -> CodeError {
    tracing::error!("Code store query failed: {}", e);
    CodeError::Storage(e.to_string())
}

#[async_trait]
impl CodeStore for PgCodeStore {
    async fn insert_batch(&self, group_id: &str, codes: Vec<NewCode>) -> Result<Vec<Code>, CodeError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let mut created = Vec::with_capacity(codes.len());
        let sql = format!(
            "INSERT INTO codes (id, group_id, pin, serial, cost, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, 'AVAILABLE', $6) RETURNING {}",
            CODE_COLUMNS
        );
        for new_code in codes {
            let code = Code::new(group_id, new_code);
            let row: CodeRow = sqlx::query_as(&sql)
                .bind(code.id)
                .bind(&code.group_id)
                .bind(&code.pin)
                .bind(&code.serial)
                .bind(code.cost)
                .bind(code.created_at)
                .fetch_one(&mut *tx)
                .await
                .map_err(storage)?;
            created.push(Code::try_from(row)?);
        }
        tx.commit().await.map_err(storage)?;
        Ok(created)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Code>, CodeError> {
        let sql = format!("SELECT {} FROM codes WHERE id = $1", CODE_COLUMNS);
        let row: Option<CodeRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.map(Code::try_from).transpose()
    }

    async fn list_group(&self, group_id: &str) -> Result<Vec<Code>, CodeError> {
        let sql = format!(
            "SELECT {} FROM codes WHERE group_id = $1 ORDER BY created_at, id",
            CODE_COLUMNS
        );
        let rows: Vec<CodeRow> = sqlx::query_as(&sql)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.into_iter().map(Code::try_from).collect()
    }

    async fn available_candidates(&self, group_id: &str, limit: usize) -> Result<Vec<Uuid>, CodeError> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM codes WHERE group_id = $1 AND status = 'AVAILABLE' \
             ORDER BY created_at, id LIMIT $2",
        )
        .bind(group_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected: CodeState,
        next: CodeState,
    ) -> Result<Option<Code>, CodeError> {
        let sql = format!(
            "UPDATE codes SET status = $3, order_id = $4, \
                 used_at = CASE WHEN $3 = 'USED' THEN now() \
                                WHEN $3 IN ('AVAILABLE', 'RESERVED') THEN NULL \
                                ELSE used_at END \
             WHERE id = $1 AND status = $2 AND order_id IS NOT DISTINCT FROM $5 \
             RETURNING {}",
            CODE_COLUMNS
        );
        let row: Option<CodeRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(expected.status.as_str())
            .bind(next.status.as_str())
            .bind(next.order_id)
            .bind(expected.order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        match row {
            Some(row) => Ok(Some(Code::try_from(row)?)),
            None => {
                // Distinguish a lost race from a missing row.
                if self.get(id).await?.is_none() {
                    return Err(CodeError::NotFound(id));
                }
                Ok(None)
            }
        }
    }

    async fn create_group(&self, group: CodeGroup) -> Result<Option<CodeGroup>, CodeError> {
        let sql = format!(
            "INSERT INTO code_groups (id, name, is_active, created_at) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO NOTHING RETURNING {}",
            GROUP_COLUMNS
        );
        let row: Option<GroupRow> = sqlx::query_as(&sql)
            .bind(&group.id)
            .bind(&group.name)
            .bind(group.is_active)
            .bind(group.created_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.map(CodeGroup::from))
    }

    async fn get_group(&self, id: &str) -> Result<Option<CodeGroup>, CodeError> {
        let sql = format!("SELECT {} FROM code_groups WHERE id = $1", GROUP_COLUMNS);
        let row: Option<GroupRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.map(CodeGroup::from))
    }

    async fn list_groups(&self) -> Result<Vec<CodeGroup>, CodeError> {
        let sql = format!("SELECT {} FROM code_groups ORDER BY created_at, id", GROUP_COLUMNS);
        let rows: Vec<GroupRow> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        Ok(rows.into_iter().map(CodeGroup::from).collect())
    }

    async fn set_group_active(&self, id: &str, active: bool) -> Result<Option<CodeGroup>, CodeError> {
        let sql = format!(
            "UPDATE code_groups SET is_active = $2 WHERE id = $1 RETURNING {}",
            GROUP_COLUMNS
        );
        let row: Option<GroupRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(active)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.map(CodeGroup::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_status_parsing() {
        let row = CodeRow {
            id: Uuid::new_v4(),
            group_id: "g1".into(),
            pin: Some("AAA".into()),
            serial: None,
            cost: 1.0,
            status: "RESERVED".into(),
            order_id: Some(Uuid::new_v4()),
            created_at: Utc::now(),
            used_at: None,
        };
        let code = Code::try_from(row).unwrap();
        assert_eq!(code.status, CodeStatus::Reserved);
    }

    #[test]
    fn test_unknown_status_is_a_storage_error() {
        let row = CodeRow {
            id: Uuid::new_v4(),
            group_id: "g1".into(),
            pin: None,
            serial: Some("1".into()),
            cost: 1.0,
            status: "LOST".into(),
            order_id: None,
            created_at: Utc::now(),
            used_at: None,
        };
        assert!(matches!(Code::try_from(row), Err(CodeError::Storage(_))));
    }
}
