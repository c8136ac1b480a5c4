//! Postgres-backed ledger store.
//!
//! ## Error Mapping
//!
//! | SQLSTATE | Meaning | StoreError |
//! |----------|---------|------------|
//! | `40P01` | deadlock detected | `Deadlock` |
//! | `40001` | serialization failure | `Deadlock` |
//! | `23505` | unique violation | `UniqueViolation` |
//! | `55P03` | lock not available (`lock_timeout`) | `LockWaitTimeout` |
//! | `57014` | query cancelled (`statement_timeout`) | `LockWaitTimeout` |
//! | other | | `Database` |
//!
//! ## Scope Encoding
//!
//! The unscoped case is stored as an empty string rather than NULL so the unique
//! index on `(scope, account)` also covers unscoped balance rows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Acquire, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use dualbook_core::{
    AccountBalance, AccountKey, Line, LineCheck, LineCheckId, LineDetail, LineFilter, LineId,
    LineMetadata, NewLine, NewLineCheck,
};

use super::r#trait::{LedgerStore, StoreError, StoreTransaction};
use crate::config::LedgerConfig;
use super::schema;

const LINE_COLUMNS: &str = r#"
    id, account, scope, partner_id, partner_account, partner_scope,
    code, amount, balance, detail_type, detail_id, created_at
"#;

/// Postgres-backed ledger store.
///
/// Uses SQLx connection pool which is thread-safe (Arc + Send + Sync). Every
/// transaction sets `lock_timeout` so a blocked `SELECT ... FOR UPDATE` surfaces as
/// `LockWaitTimeout` instead of waiting forever.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
    lock_wait_timeout: Option<Duration>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            lock_wait_timeout: None,
        }
    }

    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = Some(timeout);
        self
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Connect to `config.database_url` and apply the configured lock-wait bound.
    pub async fn from_config(config: &LedgerConfig) -> Result<Self, StoreError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| StoreError::Database("DATABASE_URL is not set".into()))?;
        Ok(Self::connect(url)
            .await?
            .with_lock_wait_timeout(config.lock_wait_timeout))
    }

    /// Create the ledger tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in schema::STATEMENTS {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        debug!(statements = schema::STATEMENTS.len(), "ledger schema ensured");
        Ok(())
    }

    async fn load_metadata(&self, lines: &mut [Line]) -> Result<(), StoreError> {
        if lines.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = lines.iter().map(|l| l.id.get()).collect();
        let rows = sqlx::query(
            r#"
            SELECT line_id, key, value
            FROM ledger_line_metadata
            WHERE line_id = ANY($1)
            ORDER BY id ASC
            "#,
        )
        .bind(&ids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_metadata", e))?;

        for row in rows {
            let line_id: i64 = row.try_get("line_id").map_err(corrupt)?;
            let key: String = row.try_get("key").map_err(corrupt)?;
            let value: String = row.try_get("value").map_err(corrupt)?;
            if let Some(line) = lines.iter_mut().find(|l| l.id.get() == line_id) {
                line.metadata.insert(key, value);
            }
        }
        Ok(())
    }

    async fn fetch_lines(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Line>, StoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        let mut lines = rows.iter().map(line_from_row).collect::<Result<Vec<_>, _>>()?;
        self.load_metadata(&mut lines).await?;
        Ok(lines)
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    type Tx = PostgresTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        if let Some(timeout) = self.lock_wait_timeout {
            // SET does not take bind parameters; the value is an integer we formatted.
            sqlx::query(&format!("SET LOCAL lock_timeout = {}", timeout.as_millis()))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;
        }

        Ok(PostgresTransaction { tx })
    }

    async fn latest_line(
        &self,
        account: &AccountKey,
        at: Option<DateTime<Utc>>,
    ) -> Result<Option<Line>, StoreError> {
        // Served by the (scope, account, id) index; ordering by id keeps the answer exact.
        let sql = format!(
            r#"
            SELECT {LINE_COLUMNS}
            FROM ledger_lines
            WHERE scope = $1 AND account = $2
                AND ($3::timestamptz IS NULL OR created_at <= $3)
            ORDER BY id DESC
            LIMIT 1
            "#
        );
        let query = sqlx::query(&sql)
            .bind(scope_to_db(&account.scope))
            .bind(&account.account)
            .bind(at);
        Ok(self.fetch_lines("latest_line", query).await?.pop())
    }

    async fn sum_amounts(
        &self,
        account: &AccountKey,
        filter: &LineFilter,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT AS total
            FROM ledger_lines
            WHERE scope = $1 AND account = $2
                AND ($3::timestamptz IS NULL OR created_at >= $3)
                AND ($4::timestamptz IS NULL OR created_at < $4)
                AND ($5::timestamptz IS NULL OR created_at <= $5)
                AND (cardinality($6::text[]) = 0 OR code = ANY($6))
            "#,
        )
        .bind(scope_to_db(&account.scope))
        .bind(&account.account)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.at)
        .bind(&filter.codes)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("sum_amounts", e))?;

        row.try_get("total").map_err(corrupt)
    }

    async fn lines(
        &self,
        account: &AccountKey,
        filter: &LineFilter,
    ) -> Result<Vec<Line>, StoreError> {
        let sql = format!(
            r#"
            SELECT {LINE_COLUMNS}
            FROM ledger_lines
            WHERE scope = $1 AND account = $2
                AND ($3::timestamptz IS NULL OR created_at >= $3)
                AND ($4::timestamptz IS NULL OR created_at < $4)
                AND ($5::timestamptz IS NULL OR created_at <= $5)
                AND (cardinality($6::text[]) = 0 OR code = ANY($6))
            ORDER BY id ASC
            "#
        );
        let query = sqlx::query(&sql)
            .bind(scope_to_db(&account.scope))
            .bind(&account.account)
            .bind(filter.from)
            .bind(filter.to)
            .bind(filter.at)
            .bind(&filter.codes);
        self.fetch_lines("lines", query).await
    }

    async fn lines_after(&self, after: LineId, limit: usize) -> Result<Vec<Line>, StoreError> {
        let sql = format!(
            r#"
            SELECT {LINE_COLUMNS}
            FROM ledger_lines
            WHERE id > $1
            ORDER BY id ASC
            LIMIT $2
            "#
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let query = sqlx::query(&sql).bind(after.get()).bind(limit);
        self.fetch_lines("lines_after", query).await
    }

    async fn previous_line(
        &self,
        account: &AccountKey,
        before: LineId,
    ) -> Result<Option<Line>, StoreError> {
        let sql = format!(
            r#"
            SELECT {LINE_COLUMNS}
            FROM ledger_lines
            WHERE scope = $1 AND account = $2 AND id < $3
            ORDER BY id DESC
            LIMIT 1
            "#
        );
        let query = sqlx::query(&sql)
            .bind(scope_to_db(&account.scope))
            .bind(&account.account)
            .bind(before.get());
        Ok(self.fetch_lines("previous_line", query).await?.pop())
    }

    async fn line(&self, id: LineId) -> Result<Option<Line>, StoreError> {
        let sql = format!("SELECT {LINE_COLUMNS} FROM ledger_lines WHERE id = $1");
        let query = sqlx::query(&sql).bind(id.get());
        Ok(self.fetch_lines("line", query).await?.pop())
    }

    async fn cached_balance(
        &self,
        account: &AccountKey,
    ) -> Result<Option<AccountBalance>, StoreError> {
        let row = sqlx::query(
            "SELECT balance FROM account_balances WHERE scope = $1 AND account = $2",
        )
        .bind(scope_to_db(&account.scope))
        .bind(&account.account)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cached_balance", e))?;

        row.map(|row| {
            Ok(AccountBalance {
                account: account.clone(),
                balance: row.try_get("balance").map_err(corrupt)?,
            })
        })
        .transpose()
    }

    async fn last_line_check(&self) -> Result<Option<LineCheck>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, last_line_id, errors_found, log, created_at
            FROM ledger_line_checks
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("last_line_check", e))?;

        row.as_ref().map(line_check_from_row).transpose()
    }

    async fn insert_line_check(&self, check: NewLineCheck) -> Result<LineCheck, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO ledger_line_checks (last_line_id, errors_found, log, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, last_line_id, errors_found, log, created_at
            "#,
        )
        .bind(check.last_line_id.get())
        .bind(check.errors_found)
        .bind(&check.log)
        .bind(check.created_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_line_check", e))?;

        line_check_from_row(&row)
    }
}

/// Open Postgres transaction.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn select_balance_for_update(
        &mut self,
        account: &AccountKey,
    ) -> Result<Option<AccountBalance>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT balance FROM account_balances
            WHERE scope = $1 AND account = $2
            FOR UPDATE
            "#,
        )
        .bind(scope_to_db(&account.scope))
        .bind(&account.account)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("select_balance_for_update", e))?;

        row.map(|row| {
            Ok(AccountBalance {
                account: account.clone(),
                balance: row.try_get("balance").map_err(corrupt)?,
            })
        })
        .transpose()
    }

    async fn insert_balance(
        &mut self,
        account: &AccountKey,
        balance: i64,
    ) -> Result<AccountBalance, StoreError> {
        // A failed statement aborts a Postgres transaction; the savepoint keeps the
        // outer transaction usable when the insert loses a race.
        let mut savepoint = Acquire::begin(&mut self.tx)
            .await
            .map_err(|e| map_sqlx_error("savepoint", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO account_balances (account, scope, balance)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&account.account)
        .bind(scope_to_db(&account.scope))
        .bind(balance)
        .execute(&mut *savepoint)
        .await;

        match inserted {
            Ok(_) => {
                savepoint
                    .commit()
                    .await
                    .map_err(|e| map_sqlx_error("release_savepoint", e))?;
                Ok(AccountBalance {
                    account: account.clone(),
                    balance,
                })
            }
            Err(e) => {
                let err = map_sqlx_error("insert_balance", e);
                savepoint
                    .rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback_savepoint", e))?;
                Err(err)
            }
        }
    }

    async fn update_balance(
        &mut self,
        account: &AccountKey,
        balance: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE account_balances
            SET balance = $3, updated_at = NOW()
            WHERE scope = $1 AND account = $2
            "#,
        )
        .bind(scope_to_db(&account.scope))
        .bind(&account.account)
        .bind(balance)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_balance", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Database(format!("no balance row for {account}")));
        }
        Ok(())
    }

    async fn sum_amounts(&mut self, account: &AccountKey) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT AS total
            FROM ledger_lines
            WHERE scope = $1 AND account = $2
            "#,
        )
        .bind(scope_to_db(&account.scope))
        .bind(&account.account)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("sum_amounts", e))?;

        row.try_get("total").map_err(corrupt)
    }

    async fn latest_line(&mut self, account: &AccountKey) -> Result<Option<Line>, StoreError> {
        let sql = format!(
            r#"
            SELECT {LINE_COLUMNS}
            FROM ledger_lines
            WHERE scope = $1 AND account = $2
            ORDER BY id DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(scope_to_db(&account.scope))
            .bind(&account.account)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("latest_line", e))?;
        row.as_ref().map(line_from_row).transpose()
    }

    async fn insert_line(&mut self, line: NewLine) -> Result<Line, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO ledger_lines (
                account, scope, partner_account, partner_scope,
                code, amount, balance, detail_type, detail_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {LINE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&line.account.account)
            .bind(scope_to_db(&line.account.scope))
            .bind(&line.partner_account.account)
            .bind(scope_to_db(&line.partner_account.scope))
            .bind(&line.code)
            .bind(line.amount)
            .bind(line.balance)
            .bind(line.detail.as_ref().map(|d| d.kind.as_str()))
            .bind(line.detail.as_ref().map(|d| d.id.as_str()))
            .bind(line.created_at)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_line", e))?;

        line_from_row(&row)
    }

    async fn link_partners(&mut self, first: LineId, second: LineId) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE ledger_lines
            SET partner_id = CASE WHEN id = $1 THEN $2 ELSE $1 END,
                updated_at = NOW()
            WHERE id IN ($1, $2)
            "#,
        )
        .bind(first.get())
        .bind(second.get())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("link_partners", e))?;
        Ok(())
    }

    async fn attach_metadata(
        &mut self,
        line: LineId,
        metadata: &LineMetadata,
    ) -> Result<(), StoreError> {
        for (key, value) in metadata {
            sqlx::query(
                "INSERT INTO ledger_line_metadata (line_id, key, value) VALUES ($1, $2, $3)",
            )
            .bind(line.get())
            .bind(key)
            .bind(value)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("attach_metadata", e))?;
        }
        Ok(())
    }

    async fn account_lines(&mut self, account: &AccountKey) -> Result<Vec<Line>, StoreError> {
        let sql = format!(
            r#"
            SELECT {LINE_COLUMNS}
            FROM ledger_lines
            WHERE scope = $1 AND account = $2
            ORDER BY id ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(scope_to_db(&account.scope))
            .bind(&account.account)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("account_lines", e))?;
        rows.iter().map(line_from_row).collect()
    }

    async fn update_line_balance(&mut self, line: LineId, balance: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE ledger_lines SET balance = $2, updated_at = NOW() WHERE id = $1")
            .bind(line.get())
            .bind(balance)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("update_line_balance", e))?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }
}

fn scope_to_db(scope: &Option<String>) -> &str {
    scope.as_deref().unwrap_or("")
}

fn scope_from_db(scope: String) -> Option<String> {
    if scope.is_empty() { None } else { Some(scope) }
}

fn corrupt(err: sqlx::Error) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

fn line_from_row(row: &PgRow) -> Result<Line, StoreError> {
    let detail_type: Option<String> = row.try_get("detail_type").map_err(corrupt)?;
    let detail_id: Option<String> = row.try_get("detail_id").map_err(corrupt)?;
    let detail = match (detail_type, detail_id) {
        (Some(kind), Some(id)) => Some(LineDetail { kind, id }),
        _ => None,
    };

    Ok(Line {
        id: LineId::new(row.try_get("id").map_err(corrupt)?),
        account: AccountKey::new(
            row.try_get::<String, _>("account").map_err(corrupt)?,
            scope_from_db(row.try_get("scope").map_err(corrupt)?),
        ),
        partner_account: AccountKey::new(
            row.try_get::<String, _>("partner_account").map_err(corrupt)?,
            scope_from_db(row.try_get("partner_scope").map_err(corrupt)?),
        ),
        partner_id: LineId::new(row.try_get("partner_id").map_err(corrupt)?),
        code: row.try_get("code").map_err(corrupt)?,
        amount: row.try_get("amount").map_err(corrupt)?,
        balance: row.try_get("balance").map_err(corrupt)?,
        detail,
        metadata: LineMetadata::new(),
        created_at: row.try_get("created_at").map_err(corrupt)?,
    })
}

fn line_check_from_row(row: &PgRow) -> Result<LineCheck, StoreError> {
    Ok(LineCheck {
        id: LineCheckId::new(row.try_get("id").map_err(corrupt)?),
        last_line_id: LineId::new(row.try_get("last_line_id").map_err(corrupt)?),
        errors_found: row.try_get("errors_found").map_err(corrupt)?,
        log: row
            .try_get::<Option<String>, _>("log")
            .map_err(corrupt)?
            .unwrap_or_default(),
        created_at: row.try_get("created_at").map_err(corrupt)?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("40P01") | Some("40001") => StoreError::Deadlock(msg),
                Some("23505") => StoreError::UniqueViolation(msg),
                Some("55P03") | Some("57014") => StoreError::LockWaitTimeout(msg),
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Database(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Database(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}
