//! Ledger schema DDL.
//!
//! Four tables: cached balances, the entry log, normalized line metadata and the
//! consistency-check audit trail. Statements are idempotent.

pub const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS account_balances (
        id BIGSERIAL PRIMARY KEY,
        account VARCHAR(31) NOT NULL,
        scope VARCHAR(23) NOT NULL DEFAULT '',
        balance BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS account_balances_scope_account_idx
        ON account_balances (scope, account)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_lines (
        id BIGSERIAL PRIMARY KEY,
        account VARCHAR(31) NOT NULL,
        scope VARCHAR(23) NOT NULL DEFAULT '',
        code VARCHAR(47) NOT NULL,
        amount BIGINT NOT NULL,
        balance BIGINT NOT NULL,
        partner_id BIGINT NOT NULL DEFAULT 0,
        partner_account VARCHAR(31) NOT NULL,
        partner_scope VARCHAR(23) NOT NULL DEFAULT '',
        detail_type VARCHAR(255),
        detail_id VARCHAR(255),
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    // Running-balance lookups: latest line of an account by id.
    r#"
    CREATE INDEX IF NOT EXISTS ledger_lines_scope_account_id_idx
        ON ledger_lines (scope, account, id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ledger_lines_scope_account_created_at_idx
        ON ledger_lines (scope, account, created_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ledger_lines_account_created_at_idx
        ON ledger_lines (account, created_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ledger_lines_account_code_created_at_idx
        ON ledger_lines (account, code, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_line_metadata (
        id BIGSERIAL PRIMARY KEY,
        line_id BIGINT NOT NULL REFERENCES ledger_lines (id),
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ledger_line_metadata_line_key_idx
        ON ledger_line_metadata (line_id, key)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_line_checks (
        id BIGSERIAL PRIMARY KEY,
        last_line_id BIGINT NOT NULL,
        errors_found BOOLEAN NOT NULL,
        log TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ledger_line_checks_created_at_idx
        ON ledger_line_checks (created_at, id)
    "#,
];
