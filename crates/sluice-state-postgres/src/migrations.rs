/// Generate SQL migrations for the PostgreSQL state store
///
/// These migrations create the tables and indexes backing the Sluice lock
/// and retry repositories in PostgreSQL.
pub fn generate_migrations() -> Vec<(&'static str, &'static str)> {
    vec![
        // Initial migration - Create core tables
        (
            "20240601000000_initial_schema",
            r#"
            -- Create distributed lock table
            CREATE TABLE IF NOT EXISTS flow_locks (
                lock_key TEXT PRIMARY KEY,
                locked_client TEXT NOT NULL,
                expire_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            -- Create index on expire_at for expiry sweeps
            CREATE INDEX IF NOT EXISTS idx_flow_locks_expire_at ON flow_locks(expire_at);

            -- Create retry record table
            CREATE TABLE IF NOT EXISTS flow_retries (
                entity_id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                next_retry_time TIMESTAMPTZ NOT NULL,
                last_retry_time TIMESTAMPTZ,
                retry_count INT NOT NULL DEFAULT 0,
                version INT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            -- Create index on next_retry_time for due-record sweeps
            CREATE INDEX IF NOT EXISTS idx_flow_retries_next_retry_time ON flow_retries(next_retry_time);

            -- Create index on entity_type for per-kind queries
            CREATE INDEX IF NOT EXISTS idx_flow_retries_entity_type ON flow_retries(entity_type);
            "#,
        ),
    ]
}
