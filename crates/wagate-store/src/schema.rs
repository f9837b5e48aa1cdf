/// SQL DDL for the gateway database.
/// WAL mode + busy timeout applied at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    api_key TEXT NOT NULL UNIQUE,
    webhook_url TEXT,
    transcription_enabled INTEGER NOT NULL DEFAULT 1,
    typing_delay_min INTEGER NOT NULL DEFAULT 1000,
    typing_delay_max INTEGER NOT NULL DEFAULT 3000,
    status TEXT NOT NULL DEFAULT 'disconnected',
    phone TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_instances_api_key ON instances(api_key);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
