/// SQL DDL for the slate-store database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    budget_cap_usd REAL NOT NULL DEFAULT 0.0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scenes (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'draft',
    version INTEGER NOT NULL DEFAULT 0,
    locked_until TEXT,
    locked_by TEXT,
    title TEXT NOT NULL,
    script TEXT NOT NULL DEFAULT '',
    narrative_goal TEXT NOT NULL DEFAULT '',
    emotional_beat TEXT NOT NULL DEFAULT '',
    location TEXT NOT NULL DEFAULT '',
    time_of_day TEXT NOT NULL DEFAULT '',
    characters TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS proposals (
    id TEXT PRIMARY KEY,
    scene_id TEXT NOT NULL REFERENCES scenes(id) ON DELETE CASCADE,
    job_id TEXT,
    role TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    summary TEXT NOT NULL,
    rationale TEXT NOT NULL DEFAULT '',
    diff TEXT NOT NULL,
    tokens_used INTEGER NOT NULL DEFAULT 0,
    cost_usd REAL NOT NULL DEFAULT 0.0,
    created_at TEXT NOT NULL,
    decided_at TEXT
);

CREATE TABLE IF NOT EXISTS ledger_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL UNIQUE,
    event_type TEXT NOT NULL,
    project_id TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    emitted_by TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    scene_id TEXT NOT NULL REFERENCES scenes(id) ON DELETE CASCADE,
    state TEXT NOT NULL DEFAULT 'scheduled',
    attempt INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    run_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scenes_project ON scenes(project_id);
CREATE INDEX IF NOT EXISTS idx_proposals_scene ON proposals(scene_id);
CREATE INDEX IF NOT EXISTS idx_proposals_status ON proposals(status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_proposals_job_role ON proposals(job_id, role) WHERE job_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_ledger_project ON ledger_events(project_id);
CREATE INDEX IF NOT EXISTS idx_ledger_entity ON ledger_events(entity_id);
CREATE INDEX IF NOT EXISTS idx_ledger_type ON ledger_events(event_type);
CREATE INDEX IF NOT EXISTS idx_ledger_timestamp ON ledger_events(timestamp);
CREATE INDEX IF NOT EXISTS idx_jobs_state_run_at ON jobs(state, run_at);
CREATE INDEX IF NOT EXISTS idx_jobs_scene ON jobs(scene_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
