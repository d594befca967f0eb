// src/db.rs

use anyhow::{Context, Result};
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use log::{debug, info, warn};
use std::path::Path;
use std::time::Duration;
use tokio_postgres::{Config, NoTls};

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

const ENV_PATHS: [&str; 3] = [".env", ".env.local", "../.env"];

pub const CREATE_PAIRS_SQL: &str = "
    CREATE TABLE IF NOT EXISTS pairs (
        id1 BIGINT NOT NULL,
        id2 BIGINT NOT NULL,
        added TIMESTAMP,
        claimed_by TEXT,
        claimed_at TIMESTAMP,
        processed_at TIMESTAMP,
        PRIMARY KEY (id1, id2),
        CHECK (id1 < id2)
    );
    CREATE INDEX IF NOT EXISTS idx_pairs_unclaimed
        ON pairs (id1, id2) WHERE claimed_by IS NULL AND processed_at IS NULL;
    CREATE INDEX IF NOT EXISTS idx_pairs_claimed_at ON pairs (claimed_at);
";

pub const CREATE_SIMILARITY_SQL: &str = "
    CREATE TABLE IF NOT EXISTS similarity (
        id1 BIGINT NOT NULL,
        id2 BIGINT NOT NULL,
        jaccard DOUBLE PRECISION NOT NULL,
        links DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (id1, id2),
        CHECK (id1 < id2)
    );
";

const ALTER_FEATURES_SQL: &str = "
    ALTER TABLE features ADD COLUMN IF NOT EXISTS selected DATE;
    ALTER TABLE features ADD COLUMN IF NOT EXISTS processed TIMESTAMP;
";

/// Reads environment variables and constructs a PostgreSQL config.
fn build_pg_config() -> Config {
    let mut config = Config::new();
    let host = std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port_str = std::env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
    let port = port_str.parse::<u16>().unwrap_or(5432);
    let dbname = std::env::var("POSTGRES_DB").unwrap_or_else(|_| "ygnews".to_string());
    let user = std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = std::env::var("POSTGRES_PASSWORD").unwrap_or_default();

    info!(
        "DB Config: Host={}, Port={}, DB={}, User={}",
        host, port, dbname, user
    );
    config
        .host(&host)
        .port(port)
        .dbname(&dbname)
        .user(&user)
        .password(&password);
    config.application_name("newscluster");
    config.connect_timeout(Duration::from_secs(10));
    config
}

/// Initializes the database connection pool.
pub async fn connect() -> Result<PgPool> {
    let config = build_pg_config();
    info!("Connecting to PostgreSQL database...");
    let manager = PostgresConnectionManager::new(config, NoTls);

    let pool = Pool::builder()
        .max_size(16)
        .min_idle(Some(1))
        .idle_timeout(Some(Duration::from_secs(180)))
        .connection_timeout(Duration::from_secs(15))
        .build(manager)
        .await
        .context("Failed to build database connection pool")?;

    let conn = pool
        .get()
        .await
        .context("Failed to get test connection from pool")?;
    conn.query_one("SELECT 1", &[])
        .await
        .context("Test query 'SELECT 1' failed")?;
    drop(conn);
    info!("Database connection pool initialized successfully.");
    Ok(pool)
}

/// Creates the pairs and similarity tables and the mark columns on `features` if missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for ensure_schema")?;
    conn.batch_execute(CREATE_PAIRS_SQL)
        .await
        .context("Failed to create pairs table")?;
    conn.batch_execute(CREATE_SIMILARITY_SQL)
        .await
        .context("Failed to create similarity table")?;
    conn.batch_execute(ALTER_FEATURES_SQL)
        .await
        .context("Failed to add selection columns to features")?;
    debug!("Schema verified");
    Ok(())
}

/// Loads the first env file found among the usual locations.
pub fn load_env() {
    for path in ENV_PATHS.iter() {
        if Path::new(path).exists() {
            if let Err(e) = load_env_from_file(path) {
                warn!("Failed to load environment from {}: {}", path, e);
            } else {
                info!("Loaded environment variables from {}", path);
                return;
            }
        }
    }
    info!("No .env file found, using environment variables from system");
}

/// Loads environment variables from a .env file. Variables already set win.
pub fn load_env_from_file(file_path: &str) -> Result<()> {
    use std::fs::File;
    use std::io::{BufRead, BufReader};

    let file = File::open(file_path).with_context(|| format!("Could not open {}", file_path))?;
    let reader = BufReader::new(file);
    for line in reader.lines() {
        let line = line.context("Failed to read line from env file")?;
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        if let Some(idx) = line.find('=') {
            let key = line[..idx].trim();
            let value = line[idx + 1..].trim().trim_matches('"');
            if std::env::var(key).is_err() {
                std::env::set_var(key, value);
                debug!(
                    "Set env var from file: {} = {}",
                    key,
                    if key == "POSTGRES_PASSWORD" {
                        "[hidden]"
                    } else {
                        value
                    }
                );
            }
        }
    }
    Ok(())
}
