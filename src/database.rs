use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::config::DatabaseConfig;
use crate::error::DataError;
use crate::languages;
use crate::model::{Commit, CommitStatus, IoKind, TestCase, TestCaseResult};
use crate::provider::DataProvider;

const DATABASE_NAME: &str = "grader.sqlite3";

pub fn get_db_path() -> anyhow::Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs =
        ProjectDirs::from("", "", "grader").context("Unable to find user directory")?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir).context("Failed to create local data dir")?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub fn db_url(db_path: impl AsRef<Path>) -> String {
    format!("sqlite://{}?mode=rwc", db_path.as_ref().display()) // rwc = read/write/create
}

/// Connection string from the configuration, or the default database file.
pub fn resolve_db_url(config: &DatabaseConfig) -> anyhow::Result<String> {
    match &config.url {
        Some(url) => Ok(url.clone()),
        None => Ok(db_url(get_db_path()?)),
    }
}

/// Connects to `db_url` and creates the schema if needed.
pub async fn init_db(db_url: &str) -> sqlx::Result<SqlitePool> {
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .connect(db_url)
        .await?;

    // PRAGMA statements cannot run inside a transaction
    for pragma_sql in &[
        "PRAGMA foreign_keys = ON;",
        "PRAGMA busy_timeout = 2000;",
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS offerings (
            id            INTEGER  PRIMARY KEY,
            course_id     INTEGER  NOT NULL
        );",
        r"
        CREATE TABLE IF NOT EXISTS exercises (
            id            INTEGER  PRIMARY KEY,
            offering_id   INTEGER  NOT NULL,
            ghost         INTEGER  NOT NULL DEFAULT 0,
            real_id       INTEGER,
            FOREIGN KEY (offering_id)  REFERENCES offerings (id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS commits (
            id                    INTEGER  PRIMARY KEY,
            user_email            TEXT     NOT NULL,
            exercise_id           INTEGER  NOT NULL,
            status                INTEGER  NOT NULL DEFAULT 0,
            hash                  TEXT     NOT NULL DEFAULT '',
            corrects              INTEGER  NOT NULL DEFAULT 0,
            score                 REAL     NOT NULL DEFAULT 0,
            compiled              INTEGER  NOT NULL DEFAULT 0,
            compiled_message      TEXT     NOT NULL DEFAULT '',
            commit_time           TEXT     NOT NULL,
            compilation_started   TEXT,
            compilation_finished  TEXT,
            compiled_signal       INTEGER,
            compiled_error        TEXT     NOT NULL DEFAULT '',
            ip                    TEXT,
            storage_key           TEXT     NOT NULL,
            FOREIGN KEY (exercise_id)  REFERENCES exercises (id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS compilation_files (
            id            INTEGER  PRIMARY KEY,
            exercise_id   INTEGER  NOT NULL,
            path          TEXT     NOT NULL,
            FOREIGN KEY (exercise_id)  REFERENCES exercises (id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS exercise_cases (
            id                    INTEGER  PRIMARY KEY,
            exercise_id           INTEGER  NOT NULL,
            input_type            INTEGER  NOT NULL DEFAULT 1,
            output_type           INTEGER  NOT NULL DEFAULT 1,
            show_input            INTEGER  NOT NULL DEFAULT 0,
            show_expected_output  INTEGER  NOT NULL DEFAULT 0,
            show_user_output      INTEGER  NOT NULL DEFAULT 0,
            maxmemsize            INTEGER  NOT NULL DEFAULT 0,
            cputime               REAL     NOT NULL DEFAULT 1,
            stacksize             INTEGER  NOT NULL DEFAULT 0,
            file_size             INTEGER  NOT NULL DEFAULT 0,
            abs_error             REAL,
            last_update           TEXT,
            FOREIGN KEY (exercise_id)  REFERENCES exercises (id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS exercise_case_files (
            id                INTEGER  PRIMARY KEY,
            exercise_case_id  INTEGER  NOT NULL,
            path              TEXT     NOT NULL,
            FOREIGN KEY (exercise_case_id)  REFERENCES exercise_cases (id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS commits_exercise_cases (
            commit_id         INTEGER  NOT NULL,
            exercise_case_id  INTEGER  NOT NULL,
            cputime           REAL     NOT NULL,
            status            INTEGER  NOT NULL,
            status_message    TEXT     NOT NULL DEFAULT '',
            PRIMARY KEY (commit_id, exercise_case_id),
            FOREIGN KEY (commit_id)         REFERENCES commits (id),
            FOREIGN KEY (exercise_case_id)  REFERENCES exercise_cases (id)
        );",
    ] {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }

    tx.commit().await?;

    log::info!("Initialized database at {db_url}");

    Ok(db_pool)
}

pub fn create_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(table: &'static str, id: i64, raw: &str) -> Result<DateTime<Utc>, DataError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|e| DataError::MalformedRecord {
            table,
            id,
            reason: format!("invalid timestamp `{raw}`: {e}"),
        })
}

fn parse_optional_timestamp(
    table: &'static str,
    id: i64,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, DataError> {
    raw.filter(|raw| !raw.is_empty())
        .map(|raw| parse_timestamp(table, id, &raw))
        .transpose()
}

/// Data provider backed by the local SQLite database.
#[derive(Clone)]
pub struct SqliteDataProvider {
    pool: SqlitePool,
}

impl SqliteDataProvider {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn commit_from_row(row: &SqliteRow) -> Result<Commit, DataError> {
        let id: i64 = row.try_get("id")?;
        let malformed = |reason: String| DataError::MalformedRecord {
            table: "commits",
            id,
            reason,
        };

        let exercise_id: i64 = row.try_get("exercise_id")?;
        let ghost: bool = row.try_get("ghost")?;
        let real_exercise_id = if ghost {
            row.try_get::<Option<i64>, _>("real_id")?
                .ok_or_else(|| malformed(format!("ghost exercise {exercise_id} has no real exercise")))?
        } else {
            exercise_id
        };
        let real_offering_id = row
            .try_get::<Option<i64>, _>("real_offering_id")?
            .ok_or_else(|| malformed(format!("exercise {exercise_id} has no real offering")))?;

        let code: i64 = row.try_get("status")?;
        let status =
            CommitStatus::from_code(code).ok_or_else(|| malformed(format!("unknown status {code}")))?;

        let storage_key: String = row.try_get("storage_key")?;
        let fname = storage_key
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        let commit_time: String = row.try_get("commit_time")?;

        Ok(Commit {
            id,
            user_email: row.try_get("user_email")?,
            exercise_id,
            real_exercise_id,
            offering_id: row.try_get("offering_id")?,
            real_offering_id,
            course_id: row.try_get("course_id")?,
            status,
            commit_hash: row.try_get("hash")?,
            corrects: row.try_get("corrects")?,
            score: row.try_get("score")?,
            is_compiled: row.try_get("compiled")?,
            compiled_message: row.try_get("compiled_message")?,
            compiled_signal: row.try_get("compiled_signal")?,
            compiled_error: row.try_get("compiled_error")?,
            commit_time: parse_timestamp("commits", id, &commit_time)?,
            compilation_started_time: parse_optional_timestamp(
                "commits",
                id,
                row.try_get("compilation_started")?,
            )?,
            compilation_finished_time: parse_optional_timestamp(
                "commits",
                id,
                row.try_get("compilation_finished")?,
            )?,
            user_ip: row.try_get("ip")?,
            language: languages::language_from_extension(&fname),
            storage_key,
            fname,
            extension: None,
            is_compilable: false,
        })
    }

    fn test_case_from_row(row: &SqliteRow) -> Result<TestCase, DataError> {
        let id: i64 = row.try_get("id")?;
        let io_kind = |column: &str| -> Result<IoKind, DataError> {
            let code: i64 = row.try_get(column)?;
            IoKind::from_code(code).ok_or_else(|| DataError::MalformedRecord {
                table: "exercise_cases",
                id,
                reason: format!("unknown {column} {code}"),
            })
        };

        Ok(TestCase {
            id,
            exercise_id: row.try_get("exercise_id")?,
            input_type: io_kind("input_type")?,
            output_type: io_kind("output_type")?,
            show_input: row.try_get("show_input")?,
            show_expected_output: row.try_get("show_expected_output")?,
            show_user_output: row.try_get("show_user_output")?,
            max_mem_size: row.try_get("maxmemsize")?,
            cpu_time: row.try_get("cputime")?,
            stack_size: row.try_get("stacksize")?,
            file_size: row.try_get("file_size")?,
            abs_error: row.try_get("abs_error")?,
            last_update: parse_optional_timestamp(
                "exercise_cases",
                id,
                row.try_get("last_update")?,
            )?,
            files: Vec::new(),
        })
    }
}

#[async_trait]
impl DataProvider for SqliteDataProvider {
    async fn fetch_queued_commits(&self) -> Result<Vec<Commit>, DataError> {
        let rows = sqlx::query(
            r#"
            SELECT com.id, com.user_email, com.exercise_id, com.status, com.hash,
                   com.corrects, com.score, com.compiled, com.compiled_message,
                   com.commit_time, com.compilation_started, com.compilation_finished,
                   com.compiled_signal, com.compiled_error, com.ip, com.storage_key,
                   exe.offering_id, exe.ghost, exe.real_id, off.course_id,
                   CASE
                       WHEN exe.ghost = 0 THEN exe.offering_id
                       ELSE (SELECT exe2.offering_id FROM exercises AS exe2 WHERE exe2.id = exe.real_id)
                   END AS real_offering_id
            FROM commits AS com
            JOIN exercises AS exe ON com.exercise_id = exe.id
            JOIN offerings AS off ON exe.offering_id = off.id
            WHERE com.status = ?
            ORDER BY com.commit_time ASC, com.id ASC
            "#,
        )
        .bind(CommitStatus::InQueue.code())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::commit_from_row).collect()
    }

    async fn update_commit(&self, commit: &Commit) -> Result<(), DataError> {
        let result = sqlx::query(
            r#"
            UPDATE commits SET
                user_email = ?, exercise_id = ?, status = ?, hash = ?, corrects = ?,
                score = ?, compiled = ?, compiled_message = ?, commit_time = ?,
                compilation_started = ?, compilation_finished = ?, compiled_signal = ?,
                compiled_error = ?
            WHERE id = ?
            "#,
        )
        .bind(&commit.user_email)
        .bind(commit.exercise_id)
        .bind(commit.status.code())
        .bind(&commit.commit_hash)
        .bind(commit.corrects)
        .bind(commit.score)
        .bind(commit.is_compiled)
        .bind(&commit.compiled_message)
        .bind(create_timestamp(&commit.commit_time))
        .bind(commit.compilation_started_time.as_ref().map(create_timestamp))
        .bind(commit.compilation_finished_time.as_ref().map(create_timestamp))
        .bind(commit.compiled_signal)
        .bind(&commit.compiled_error)
        .bind(commit.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DataError::NotFound {
                table: "commits",
                id: commit.id,
            });
        }
        log::debug!("[{}] Commit updated to {}", commit.id, commit.status);
        Ok(())
    }

    async fn fetch_test_cases(&self, commit: &Commit) -> Result<Vec<TestCase>, DataError> {
        let rows = sqlx::query(
            r#"
            SELECT id, exercise_id, input_type, output_type, show_input,
                   show_expected_output, show_user_output, maxmemsize, cputime,
                   stacksize, file_size, abs_error, last_update
            FROM exercise_cases
            WHERE exercise_id = ?
            ORDER BY id
            "#,
        )
        .bind(commit.real_exercise_id)
        .fetch_all(&self.pool)
        .await?;

        let mut test_cases = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut test_case = Self::test_case_from_row(row)?;
            test_case.files = sqlx::query_scalar::<_, String>(
                "SELECT path FROM exercise_case_files WHERE exercise_case_id = ? ORDER BY id",
            )
            .bind(test_case.id)
            .fetch_all(&self.pool)
            .await?;
            test_cases.push(test_case);
        }
        Ok(test_cases)
    }

    async fn fetch_exercise_files(&self, commit: &Commit) -> Result<Vec<String>, DataError> {
        let paths = sqlx::query_scalar::<_, String>(
            "SELECT path FROM compilation_files WHERE exercise_id = ? ORDER BY id",
        )
        .bind(commit.real_exercise_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(paths)
    }

    async fn store_test_results(
        &self,
        commit: &Commit,
        results: &[TestCaseResult],
    ) -> Result<(), DataError> {
        let mut tx = self.pool.begin().await?;
        for result in results {
            sqlx::query(
                r#"
                INSERT INTO commits_exercise_cases
                    (commit_id, exercise_case_id, cputime, status, status_message)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(commit.id)
            .bind(result.test_case_id)
            .bind(result.cpu_time)
            .bind(result.status.code())
            .bind(&result.status_message)
            .execute(tx.as_mut())
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_test_results(&self, commit: &Commit) -> Result<(), DataError> {
        sqlx::query("DELETE FROM commits_exercise_cases WHERE commit_id = ?")
            .bind(commit.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
