use chrono::{DateTime, Local, NaiveDate};
use rand::{distributions::Alphanumeric, Rng};
use rusqlite::{params, types::Value, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::Path,
    sync::{
        mpsc::{self, Sender},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
};
use tracing::{debug, info, warn};

use crate::backend::engine::models::{
    now_ts, AnalyticsRange, AppError, AppResult, AppSettings, StudyMinuteRecord, TopicId,
};
use crate::backend::engine::timer::SessionAccounting;

pub const APP_SETTINGS_KEY: &str = "app_settings";

const DAY_FORMAT: &str = "%Y-%m-%d";

/// The SQLite database holding settings, minute credits and study days.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> AppResult<Self> {
        init_database(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| AppError::Runtime(format!("database lock poisoned: {e}")))
    }
}

fn init_database(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS study_minutes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic_id INTEGER NOT NULL,
            whole_minutes INTEGER NOT NULL,
            occurred_at INTEGER NOT NULL,
            day TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS study_days (
            day TEXT PRIMARY KEY,
            first_marked_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_study_minutes_day ON study_minutes(day);
        CREATE INDEX IF NOT EXISTS idx_study_minutes_topic_id ON study_minutes(topic_id);
        "#,
    )?;

    Ok(())
}

pub fn day_key(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

pub fn parse_day_key(value: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(value, DAY_FORMAT)
        .map_err(|e| AppError::Runtime(format!("bad day key {value:?}: {e}")))
}

fn save_json_setting<T: Serialize>(conn: &Connection, key: &str, value: &T) -> AppResult<()> {
    let json = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, json],
    )?;
    Ok(())
}

fn load_json_setting<T: for<'de> Deserialize<'de>>(
    conn: &Connection,
    key: &str,
) -> AppResult<Option<T>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;

    match value {
        Some(raw) => Ok(Some(serde_json::from_str::<T>(&raw)?)),
        None => Ok(None),
    }
}

pub fn normalize_settings(mut settings: AppSettings) -> AppSettings {
    settings.focus_min = settings.focus_min.clamp(1, 180);
    settings.short_break_min = settings.short_break_min.clamp(1, 60);
    settings.long_break_min = settings.long_break_min.clamp(1, 90);
    settings.long_break_every = settings.long_break_every.clamp(1, 10);
    settings.remote_control_port = settings.remote_control_port.clamp(1024, 65535);
    ensure_remote_token(&mut settings);
    settings
}

fn generate_remote_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn ensure_remote_token(settings: &mut AppSettings) {
    if settings.remote_control_token.trim().is_empty() {
        settings.remote_control_token = generate_remote_token();
    }
}

pub fn load_or_create_settings(conn: &Connection) -> AppResult<AppSettings> {
    let settings = load_json_setting::<AppSettings>(conn, APP_SETTINGS_KEY)?.unwrap_or_default();
    let settings = normalize_settings(settings);
    save_json_setting(conn, APP_SETTINGS_KEY, &settings)?;
    Ok(settings)
}

pub fn save_settings(conn: &Connection, settings: &AppSettings) -> AppResult<()> {
    save_json_setting(conn, APP_SETTINGS_KEY, settings)
}

pub fn insert_credit(
    conn: &Connection,
    topic_id: TopicId,
    whole_minutes: i64,
    occurred_at: DateTime<Local>,
) -> AppResult<StudyMinuteRecord> {
    let day = occurred_at.date_naive();
    let ts = occurred_at.timestamp();
    conn.execute(
        "INSERT INTO study_minutes (topic_id, whole_minutes, occurred_at, day)
         VALUES (?1, ?2, ?3, ?4)",
        params![topic_id, whole_minutes, ts, day_key(day)],
    )?;

    Ok(StudyMinuteRecord {
        id: conn.last_insert_rowid(),
        topic_id,
        whole_minutes,
        occurred_at: ts,
        day,
    })
}

/// Returns false when the day was already marked.
pub fn insert_study_day(conn: &Connection, day: NaiveDate) -> AppResult<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO study_days (day, first_marked_at) VALUES (?1, ?2)",
        params![day_key(day), now_ts()],
    )?;
    Ok(inserted > 0)
}

fn build_credits_query(range: &AnalyticsRange) -> (String, Vec<Value>) {
    let mut query = String::from(
        "SELECT id, topic_id, whole_minutes, occurred_at, day FROM study_minutes WHERE 1 = 1",
    );
    let mut values: Vec<Value> = Vec::new();

    if let Some(from) = range.from {
        query.push_str(" AND day >= ?");
        values.push(Value::Text(day_key(from)));
    }
    if let Some(to) = range.to {
        query.push_str(" AND day <= ?");
        values.push(Value::Text(day_key(to)));
    }
    if let Some(topic_id) = range.topic_id {
        query.push_str(" AND topic_id = ?");
        values.push(Value::Integer(topic_id));
    }

    query.push_str(" ORDER BY occurred_at DESC, id DESC");

    (query, values)
}

pub fn fetch_credits(conn: &Connection, range: &AnalyticsRange) -> AppResult<Vec<StudyMinuteRecord>> {
    let (query, values) = build_credits_query(range);
    let mut stmt = conn.prepare(&query)?;

    let rows = stmt.query_map(rusqlite::params_from_iter(values), |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut credits = Vec::new();
    for row in rows {
        let (id, topic_id, whole_minutes, occurred_at, day) = row?;
        credits.push(StudyMinuteRecord {
            id,
            topic_id,
            whole_minutes,
            occurred_at,
            day: parse_day_key(&day)?,
        });
    }

    Ok(credits)
}

pub fn fetch_study_days(conn: &Connection) -> AppResult<Vec<NaiveDate>> {
    let mut stmt = conn.prepare("SELECT day FROM study_days ORDER BY day ASC")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut days = Vec::new();
    for row in rows {
        days.push(parse_day_key(&row?)?);
    }
    Ok(days)
}

enum StorageJob {
    Credit {
        topic_id: TopicId,
        whole_minutes: i64,
        occurred_at: DateTime<Local>,
    },
    MarkStudyDay(NaiveDate),
    SaveSettings(AppSettings),
    Flush(Sender<()>),
    Shutdown,
}

/// Cheap to clone; every call just enqueues a job for the storage thread.
#[derive(Clone)]
pub struct StorageHandle {
    tx: Sender<StorageJob>,
}

impl StorageHandle {
    pub fn save_settings(&self, settings: &AppSettings) {
        self.send(StorageJob::SaveSettings(settings.clone()));
    }

    /// Blocks until every job queued before this call has been applied.
    pub fn flush(&self) {
        let (tx, rx) = mpsc::channel();
        if self.tx.send(StorageJob::Flush(tx)).is_ok() {
            let _ = rx.recv();
        }
    }

    fn send(&self, job: StorageJob) {
        if self.tx.send(job).is_err() {
            warn!("storage worker gone, write dropped");
        }
    }
}

impl SessionAccounting for StorageHandle {
    fn credit_minutes(&self, topic_id: TopicId, whole_minutes: i64, occurred_at: DateTime<Local>) {
        self.send(StorageJob::Credit {
            topic_id,
            whole_minutes,
            occurred_at,
        });
    }

    fn mark_study_day(&self, day: NaiveDate) {
        self.send(StorageJob::MarkStudyDay(day));
    }
}

/// Owns the thread that applies queued writes to the [`Store`]. Failed writes
/// are logged and dropped.
pub struct StorageWorker {
    handle: StorageHandle,
    join: Option<JoinHandle<()>>,
}

impl StorageWorker {
    pub fn spawn(store: Arc<Store>) -> AppResult<Self> {
        let (tx, rx) = mpsc::channel::<StorageJob>();
        let join = thread::Builder::new()
            .name("storage".to_string())
            .spawn(move || {
                for job in rx {
                    if matches!(job, StorageJob::Shutdown) {
                        break;
                    }
                    apply_job(&store, job);
                }
                debug!("storage worker exited");
            })?;

        Ok(Self {
            handle: StorageHandle { tx },
            join: Some(join),
        })
    }

    pub fn handle(&self) -> StorageHandle {
        self.handle.clone()
    }

    /// Applies what is already queued, then stops the thread.
    pub fn shutdown(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = self.handle.tx.send(StorageJob::Shutdown);
            if join.join().is_err() {
                warn!("storage worker panicked");
            }
        }
    }
}

impl Drop for StorageWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn apply_job(store: &Store, job: StorageJob) {
    let result = store.lock().and_then(|conn| match job {
        StorageJob::Credit {
            topic_id,
            whole_minutes,
            occurred_at,
        } => insert_credit(&conn, topic_id, whole_minutes, occurred_at).map(|record| {
            debug!(topic_id, whole_minutes, id = record.id, "minutes credited");
        }),
        StorageJob::MarkStudyDay(day) => insert_study_day(&conn, day).map(|inserted| {
            if inserted {
                info!(%day, "study day marked");
            }
        }),
        StorageJob::SaveSettings(settings) => save_settings(&conn, &settings),
        StorageJob::Flush(done) => {
            let _ = done.send(());
            Ok(())
        }
        StorageJob::Shutdown => Ok(()),
    });

    if let Err(error) = result {
        warn!(%error, "storage write failed");
    }
}
