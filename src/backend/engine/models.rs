use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Topics live in another store; the timer only carries their id.
pub type TopicId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimerPhase {
    Idle,
    Focus,
    ShortBreak,
    LongBreak,
}

impl std::fmt::Display for TimerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TimerPhase::Idle => "Idle",
            TimerPhase::Focus => "Focus",
            TimerPhase::ShortBreak => "Short break",
            TimerPhase::LongBreak => "Long break",
        };
        write!(f, "{label}")
    }
}

/// Phase lengths in minutes plus the number of focus cycles before a long break.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Durations {
    pub focus_min: i64,
    pub short_break_min: i64,
    pub long_break_min: i64,
    pub long_break_every: i64,
}

impl Default for Durations {
    fn default() -> Self {
        Self {
            focus_min: 25,
            short_break_min: 5,
            long_break_min: 15,
            long_break_every: 4,
        }
    }
}

impl Durations {
    /// Idle shows the length of the focus phase a `start` would begin.
    pub fn seconds_for(&self, phase: TimerPhase) -> i64 {
        match phase {
            TimerPhase::Idle | TimerPhase::Focus => self.focus_min * 60,
            TimerPhase::ShortBreak => self.short_break_min * 60,
            TimerPhase::LongBreak => self.long_break_min * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub focus_min: i64,
    pub short_break_min: i64,
    pub long_break_min: i64,
    pub long_break_every: i64,
    pub sound_enabled: bool,
    pub notifications_enabled: bool,
    pub remote_control_enabled: bool,
    pub remote_control_port: i64,
    pub remote_control_token: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        let durations = Durations::default();
        Self {
            focus_min: durations.focus_min,
            short_break_min: durations.short_break_min,
            long_break_min: durations.long_break_min,
            long_break_every: durations.long_break_every,
            sound_enabled: true,
            notifications_enabled: true,
            remote_control_enabled: false,
            remote_control_port: 48484,
            remote_control_token: String::new(),
        }
    }
}

impl AppSettings {
    pub fn durations(&self) -> Durations {
        Durations {
            focus_min: self.focus_min,
            short_break_min: self.short_break_min,
            long_break_min: self.long_break_min,
            long_break_every: self.long_break_every,
        }
    }

    pub fn apply_patch(&mut self, patch: AppSettingsPatch) {
        if let Some(v) = patch.focus_min {
            self.focus_min = v;
        }
        if let Some(v) = patch.short_break_min {
            self.short_break_min = v;
        }
        if let Some(v) = patch.long_break_min {
            self.long_break_min = v;
        }
        if let Some(v) = patch.long_break_every {
            self.long_break_every = v;
        }
        if let Some(v) = patch.sound_enabled {
            self.sound_enabled = v;
        }
        if let Some(v) = patch.notifications_enabled {
            self.notifications_enabled = v;
        }
        if let Some(v) = patch.remote_control_enabled {
            self.remote_control_enabled = v;
        }
        if let Some(v) = patch.remote_control_port {
            self.remote_control_port = v;
        }
        if let Some(v) = patch.remote_control_token {
            self.remote_control_token = v;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppSettingsPatch {
    pub focus_min: Option<i64>,
    pub short_break_min: Option<i64>,
    pub long_break_min: Option<i64>,
    pub long_break_every: Option<i64>,
    pub sound_enabled: Option<bool>,
    pub notifications_enabled: Option<bool>,
    pub remote_control_enabled: Option<bool>,
    pub remote_control_port: Option<i64>,
    pub remote_control_token: Option<String>,
}

impl AppSettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == AppSettingsPatch::default()
    }
}

/// What presenters render. Pushed after every state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub phase: TimerPhase,
    pub remaining_seconds: i64,
    pub elapsed_focus_seconds: i64,
    pub is_running: bool,
    pub active_topic_id: Option<TopicId>,
    pub completed_focus_cycles: i64,
    pub phase_total_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseCompletedEvent {
    pub completed_phase: TimerPhase,
    pub next_phase: TimerPhase,
    pub auto_started: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StudyMinuteRecord {
    pub id: i64,
    pub topic_id: TopicId,
    pub whole_minutes: i64,
    pub occurred_at: i64,
    pub day: NaiveDate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub topic_id: Option<TopicId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSummary {
    pub total_focus_minutes: i64,
    pub credit_records: i64,
    pub study_days: i64,
    pub streak_days: i64,
    pub avg_daily_focus_minutes: i64,
    pub minutes_today: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapPoint {
    pub date: NaiveDate,
    pub minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TopicTotal {
    pub topic_id: TopicId,
    pub minutes: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote control: {0}")]
    Remote(String),

    #[error("timer runtime: {0}")]
    Runtime(String),
}

pub type AppResult<T> = Result<T, AppError>;

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

pub fn format_seconds(seconds: i64) -> String {
    let minutes = seconds / 60;
    let secs = seconds % 60;
    format!("{minutes:02}:{secs:02}")
}
