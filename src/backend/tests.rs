use chrono::{DateTime, Duration as DateDuration, Local, NaiveDate, TimeZone};
use std::{
    collections::HashSet,
    io::{Read, Write},
    net::{Shutdown, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, Sender},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use super::app::commands::{parse_console_line, parse_settings_patch, ConsoleInput};
use super::app::runtime::{SettingsSink, TickerMode, TimerCommand, TimerObserver, TimerRuntime};
use super::data::storage::{
    fetch_credits, fetch_study_days, insert_credit, insert_study_day, load_or_create_settings,
    normalize_settings, Store, StorageWorker,
};
use super::engine::models::{
    AnalyticsRange, AppSettings, AppSettingsPatch, Durations, PhaseCompletedEvent, TimerPhase,
    TimerSnapshot, TopicId,
};
use super::engine::ticker::{Epoch, PulseSink, ThreadTicker, Ticker};
use super::engine::timer::{Clock, SessionAccounting, TimerSession};
use super::features::analytics::{
    calculate_streak_days, heatmap, last_days_range, summary, topic_totals, MAX_RANGE_DAYS,
};
use super::features::remote::{bind_remote_listener, route_request, RemoteContext, RemoteServer};

#[derive(Default)]
struct ManualTickerState {
    running: bool,
    epoch: Epoch,
    starts: usize,
}

#[derive(Clone, Default)]
struct ManualTicker {
    state: Arc<Mutex<ManualTickerState>>,
}

impl ManualTicker {
    fn running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    fn epoch(&self) -> Epoch {
        self.state.lock().unwrap().epoch
    }
}

impl Ticker for ManualTicker {
    fn start(&mut self) {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            state.running = true;
            state.epoch += 1;
            state.starts += 1;
        }
    }

    fn stop(&mut self) {
        self.state.lock().unwrap().running = false;
    }

    fn is_running(&self) -> bool {
        self.running()
    }

    fn accepts(&self, epoch: Epoch) -> bool {
        let state = self.state.lock().unwrap();
        state.running && state.epoch == epoch
    }
}

#[derive(Clone, Default)]
struct RecordingAccounting {
    credits: Arc<Mutex<Vec<(TopicId, i64, DateTime<Local>)>>>,
    days: Arc<Mutex<Vec<NaiveDate>>>,
}

impl RecordingAccounting {
    fn credits(&self) -> Vec<(TopicId, i64)> {
        self.credits
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, minutes, _)| (*topic, *minutes))
            .collect()
    }

    fn minutes_for(&self, topic_id: TopicId) -> i64 {
        self.credits()
            .into_iter()
            .filter(|(topic, _)| *topic == topic_id)
            .map(|(_, minutes)| minutes)
            .sum()
    }

    fn days(&self) -> Vec<NaiveDate> {
        self.days.lock().unwrap().clone()
    }
}

impl SessionAccounting for RecordingAccounting {
    fn credit_minutes(&self, topic_id: TopicId, whole_minutes: i64, occurred_at: DateTime<Local>) {
        self.credits
            .lock()
            .unwrap()
            .push((topic_id, whole_minutes, occurred_at));
    }

    fn mark_study_day(&self, day: NaiveDate) {
        self.days.lock().unwrap().push(day);
    }
}

#[derive(Clone)]
struct FixedClock {
    now: Arc<Mutex<DateTime<Local>>>,
}

impl FixedClock {
    fn at(year: i32, month: u32, day: u32) -> Self {
        let now = Local
            .with_ymd_and_hms(year, month, day, 9, 0, 0)
            .single()
            .expect("unambiguous local time");
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    fn advance_days(&self, days: i64) {
        let mut now = self.now.lock().unwrap();
        *now += DateDuration::days(days);
    }

    fn today(&self) -> NaiveDate {
        self.now.lock().unwrap().date_naive()
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().unwrap()
    }
}

struct Harness {
    session: TimerSession,
    ticker: ManualTicker,
    accounting: RecordingAccounting,
    clock: FixedClock,
}

impl Harness {
    fn new(durations: Durations) -> Self {
        let ticker = ManualTicker::default();
        let accounting = RecordingAccounting::default();
        let clock = FixedClock::at(2026, 3, 10);
        let session = TimerSession::new(
            durations,
            Box::new(ticker.clone()),
            Box::new(accounting.clone()),
            Box::new(clock.clone()),
        );
        Self {
            session,
            ticker,
            accounting,
            clock,
        }
    }

    fn ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.session.tick();
        }
    }

    fn snapshot(&self) -> TimerSnapshot {
        self.session.snapshot()
    }
}

fn durations(focus_min: i64, short_break_min: i64, long_break_min: i64, every: i64) -> Durations {
    Durations {
        focus_min,
        short_break_min,
        long_break_min,
        long_break_every: every,
    }
}

#[test]
fn new_session_is_idle_with_focus_length_remaining() {
    let h = Harness::new(Durations::default());
    let snap = h.snapshot();

    assert_eq!(snap.phase, TimerPhase::Idle);
    assert_eq!(snap.remaining_seconds, 25 * 60);
    assert!(!snap.is_running);
    assert_eq!(snap.active_topic_id, None);
    assert!(!h.ticker.running());
}

#[test]
fn uninterrupted_focus_credits_on_each_minute_boundary() {
    let mut h = Harness::new(durations(3, 5, 15, 4));
    h.session.start(Some(1));

    let mut boundaries = Vec::new();
    for second in 1..=180 {
        let before = h.accounting.credits().len();
        h.session.tick();
        if h.accounting.credits().len() > before {
            boundaries.push(second);
        }
    }

    assert_eq!(boundaries, vec![60, 120, 180]);
    assert_eq!(h.accounting.credits(), vec![(1, 1), (1, 1), (1, 1)]);
}

#[test]
fn full_focus_phase_rolls_into_running_short_break() {
    let mut h = Harness::new(Durations::default());
    h.session.start(Some(1));

    h.ticks(1499);
    let snap = h.snapshot();
    assert_eq!(snap.remaining_seconds, 1);
    assert_eq!(snap.elapsed_focus_seconds, 1499);
    assert_eq!(h.accounting.credits().len(), 24);

    h.session.tick();
    let snap = h.snapshot();
    assert_eq!(h.accounting.credits().len(), 25);
    assert!(h.accounting.credits().iter().all(|c| *c == (1, 1)));
    assert_eq!(snap.phase, TimerPhase::ShortBreak);
    assert_eq!(snap.remaining_seconds, 5 * 60);
    assert_eq!(snap.elapsed_focus_seconds, 0);
    assert!(snap.is_running);
    assert!(h.ticker.running());
    assert_eq!(snap.completed_focus_cycles, 1);
    assert_eq!(
        h.session.drain_phase_events(),
        vec![PhaseCompletedEvent {
            completed_phase: TimerPhase::Focus,
            next_phase: TimerPhase::ShortBreak,
            auto_started: true,
        }]
    );
    assert!(h.session.drain_phase_events().is_empty());
}

#[test]
fn pause_resume_cycles_do_not_change_credit_total() {
    let mut h = Harness::new(durations(2, 5, 15, 4));
    h.session.start(Some(9));

    for _ in 0..119 {
        h.session.tick();
        h.session.pause();
        h.session.tick();
        h.session.resume();
    }
    assert_eq!(h.snapshot().elapsed_focus_seconds, 119);
    assert_eq!(h.accounting.credits(), vec![(9, 1)]);

    h.session.tick();
    assert_eq!(h.accounting.credits(), vec![(9, 1), (9, 1)]);
    assert_eq!(h.snapshot().phase, TimerPhase::ShortBreak);
}

#[test]
fn ticks_while_paused_are_ignored() {
    let mut h = Harness::new(Durations::default());
    h.session.start(Some(1));
    h.ticks(10);
    h.session.pause();
    h.ticks(100);

    let snap = h.snapshot();
    assert_eq!(snap.remaining_seconds, 25 * 60 - 10);
    assert_eq!(snap.elapsed_focus_seconds, 10);
    assert!(!h.ticker.running());
}

#[test]
fn skip_before_first_minute_credits_nothing_but_counts_cycle() {
    let mut h = Harness::new(Durations::default());
    h.session.start(Some(3));
    h.ticks(59);
    h.session.skip();

    let snap = h.snapshot();
    assert!(h.accounting.credits().is_empty());
    assert_eq!(snap.completed_focus_cycles, 1);
    assert_eq!(snap.phase, TimerPhase::ShortBreak);
    assert!(snap.is_running);
}

#[test]
fn long_break_follows_every_configured_cycle() {
    let mut h = Harness::new(durations(25, 5, 15, 4));
    h.session.start(Some(1));

    let mut breaks = Vec::new();
    for _ in 0..8 {
        h.session.skip();
        breaks.push(h.snapshot().phase);
        h.session.skip();
        assert_eq!(h.snapshot().phase, TimerPhase::Focus);
    }

    assert_eq!(
        breaks,
        vec![
            TimerPhase::ShortBreak,
            TimerPhase::ShortBreak,
            TimerPhase::ShortBreak,
            TimerPhase::LongBreak,
            TimerPhase::ShortBreak,
            TimerPhase::ShortBreak,
            TimerPhase::ShortBreak,
            TimerPhase::LongBreak,
        ]
    );
    assert_eq!(h.snapshot().completed_focus_cycles, 8);
}

#[test]
fn cycle_count_restarts_on_a_new_day() {
    let mut h = Harness::new(durations(25, 5, 15, 4));
    h.session.start(Some(1));
    for _ in 0..3 {
        h.session.skip();
        h.session.skip();
    }
    assert_eq!(h.snapshot().completed_focus_cycles, 3);

    h.clock.advance_days(1);
    h.session.skip();

    let snap = h.snapshot();
    assert_eq!(snap.completed_focus_cycles, 1);
    assert_eq!(snap.phase, TimerPhase::ShortBreak);
}

#[test]
fn change_topic_mid_focus_settles_outgoing_topic() {
    let mut h = Harness::new(Durations::default());
    h.session.start(Some(1));
    h.ticks(125);
    assert_eq!(h.snapshot().elapsed_focus_seconds, 125);

    h.session.change_topic(Some(2));

    let snap = h.snapshot();
    assert_eq!(h.accounting.minutes_for(1), 2);
    assert_eq!(snap.elapsed_focus_seconds, 0);
    assert_eq!(snap.active_topic_id, Some(2));
    assert!(snap.is_running);

    h.ticks(60);
    assert_eq!(h.accounting.minutes_for(2), 1);
    assert_eq!(h.accounting.minutes_for(1), 2);
}

#[test]
fn change_topic_credits_whole_minutes_no_tick_has_credited() {
    let mut h = Harness::new(Durations::default());
    h.session.start(Some(1));
    h.session.force_elapsed_for_test(125);

    h.session.change_topic(Some(2));

    assert_eq!(h.accounting.credits(), vec![(1, 2)]);
    assert_eq!(h.snapshot().elapsed_focus_seconds, 0);
}

#[test]
fn change_topic_outside_focus_only_switches_topic() {
    let mut h = Harness::new(Durations::default());
    h.session.start(Some(1));
    h.session.skip();
    h.ticks(30);

    h.session.change_topic(Some(5));

    assert!(h.accounting.credits().is_empty());
    assert_eq!(h.snapshot().active_topic_id, Some(5));
    assert_eq!(h.snapshot().phase, TimerPhase::ShortBreak);
}

#[test]
fn reset_returns_to_idle_from_every_phase() {
    let focus_seconds = 25 * 60;
    let mut h = Harness::new(Durations::default());

    // Running focus.
    h.session.start(Some(1));
    h.ticks(42);
    h.session.reset();
    let expected = |snap: TimerSnapshot| {
        assert_eq!(snap.phase, TimerPhase::Idle);
        assert_eq!(snap.remaining_seconds, focus_seconds);
        assert_eq!(snap.elapsed_focus_seconds, 0);
        assert!(!snap.is_running);
    };
    expected(h.snapshot());
    assert!(!h.ticker.running());

    // Short break.
    h.session.start(Some(1));
    h.session.skip();
    assert_eq!(h.snapshot().phase, TimerPhase::ShortBreak);
    h.session.reset();
    expected(h.snapshot());

    // Paused long break.
    let mut h = Harness::new(durations(25, 5, 15, 1));
    h.session.start(Some(1));
    h.session.skip();
    h.session.pause();
    assert_eq!(h.snapshot().phase, TimerPhase::LongBreak);
    h.session.reset();
    expected(h.snapshot());

    // Already idle.
    h.session.reset();
    expected(h.snapshot());
}

#[test]
fn invalid_commands_are_absorbed() {
    let mut h = Harness::new(Durations::default());
    let idle = h.snapshot();

    h.session.start(None);
    h.session.resume();
    h.session.pause();
    assert_eq!(h.snapshot(), idle);
    assert_eq!(h.ticker.starts(), 0);

    h.session.start(Some(1));
    h.ticks(5);
    h.session.start(Some(2));
    h.session.resume();
    let snap = h.snapshot();
    assert_eq!(snap.active_topic_id, Some(1));
    assert_eq!(snap.elapsed_focus_seconds, 5);
    assert_eq!(h.ticker.starts(), 1);
}

#[test]
fn phase_without_topic_waits_for_user() {
    let mut h = Harness::new(Durations::default());
    h.session.start(Some(1));
    h.session.change_topic(None);
    h.ticks(1500);

    let snap = h.snapshot();
    assert!(h.accounting.credits().is_empty());
    assert_eq!(snap.phase, TimerPhase::ShortBreak);
    assert!(!snap.is_running);
    assert!(!h.ticker.running());
    assert!(!h.session.drain_phase_events()[0].auto_started);

    h.session.resume();
    assert!(h.snapshot().is_running);
}

#[test]
fn skip_from_idle_enters_focus() {
    let mut h = Harness::new(Durations::default());
    h.session.skip();

    let snap = h.snapshot();
    assert_eq!(snap.phase, TimerPhase::Focus);
    assert!(!snap.is_running);
    assert_eq!(snap.completed_focus_cycles, 0);
}

#[test]
fn toggle_pauses_resumes_and_starts() {
    let mut h = Harness::new(Durations::default());
    h.session.toggle();
    assert!(!h.snapshot().is_running);

    h.session.start(Some(4));
    h.session.toggle();
    assert!(!h.snapshot().is_running);
    h.session.toggle();
    assert!(h.snapshot().is_running);

    h.session.reset();
    h.session.toggle();
    let snap = h.snapshot();
    assert!(snap.is_running);
    assert_eq!(snap.phase, TimerPhase::Focus);
    assert_eq!(snap.active_topic_id, Some(4));
}

#[test]
fn study_day_marked_once_per_calendar_day() {
    let mut h = Harness::new(Durations::default());
    let first_day = h.clock.today();
    h.session.start(Some(1));
    h.ticks(180);
    assert_eq!(h.accounting.days(), vec![first_day]);

    h.clock.advance_days(1);
    h.ticks(60);
    assert_eq!(h.accounting.days(), vec![first_day, first_day.succ_opt().unwrap()]);
    assert_eq!(h.accounting.credits().len(), 4);
}

#[test]
fn update_settings_refreshes_idle_timer_only() {
    let mut h = Harness::new(Durations::default());
    h.session.update_settings(durations(50, 10, 30, 2));
    assert_eq!(h.snapshot().remaining_seconds, 50 * 60);

    h.session.start(Some(1));
    h.ticks(10);
    h.session.update_settings(durations(10, 10, 30, 2));
    assert_eq!(h.snapshot().remaining_seconds, 50 * 60 - 10);

    h.session.pause();
    h.session.update_settings(durations(15, 10, 30, 2));
    assert_eq!(h.snapshot().remaining_seconds, 50 * 60 - 10);

    h.session.skip();
    assert_eq!(h.snapshot().remaining_seconds, 10 * 60);
}

#[test]
fn zero_long_break_interval_is_clamped() {
    let mut h = Harness::new(durations(0, 0, 0, 0));
    assert_eq!(h.snapshot().remaining_seconds, 60);
    h.session.start(Some(1));
    h.session.skip();
    assert_eq!(h.snapshot().phase, TimerPhase::LongBreak);
}

#[test]
fn stale_pulses_are_dropped() {
    let mut h = Harness::new(Durations::default());
    h.session.start(Some(1));
    let first = h.ticker.epoch();
    h.session.pause();
    h.session.resume();
    let second = h.ticker.epoch();

    assert!(!h.session.on_pulse(first));
    assert!(h.session.on_pulse(second));
    assert_eq!(h.snapshot().elapsed_focus_seconds, 1);
}

fn counting_sink() -> (PulseSink, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let sink: PulseSink = Arc::new(move |_epoch: Epoch| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (sink, count)
}

#[test]
fn thread_ticker_start_and_stop_are_idempotent() {
    let (sink, count) = counting_sink();
    let mut ticker = ThreadTicker::with_period(sink, Duration::from_millis(5));

    ticker.start();
    ticker.start();
    assert!(ticker.is_running());
    assert!(ticker.accepts(1));
    assert!(!ticker.is_inline());

    let deadline = Instant::now() + Duration::from_secs(5);
    while count.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(count.load(Ordering::SeqCst) >= 3);

    ticker.stop();
    ticker.stop();
    assert!(!ticker.is_running());
    assert!(!ticker.accepts(1));

    let stopped_at = count.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(30));
    assert_eq!(count.load(Ordering::SeqCst), stopped_at);

    ticker.start();
    assert!(ticker.accepts(2));
}

#[test]
fn same_thread_ticker_hands_pulses_to_consumer() {
    let (sink, count) = counting_sink();
    let mut ticker = ThreadTicker::same_thread(sink, Duration::from_millis(10));
    assert_eq!(ticker.inline_deadline(), None);

    ticker.start();
    let first = ticker.inline_deadline().expect("inline deadline");
    assert_eq!(ticker.inline_pulse(), Some(1));
    assert_eq!(ticker.inline_deadline(), Some(first + Duration::from_millis(10)));
    assert_eq!(count.load(Ordering::SeqCst), 0);

    ticker.stop();
    assert_eq!(ticker.inline_deadline(), None);
    assert_eq!(ticker.inline_pulse(), None);
}

#[test]
fn settings_are_normalized_and_persisted() {
    let store = Store::open_in_memory().unwrap();
    let conn = store.lock().unwrap();

    let settings = load_or_create_settings(&conn).unwrap();
    assert_eq!(settings.focus_min, 25);
    assert_eq!(settings.remote_control_token.len(), 32);

    let again = load_or_create_settings(&conn).unwrap();
    assert_eq!(again.remote_control_token, settings.remote_control_token);

    let mut wild = AppSettings {
        focus_min: 500,
        short_break_min: 0,
        long_break_every: 99,
        remote_control_port: 80,
        ..AppSettings::default()
    };
    wild = normalize_settings(wild);
    assert_eq!(wild.focus_min, 180);
    assert_eq!(wild.short_break_min, 1);
    assert_eq!(wild.long_break_every, 10);
    assert_eq!(wild.remote_control_port, 1024);
    assert!(!wild.remote_control_token.is_empty());
}

#[test]
fn storage_worker_persists_credits_and_study_days() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&dir.path().join("nested").join("study.db")).unwrap());
    let mut worker = StorageWorker::spawn(store.clone()).unwrap();
    let handle = worker.handle();

    let at = Local.with_ymd_and_hms(2026, 5, 4, 10, 30, 0).single().unwrap();
    handle.credit_minutes(7, 1, at);
    handle.credit_minutes(7, 2, at);
    handle.mark_study_day(at.date_naive());
    handle.mark_study_day(at.date_naive());
    handle.save_settings(&AppSettings {
        focus_min: 40,
        ..AppSettings::default()
    });
    handle.flush();
    let flushed = fetch_credits(&*store.lock().unwrap(), &AnalyticsRange::default()).unwrap();
    assert_eq!(flushed.len(), 2);
    worker.shutdown();

    let conn = store.lock().unwrap();
    let credits = fetch_credits(&conn, &AnalyticsRange::default()).unwrap();
    assert_eq!(credits.len(), 2);
    assert!(credits.iter().all(|c| c.topic_id == 7 && c.day == at.date_naive()));
    assert_eq!(credits.iter().map(|c| c.whole_minutes).sum::<i64>(), 3);
    assert_eq!(fetch_study_days(&conn).unwrap(), vec![at.date_naive()]);
    assert_eq!(load_or_create_settings(&conn).unwrap().focus_min, 40);
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[test]
fn streak_counts_contiguous_days() {
    let today = day(2026, 3, 10);
    let days: HashSet<NaiveDate> = [day(2026, 3, 10), day(2026, 3, 9), day(2026, 3, 8), day(2026, 3, 6)]
        .into_iter()
        .collect();
    assert_eq!(calculate_streak_days(&days, today), 3);

    let without_today: HashSet<NaiveDate> = [day(2026, 3, 9), day(2026, 3, 8)].into_iter().collect();
    assert_eq!(calculate_streak_days(&without_today, today), 2);

    let stale: HashSet<NaiveDate> = [day(2026, 3, 7)].into_iter().collect();
    assert_eq!(calculate_streak_days(&stale, today), 0);
}

#[test]
fn analytics_aggregate_credits() {
    let store = Store::open_in_memory().unwrap();
    let conn = store.lock().unwrap();
    let at = |d: u32, h: u32| Local.with_ymd_and_hms(2026, 3, d, h, 0, 0).single().unwrap();

    for _ in 0..3 {
        insert_credit(&conn, 1, 1, at(9, 10)).unwrap();
    }
    insert_credit(&conn, 2, 2, at(9, 11)).unwrap();
    insert_credit(&conn, 2, 5, at(10, 9)).unwrap();
    insert_credit(&conn, 1, 4, at(1, 9)).unwrap();
    insert_study_day(&conn, day(2026, 3, 9)).unwrap();
    insert_study_day(&conn, day(2026, 3, 10)).unwrap();

    let today = day(2026, 3, 10);
    let range = AnalyticsRange {
        from: Some(day(2026, 3, 8)),
        to: Some(today),
        topic_id: None,
    };

    let s = summary(&conn, &range, today).unwrap();
    assert_eq!(s.total_focus_minutes, 10);
    assert_eq!(s.credit_records, 5);
    assert_eq!(s.study_days, 2);
    assert_eq!(s.avg_daily_focus_minutes, 5);
    assert_eq!(s.minutes_today, 5);
    assert_eq!(s.streak_days, 2);

    let totals = topic_totals(&conn, &range).unwrap();
    assert_eq!(totals[0].topic_id, 2);
    assert_eq!(totals[0].minutes, 7);
    assert_eq!(totals[1].minutes, 3);

    let points = heatmap(&conn, day(2026, 3, 8), today).unwrap();
    let minutes: Vec<i64> = points.iter().map(|p| p.minutes).collect();
    assert_eq!(minutes, vec![0, 5, 5]);
    assert_eq!(points[0].date, day(2026, 3, 8));

    let only_topic_one = AnalyticsRange {
        topic_id: Some(1),
        ..AnalyticsRange::default()
    };
    assert_eq!(summary(&conn, &only_topic_one, today).unwrap().total_focus_minutes, 7);
}

#[test]
fn oversized_day_windows_are_clamped() {
    let today = day(2026, 3, 10);
    let range = last_days_range(100_000_000_000, today);
    assert_eq!(range.to, Some(today));
    assert_eq!(range.from, Some(today - DateDuration::days(MAX_RANGE_DAYS - 1)));

    let range = last_days_range(-5, today);
    assert_eq!(range.from, Some(today));
}

#[derive(Clone, Default)]
struct RecordingSettings {
    saved: Arc<Mutex<Vec<AppSettings>>>,
}

impl SettingsSink for RecordingSettings {
    fn save_settings(&self, settings: &AppSettings) {
        self.saved.lock().unwrap().push(settings.clone());
    }
}

struct ChannelObserver {
    snapshots: Sender<TimerSnapshot>,
    phases: Sender<PhaseCompletedEvent>,
}

impl TimerObserver for ChannelObserver {
    fn timer_state(&self, snapshot: &TimerSnapshot) {
        let _ = self.snapshots.send(snapshot.clone());
    }

    fn phase_completed(&self, event: &PhaseCompletedEvent, _settings: &AppSettings) {
        let _ = self.phases.send(event.clone());
    }
}

fn one_minute_settings() -> AppSettings {
    AppSettings {
        focus_min: 1,
        short_break_min: 1,
        long_break_min: 1,
        remote_control_enabled: true,
        remote_control_token: "testtoken".to_string(),
        ..AppSettings::default()
    }
}

fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn run_focus_minute(mode: TickerMode) {
    let accounting = RecordingAccounting::default();
    let (snap_tx, snap_rx) = mpsc::channel();
    let (phase_tx, phase_rx) = mpsc::channel();

    let mut runtime = TimerRuntime::new(
        one_minute_settings(),
        Box::new(accounting.clone()),
        Box::new(RecordingSettings::default()),
    )
    .observe(Box::new(ChannelObserver {
        snapshots: snap_tx,
        phases: phase_tx,
    }));
    runtime.ticker = mode;
    let timer = runtime.spawn().unwrap();

    timer.send(TimerCommand::Start(Some(11))).unwrap();
    assert!(wait_for(|| !accounting.credits().is_empty()));

    let event = phase_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("phase event");
    assert_eq!(event.completed_phase, TimerPhase::Focus);
    assert_eq!(event.next_phase, TimerPhase::ShortBreak);

    timer.send(TimerCommand::Pause).unwrap();
    let snap = timer.snapshot().unwrap();
    assert!(!snap.is_running);
    assert_eq!(accounting.credits()[0], (11, 1));
    assert!(snap_rx.try_iter().count() > 1);

    timer.shutdown();
    timer.shutdown();
    assert!(timer.snapshot().is_err());
}

#[test]
fn runtime_credits_with_thread_ticker() {
    run_focus_minute(TickerMode::Thread(Duration::from_millis(2)));
}

#[test]
fn runtime_credits_with_same_thread_ticker() {
    run_focus_minute(TickerMode::SameThread(Duration::from_millis(2)));
}

#[test]
fn runtime_update_settings_persists_and_refreshes_idle_timer() {
    let sink = RecordingSettings::default();
    let timer = TimerRuntime::new(
        AppSettings::default(),
        Box::new(RecordingAccounting::default()),
        Box::new(sink.clone()),
    )
    .spawn()
    .unwrap();

    timer
        .send(TimerCommand::UpdateSettings(AppSettingsPatch {
            focus_min: Some(45),
            long_break_every: Some(0),
            ..AppSettingsPatch::default()
        }))
        .unwrap();

    let snap = timer.snapshot().unwrap();
    assert_eq!(snap.remaining_seconds, 45 * 60);
    let settings = timer.settings().unwrap();
    assert_eq!(settings.focus_min, 45);
    assert_eq!(settings.long_break_every, 1);

    let saved = sink.saved.lock().unwrap().clone();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].focus_min, 45);
    timer.shutdown();
}

struct DropSignal {
    dropped: Sender<()>,
}

impl TimerObserver for DropSignal {
    fn timer_state(&self, _snapshot: &TimerSnapshot) {}

    fn phase_completed(&self, _event: &PhaseCompletedEvent, _settings: &AppSettings) {}
}

impl Drop for DropSignal {
    fn drop(&mut self) {
        let _ = self.dropped.send(());
    }
}

#[test]
fn runtime_stops_when_last_handle_is_dropped() {
    let (dropped_tx, dropped_rx) = mpsc::channel();
    let timer = TimerRuntime::new(
        one_minute_settings(),
        Box::new(RecordingAccounting::default()),
        Box::new(RecordingSettings::default()),
    )
    .observe(Box::new(DropSignal {
        dropped: dropped_tx,
    }))
    .spawn()
    .unwrap();

    let clone = timer.clone();
    timer.send(TimerCommand::Start(Some(3))).unwrap();
    drop(timer);
    assert!(clone.snapshot().unwrap().is_running);

    drop(clone);
    assert!(dropped_rx.recv_timeout(Duration::from_secs(5)).is_ok());
}

fn remote_context(settings: AppSettings) -> RemoteContext {
    let timer = TimerRuntime {
        ticker: TickerMode::SameThread(Duration::from_secs(3600)),
        ..TimerRuntime::new(
            settings,
            Box::new(RecordingAccounting::default()),
            Box::new(RecordingSettings::default()),
        )
    }
    .spawn()
    .unwrap();
    RemoteContext {
        timer,
        store: Arc::new(Store::open_in_memory().unwrap()),
    }
}

fn json_body(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).expect("json body")
}

#[test]
fn remote_requires_enabled_and_token() {
    let disabled = remote_context(AppSettings::default());
    let reply = route_request(&disabled, "GET", "/api/state", Some("x"), b"");
    assert_eq!(reply.code, "404 Not Found");
    disabled.timer.shutdown();

    let ctx = remote_context(one_minute_settings());
    assert_eq!(route_request(&ctx, "GET", "/", None, b"").code, "200 OK");
    assert_eq!(
        route_request(&ctx, "GET", "/api/state", Some("wrong"), b"").code,
        "401 Unauthorized"
    );
    assert_eq!(
        route_request(&ctx, "GET", "/api/state?token=testtoken", None, b"").code,
        "200 OK"
    );
    assert_eq!(
        route_request(&ctx, "GET", "/api/nope", Some("testtoken"), b"").code,
        "404 Not Found"
    );
    ctx.timer.shutdown();
}

#[test]
fn remote_commands_drive_the_timer() {
    let ctx = remote_context(one_minute_settings());

    let reply = route_request(&ctx, "POST", "/api/start", Some("testtoken"), br#"{"topicId":7}"#);
    assert_eq!(reply.code, "200 OK");
    let state = json_body(&reply.body);
    assert_eq!(state["phase"], "focus");
    assert_eq!(state["isRunning"], true);
    assert_eq!(state["activeTopicId"], 7);
    assert_eq!(state["nextPhase"], "short_break");

    let state = json_body(&route_request(&ctx, "POST", "/api/toggle", Some("testtoken"), b"").body);
    assert_eq!(state["isRunning"], false);

    let state = json_body(
        &route_request(&ctx, "POST", "/api/topic", Some("testtoken"), br#"{"topicId":null}"#).body,
    );
    assert_eq!(state["activeTopicId"], serde_json::Value::Null);

    let state = json_body(&route_request(&ctx, "POST", "/api/skip", Some("testtoken"), b"").body);
    assert_eq!(state["phase"], "short_break");
    assert_eq!(state["completedFocusCycles"], 1);

    let state = json_body(&route_request(&ctx, "POST", "/api/reset", Some("testtoken"), b"").body);
    assert_eq!(state["phase"], "idle");

    let summary = json_body(&route_request(&ctx, "GET", "/api/summary?days=3", Some("testtoken"), b"").body);
    assert_eq!(summary["days"], 3);
    assert_eq!(summary["summary"]["totalFocusMinutes"], 0);

    ctx.timer.shutdown();
}

#[test]
fn remote_summary_clamps_oversized_day_window() {
    let ctx = remote_context(one_minute_settings());

    let reply = route_request(
        &ctx,
        "GET",
        "/api/summary?days=100000000000",
        Some("testtoken"),
        b"",
    );
    assert_eq!(reply.code, "200 OK");
    assert_eq!(json_body(&reply.body)["days"], MAX_RANGE_DAYS);

    ctx.timer.shutdown();
}

fn raw_request(port: u16, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect to remote server");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream.write_all(request).unwrap();
    stream.shutdown(Shutdown::Write).unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

#[test]
fn remote_server_answers_raw_http_requests() {
    let ctx = remote_context(one_minute_settings());
    let mut server = RemoteServer::start(0, ctx.timer.clone(), ctx.store.clone()).unwrap();
    let port = server.port();
    assert_ne!(port, 0);

    let body = r#"{"topicId":7}"#;
    let request = format!(
        "POST /api/start HTTP/1.1\r\nHost: localhost\r\nX-Pomodoro-Token: testtoken\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    let response = raw_request(port, request.as_bytes());
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    let (_, payload) = response.split_once("\r\n\r\n").expect("header terminator");
    let state: serde_json::Value = serde_json::from_str(payload).unwrap();
    assert_eq!(state["phase"], "focus");
    assert_eq!(state["activeTopicId"], 7);
    assert_eq!(state["isRunning"], true);

    let unauthorized = raw_request(port, b"GET /api/state HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(unauthorized.starts_with("HTTP/1.1 401 Unauthorized"), "{unauthorized}");

    let truncated = raw_request(port, b"GET /api/state HTTP/1.1\r\nHost: localhost\r\n");
    assert!(truncated.starts_with("HTTP/1.1 400 Bad Request"), "{truncated}");

    server.stop();
    ctx.timer.shutdown();
}

#[test]
fn remote_listener_bind_succeeds_on_available_port() {
    let probe = TcpListener::bind("127.0.0.1:0").expect("failed to reserve probe port");
    let port = probe
        .local_addr()
        .expect("failed to get probe local addr")
        .port();
    drop(probe);

    let listener = bind_remote_listener(port).expect("expected bind to succeed");
    let _ = listener
        .local_addr()
        .expect("listener should have local addr");
}

#[test]
fn remote_listener_bind_returns_error_when_port_is_occupied() {
    let occupied = TcpListener::bind("0.0.0.0:0").expect("failed to reserve an occupied test port");
    let port = occupied
        .local_addr()
        .expect("failed to get occupied local addr")
        .port();

    let err = bind_remote_listener(port).expect_err("expected occupied port bind failure");
    assert!(err.to_string().contains("bind failed"));
}

#[test]
fn console_lines_parse_into_commands() {
    assert_eq!(
        parse_console_line("start 12").unwrap(),
        ConsoleInput::Command(TimerCommand::Start(Some(12)))
    );
    assert_eq!(
        parse_console_line("  topic none ").unwrap(),
        ConsoleInput::Command(TimerCommand::ChangeTopic(None))
    );
    assert_eq!(parse_console_line("PAUSE").unwrap(), ConsoleInput::Command(TimerCommand::Pause));
    assert_eq!(parse_console_line("").unwrap(), ConsoleInput::Empty);
    assert_eq!(parse_console_line("q").unwrap(), ConsoleInput::Quit);
    assert!(parse_console_line("start").is_err());
    assert!(parse_console_line("start abc").is_err());
    assert!(parse_console_line("dance").is_err());

    let patch = parse_settings_patch(&["focus=50", "every=3", "sound=off"]).unwrap();
    assert_eq!(patch.focus_min, Some(50));
    assert_eq!(patch.long_break_every, Some(3));
    assert_eq!(patch.sound_enabled, Some(false));
    assert!(parse_settings_patch(&["focus"]).is_err());
    assert!(parse_settings_patch(&["colour=red"]).is_err());
    assert!(parse_settings_patch(&[]).is_err());
}
