use chrono::{DateTime, Local, NaiveDate};
use tracing::{debug, info};

use super::models::{Durations, PhaseCompletedEvent, TimerPhase, TimerSnapshot, TopicId};
use super::ticker::{Epoch, Ticker};

/// Where credited study time goes. Calls are fire-and-forget: the timer has
/// already advanced its counters and never looks at the outcome.
pub trait SessionAccounting: Send {
    fn credit_minutes(&self, topic_id: TopicId, whole_minutes: i64, occurred_at: DateTime<Local>);
    fn mark_study_day(&self, day: NaiveDate);
}

pub trait Clock: Send {
    fn now(&self) -> DateTime<Local>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// The Pomodoro state machine.
///
/// Commands that do not apply to the current state are absorbed silently;
/// nothing here returns an error. Minute credits are driven by ticks, not by
/// wall-clock arithmetic, so pausing can neither skip nor duplicate one.
pub struct TimerSession {
    phase: TimerPhase,
    remaining_seconds: i64,
    phase_total_seconds: i64,
    elapsed_focus_seconds: i64,
    // Minutes already emitted for the current topic segment.
    credited_minutes: i64,
    is_running: bool,
    active_topic_id: Option<TopicId>,
    completed_focus_cycles: i64,
    last_cycle_day: Option<NaiveDate>,
    last_study_day: Option<NaiveDate>,
    durations: Durations,
    ticker: Box<dyn Ticker>,
    accounting: Box<dyn SessionAccounting>,
    clock: Box<dyn Clock>,
    phase_events: Vec<PhaseCompletedEvent>,
}

impl TimerSession {
    pub fn new(
        durations: Durations,
        ticker: Box<dyn Ticker>,
        accounting: Box<dyn SessionAccounting>,
        clock: Box<dyn Clock>,
    ) -> Self {
        let durations = sanitize(durations);
        let phase_total_seconds = durations.seconds_for(TimerPhase::Idle);
        Self {
            phase: TimerPhase::Idle,
            remaining_seconds: phase_total_seconds,
            phase_total_seconds,
            elapsed_focus_seconds: 0,
            credited_minutes: 0,
            is_running: false,
            active_topic_id: None,
            completed_focus_cycles: 0,
            last_cycle_day: None,
            last_study_day: None,
            durations,
            ticker,
            accounting,
            clock,
            phase_events: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            phase: self.phase,
            remaining_seconds: self.remaining_seconds,
            elapsed_focus_seconds: self.elapsed_focus_seconds,
            is_running: self.is_running,
            active_topic_id: self.active_topic_id,
            completed_focus_cycles: self.completed_focus_cycles,
            phase_total_seconds: self.phase_total_seconds,
        }
    }

    pub fn durations(&self) -> Durations {
        self.durations
    }

    pub fn start(&mut self, topic_id: Option<TopicId>) {
        if self.is_running {
            debug!("start ignored: timer already running");
            return;
        }
        let Some(topic_id) = topic_id else {
            debug!("start ignored: no topic selected");
            return;
        };

        self.enter_phase(TimerPhase::Focus);
        self.active_topic_id = Some(topic_id);
        self.is_running = true;
        self.ticker.start();
        info!(topic_id, "focus started");
    }

    pub fn pause(&mut self) {
        if !self.is_running {
            debug!("pause ignored: timer not running");
            return;
        }
        self.is_running = false;
        self.ticker.stop();
    }

    pub fn resume(&mut self) {
        if self.is_running || self.remaining_seconds <= 0 || self.phase == TimerPhase::Idle {
            debug!(phase = %self.phase, remaining = self.remaining_seconds, "resume ignored");
            return;
        }
        self.is_running = true;
        self.ticker.start();
    }

    /// Pause when running, resume a paused phase, otherwise start focus on the
    /// active topic.
    pub fn toggle(&mut self) {
        if self.is_running {
            self.pause();
        } else if self.phase != TimerPhase::Idle && self.remaining_seconds > 0 {
            self.resume();
        } else {
            self.start(self.active_topic_id);
        }
    }

    pub fn reset(&mut self) {
        self.ticker.stop();
        self.is_running = false;
        self.enter_phase(TimerPhase::Idle);
    }

    pub fn skip(&mut self) {
        self.ticker.stop();
        self.is_running = false;
        self.advance_phase();
    }

    pub fn change_topic(&mut self, topic_id: Option<TopicId>) {
        if topic_id == self.active_topic_id {
            debug!(?topic_id, "change_topic ignored: topic unchanged");
            return;
        }
        if self.phase == TimerPhase::Focus && self.elapsed_focus_seconds > 0 {
            self.settle_segment();
        }
        self.elapsed_focus_seconds = 0;
        self.credited_minutes = 0;
        self.active_topic_id = topic_id;
    }

    pub fn update_settings(&mut self, durations: Durations) {
        self.durations = sanitize(durations);
        if self.phase == TimerPhase::Idle && !self.is_running {
            self.phase_total_seconds = self.durations.seconds_for(TimerPhase::Idle);
            self.remaining_seconds = self.phase_total_seconds;
        }
    }

    /// Returns whether the pulse was counted.
    pub fn on_pulse(&mut self, epoch: Epoch) -> bool {
        if !self.ticker.accepts(epoch) {
            debug!(epoch, "stale pulse dropped");
            return false;
        }
        self.tick();
        true
    }

    /// One second of timer time. Outside callers go through [`Self::on_pulse`].
    pub(crate) fn tick(&mut self) {
        if !self.is_running || self.phase == TimerPhase::Idle {
            return;
        }

        if self.remaining_seconds <= 1 {
            if self.phase == TimerPhase::Focus {
                self.elapsed_focus_seconds += 1;
                self.credit_on_minute_boundary();
            }
            self.remaining_seconds = 0;
            self.is_running = false;
            self.advance_phase();
            return;
        }

        self.remaining_seconds -= 1;
        if self.phase == TimerPhase::Focus {
            self.elapsed_focus_seconds += 1;
            self.credit_on_minute_boundary();
        }
    }

    pub fn drain_phase_events(&mut self) -> Vec<PhaseCompletedEvent> {
        std::mem::take(&mut self.phase_events)
    }

    pub fn ticker(&self) -> &dyn Ticker {
        self.ticker.as_ref()
    }

    pub fn ticker_mut(&mut self) -> &mut dyn Ticker {
        self.ticker.as_mut()
    }

    pub fn shutdown(&mut self) {
        self.is_running = false;
        self.ticker.stop();
    }

    fn enter_phase(&mut self, phase: TimerPhase) {
        self.phase = phase;
        self.phase_total_seconds = self.durations.seconds_for(phase);
        self.remaining_seconds = self.phase_total_seconds;
        self.elapsed_focus_seconds = 0;
        self.credited_minutes = 0;
    }

    fn advance_phase(&mut self) {
        self.ticker.stop();

        let completed_phase = self.phase;
        let next_phase = match completed_phase {
            TimerPhase::Focus => {
                self.record_completed_cycle();
                if self.completed_focus_cycles % self.durations.long_break_every == 0 {
                    TimerPhase::LongBreak
                } else {
                    TimerPhase::ShortBreak
                }
            }
            TimerPhase::ShortBreak | TimerPhase::LongBreak | TimerPhase::Idle => TimerPhase::Focus,
        };

        self.enter_phase(next_phase);

        let auto_started = self.active_topic_id.is_some();
        self.is_running = auto_started;
        if auto_started {
            self.ticker.start();
        }

        info!(
            completed = %completed_phase,
            next = %next_phase,
            cycles = self.completed_focus_cycles,
            auto_started,
            "phase advanced"
        );
        self.phase_events.push(PhaseCompletedEvent {
            completed_phase,
            next_phase,
            auto_started,
        });
    }

    fn record_completed_cycle(&mut self) {
        let today = self.clock.now().date_naive();
        if self.last_cycle_day == Some(today) {
            self.completed_focus_cycles += 1;
        } else {
            self.completed_focus_cycles = 1;
        }
        self.last_cycle_day = Some(today);
    }

    fn credit_on_minute_boundary(&mut self) {
        if self.elapsed_focus_seconds <= 0 || self.elapsed_focus_seconds % 60 != 0 {
            return;
        }
        if let Some(topic_id) = self.active_topic_id {
            self.credit(topic_id, 1);
        }
    }

    // Whole minutes of the outgoing segment that no boundary tick has
    // credited yet. The sub-minute remainder is dropped.
    fn settle_segment(&mut self) {
        let Some(topic_id) = self.active_topic_id else {
            return;
        };
        let owed = self.elapsed_focus_seconds / 60 - self.credited_minutes;
        if owed > 0 {
            self.credit(topic_id, owed);
        }
    }

    fn credit(&mut self, topic_id: TopicId, whole_minutes: i64) {
        let now = self.clock.now();
        self.accounting.credit_minutes(topic_id, whole_minutes, now);
        self.credited_minutes += whole_minutes;

        let today = now.date_naive();
        if self.last_study_day != Some(today) {
            self.accounting.mark_study_day(today);
            self.last_study_day = Some(today);
        }
    }

    #[cfg(test)]
    pub(crate) fn force_elapsed_for_test(&mut self, seconds: i64) {
        self.elapsed_focus_seconds = seconds;
    }
}

fn sanitize(durations: Durations) -> Durations {
    Durations {
        focus_min: durations.focus_min.max(1),
        short_break_min: durations.short_break_min.max(1),
        long_break_min: durations.long_break_min.max(1),
        long_break_every: durations.long_break_every.max(1),
    }
}
