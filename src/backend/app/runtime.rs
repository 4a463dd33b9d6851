use std::{
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::backend::data::storage::{normalize_settings, StorageHandle};
use crate::backend::engine::models::{
    AppError, AppResult, AppSettings, AppSettingsPatch, PhaseCompletedEvent, TimerSnapshot,
    TopicId,
};
use crate::backend::engine::ticker::{Epoch, PulseSink, ThreadTicker, Ticker, TICK_PERIOD};
use crate::backend::engine::timer::{Clock, SessionAccounting, SystemClock, TimerSession};

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Presentation side. Called on the runtime thread, so implementations must
/// hand work off rather than block.
pub trait TimerObserver: Send {
    fn timer_state(&self, snapshot: &TimerSnapshot);
    fn phase_completed(&self, event: &PhaseCompletedEvent, settings: &AppSettings);
}

pub trait SettingsSink: Send {
    fn save_settings(&self, settings: &AppSettings);
}

impl SettingsSink for StorageHandle {
    fn save_settings(&self, settings: &AppSettings) {
        StorageHandle::save_settings(self, settings);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerCommand {
    Start(Option<TopicId>),
    Pause,
    Resume,
    Toggle,
    Reset,
    Skip,
    ChangeTopic(Option<TopicId>),
    UpdateSettings(AppSettingsPatch),
}

#[derive(Debug, Clone, Copy)]
pub enum TickerMode {
    Thread(Duration),
    SameThread(Duration),
}

impl Default for TickerMode {
    fn default() -> Self {
        TickerMode::Thread(TICK_PERIOD)
    }
}

enum TimerMessage {
    Command(TimerCommand),
    Pulse(Epoch),
    Snapshot(Sender<TimerSnapshot>),
    Settings(Sender<AppSettings>),
    Shutdown,
}

/// Everything the runtime thread takes ownership of.
pub struct TimerRuntime {
    pub settings: AppSettings,
    pub accounting: Box<dyn SessionAccounting>,
    pub settings_sink: Box<dyn SettingsSink>,
    pub observers: Vec<Box<dyn TimerObserver>>,
    pub clock: Box<dyn Clock>,
    pub ticker: TickerMode,
}

impl TimerRuntime {
    pub fn new(
        settings: AppSettings,
        accounting: Box<dyn SessionAccounting>,
        settings_sink: Box<dyn SettingsSink>,
    ) -> Self {
        Self {
            settings,
            accounting,
            settings_sink,
            observers: Vec::new(),
            clock: Box::new(SystemClock),
            ticker: TickerMode::default(),
        }
    }

    pub fn observe(mut self, observer: Box<dyn TimerObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Commands and pulses share one queue so the session is only ever
    /// touched by the runtime thread.
    pub fn spawn(self) -> AppResult<TimerHandle> {
        let (tx, rx) = mpsc::channel::<TimerMessage>();

        let pulse_tx = tx.clone();
        let sink: PulseSink = Arc::new(move |epoch| {
            let _ = pulse_tx.send(TimerMessage::Pulse(epoch));
        });
        let ticker: Box<dyn Ticker> = match self.ticker {
            TickerMode::Thread(period) => Box::new(ThreadTicker::with_period(sink, period)),
            TickerMode::SameThread(period) => Box::new(ThreadTicker::same_thread(sink, period)),
        };

        let session = TimerSession::new(
            self.settings.durations(),
            ticker,
            self.accounting,
            self.clock,
        );
        let mut state = RuntimeState {
            session,
            settings: self.settings,
            settings_sink: self.settings_sink,
            observers: self.observers,
            last_published: None,
        };

        let join = thread::Builder::new()
            .name("timer-runtime".to_string())
            .spawn(move || {
                state.publish();
                run_loop(&mut state, rx);
                state.session.shutdown();
                info!("timer runtime stopped");
            })?;

        Ok(TimerHandle {
            link: Arc::new(RuntimeLink {
                tx,
                join: Mutex::new(Some(join)),
            }),
        })
    }
}

struct RuntimeState {
    session: TimerSession,
    settings: AppSettings,
    settings_sink: Box<dyn SettingsSink>,
    observers: Vec<Box<dyn TimerObserver>>,
    last_published: Option<TimerSnapshot>,
}

impl RuntimeState {
    fn apply(&mut self, command: TimerCommand) {
        debug!(?command, "timer command");
        match command {
            TimerCommand::Start(topic_id) => self.session.start(topic_id),
            TimerCommand::Pause => self.session.pause(),
            TimerCommand::Resume => self.session.resume(),
            TimerCommand::Toggle => self.session.toggle(),
            TimerCommand::Reset => self.session.reset(),
            TimerCommand::Skip => self.session.skip(),
            TimerCommand::ChangeTopic(topic_id) => self.session.change_topic(topic_id),
            TimerCommand::UpdateSettings(patch) => {
                let mut settings = self.settings.clone();
                settings.apply_patch(patch);
                self.settings = normalize_settings(settings);
                self.settings_sink.save_settings(&self.settings);
                self.session.update_settings(self.settings.durations());
            }
        }
    }

    fn publish(&mut self) {
        for event in self.session.drain_phase_events() {
            for observer in &self.observers {
                observer.phase_completed(&event, &self.settings);
            }
        }

        let snapshot = self.session.snapshot();
        if self.last_published.as_ref() == Some(&snapshot) {
            return;
        }
        for observer in &self.observers {
            observer.timer_state(&snapshot);
        }
        self.last_published = Some(snapshot);
    }
}

fn run_loop(state: &mut RuntimeState, rx: Receiver<TimerMessage>) {
    loop {
        let message = match state.session.ticker().inline_deadline() {
            Some(deadline) => {
                match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => {
                        match state.session.ticker_mut().inline_pulse() {
                            Some(epoch) => TimerMessage::Pulse(epoch),
                            None => continue,
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match rx.recv() {
                Ok(message) => message,
                Err(_) => return,
            },
        };

        match message {
            TimerMessage::Command(command) => {
                state.apply(command);
                state.publish();
            }
            TimerMessage::Pulse(epoch) => {
                if state.session.on_pulse(epoch) {
                    state.publish();
                }
            }
            TimerMessage::Snapshot(reply) => {
                let _ = reply.send(state.session.snapshot());
            }
            TimerMessage::Settings(reply) => {
                let _ = reply.send(state.settings.clone());
            }
            TimerMessage::Shutdown => return,
        }
    }
}

// The ticker's sink holds its own sender, so the queue never disconnects on
// its own. Dropping the last handle has to stop the runtime explicitly.
struct RuntimeLink {
    tx: Sender<TimerMessage>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl RuntimeLink {
    fn shutdown(&self) {
        let join = match self.join.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(join) = join {
            let _ = self.tx.send(TimerMessage::Shutdown);
            if join.join().is_err() {
                warn!("timer runtime panicked");
            }
        }
    }
}

impl Drop for RuntimeLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cloneable entry point into a running [`TimerRuntime`]. The runtime stops
/// when the last clone is dropped.
#[derive(Clone)]
pub struct TimerHandle {
    link: Arc<RuntimeLink>,
}

impl TimerHandle {
    pub fn send(&self, command: TimerCommand) -> AppResult<()> {
        self.link
            .tx
            .send(TimerMessage::Command(command))
            .map_err(|_| AppError::Runtime("timer runtime is not running".to_string()))
    }

    /// Answered after every command queued before it, so it reflects them.
    pub fn snapshot(&self) -> AppResult<TimerSnapshot> {
        self.request(TimerMessage::Snapshot)
    }

    pub fn settings(&self) -> AppResult<AppSettings> {
        self.request(TimerMessage::Settings)
    }

    /// Stops the ticker and joins the runtime thread. Later calls are no-ops.
    pub fn shutdown(&self) {
        self.link.shutdown();
    }

    fn request<T>(&self, make: impl FnOnce(Sender<T>) -> TimerMessage) -> AppResult<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.link
            .tx
            .send(make(reply_tx))
            .map_err(|_| AppError::Runtime("timer runtime is not running".to_string()))?;
        reply_rx
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|e| AppError::Runtime(format!("no reply from timer runtime: {e}")))
    }
}
