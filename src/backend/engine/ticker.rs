use std::{
    sync::{
        mpsc::{self, RecvTimeoutError, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, warn};

pub const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Generation counter bumped on every `start`. A pulse tagged with an older
/// epoch was emitted by a cadence that has since been stopped.
pub type Epoch = u64;

/// Receives one call per pulse. Must not block.
pub type PulseSink = Arc<dyn Fn(Epoch) + Send + Sync>;

/// A one-second metronome. It knows nothing about phases or minutes.
pub trait Ticker: Send {
    /// Begin pulsing. No-op while already running.
    fn start(&mut self);
    /// Stop pulsing. No-op while stopped.
    fn stop(&mut self);
    fn is_running(&self) -> bool;
    /// True when a pulse from `epoch` belongs to the cadence that is running now.
    fn accepts(&self, epoch: Epoch) -> bool;

    /// When pulses cannot be produced off-thread, the consumer has to wake up
    /// at this deadline and call [`Ticker::inline_pulse`].
    fn inline_deadline(&self) -> Option<Instant> {
        None
    }

    fn inline_pulse(&mut self) -> Option<Epoch> {
        None
    }
}

struct PulseThread {
    stop: Sender<()>,
    join: JoinHandle<()>,
}

enum Cadence {
    Stopped,
    Thread(PulseThread),
    Inline { next: Instant },
}

/// Runs the cadence on a dedicated thread so a busy consumer does not skew it.
/// Pulses are scheduled at `start + n * period` on the monotonic clock.
///
/// Falls back to same-thread scheduling when the OS refuses a new thread.
pub struct ThreadTicker {
    sink: PulseSink,
    period: Duration,
    epoch: Epoch,
    cadence: Cadence,
    force_inline: bool,
}

impl ThreadTicker {
    pub fn new(sink: PulseSink) -> Self {
        Self::with_period(sink, TICK_PERIOD)
    }

    pub fn with_period(sink: PulseSink, period: Duration) -> Self {
        Self {
            sink,
            period,
            epoch: 0,
            cadence: Cadence::Stopped,
            force_inline: false,
        }
    }

    /// Never spawns; the consumer loop produces every pulse itself.
    pub fn same_thread(sink: PulseSink, period: Duration) -> Self {
        let mut ticker = Self::with_period(sink, period);
        ticker.force_inline = true;
        ticker
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.cadence, Cadence::Inline { .. })
    }

    fn spawn_pulse_thread(&self) -> std::io::Result<PulseThread> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let sink = self.sink.clone();
        let period = self.period;
        let epoch = self.epoch;

        let join = thread::Builder::new()
            .name(format!("ticker-{epoch}"))
            .spawn(move || {
                let mut next = Instant::now() + period;
                loop {
                    let wait = next.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {
                            sink(epoch);
                            next += period;
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        Ok(PulseThread {
            stop: stop_tx,
            join,
        })
    }
}

impl Ticker for ThreadTicker {
    fn start(&mut self) {
        if self.is_running() {
            return;
        }
        self.epoch += 1;

        if !self.force_inline {
            match self.spawn_pulse_thread() {
                Ok(thread) => {
                    debug!(epoch = self.epoch, "ticker started");
                    self.cadence = Cadence::Thread(thread);
                    return;
                }
                Err(error) => {
                    warn!(%error, "ticker thread unavailable, falling back to same-thread pulses");
                }
            }
        }

        self.cadence = Cadence::Inline {
            next: Instant::now() + self.period,
        };
    }

    fn stop(&mut self) {
        if let Cadence::Thread(thread) = std::mem::replace(&mut self.cadence, Cadence::Stopped) {
            let _ = thread.stop.send(());
            if thread.join.join().is_err() {
                warn!(epoch = self.epoch, "ticker thread panicked");
            }
            debug!(epoch = self.epoch, "ticker stopped");
        }
    }

    fn is_running(&self) -> bool {
        !matches!(self.cadence, Cadence::Stopped)
    }

    fn accepts(&self, epoch: Epoch) -> bool {
        self.is_running() && epoch == self.epoch
    }

    fn inline_deadline(&self) -> Option<Instant> {
        match self.cadence {
            Cadence::Inline { next } => Some(next),
            _ => None,
        }
    }

    fn inline_pulse(&mut self) -> Option<Epoch> {
        match &mut self.cadence {
            Cadence::Inline { next } => {
                *next += self.period;
                Some(self.epoch)
            }
            _ => None,
        }
    }
}

impl Drop for ThreadTicker {
    fn drop(&mut self) {
        self.stop();
    }
}
