mod backend;

pub use backend::app::bootstrap::{run, Cli, CliCommand};
pub use backend::app::runtime::{
    SettingsSink, TickerMode, TimerCommand, TimerHandle, TimerObserver, TimerRuntime,
};
pub use backend::data::storage::{Store, StorageHandle, StorageWorker};
pub use backend::engine::models::*;
pub use backend::engine::ticker::{Epoch, PulseSink, ThreadTicker, Ticker, TICK_PERIOD};
pub use backend::engine::timer::{Clock, SessionAccounting, SystemClock, TimerSession};
pub use backend::features::analytics;
