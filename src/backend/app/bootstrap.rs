use chrono::Local;
use clap::{Parser, Subcommand};
use std::{
    io::{self, BufRead, Write},
    net::UdpSocket,
    path::PathBuf,
    sync::Arc,
};
use tracing::{info, warn};

use crate::backend::app::commands::{
    parse_console_line, status_line, ConsoleInput, TerminalObserver, HELP,
};
use crate::backend::app::runtime::{TickerMode, TimerCommand, TimerHandle, TimerRuntime};
use crate::backend::data::storage::{
    load_or_create_settings, save_settings, StorageWorker, Store,
};
use crate::backend::engine::models::{AppResult, TopicId};
use crate::backend::engine::ticker::TICK_PERIOD;
use crate::backend::features::{analytics, remote::RemoteServer};

#[derive(Parser, Debug)]
#[command(name = "study-pulse", version, about = "Pomodoro study timer")]
pub struct Cli {
    /// SQLite database path. Defaults to <data dir>/study-pulse/study.db.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the timer and read commands from stdin (default).
    Run {
        /// Tick on the runtime thread instead of a dedicated ticker thread.
        #[arg(long)]
        inline_ticker: bool,

        /// Start focusing on this topic right away.
        #[arg(long)]
        topic: Option<TopicId>,

        /// Enable the LAN remote control for this and later runs.
        #[arg(long)]
        remote: bool,
    },
    /// Totals, streak and averages over the last N days.
    Summary {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Minutes per day over the last N days.
    Heatmap {
        #[arg(long, default_value_t = 28)]
        days: i64,
    },
    /// Minutes per topic over the last N days.
    Topics {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("study-pulse")
        .join("study.db")
}

pub fn run(cli: Cli) -> AppResult<()> {
    let db_path = cli.db.unwrap_or_else(default_db_path);
    let store = Arc::new(Store::open(&db_path)?);
    info!(db = %db_path.display(), "database opened");

    let command = cli.command.unwrap_or(CliCommand::Run {
        inline_ticker: false,
        topic: None,
        remote: false,
    });

    let today = Local::now().date_naive();
    match command {
        CliCommand::Run {
            inline_ticker,
            topic,
            remote,
        } => run_timer(store, inline_ticker, topic, remote),
        CliCommand::Summary { days } => {
            let range = analytics::last_days_range(days, today);
            let summary = analytics::summary(&*store.lock()?, &range, today)?;
            print_json(&summary)
        }
        CliCommand::Heatmap { days } => {
            let from = analytics::last_days_range(days, today).from.unwrap_or(today);
            let points = analytics::heatmap(&*store.lock()?, from, today)?;
            print_json(&points)
        }
        CliCommand::Topics { days } => {
            let range = analytics::last_days_range(days, today);
            let totals = analytics::topic_totals(&*store.lock()?, &range)?;
            print_json(&totals)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_timer(
    store: Arc<Store>,
    inline_ticker: bool,
    topic: Option<TopicId>,
    remote: bool,
) -> AppResult<()> {
    let settings = {
        let conn = store.lock()?;
        let mut settings = load_or_create_settings(&conn)?;
        if remote && !settings.remote_control_enabled {
            settings.remote_control_enabled = true;
            save_settings(&conn, &settings)?;
        }
        settings
    };

    let mut worker = StorageWorker::spawn(store.clone())?;
    let mut runtime = TimerRuntime::new(
        settings.clone(),
        Box::new(worker.handle()),
        Box::new(worker.handle()),
    )
    .observe(Box::new(TerminalObserver));
    if inline_ticker {
        runtime.ticker = TickerMode::SameThread(TICK_PERIOD);
    }
    let timer = runtime.spawn()?;

    let mut remote_server = None;
    if settings.remote_control_enabled {
        match RemoteServer::start(settings.remote_control_port as u16, timer.clone(), store) {
            Ok(server) => {
                let host = local_ip().unwrap_or_else(|| "localhost".to_string());
                println!(
                    "remote control: http://{host}:{}/?token={}",
                    server.port(),
                    settings.remote_control_token
                );
                remote_server = Some(server);
            }
            Err(error) => warn!(%error, "remote control startup warning"),
        }
    }

    let result = match topic {
        Some(_) => timer.send(TimerCommand::Start(topic)),
        None => Ok(()),
    }
    .and_then(|_| console_loop(&timer));

    if let Some(mut server) = remote_server.take() {
        server.stop();
    }
    timer.shutdown();
    worker.shutdown();
    result
}

fn console_loop(timer: &TimerHandle) -> AppResult<()> {
    println!("{HELP}");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match parse_console_line(&line) {
            Ok(ConsoleInput::Command(command)) => timer.send(command)?,
            Ok(ConsoleInput::Status) => println!("{}", status_line(&timer.snapshot()?)),
            Ok(ConsoleInput::Help) => println!("{HELP}"),
            Ok(ConsoleInput::Quit) => break,
            Ok(ConsoleInput::Empty) => {}
            Err(message) => eprintln!("{message}"),
        }
        io::stdout().flush()?;
    }
    println!();
    Ok(())
}

// Any routable address works; connecting a UDP socket only picks the route.
const ROUTE_LOOKUP_ADDR: &str = "8.8.8.8:80";

/// Best-effort LAN address for the remote control URL. No packet is sent.
fn local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(ROUTE_LOOKUP_ADDR).ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}
