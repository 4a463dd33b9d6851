use std::io::Write;

use crate::backend::app::runtime::{TimerCommand, TimerObserver};
use crate::backend::engine::models::{
    format_seconds, AppSettings, AppSettingsPatch, PhaseCompletedEvent, TimerSnapshot, TopicId,
};

pub const HELP: &str = "\
commands:
  start <topic>     start a focus phase on a topic id
  pause | resume | toggle | reset | skip
  topic <id|none>   switch the topic being credited
  set key=value...  focus, short, long, every (minutes/count), sound, notify, remote (on/off), port
  status            print the current state
  quit";

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleInput {
    Command(TimerCommand),
    Status,
    Help,
    Quit,
    Empty,
}

pub fn parse_console_line(line: &str) -> Result<ConsoleInput, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(ConsoleInput::Empty);
    };
    let rest: Vec<&str> = words.collect();

    let input = match verb.to_ascii_lowercase().as_str() {
        "start" => {
            let topic = rest
                .first()
                .ok_or_else(|| "usage: start <topic>".to_string())
                .and_then(|raw| parse_topic(raw))?;
            ConsoleInput::Command(TimerCommand::Start(topic))
        }
        "pause" => ConsoleInput::Command(TimerCommand::Pause),
        "resume" => ConsoleInput::Command(TimerCommand::Resume),
        "toggle" => ConsoleInput::Command(TimerCommand::Toggle),
        "reset" => ConsoleInput::Command(TimerCommand::Reset),
        "skip" => ConsoleInput::Command(TimerCommand::Skip),
        "topic" => {
            let topic = match rest.first() {
                Some(raw) => parse_topic(raw)?,
                None => return Err("usage: topic <id|none>".to_string()),
            };
            ConsoleInput::Command(TimerCommand::ChangeTopic(topic))
        }
        "set" => ConsoleInput::Command(TimerCommand::UpdateSettings(parse_settings_patch(&rest)?)),
        "status" => ConsoleInput::Status,
        "help" | "?" => ConsoleInput::Help,
        "quit" | "exit" | "q" => ConsoleInput::Quit,
        other => return Err(format!("unknown command: {other} (try `help`)")),
    };

    Ok(input)
}

fn parse_topic(raw: &str) -> Result<Option<TopicId>, String> {
    if raw.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    raw.parse::<TopicId>()
        .map(Some)
        .map_err(|_| format!("topic must be a number or `none`, got {raw}"))
}

fn parse_switch(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(format!("expected on/off, got {raw}")),
    }
}

fn parse_number(key: &str, raw: &str) -> Result<i64, String> {
    raw.parse::<i64>()
        .map_err(|_| format!("{key} must be a number, got {raw}"))
}

pub fn parse_settings_patch(pairs: &[&str]) -> Result<AppSettingsPatch, String> {
    let mut patch = AppSettingsPatch::default();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got {pair}"))?;
        match key {
            "focus" => patch.focus_min = Some(parse_number(key, value)?),
            "short" => patch.short_break_min = Some(parse_number(key, value)?),
            "long" => patch.long_break_min = Some(parse_number(key, value)?),
            "every" => patch.long_break_every = Some(parse_number(key, value)?),
            "sound" => patch.sound_enabled = Some(parse_switch(value)?),
            "notify" => patch.notifications_enabled = Some(parse_switch(value)?),
            "remote" => patch.remote_control_enabled = Some(parse_switch(value)?),
            "port" => patch.remote_control_port = Some(parse_number(key, value)?),
            other => return Err(format!("unknown setting: {other}")),
        }
    }
    if patch.is_empty() {
        return Err("usage: set focus=25 short=5 long=15 every=4".to_string());
    }
    Ok(patch)
}

pub fn status_line(snapshot: &TimerSnapshot) -> String {
    let status = if snapshot.is_running {
        "Running"
    } else {
        "Paused"
    };
    let topic = snapshot
        .active_topic_id
        .map(|id| format!("topic {id}"))
        .unwrap_or_else(|| "no topic".to_string());
    format!(
        "{} {} {status} | {topic} | cycles today {}",
        snapshot.phase,
        format_seconds(snapshot.remaining_seconds),
        snapshot.completed_focus_cycles
    )
}

/// Redraws a single status line on stderr, keeping stdout for prompts.
pub struct TerminalObserver;

impl TimerObserver for TerminalObserver {
    fn timer_state(&self, snapshot: &TimerSnapshot) {
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r\x1b[2K{}", status_line(snapshot));
        let _ = err.flush();
    }

    fn phase_completed(&self, event: &PhaseCompletedEvent, settings: &AppSettings) {
        let mut err = std::io::stderr().lock();
        if settings.sound_enabled {
            let _ = write!(err, "\x07");
        }
        if settings.notifications_enabled {
            let follow_up = if event.auto_started {
                "started"
            } else {
                "waiting for a topic"
            };
            let _ = writeln!(
                err,
                "\r\x1b[2K{} complete. Next: {} ({follow_up})",
                event.completed_phase, event.next_phase
            );
        }
        let _ = err.flush();
    }
}
