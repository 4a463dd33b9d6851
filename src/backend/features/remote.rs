use chrono::Local;
use httparse::Status;
use serde::Deserialize;
use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::backend::app::runtime::{TimerCommand, TimerHandle};
use crate::backend::data::storage::Store;
use crate::backend::engine::models::{
    AppError, AppResult, AppSettings, TimerPhase, TimerSnapshot, TopicId,
};
use crate::backend::features::analytics;

const REMOTE_CSP: &str = "default-src 'self'; script-src 'self' 'unsafe-inline'; style-src 'self' 'unsafe-inline'; connect-src 'self'; object-src 'none'; base-uri 'none'; frame-ancestors 'none'; form-action 'self'";
const TOKEN_HEADER: &str = "X-Pomodoro-Token";
const DEFAULT_SUMMARY_DAYS: i64 = 7;

/// A running LAN control server. Dropping it stops the accept loop.
pub struct RemoteServer {
    port: u16,
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl RemoteServer {
    pub fn start(port: u16, timer: TimerHandle, store: Arc<Store>) -> AppResult<Self> {
        let listener = bind_remote_listener(port)?;
        let port = listener.local_addr()?.port();
        let running = Arc::new(AtomicBool::new(true));
        let running_thread = running.clone();
        let ctx = RemoteContext { timer, store };

        let join = thread::Builder::new()
            .name("remote-control".to_string())
            .spawn(move || remote_server_loop(ctx, listener, running_thread))?;

        info!(port, "remote control listening");
        Ok(Self {
            port,
            running,
            join: Some(join),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("remote control thread panicked");
            }
        }
    }
}

impl Drop for RemoteServer {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn bind_remote_listener(port: u16) -> AppResult<TcpListener> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .map_err(|e| AppError::Remote(format!("bind failed on {addr}: {e}")))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| AppError::Remote(format!("nonblocking setup failed on {addr}: {e}")))?;
    Ok(listener)
}

pub struct RemoteContext {
    pub timer: TimerHandle,
    pub store: Arc<Store>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RemoteReply {
    pub code: &'static str,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl RemoteReply {
    fn text(code: &'static str, body: &str) -> Self {
        Self {
            code,
            content_type: "text/plain; charset=utf-8",
            body: body.as_bytes().to_vec(),
        }
    }

    fn json(value: &serde_json::Value) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                code: "200 OK",
                content_type: "application/json; charset=utf-8",
                body,
            },
            Err(_) => Self::text("500 Internal Server Error", "error"),
        }
    }

    fn error(error: AppError) -> Self {
        warn!(%error, "remote request failed");
        Self::text("500 Internal Server Error", "error")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopicRequest {
    topic_id: Option<TopicId>,
}

fn header_value<'a>(headers: &'a [httparse::Header<'a>], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
}

fn parse_query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|part| {
        let (k, v) = part.split_once('=').unwrap_or((part, ""));
        (k == key).then_some(v)
    })
}

fn split_path_query(path: &str) -> (&str, &str) {
    path.split_once('?').unwrap_or((path, ""))
}

fn write_response(stream: &mut TcpStream, reply: &RemoteReply) {
    let headers = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\nAccess-Control-Allow-Origin: *\r\nAccess-Control-Allow-Headers: Content-Type, {TOKEN_HEADER}\r\nAccess-Control-Allow-Methods: GET, POST, OPTIONS\r\nContent-Security-Policy: {REMOTE_CSP}\r\nX-Content-Type-Options: nosniff\r\nX-Frame-Options: DENY\r\nReferrer-Policy: no-referrer\r\n\r\n",
        reply.code,
        reply.content_type,
        reply.body.len()
    );
    let _ = stream.write_all(headers.as_bytes());
    let _ = stream.write_all(&reply.body);
}

pub fn predict_next_phase(timer: &TimerSnapshot, settings: &AppSettings) -> TimerPhase {
    match timer.phase {
        TimerPhase::Focus => {
            let next_cycle = timer.completed_focus_cycles + 1;
            if next_cycle % settings.long_break_every.max(1) == 0 {
                TimerPhase::LongBreak
            } else {
                TimerPhase::ShortBreak
            }
        }
        TimerPhase::Idle | TimerPhase::ShortBreak | TimerPhase::LongBreak => TimerPhase::Focus,
    }
}

fn state_payload(ctx: &RemoteContext, settings: &AppSettings) -> AppResult<serde_json::Value> {
    let timer = ctx.timer.snapshot()?;
    let next_phase = predict_next_phase(&timer, settings);

    let mut payload = serde_json::to_value(&timer)?;
    if let serde_json::Value::Object(map) = &mut payload {
        map.insert("nextPhase".to_string(), serde_json::to_value(next_phase)?);
    }
    Ok(payload)
}

fn summary_payload(ctx: &RemoteContext, query: &str) -> AppResult<serde_json::Value> {
    let days = parse_query_param(query, "days")
        .and_then(|v| v.parse::<i64>().ok())
        .map(analytics::clamp_range_days)
        .unwrap_or(DEFAULT_SUMMARY_DAYS);
    let today = Local::now().date_naive();
    let range = analytics::last_days_range(days, today);

    let conn = ctx.store.lock()?;
    let summary = analytics::summary(&conn, &range, today)?;
    let topics = analytics::topic_totals(&conn, &range)?;
    Ok(serde_json::json!({
        "days": days,
        "summary": summary,
        "topics": topics,
    }))
}

fn command_then_state(
    ctx: &RemoteContext,
    settings: &AppSettings,
    command: TimerCommand,
) -> RemoteReply {
    match ctx
        .timer
        .send(command)
        .and_then(|_| state_payload(ctx, settings))
    {
        Ok(v) => RemoteReply::json(&v),
        Err(e) => RemoteReply::error(e),
    }
}

/// Routes one parsed request. Everything except the control page needs the token.
pub fn route_request(
    ctx: &RemoteContext,
    method: &str,
    path_raw: &str,
    token_header: Option<&str>,
    body: &[u8],
) -> RemoteReply {
    let (path, query) = split_path_query(path_raw);

    if method.eq_ignore_ascii_case("OPTIONS") {
        return RemoteReply::text("204 No Content", "");
    }

    let settings = match ctx.timer.settings() {
        Ok(settings) => settings,
        Err(e) => return RemoteReply::error(e),
    };

    if !settings.remote_control_enabled {
        return RemoteReply::text("404 Not Found", "not found");
    }

    if method.eq_ignore_ascii_case("GET") && path == "/" {
        return RemoteReply {
            code: "200 OK",
            content_type: "text/html; charset=utf-8",
            body: remote_html().as_bytes().to_vec(),
        };
    }

    let token_got = token_header
        .or_else(|| parse_query_param(query, "token"))
        .unwrap_or("");
    if token_got != settings.remote_control_token {
        return RemoteReply::text("401 Unauthorized", "unauthorized");
    }

    let topic_request = || serde_json::from_slice::<TopicRequest>(body).unwrap_or_default();

    match (method, path) {
        ("GET", "/api/state") => match state_payload(ctx, &settings) {
            Ok(v) => RemoteReply::json(&v),
            Err(e) => RemoteReply::error(e),
        },
        ("GET", "/api/summary") => match summary_payload(ctx, query) {
            Ok(v) => RemoteReply::json(&v),
            Err(e) => RemoteReply::error(e),
        },
        ("POST", "/api/toggle") => command_then_state(ctx, &settings, TimerCommand::Toggle),
        ("POST", "/api/start") => {
            let topic_id = match topic_request().topic_id {
                Some(id) => Some(id),
                None => ctx.timer.snapshot().ok().and_then(|s| s.active_topic_id),
            };
            command_then_state(ctx, &settings, TimerCommand::Start(topic_id))
        }
        ("POST", "/api/pause") => command_then_state(ctx, &settings, TimerCommand::Pause),
        ("POST", "/api/resume") => command_then_state(ctx, &settings, TimerCommand::Resume),
        ("POST", "/api/reset") => command_then_state(ctx, &settings, TimerCommand::Reset),
        ("POST", "/api/skip") => command_then_state(ctx, &settings, TimerCommand::Skip),
        ("POST", "/api/topic") => command_then_state(
            ctx,
            &settings,
            TimerCommand::ChangeTopic(topic_request().topic_id),
        ),
        _ => RemoteReply::text("404 Not Found", "not found"),
    }
}

fn remote_handle_connection(ctx: &RemoteContext, mut stream: TcpStream) {
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));

    let mut buf = vec![0u8; 8192];
    let mut filled = 0usize;
    let mut header_end: Option<usize> = None;

    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                if let Some(pos) = buf[..filled].windows(4).position(|w| w == b"\r\n\r\n") {
                    header_end = Some(pos + 4);
                    break;
                }
            }
            Err(_) => break,
        }
    }

    let bad_request = RemoteReply::text("400 Bad Request", "bad request");
    let Some(header_end) = header_end else {
        write_response(&mut stream, &bad_request);
        return;
    };

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    if !matches!(req.parse(&buf[..filled]), Ok(Status::Complete(_))) {
        write_response(&mut stream, &bad_request);
        return;
    }

    let method = req.method.unwrap_or("");
    let path = req.path.unwrap_or("/");
    let token = header_value(req.headers, TOKEN_HEADER);
    let content_length = header_value(req.headers, "Content-Length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0)
        .min(64 * 1024);

    let mut body = Vec::new();
    if content_length > 0 {
        body.extend_from_slice(&buf[header_end..filled]);
        while body.len() < content_length {
            let mut chunk = vec![0u8; (content_length - body.len()).min(4096)];
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => body.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
        body.truncate(content_length);
    }

    debug!(method, path, "remote request");
    let reply = route_request(ctx, method, path, token, &body);
    write_response(&mut stream, &reply);
}

fn remote_server_loop(ctx: RemoteContext, listener: TcpListener, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => remote_handle_connection(&ctx, stream),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                debug!(error = %e, "remote accept failed");
                thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

fn remote_html() -> &'static str {
    r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>Study Pulse Remote</title>
    <style>
      body { font-family: ui-sans-serif, system-ui, sans-serif; margin: 0; background: #0b1220; color: #e8eefc; }
      .wrap { max-width: 520px; margin: 0 auto; padding: 16px; }
      .big { font-size: 44px; font-weight: 750; }
      .muted { color: rgba(232,238,252,0.72); font-size: 13px; }
      .btns { display: grid; grid-template-columns: 1fr 1fr; gap: 10px; margin-top: 14px; }
      button, input { border: 1px solid rgba(255,255,255,0.14); background: rgba(255,255,255,0.08); color: #e8eefc; padding: 12px 14px; border-radius: 12px; font-size: 16px; }
    </style>
  </head>
  <body>
    <div class="wrap">
      <p class="muted"><span id="phase">...</span> &rarr; <span id="next_phase">...</span> &middot; <span id="topic"></span></p>
      <div class="big" id="time">--:--</div>
      <div class="muted" id="status">...</div>
      <div class="btns">
        <button id="toggle">Start / Pause</button>
        <button id="skip">Skip phase</button>
        <input id="topicId" placeholder="Topic id" inputmode="numeric" />
        <button id="setTopic">Switch topic</button>
        <button id="reset">Reset</button>
      </div>
    </div>
    <script>
      const token = new URLSearchParams(location.search).get("token") || "";
      async function api(path, method, body) {
        const res = await fetch(path, {
          method,
          headers: { "X-Pomodoro-Token": token, "Content-Type": "application/json" },
          body: body ? JSON.stringify(body) : undefined
        });
        if (res.status === 401) throw new Error("Unauthorized (add ?token=...)");
        if (!res.ok) throw new Error("HTTP " + res.status);
        return res.json();
      }
      const labels = { idle: "Idle", focus: "Focus", short_break: "Short break", long_break: "Long break" };
      function fmt(sec) {
        return String(Math.floor(sec / 60)).padStart(2, "0") + ":" + String(sec % 60).padStart(2, "0");
      }
      async function refresh() {
        try {
          const st = await api("/api/state", "GET");
          document.getElementById("phase").textContent = labels[st.phase] || st.phase;
          document.getElementById("next_phase").textContent = labels[st.nextPhase] || st.nextPhase;
          document.getElementById("topic").textContent = st.activeTopicId == null ? "no topic" : "topic " + st.activeTopicId;
          document.getElementById("time").textContent = fmt(st.remainingSeconds);
          document.getElementById("status").textContent = st.isRunning ? "Running" : "Paused";
        } catch (e) {
          document.getElementById("status").textContent = String(e.message || e);
        }
      }
      function bind(id, path, body) {
        document.getElementById(id).addEventListener("click", async () => {
          try { await api(path, "POST", body && body()); } finally { await refresh(); }
        });
      }
      bind("toggle", "/api/toggle");
      bind("skip", "/api/skip");
      bind("reset", "/api/reset");
      bind("setTopic", "/api/topic", () => {
        const raw = document.getElementById("topicId").value.trim();
        return { topicId: raw === "" ? null : Number(raw) };
      });
      refresh();
      setInterval(refresh, 1000);
    </script>
  </body>
</html>
"#
}
