// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Process logging for the sort operator.
//!
//! Events are rendered in glog layout
//! (`Lyyyymmdd hh:mm:ss.uuuuuu thread file:line] message`) so operator logs
//! interleave cleanly with the host engine's. Output goes to a log file when
//! one is configured and to stderr otherwise.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Datelike, Local, Timelike};
use tracing::Level;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

static INIT: OnceLock<()> = OnceLock::new();

const LOG_FILE_NAME: &str = "xsort.log";

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogTarget {
    File(PathBuf),
    Stderr,
}

/// An explicit file wins over a directory; neither means stderr.
fn resolve_log_target(file: Option<&str>, dir: Option<&str>) -> LogTarget {
    fn non_empty(v: Option<&str>) -> Option<&str> {
        v.map(str::trim).filter(|v| !v.is_empty())
    }
    if let Some(file) = non_empty(file) {
        return LogTarget::File(PathBuf::from(file));
    }
    match non_empty(dir) {
        Some(dir) => LogTarget::File(Path::new(dir).join(LOG_FILE_NAME)),
        None => LogTarget::Stderr,
    }
}

fn env_log_target() -> LogTarget {
    let file = std::env::var("XSORT_LOG_FILE").ok();
    let dir = std::env::var("XSORT_LOG_DIR").ok();
    resolve_log_target(file.as_deref(), dir.as_deref())
}

fn open_log_file(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && let Err(err) = fs::create_dir_all(parent)
    {
        eprintln!(
            "failed to create log directory {}: {}, fallback to stderr",
            parent.display(),
            err
        );
        return None;
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!(
                "failed to open log file {}: {}, fallback to stderr",
                path.display(),
                err
            );
            None
        }
    }
}

fn level_char(level: &Level) -> char {
    match *level {
        Level::ERROR => 'E',
        Level::WARN => 'W',
        Level::INFO => 'I',
        Level::DEBUG => 'D',
        Level::TRACE => 'T',
    }
}

/// Numeric id of the current thread, parsed from its debug form.
fn thread_number() -> u64 {
    format!("{:?}", std::thread::current().id())
        .trim_start_matches("ThreadId(")
        .trim_end_matches(')')
        .parse::<u64>()
        .unwrap_or(0)
}

/// glog prints the source file's base name only.
fn short_file(file: &str) -> &str {
    file.rsplit(['/', '\\']).next().unwrap_or(file)
}

fn write_prefix(
    writer: &mut impl fmt::Write,
    level: &Level,
    now: &DateTime<Local>,
    thread: u64,
    file: &str,
    line: u32,
) -> fmt::Result {
    write!(
        writer,
        "{}{:04}{:02}{:02} {:02}:{:02}:{:02}.{:06} {} {}:{}] ",
        level_char(level),
        now.year() % 10000,
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.timestamp_subsec_micros(),
        thread,
        short_file(file),
        line
    )
}

struct GlogFormatter;

impl<S, N> FormatEvent<S, N> for GlogFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write_prefix(
            &mut writer,
            metadata.level(),
            &Local::now(),
            thread_number(),
            metadata.file().unwrap_or("unknown"),
            metadata.line().unwrap_or(0),
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn install(filter: &str, target: LogTarget) {
    INIT.get_or_init(|| {
        let env_filter = EnvFilter::new(filter);
        if let LogTarget::File(path) = &target
            && let Some(file) = open_log_file(path)
        {
            let _ = tracing_fmt()
                .with_env_filter(env_filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .event_format(GlogFormatter)
                .try_init();
            return;
        }

        // Colors only when stderr is a terminal.
        let _ = tracing_fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(atty::is(atty::Stream::Stderr))
            .event_format(GlogFormatter)
            .try_init();
    });
}

/// Install the global subscriber once; later calls are no-ops.
pub fn init_with_level(level: &str) {
    install(level, env_log_target());
}

/// Initialize from the loaded `xsort.toml`, falling back to `info`.
///
/// `log_file` from the config takes precedence over the environment.
pub fn init_from_config() {
    match crate::xsort_config::config() {
        Ok(cfg) => {
            let target = match cfg.log_file.as_deref() {
                Some(file) => resolve_log_target(Some(file), None),
                None => env_log_target(),
            };
            install(cfg.log_filter_or_level(), target);
        }
        Err(_) => init(),
    }
}

pub fn init() {
    init_with_level("info");
}

pub use tracing::{debug, error, info, trace, warn};
