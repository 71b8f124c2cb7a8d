//! Structured logging with timestamps, source locations, and ANSI colour.
//!
//! Provides the [`flog!`] macro for consistent log output:
//!
//! ```text
//! 20260805T14:02:51.318 - src/session.rs:88 - send: u-amelie -> c-amelie_b
//! ```
//!
//! Log lines go to stderr by default.  Call [`set_writer`] to redirect them
//! to any [`std::io::Write`] implementor; installing a custom writer also
//! disables colour codes.  On a colour terminal, user and conversation
//! identifiers are tinted with a colour derived from their content so the
//! same identity always renders the same way.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

static COLOUR: AtomicBool = AtomicBool::new(false);

static WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Initialize logging. Call once at startup; detects colour support.
pub fn init() {
    COLOUR.store(io::stderr().is_terminal(), Ordering::Relaxed);
}

/// Replace the log writer. All subsequent [`flog!`] output goes to `w`,
/// without colour codes.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR.store(false, Ordering::Relaxed);
    *WRITER.lock().unwrap() = w;
}

fn colour_enabled() -> bool {
    COLOUR.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

const ID_COLOURS: &[&str] = &[
    "\x1b[91m", "\x1b[92m", "\x1b[93m", "\x1b[94m", "\x1b[95m", "\x1b[96m",
    "\x1b[31m", "\x1b[32m", "\x1b[33m", "\x1b[34m", "\x1b[35m", "\x1b[36m",
];

const ID_SHORT_LEN: usize = 8;

fn tint(id: &str) -> &'static str {
    let hash = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

fn short(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(ID_SHORT_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

fn tagged(tag: char, id: &str) -> String {
    let s = short(id);
    if colour_enabled() {
        format!("{}{tag}-{s}{RESET}", tint(id))
    } else {
        format!("{tag}-{s}")
    }
}

/// Format a user identity with consistent colour and truncation.
pub fn user_id(id: &str) -> String {
    tagged('u', id)
}

/// Format a conversation identity with consistent colour and truncation.
pub fn conv_id(id: &str) -> String {
    tagged('c', id)
}

/// Civil date from days since the Unix epoch (Howard Hinnant's algorithm).
fn civil_from_days(days: i64) -> (i64, u64, u64) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe as i64 + era * 400 + if m <= 2 { 1 } else { 0 };
    (y, m, d)
}

/// Format the current wall-clock time as `YYYYMMDDTHH:MM:SS.mmm`.
pub fn format_timestamp() -> String {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let (y, m, d) = civil_from_days((secs / 86_400) as i64);
    let tod = secs % 86_400;
    format!(
        "{:04}{:02}{:02}T{:02}:{:02}:{:02}.{:03}",
        y,
        m,
        d,
        tod / 3600,
        (tod % 3600) / 60,
        tod % 60,
        duration.subsec_millis()
    )
}

/// Write one log line. Called by [`flog!`]; not intended for direct use.
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = format_timestamp();
    let formatted = if colour_enabled() {
        format!("{DIM}{ts}{RESET} {DIM}{file}:{line}{RESET} {msg}")
    } else {
        format!("{ts} - {file}:{line} - {msg}")
    };
    let mut writer = WRITER.lock().unwrap();
    let _ = writeln!(*writer, "{formatted}");
}

/// Emit a log line with timestamp and source location.
///
/// ```ignore
/// flog!("send: {} -> {}", logging::user_id(&uid), logging::conv_id(&cid));
/// ```
#[macro_export]
macro_rules! flog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}
