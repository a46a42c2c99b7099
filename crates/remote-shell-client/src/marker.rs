//! Marker framing for commands sent into a long-lived shell.
//!
//! Every invocation is bracketed by a unique start/end marker pair so its
//! output can be cut out of the session scrollback. Markers are printed as
//! two concatenated halves, so the terminal echo of the command line never
//! contains a complete marker.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// Byte the heartbeat loop emits.
pub const HEARTBEAT_BYTE: u8 = 0x00;

/// Seconds between heartbeat bytes.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;

/// Ctrl-C.
pub const INTERRUPT_BYTE: u8 = 0x03;

const ENV_PREAMBLE: &str = "export TERM=dumb NO_COLOR=1 CLICOLOR=0 PAGER=cat GIT_PAGER=cat \
                            GIT_TERMINAL_PROMPT=0 DEBIAN_FRONTEND=noninteractive";

/// Undo what an interrupted wrapper left behind: its heartbeat loop and a
/// per-call working directory. SIGINT aborts the rest of the wrapped list,
/// so neither is cleaned up by the wrapper itself.
const ABORTED_CALL_CLEANUP: &str = "{ [ -n \"$__rsh_hb\" ] && kill $__rsh_hb && wait $__rsh_hb; \
                                    unset __rsh_hb; [ -n \"$__rsh_twd\" ] && \
                                    [ \"$PWD\" = \"$__rsh_twd\" ] && cd -- \"$__rsh_owd\"; \
                                    __rsh_twd=; } 2>/dev/null;";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Start/end sentinels for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerPair {
    pub start: String,
    pub end: String,
}

impl MarkerPair {
    /// Fresh pair seeded from the current time.
    #[must_use]
    pub fn generate() -> Self {
        new_marker_pair(time_seed())
    }
}

/// Output of a completed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub output: String,
    pub exit_code: i32,
}

/// Nanoseconds since the epoch.
#[must_use]
pub fn time_seed() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

/// Marker pair derived from `seed`.
///
/// A process-wide sequence number is mixed in, so equal seeds still yield
/// distinct pairs.
#[must_use]
pub fn new_marker_pair(seed: u128) -> MarkerPair {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let tag = format!("{seed:x}_{seq:x}");
    MarkerPair {
        start: format!("__RSH_BEGIN_{tag}__"),
        end: format!("__RSH_END_{tag}__"),
    }
}

/// Single marker for an interrupt probe.
#[must_use]
pub fn new_probe_marker() -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("__RSH_PROBE_{:x}_{seq:x}__", time_seed())
}

/// `printf` invocation that prints `marker` (plus `trailer`) without the
/// command line itself containing it.
fn print_split(marker: &str, trailer: Option<&str>) -> String {
    let (head, tail) = marker.split_at(marker.len() / 2);
    match trailer {
        Some(trailer) => format!("printf '%s%s%s\\n' '{head}' '{tail}' {trailer}"),
        None => format!("printf '%s%s\\n' '{head}' '{tail}'"),
    }
}

/// Shell line that cleans up after an interrupted call, then echoes a
/// probe marker.
#[must_use]
pub fn probe_command(marker: &str) -> String {
    format!("{ABORTED_CALL_CLEANUP} {}\n", print_split(marker, None))
}

/// `command` followed by the newline that ends it inside a brace group.
///
/// A trailing unescaped backslash would join that newline with the closing
/// brace, so it gets an empty line of its own to continue onto.
fn with_line_end(command: &str) -> String {
    let backslashes = command.len() - command.trim_end_matches('\\').len();
    if backslashes % 2 == 1 {
        format!("{command}\n\n")
    } else {
        format!("{command}\n")
    }
}

/// Wrap `command` for execution in the session shell.
///
/// The wrapper disables colour and pagers, runs a heartbeat loop in the
/// background, prints the start marker, runs the command, captures its exit
/// code, stops the heartbeat and prints the end marker followed by the code.
#[must_use]
pub fn wrap(command: &str, markers: &MarkerPair) -> String {
    let start = print_split(&markers.start, None);
    let end = print_split(&markers.end, Some("\"$__rsh_ec\""));
    let command = with_line_end(command);
    format!(
        "{ENV_PREAMBLE}; set +m 2>/dev/null; \
         ( while :; do sleep {HEARTBEAT_INTERVAL_SECS}; printf '\\000'; done ) & __rsh_hb=$!; \
         {start}; {{ {command}}}; __rsh_ec=$?; \
         {{ kill $__rsh_hb; wait $__rsh_hb; }} 2>/dev/null; unset __rsh_hb; {end}\n"
    )
}

/// Run `command` in `dir` for this call only.
///
/// A failing `cd` yields exit code 1 without running the command. The
/// previous directory is restored afterwards unless the command moved on
/// to somewhere else itself.
///
/// # Errors
/// Returns error if `dir` cannot be quoted for the shell.
pub fn with_working_dir(command: &str, dir: &str) -> Result<String, shlex::QuoteError> {
    let dir = shlex::try_quote(dir)?;
    let command = with_line_end(command);
    Ok(format!(
        "__rsh_owd=$PWD; __rsh_twd=; cd -- {dir} && {{ __rsh_twd=$PWD; {command}}}; \
         __rsh_rc=$?; if [ \"$PWD\" = \"$__rsh_twd\" ]; then cd -- \"$__rsh_owd\"; fi; \
         __rsh_twd=; (exit $__rsh_rc)"
    ))
}

struct Completion {
    extracted: Extracted,
    /// Something follows the exit code digits, so they cannot still grow.
    terminated: bool,
}

/// First end marker at or after a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndScan {
    /// End marker followed by exit code digits.
    Found { at: usize, terminated: bool },
    /// End marker with nothing after it yet.
    Pending { at: usize },
    Missing,
}

/// Look for an end marker with exit code digits in `buffer[from..]`.
///
/// End markers followed by anything but digits are skipped.
pub(crate) fn scan_end(buffer: &str, from: usize, end: &str) -> EndScan {
    for (offset, _) in buffer[from..].match_indices(end) {
        let at = from + offset;
        let rest = &buffer[at + end.len()..];
        if rest.is_empty() {
            return EndScan::Pending { at };
        }
        let digits = exit_digits(rest);
        if digits > 0 {
            return EndScan::Found {
                at,
                terminated: digits < rest.len(),
            };
        }
    }
    EndScan::Missing
}

fn exit_digits(rest: &str) -> usize {
    rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len()
}

/// Result for an end marker found at `at` by [`scan_end`].
pub(crate) fn completion_at(buffer: &str, body: Option<usize>, at: usize, end: &str) -> Extracted {
    let rest = &buffer[at + end.len()..];
    Extracted {
        output: body
            .filter(|b| *b <= at)
            .map_or_else(String::new, |b| buffer[b..at].to_string()),
        exit_code: rest[..exit_digits(rest)].parse().unwrap_or(-1),
    }
}

/// Byte offset where the output following the start marker line begins.
///
/// The last occurrence wins, since a reattach may replay scrollback that
/// was already captured.
fn body_start(buffer: &str, start: &str) -> Option<usize> {
    let pos = buffer.rfind(start)? + start.len();
    buffer[pos..].find('\n').map(|nl| pos + nl + 1)
}

fn find_completion(buffer: &str, markers: &MarkerPair) -> Option<Completion> {
    let body = body_start(buffer, &markers.start);
    match scan_end(buffer, body.unwrap_or(0), &markers.end) {
        EndScan::Found { at, terminated } => Some(Completion {
            extracted: completion_at(buffer, body, at, &markers.end),
            terminated,
        }),
        EndScan::Pending { .. } | EndScan::Missing => None,
    }
}

/// Output and exit code once the end marker and its digits are present.
///
/// Pure; safe to call repeatedly on a growing buffer. If the start marker
/// has scrolled out of the buffer the output is empty.
#[must_use]
pub fn extract(buffer: &str, markers: &MarkerPair) -> Option<Extracted> {
    find_completion(buffer, markers).map(|c| c.extracted)
}

/// Like [`extract`], but only once the exit code is followed by more bytes.
///
/// Used while the stream is still live, where `END1` may yet become `END12`.
#[must_use]
pub fn extract_settled(buffer: &str, markers: &MarkerPair) -> Option<Extracted> {
    find_completion(buffer, markers)
        .filter(|c| c.terminated)
        .map(|c| c.extracted)
}

/// Sanitized output seen after the start marker, for timeout paths.
///
/// Empty if the start marker never appeared, so a failed call never returns
/// scrollback belonging to an earlier command.
#[must_use]
pub fn extract_partial(buffer: &str, markers: &MarkerPair) -> String {
    body_start(buffer, &markers.start).map_or_else(String::new, |b| {
        crate::sanitize::sanitize(&buffer[b..], &markers.end)
    })
}
