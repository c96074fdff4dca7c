//! tracefs plumbing: dynamic probe events and tracepoint ids.
//!
//! Kprobes and uprobes are created by appending `p:NAME TARGET` lines to
//! the `*_events` files and removed with `-:NAME`. Each created event
//! surfaces a numeric id under `events/<group>/<name>/id`, which is what
//! perf_event_open wants.

use std::fmt;
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

pub const TRACEFS_ROOT: &str = "/sys/kernel/debug/tracing";

/// The four dynamic probe flavors that go through tracefs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Kprobe,
    Kretprobe,
    Uprobe,
    Uretprobe,
}

impl ProbeKind {
    /// `p` creates an entry probe, `r` a return probe.
    pub fn probe_char(self) -> char {
        match self {
            ProbeKind::Kprobe | ProbeKind::Uprobe => 'p',
            ProbeKind::Kretprobe | ProbeKind::Uretprobe => 'r',
        }
    }

    pub fn events_file(self) -> String {
        match self {
            ProbeKind::Kprobe | ProbeKind::Kretprobe => format!("{TRACEFS_ROOT}/kprobe_events"),
            ProbeKind::Uprobe | ProbeKind::Uretprobe => format!("{TRACEFS_ROOT}/uprobe_events"),
        }
    }

    /// Event group tracefs files the probe under.
    pub fn group(self) -> &'static str {
        match self {
            ProbeKind::Kprobe | ProbeKind::Kretprobe => "kprobes",
            ProbeKind::Uprobe | ProbeKind::Uretprobe => "uprobes",
        }
    }

    fn name_prefix(self) -> &'static str {
        match self {
            ProbeKind::Kprobe => "kprobe_",
            ProbeKind::Kretprobe => "kretp_",
            ProbeKind::Uprobe => "uprobe_",
            ProbeKind::Uretprobe => "uretp_",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeKind::Kprobe => "kprobe",
            ProbeKind::Kretprobe => "kretprobe",
            ProbeKind::Uprobe => "uprobe",
            ProbeKind::Uretprobe => "uretprobe",
        };
        f.write_str(s)
    }
}

/// Event names admit only `[A-Za-z0-9_]`.
pub fn sanitize(target: &str) -> String {
    target
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// A per-attach unique event name: prefix, sanitized target, and a
/// nanosecond timestamp to keep concurrent attaches to the same target
/// apart.
pub fn unique_event_name(kind: ProbeKind, target: &str) -> String {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    format!("{}{}_{}", kind.name_prefix(), sanitize(target), stamp)
}

/// Create a probe event. A stale event with the same name is removed
/// best-effort first; a remove failure there is expected and ignored.
pub fn create_event(kind: ProbeKind, event_name: &str, target: &str) -> Result<()> {
    let _ = remove_event(kind, event_name);

    let line = format!("{}:{} {}\n", kind.probe_char(), event_name, target);
    let result = std::fs::OpenOptions::new()
        .append(true)
        .open(kind.events_file())
        .and_then(|mut f| f.write_all(line.as_bytes()));
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Err(Error::AlreadyExists {
            name: event_name.to_string(),
        }),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Err(Error::not_found(format!(
            "{kind} target {target}"
        ))),
        Err(e) => Err(e.into()),
    }
}

pub fn remove_event(kind: ProbeKind, event_name: &str) -> Result<()> {
    let line = format!("-:{event_name}\n");
    let mut f = std::fs::OpenOptions::new()
        .append(true)
        .open(kind.events_file())?;
    f.write_all(line.as_bytes())?;
    Ok(())
}

/// Removes the tracefs event on drop unless disarmed; this is what
/// keeps a half-finished attach from leaving residue behind.
pub struct EventGuard {
    kind: ProbeKind,
    name: String,
    armed: bool,
}

impl EventGuard {
    pub fn new(kind: ProbeKind, name: String) -> Self {
        EventGuard {
            kind,
            name,
            armed: true,
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for EventGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = remove_event(self.kind, &self.name) {
                log::warn!("failed to clean up tracefs event {}: {e}", self.name);
            }
        }
    }
}

/// The numeric id of a created probe event.
pub fn probe_event_id(kind: ProbeKind, event_name: &str) -> Result<u64> {
    tracepoint_id(kind.group(), event_name)
}

/// Slurp `events/<category>/<name>/id`.
pub fn tracepoint_id(category: &str, name: &str) -> Result<u64> {
    let path = format!("{TRACEFS_ROOT}/events/{category}/{name}/id");
    let text = std::fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::not_found(format!("tracepoint {category}/{name}"))
        } else {
            e.into()
        }
    })?;
    text.trim()
        .parse()
        .map_err(|_| Error::shape(format!("tracepoint id file {path} held {text:?}")))
}

/// One bounded read from `trace_pipe`, the stream `trace_printk` output
/// lands in. Blocks until the kernel has something to say.
pub fn read_trace_pipe(max_bytes: usize) -> Result<String> {
    let mut f = std::fs::File::open(format!("{TRACEFS_ROOT}/trace_pipe"))?;
    let mut buf = vec![0u8; max_bytes];
    let n = f.read(&mut buf)?;
    buf.truncate(n);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_word_chars_only() {
        assert_eq!(sanitize("do_nanosleep"), "do_nanosleep");
        assert_eq!(sanitize("/usr/bin/app:0x4f0"), "_usr_bin_app_0x4f0");
        assert_eq!(sanitize("tcp_v4_rcv"), "tcp_v4_rcv");
    }

    #[test]
    fn event_names_carry_kind_prefix_and_are_unique() {
        let a = unique_event_name(ProbeKind::Kprobe, "do_nanosleep");
        assert!(a.starts_with("kprobe_do_nanosleep_"));
        let b = unique_event_name(ProbeKind::Kretprobe, "do_nanosleep");
        assert!(b.starts_with("kretp_do_nanosleep_"));
        let c = unique_event_name(ProbeKind::Uretprobe, "/bin/sh:0x400");
        assert!(c.starts_with("uretp__bin_sh_0x400_"));
    }

    #[test]
    fn probe_chars_and_files() {
        assert_eq!(ProbeKind::Kprobe.probe_char(), 'p');
        assert_eq!(ProbeKind::Kretprobe.probe_char(), 'r');
        assert!(ProbeKind::Uprobe.events_file().ends_with("uprobe_events"));
        assert_eq!(ProbeKind::Kretprobe.group(), "kprobes");
    }
}
