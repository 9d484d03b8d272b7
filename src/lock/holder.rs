// src/lock/holder.rs

//! Lock holder identity
//!
//! The process holding an exclusive lock records itself in the lock file as
//! `pid=<pid>,host=<host>` so that a stuck lock can be traced back to its
//! owner. Readers treat this payload as advisory: it may be missing, stale,
//! or half-written by a racing writer.

use dns_lookup::AddrInfoHints;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::debug;

/// Identity of a process that held an exclusive lock
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Holder {
    pub pid: u32,
    pub host: String,
}

impl Holder {
    pub fn new(pid: u32, host: impl Into<String>) -> Self {
        Self {
            pid,
            host: host.into(),
        }
    }

    /// Identity of the running process
    pub fn current() -> Self {
        Self::new(std::process::id(), local_hostname())
    }
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid={},host={}", self.pid, self.host)
    }
}

impl FromStr for Holder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let (pid, host) = s
            .split_once(',')
            .ok_or_else(|| format!("Invalid lock holder: {}", s))?;

        let pid = pid
            .strip_prefix("pid=")
            .ok_or_else(|| format!("Missing pid in lock holder: {}", s))?
            .parse::<u32>()
            .map_err(|e| format!("Invalid pid in lock holder '{}': {}", s, e))?;
        let host = host
            .strip_prefix("host=")
            .ok_or_else(|| format!("Missing host in lock holder: {}", s))?;

        if host.is_empty() {
            return Err(format!("Empty host in lock holder: {}", s));
        }

        Ok(Self::new(pid, host))
    }
}

fn local_hostname() -> String {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME
        .get_or_init(|| match hostname::get() {
            Ok(name) => {
                let name = name.to_string_lossy().into_owned();
                canonical_name(&name).unwrap_or(name)
            }
            Err(e) => {
                debug!("Could not determine hostname, using localhost: {}", e);
                "localhost".to_string()
            }
        })
        .clone()
}

/// Fully qualified name for `host` as reported by the resolver
///
/// Nodes of a cluster often share a short name across domains, so the
/// canonical name is what gets recorded when one can be found.
fn canonical_name(host: &str) -> Option<String> {
    if host.is_empty() {
        return None;
    }
    let hints = AddrInfoHints {
        flags: libc::AI_CANONNAME,
        ..AddrInfoHints::default()
    };

    match dns_lookup::getaddrinfo(Some(host), None, Some(hints)) {
        Ok(infos) => infos
            .filter_map(|info| info.ok())
            .filter_map(|info| info.canonname)
            .find(|name| !name.is_empty()),
        Err(e) => {
            debug!("Could not resolve canonical name of {}: {:?}", host, e);
            None
        }
    }
}

/// Read the recorded holder from an open lock file.
///
/// Best effort: I/O failures and unparsable content yield `None`.
pub(crate) fn read_holder(file: &mut File) -> Option<Holder> {
    let mut contents = String::new();
    let read = file
        .seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_string(&mut contents));

    if let Err(e) = read {
        debug!("Could not read lock holder: {}", e);
        return None;
    }
    if contents.trim().is_empty() {
        return None;
    }

    match contents.parse() {
        Ok(holder) => Some(holder),
        Err(e) => {
            debug!("Ignoring lock file contents: {}", e);
            None
        }
    }
}

/// Replace the lock file contents with `holder`.
///
/// The data is flushed and synced before returning so other nodes of a
/// shared filesystem see it right away.
pub(crate) fn write_holder(file: &mut File, holder: &Holder) -> io::Result<()> {
    let payload = holder.to_string();

    file.seek(SeekFrom::Start(0))?;
    file.write_all(payload.as_bytes())?;
    file.set_len(payload.len() as u64)?;
    file.flush()?;
    file.sync_all()
}
