//! Resource limits applied through a bash `ulimit` preamble.
//!
//! The sandboxed program is started as
//! `bash -e -c <script> -- <program> <args...>`, where the script narrows
//! each requested limit and then `exec`s the program.

use std::collections::BTreeMap;

use nix::sys::resource::{Resource, getrlimit};
use serde::{Deserialize, Serialize};

/// A single bound. `None` is unlimited.
pub type Bound = Option<u64>;

/// Token bash's `ulimit` accepts for an unbounded limit.
pub const UNLIMITED: &str = "unlimited";

/// Limit kinds, ordered by their Linux `RLIMIT_*` number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RlimitKind {
    #[serde(rename = "RLIMIT_CPU")]
    Cpu,
    #[serde(rename = "RLIMIT_FSIZE")]
    Fsize,
    #[serde(rename = "RLIMIT_DATA")]
    Data,
    #[serde(rename = "RLIMIT_STACK")]
    Stack,
    #[serde(rename = "RLIMIT_CORE")]
    Core,
    #[serde(rename = "RLIMIT_RSS")]
    Rss,
    #[serde(rename = "RLIMIT_NOFILE")]
    Nofile,
    #[serde(rename = "RLIMIT_MEMLOCK")]
    Memlock,
    #[serde(rename = "RLIMIT_AS")]
    As,
}

impl RlimitKind {
    /// The `ulimit` option letter.
    pub fn flag(self) -> char {
        match self {
            Self::Cpu => 't',
            Self::Fsize => 'f',
            Self::Data => 'd',
            Self::Stack => 's',
            Self::Core => 'c',
            Self::Rss => 'm',
            Self::Nofile => 'n',
            Self::Memlock => 'l',
            Self::As => 'v',
        }
    }

    /// Divisor from the kernel's unit to the one `ulimit` expects.
    ///
    /// Bash takes seconds for `-t`, a plain count for `-n` and kibibytes
    /// for everything else here.
    pub fn scale(self) -> u64 {
        match self {
            Self::Cpu | Self::Nofile => 1,
            _ => 1024,
        }
    }

    /// Stack and locked-memory limits are not applied: neither can be
    /// narrowed reliably from inside an unprivileged or containerised shell.
    pub fn settable(self) -> bool {
        !matches!(self, Self::Stack | Self::Memlock)
    }

    fn resource(self) -> Resource {
        match self {
            Self::Cpu => Resource::RLIMIT_CPU,
            Self::Fsize => Resource::RLIMIT_FSIZE,
            Self::Data => Resource::RLIMIT_DATA,
            Self::Stack => Resource::RLIMIT_STACK,
            Self::Core => Resource::RLIMIT_CORE,
            Self::Rss => Resource::RLIMIT_RSS,
            Self::Nofile => Resource::RLIMIT_NOFILE,
            Self::Memlock => Resource::RLIMIT_MEMLOCK,
            Self::As => Resource::RLIMIT_AS,
        }
    }

    /// Limit currently enforced on this process, or `None` if it cannot be read.
    pub fn current(self) -> Option<Rlimit> {
        let (soft, hard) = getrlimit(self.resource()).ok()?;
        Some(Rlimit {
            soft: from_rlim(soft),
            hard: from_rlim(hard),
        })
    }
}

// rlim_t is narrower than u64 on 32-bit targets.
#[allow(clippy::useless_conversion)]
fn from_rlim(value: nix::libc::rlim_t) -> Bound {
    if value == nix::libc::RLIM_INFINITY {
        None
    } else {
        Some(u64::from(value))
    }
}

/// A soft/hard pair.
///
/// Deserializes from `[soft, hard]`; a negative or `null` entry is unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "(Option<i64>, Option<i64>)")]
pub struct Rlimit {
    pub soft: Bound,
    pub hard: Bound,
}

impl Rlimit {
    pub fn new(soft: Bound, hard: Bound) -> Self {
        Self { soft, hard }
    }
}

impl From<(Option<i64>, Option<i64>)> for Rlimit {
    fn from((soft, hard): (Option<i64>, Option<i64>)) -> Self {
        let bound = |v: Option<i64>| v.and_then(|v| u64::try_from(v).ok());
        Self {
            soft: bound(soft),
            hard: bound(hard),
        }
    }
}

/// The value to hand `ulimit`: the tighter of `requested` and `current`,
/// already divided by `scale`.
pub fn ulimit_value(requested: Bound, current: Bound, scale: u64) -> String {
    let scale = scale.max(1);
    let effective = match (requested, current) {
        (Some(req), Some(cur)) => Some(req.min(cur)),
        (bound @ Some(_), None) | (None, bound) => bound,
    };
    match effective {
        Some(value) => (value / scale).to_string(),
        None => UNLIMITED.to_string(),
    }
}

/// Builds the limiting launch wrapper for one program invocation.
#[derive(Debug, Clone)]
pub struct RlimitScript {
    limits: BTreeMap<RlimitKind, Rlimit>,
    args: Vec<String>,
}

impl RlimitScript {
    pub fn new(limits: BTreeMap<RlimitKind, Rlimit>, args: Vec<String>) -> Self {
        Self { limits, args }
    }

    /// Full argument vector, `args[0]` being the shell to execute.
    pub fn build_args(&self) -> Vec<String> {
        self.build_args_with(RlimitKind::current)
    }

    pub fn build_args_with(&self, current: impl Fn(RlimitKind) -> Option<Rlimit>) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 5);
        argv.extend(["bash", "-e", "-c"].map(String::from));
        argv.push(self.build_script_with(current));
        argv.push("--".to_string());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Script text, clamped against this process's own limits.
    pub fn build_script(&self) -> String {
        self.build_script_with(RlimitKind::current)
    }

    /// Script text, clamped against limits reported by `current`.
    ///
    /// Kinds that are not [settable](RlimitKind::settable), or whose current
    /// value cannot be read, produce no `ulimit` line.
    pub fn build_script_with(&self, current: impl Fn(RlimitKind) -> Option<Rlimit>) -> String {
        let mut lines = vec!["#!/bin/bash".to_string(), String::new()];
        lines.push("# Set resource limits.".to_string());
        for (&kind, requested) in &self.limits {
            if !kind.settable() {
                continue;
            }
            let Some(enforced) = current(kind) else {
                continue;
            };
            let (flag, scale) = (kind.flag(), kind.scale());
            lines.push(format!(
                "ulimit -S{flag} {}",
                ulimit_value(requested.soft, enforced.soft, scale)
            ));
            lines.push(format!(
                "ulimit -H{flag} {}",
                ulimit_value(requested.hard, enforced.hard, scale)
            ));
        }
        lines.push(String::new());
        lines.push("exec \"$@\"".to_string());
        lines.join("\n")
    }
}
