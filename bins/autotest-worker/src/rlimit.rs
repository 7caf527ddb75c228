/// Resource Limiter - OS Resource Limits for Tester Processes
///
/// **Core Responsibility:**
/// Turn the configured `[soft, hard]` pairs into limits that are safe to
/// apply: never above what the worker itself currently has, and with the
/// soft limit never above the hard one.
///
/// **Rules (`-1` means unlimited):**
/// - hard = configured hard clipped by current hard; an unlimited side
///   defers to the other
/// - soft = lower of configured soft and current soft; an unlimited side
///   defers to the other
/// - soft is then clipped to hard whenever hard is finite
///
/// Limits are applied only inside the forked child (see `sandbox.rs`), so
/// the worker process keeps its own limits.

use anyhow::{bail, Result};
use nix::libc::rlim_t;
use nix::sys::resource::{getrlimit, setrlimit, Resource, RLIM_INFINITY};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

pub const UNLIMITED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlimitKind {
    Nproc,
    Cpu,
    Nofile,
    As,
    Fsize,
    Core,
    Data,
    Stack,
}

impl RlimitKind {
    pub fn resource(&self) -> Resource {
        match self {
            RlimitKind::Nproc => Resource::RLIMIT_NPROC,
            RlimitKind::Cpu => Resource::RLIMIT_CPU,
            RlimitKind::Nofile => Resource::RLIMIT_NOFILE,
            RlimitKind::As => Resource::RLIMIT_AS,
            RlimitKind::Fsize => Resource::RLIMIT_FSIZE,
            RlimitKind::Core => Resource::RLIMIT_CORE,
            RlimitKind::Data => Resource::RLIMIT_DATA,
            RlimitKind::Stack => Resource::RLIMIT_STACK,
        }
    }

    /// The platform's resource number, as testers see it
    pub fn os_number(&self) -> i64 {
        self.resource() as i64
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RlimitKind::Nproc => "nproc",
            RlimitKind::Cpu => "cpu",
            RlimitKind::Nofile => "nofile",
            RlimitKind::As => "as",
            RlimitKind::Fsize => "fsize",
            RlimitKind::Core => "core",
            RlimitKind::Data => "data",
            RlimitKind::Stack => "stack",
        }
    }
}

impl fmt::Display for RlimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RlimitKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_lowercase().as_str() {
            "nproc" => RlimitKind::Nproc,
            "cpu" => RlimitKind::Cpu,
            "nofile" => RlimitKind::Nofile,
            "as" => RlimitKind::As,
            "fsize" => RlimitKind::Fsize,
            "core" => RlimitKind::Core,
            "data" => RlimitKind::Data,
            "stack" => RlimitKind::Stack,
            other => bail!("Unknown resource limit '{}'", other),
        })
    }
}

fn min_limited(a: i64, b: i64) -> i64 {
    match (a < 0, b < 0) {
        (true, true) => UNLIMITED,
        (true, false) => b,
        (false, true) => a,
        (false, false) => a.min(b),
    }
}

/// Clip a configured `(soft, hard)` pair against the current one
pub fn validate_rlimit(config_soft: i64, config_hard: i64, current_soft: i64, current_hard: i64) -> (i64, i64) {
    let hard = min_limited(config_hard, current_hard);
    let soft = min_limited(config_soft, current_soft);
    if hard < 0 {
        return (soft, hard);
    }
    (min_limited(soft, hard), hard)
}

fn from_os(value: rlim_t) -> i64 {
    if value == RLIM_INFINITY {
        UNLIMITED
    } else {
        i64::try_from(value).unwrap_or(i64::MAX)
    }
}

fn to_os(value: i64) -> rlim_t {
    if value < 0 {
        RLIM_INFINITY
    } else {
        value as rlim_t
    }
}

/// Current `(soft, hard)` of the worker process, `-1` for unlimited
pub fn current_limits(kind: RlimitKind) -> Result<(i64, i64)> {
    let (soft, hard) = getrlimit(kind.resource())?;
    Ok((from_os(soft), from_os(hard)))
}

/// Validated limits, in configuration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSettings {
    entries: Vec<(RlimitKind, (i64, i64))>,
}

impl ResourceSettings {
    pub fn entries(&self) -> &[(RlimitKind, (i64, i64))] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply every limit to the calling process.
    ///
    /// Runs between fork and exec: no allocation, no locking, only
    /// `setrlimit` calls.
    pub fn apply(&self) -> std::io::Result<()> {
        for (kind, (soft, hard)) in &self.entries {
            setrlimit(kind.resource(), to_os(*soft), to_os(*hard))?;
        }
        Ok(())
    }

    /// `[[resource number, [soft, hard]], ...]` as sent to testers
    pub fn to_wire(&self) -> Value {
        Value::Array(
            self.entries
                .iter()
                .map(|(kind, (soft, hard))| json!([kind.os_number(), [soft, hard]]))
                .collect(),
        )
    }
}

/// Validate the configured limits against the worker's current ones
pub fn get_resource_settings(config: &[(String, [i64; 2])]) -> Result<ResourceSettings> {
    get_resource_settings_with(config, current_limits)
}

/// Same as [`get_resource_settings`] with an injectable limit reader
pub fn get_resource_settings_with<F>(config: &[(String, [i64; 2])], mut current: F) -> Result<ResourceSettings>
where
    F: FnMut(RlimitKind) -> Result<(i64, i64)>,
{
    let mut entries = Vec::with_capacity(config.len());
    for (name, [soft, hard]) in config {
        let kind: RlimitKind = name.parse()?;
        let (cur_soft, cur_hard) = current(kind)?;
        entries.push((kind, validate_rlimit(*soft, *hard, cur_soft, cur_hard)));
    }
    Ok(ResourceSettings { entries })
}
