// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Host metadata probes.
//!
//! Everything here is best effort: a probe that cannot answer returns `None`.

use std::path::{Path, PathBuf};

/// Source of the immutable host facts captured when a context is built.
pub trait HostProbe: Send + Sync {
    fn app_version(&self) -> Option<String>;
    fn os_version(&self) -> Option<String>;
    fn device(&self) -> Option<String>;
    fn source_revision(&self) -> Option<String>;
}

/// Facts resolved from a [`HostProbe`] once, at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct HostFacts {
    pub app_version: Option<String>,
    pub os_version: Option<String>,
    pub device: Option<String>,
    pub source_revision: Option<String>,
}

impl HostFacts {
    /// Query every probe method once.
    pub fn capture(probe: &dyn HostProbe) -> Self {
        Self {
            app_version: probe.app_version(),
            os_version: probe.os_version(),
            device: probe.device(),
            source_revision: probe.source_revision(),
        }
    }
}

/// Probe backed by the running process and the local file system.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    /// Directory searched for `.git/HEAD`.
    base_dir: Option<PathBuf>,
}

impl SystemProbe {
    /// Probe rooted at the executable's directory.
    pub fn new() -> Self {
        let base_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        Self { base_dir }
    }

    /// Probe rooted at an explicit directory.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for SystemProbe {
    fn app_version(&self) -> Option<String> {
        Some(env!("CARGO_PKG_VERSION").to_string())
    }

    fn os_version(&self) -> Option<String> {
        let pretty = std::fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|content| {
                content.lines().find_map(|line| {
                    line.strip_prefix("PRETTY_NAME=")
                        .map(|v| v.trim_matches('"').to_string())
                })
            });
        Some(pretty.unwrap_or_else(|| {
            format!("{} {}", std::env::consts::OS, std::env::consts::FAMILY)
        }))
    }

    fn device(&self) -> Option<String> {
        let host = hostname()?;
        Some(format!("Host={}; Arch={}", host, std::env::consts::ARCH))
    }

    fn source_revision(&self) -> Option<String> {
        read_git_revision(self.base_dir.as_deref()?)
    }
}

fn hostname() -> Option<String> {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok())
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

/// Resolve the commit `HEAD` points at under `base_dir/.git`.
pub fn read_git_revision(base_dir: &Path) -> Option<String> {
    let git_dir = base_dir.join(".git");
    let head = std::fs::read_to_string(git_dir.join("HEAD")).ok()?;
    let head = head.trim();

    match head.strip_prefix("ref:") {
        Some(reference) => {
            let reference = reference.trim();
            if reference.is_empty() {
                return None;
            }
            let rev = std::fs::read_to_string(git_dir.join(reference)).ok()?;
            Some(rev.trim().to_string()).filter(|r| !r.is_empty())
        }
        // Detached HEAD holds the hash itself.
        None if !head.is_empty() => Some(head.to_string()),
        None => None,
    }
}

/// Probe returning fixed values; used when the host is known up front.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    pub facts: HostFacts,
}

impl StaticProbe {
    pub fn new(facts: HostFacts) -> Self {
        Self { facts }
    }
}

impl HostProbe for StaticProbe {
    fn app_version(&self) -> Option<String> {
        self.facts.app_version.clone()
    }

    fn os_version(&self) -> Option<String> {
        self.facts.os_version.clone()
    }

    fn device(&self) -> Option<String> {
        self.facts.device.clone()
    }

    fn source_revision(&self) -> Option<String> {
        self.facts.source_revision.clone()
    }
}
