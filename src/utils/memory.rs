//! System memory detection backed by `/proc/meminfo`

use std::path::Path;

const MEMINFO_PATH: &str = "/proc/meminfo";

/// Point-in-time view of physical memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemMemory {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl SystemMemory {
    /// Read the running system's memory; `None` where `/proc/meminfo` is
    /// missing or unparseable.
    pub fn read() -> Option<Self> {
        Self::read_from(Path::new(MEMINFO_PATH))
    }

    pub(crate) fn read_from(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        Self::parse(&content)
    }

    pub(crate) fn parse(content: &str) -> Option<Self> {
        let mut total_kb = None;
        let mut available_kb = None;

        for line in content.lines() {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("MemTotal:"), Some(value)) => total_kb = value.parse::<u64>().ok(),
                (Some("MemAvailable:"), Some(value)) => available_kb = value.parse::<u64>().ok(),
                _ => {}
            }
            if total_kb.is_some() && available_kb.is_some() {
                break;
            }
        }

        let total_bytes = total_kb? * 1024;
        Some(Self {
            total_bytes,
            // Older kernels lack MemAvailable
            available_bytes: available_kb.map(|kb| kb * 1024).unwrap_or(total_bytes),
        })
    }

    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.available_bytes)
    }
}
