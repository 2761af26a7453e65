//! Memory pressure classification.

use std::fmt;

/// How close the system is to running out of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// Less than 50% in use
    Low,
    /// 50% to 75% in use
    Moderate,
    /// 75% to 90% in use
    High,
    /// More than 90% in use
    Critical,
}

impl MemoryPressure {
    /// Classifies a system-wide usage percentage (0.0 to 100.0).
    pub fn from_percent(percent_used: f64) -> Self {
        if percent_used < 50.0 {
            MemoryPressure::Low
        } else if percent_used < 75.0 {
            MemoryPressure::Moderate
        } else if percent_used <= 90.0 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }

    /// Returns true if cleanup should be aggressive (Critical)
    pub fn is_critical(&self) -> bool {
        matches!(self, MemoryPressure::Critical)
    }

    /// Returns true if memory pressure requires action (High or Critical)
    pub fn needs_cleanup(&self) -> bool {
        matches!(self, MemoryPressure::High | MemoryPressure::Critical)
    }
}

impl fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryPressure::Low => "low",
            MemoryPressure::Moderate => "moderate",
            MemoryPressure::High => "high",
            MemoryPressure::Critical => "critical",
        };
        f.write_str(name)
    }
}
