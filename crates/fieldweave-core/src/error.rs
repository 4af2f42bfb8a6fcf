//! Typed error hierarchy for the engine.
//!
//! Uses `thiserror` for library-grade errors.  Application code should wrap
//! these in `anyhow::Result` at call sites.
//!
//! Pipeline consistency *faults* are deliberately not errors: they are
//! recorded in the engine's fault state and degrade the consumer surface
//! until explicit recovery.  `EngineError` covers the fallible edges only:
//! configuration, stream registration, and hardware-unit calls.
//!
//! Each variant maps to a stable integer code via [`EngineError::error_code`]
//! for structured telemetry without string parsing.

use crate::types::FrameFormat;

/// All errors originating from the fieldweave engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Invalid engine config: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    ConfigParse(String),

    // ── Stream registration ──────────────────────────────────────────
    #[error("No frame source registered")]
    NoSource,

    #[error("A frame source is already registered")]
    AlreadyRegistered,

    #[error("Engine not initialized: register a source first")]
    NotInitialized,

    // ── Hardware unit ────────────────────────────────────────────────
    #[error("Hardware unit error: {0}")]
    Unit(String),

    #[error("Hardware unit busy: {0}")]
    UnitBusy(&'static str),

    // ── Type contracts ───────────────────────────────────────────────
    #[error("Frame format mismatch: expected {expected:?}, got {actual:?}")]
    FormatMismatch {
        expected: FrameFormat,
        actual: FrameFormat,
    },

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    // ── Audit invariants ─────────────────────────────────────────────
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    /// Stable integer error code for structured telemetry.
    ///
    /// Codes are grouped by category:
    /// - 1xx: Configuration
    /// - 2xx: Stream registration
    /// - 3xx: Hardware unit
    /// - 5xx: Type contracts
    /// - 6xx: Audit/invariant
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Config(_) => 100,
            Self::ConfigParse(_) => 101,
            Self::NoSource => 200,
            Self::AlreadyRegistered => 201,
            Self::NotInitialized => 202,
            Self::Unit(_) => 300,
            Self::UnitBusy(_) => 301,
            Self::FormatMismatch { .. } => 500,
            Self::DimensionMismatch(_) => 501,
            Self::InvariantViolation(_) => 600,
        }
    }
}

/// Convenience alias used throughout the engine crates.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_grouped_by_category() {
        assert_eq!(EngineError::Config("x".into()).error_code(), 100);
        assert_eq!(EngineError::NoSource.error_code(), 200);
        assert_eq!(EngineError::Unit("x".into()).error_code(), 300);
        assert_eq!(
            EngineError::InvariantViolation("x".into()).error_code(),
            600
        );
    }

    #[test]
    fn display_includes_detail() {
        let err = EngineError::Config("input_slots must be > 0".into());
        assert!(err.to_string().contains("input_slots"));
    }
}
