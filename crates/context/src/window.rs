//! Context-window sanity guard.
//!
//! Runs fail synchronously below the hard floor; a window below the warn
//! threshold is logged once per process.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use talon_core::error::AgentError;

/// Hard minimum: below this the loop cannot do useful work.
pub const MIN_CONTEXT_TOKENS: u32 = 8_000;

/// Soft minimum: compaction will be constantly busy below this.
pub const WARN_CONTEXT_TOKENS: u32 = 16_000;

static WARNED: AtomicBool = AtomicBool::new(false);

/// Validate a configured context window before any I/O happens.
pub fn check_context_window(tokens: u32) -> Result<(), AgentError> {
    if tokens < MIN_CONTEXT_TOKENS {
        return Err(AgentError::ContextWindowTooSmall {
            tokens,
            min: MIN_CONTEXT_TOKENS,
        });
    }
    if tokens < WARN_CONTEXT_TOKENS && !WARNED.swap(true, Ordering::Relaxed) {
        warn!(
            context_tokens = tokens,
            threshold = WARN_CONTEXT_TOKENS,
            "Context window is small; expect frequent compaction"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_is_enforced() {
        assert!(matches!(
            check_context_window(4_000),
            Err(AgentError::ContextWindowTooSmall { tokens: 4_000, .. })
        ));
        assert!(check_context_window(8_000).is_ok());
        assert!(check_context_window(200_000).is_ok());
    }

    #[test]
    fn warn_zone_still_passes() {
        assert!(check_context_window(12_000).is_ok());
        assert!(check_context_window(12_000).is_ok());
    }
}
