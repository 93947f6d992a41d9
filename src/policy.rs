// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-target error policy.
//!
//! Decides what a worker does when its adapter rejects a write:
//!
//! ```text
//! Authentication ─────────────────────────────────────────────▶ Halt
//! Connection ──(attempts left)──▶ Retry(backoff)
//!            └─(exhausted)──┐
//! InvalidDocument / Other ──┴─▶ continueOnError? ──yes──▶ Skip
//!                                              └─no──▶ haltMode: exit ──▶ Halt
//!                                                                block ─▶ Block(backoff)
//! ```

use crate::config::{HaltMode, TargetConfig, ValidatedConfig};
use crate::doc_manager::{AdapterError, AdapterErrorKind};
use crate::resilience::RetryConfig;
use std::time::Duration;

/// What to do about a failed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Try the same write again after the delay.
    Retry(Duration),
    /// Log, count and move past the write.
    Skip,
    /// Stop the connector without advancing past the write.
    Halt,
    /// Keep retrying the write after the delay until it succeeds or shutdown.
    Block(Duration),
}

impl FailureAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry(_) => "retry",
            Self::Skip => "skip",
            Self::Halt => "halt",
            Self::Block(_) => "block",
        }
    }
}

/// Error policy of one target.
#[derive(Debug, Clone)]
pub struct ErrorPolicy {
    pub continue_on_error: bool,
    pub halt_mode: HaltMode,
    pub retry: RetryConfig,
}

impl ErrorPolicy {
    pub fn new(continue_on_error: bool, halt_mode: HaltMode, retry: RetryConfig) -> Self {
        Self {
            continue_on_error,
            halt_mode,
            retry,
        }
    }

    /// Policy for a target, with the global settings as fallback.
    pub fn for_target(target: &TargetConfig, config: &ValidatedConfig) -> Self {
        Self::new(target.continue_on_error, config.halt_mode, config.apply_retry())
    }

    /// Decide after the `attempt`-th consecutive failure of the same write.
    pub fn decide(&self, error: &AdapterError, attempt: usize) -> FailureAction {
        match error.kind {
            AdapterErrorKind::Authentication => return FailureAction::Halt,
            AdapterErrorKind::Connection if self.retry.should_retry(attempt) => {
                return FailureAction::Retry(self.retry.delay_for_attempt(attempt));
            }
            _ => {}
        }

        if self.continue_on_error {
            return FailureAction::Skip;
        }
        match self.halt_mode {
            HaltMode::Exit => FailureAction::Halt,
            HaltMode::Block => FailureAction::Block(self.retry.delay_for_attempt(attempt)),
        }
    }
}
