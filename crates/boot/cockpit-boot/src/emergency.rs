//! Emergency handling: fail-safe shutdown and bounded auto-recovery.
//!
//! Phase order on every declared condition:
//! detect -> signal -> critical cleanup -> hardware safe state ->
//! diagnostics log -> final shutdown. Recovery, when the policy allows
//! it, short-circuits after the signal phase with a condition-specific
//! action and a growing back-off; once the retry budget is spent the
//! full shutdown sequence runs.
//!
//! The last [`EMERGENCY_HISTORY`] events are retained for post-mortem
//! retrieval.

use cockpit_core::history::History;
use cockpit_core::time::Ticks;
use cockpit_core::{cvlog, log::LogLevel};

/// Events retained for post-mortem retrieval.
pub const EMERGENCY_HISTORY: usize = 8;

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyCondition {
    /// A bounded buffer or budget was exhausted.
    ResourceExhaustion,
    /// A peripheral failed.
    HardwareFault,
    /// The transport failed irrecoverably.
    CommunicationFailure,
    /// Flash contents failed integrity checks.
    FlashCorruption,
    /// A critical deadline passed.
    CriticalTimeout,
    /// The protocol state machine was violated beyond recovery.
    ProtocolViolation,
    /// The user asked for an emergency stop.
    UserRequested,
}

/// Shutdown phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Condition recognized.
    Detect,
    /// Subsystems notified.
    Signal,
    /// State that must not be lost is flushed.
    CriticalCleanup,
    /// Outputs driven to their safe levels.
    HardwareSafeState,
    /// Post-mortem record emitted.
    DiagnosticsLog,
    /// Execution stops.
    FinalShutdown,
}

/// Recovery actions a caller can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyRecovery {
    /// Tear down and restart the protocol session.
    RestartSession,
    /// Reset the protocol engine wholesale.
    ResetProtocol,
    /// Re-initialize the serial transport.
    ReinitSerial,
    /// Drop all buffered transport bytes.
    FlushBuffers,
    /// Full software reset.
    FullReset,
    /// Keep running with hazardous capabilities disabled.
    SafeMode,
}

/// Auto-recovery policy.
#[derive(Debug, Clone, Copy)]
pub struct AutoRecovery {
    /// Whether recovery is attempted at all.
    pub enabled: bool,
    /// Consecutive recoveries before giving up.
    pub max_retries: u8,
    /// Base back-off; doubles per consecutive retry.
    pub backoff_ms: u32,
}

impl Default for AutoRecovery {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            backoff_ms: 250,
        }
    }
}

/// One retained emergency event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmergencyEvent {
    /// What happened.
    pub condition: EmergencyCondition,
    /// When it was declared.
    pub at: Ticks,
    /// Whether recovery was attempted (vs. full shutdown).
    pub recovered: bool,
}

/// Counters for post-mortem and test assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmergencyStats {
    /// Conditions declared.
    pub events: u32,
    /// Recoveries attempted.
    pub recoveries: u32,
    /// Full shutdowns executed.
    pub shutdowns: u32,
}

/// What the caller must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyOutcome {
    /// Execute the action after waiting `backoff_ms`.
    Recover {
        /// The action to execute.
        action: EmergencyRecovery,
        /// Delay before the attempt.
        backoff_ms: u32,
    },
    /// The retry budget is spent (or recovery is disabled): the full
    /// shutdown sequence has run and execution must stop.
    Shutdown,
}

/// The emergency manager. Process-wide by convention; owned and
/// injected explicitly like every other capability.
pub struct EmergencyManager {
    policy: AutoRecovery,
    consecutive_retries: u8,
    history: History<EmergencyEvent, EMERGENCY_HISTORY>,
    stats: EmergencyStats,
}

impl Default for EmergencyManager {
    fn default() -> Self {
        Self::new(AutoRecovery::default())
    }
}

impl EmergencyManager {
    /// Creates a manager with the given policy.
    #[must_use]
    pub const fn new(policy: AutoRecovery) -> Self {
        Self {
            policy,
            consecutive_retries: 0,
            history: History::new(),
            stats: EmergencyStats {
                events: 0,
                recoveries: 0,
                shutdowns: 0,
            },
        }
    }

    /// Declares a condition and decides between recovery and shutdown.
    pub fn declare(&mut self, condition: EmergencyCondition, now: Ticks) -> EmergencyOutcome {
        self.stats.events += 1;
        self.phase(ShutdownPhase::Detect, condition);
        self.phase(ShutdownPhase::Signal, condition);

        let recover = self.policy.enabled && self.consecutive_retries < self.policy.max_retries;
        self.history.push(EmergencyEvent {
            condition,
            at: now,
            recovered: recover,
        });

        if recover {
            self.consecutive_retries += 1;
            self.stats.recoveries += 1;
            let backoff_ms = self
                .policy
                .backoff_ms
                .saturating_mul(1 << (self.consecutive_retries - 1));
            let action = recovery_for(condition);
            cvlog!(
                LogLevel::Warn,
                0,
                "recovering from {:?} with {:?}, backoff {} ms",
                condition,
                action,
                backoff_ms
            );
            return EmergencyOutcome::Recover { action, backoff_ms };
        }

        // Budget spent: run the remaining phases and stop.
        self.phase(ShutdownPhase::CriticalCleanup, condition);
        self.phase(ShutdownPhase::HardwareSafeState, condition);
        self.phase(ShutdownPhase::DiagnosticsLog, condition);
        self.phase(ShutdownPhase::FinalShutdown, condition);
        self.stats.shutdowns += 1;
        EmergencyOutcome::Shutdown
    }

    /// Tells the manager the last recovery worked; resets the
    /// consecutive-retry counter.
    pub fn recovery_succeeded(&mut self) {
        self.consecutive_retries = 0;
    }

    /// Retained events, oldest first.
    pub fn history(&self) -> impl Iterator<Item = EmergencyEvent> + '_ {
        self.history.iter()
    }

    /// The most recent event.
    #[must_use]
    pub fn latest(&self) -> Option<EmergencyEvent> {
        self.history.latest()
    }

    /// Counters.
    #[must_use]
    pub const fn stats(&self) -> EmergencyStats {
        self.stats
    }

    fn phase(&self, phase: ShutdownPhase, condition: EmergencyCondition) {
        cvlog!(
            LogLevel::Error,
            phase as u16,
            "emergency {:?}: {:?}",
            condition,
            phase
        );
    }
}

/// Condition-specific recovery choice.
fn recovery_for(condition: EmergencyCondition) -> EmergencyRecovery {
    match condition {
        EmergencyCondition::CommunicationFailure => EmergencyRecovery::ReinitSerial,
        EmergencyCondition::CriticalTimeout => EmergencyRecovery::RestartSession,
        EmergencyCondition::ProtocolViolation => EmergencyRecovery::ResetProtocol,
        EmergencyCondition::ResourceExhaustion => EmergencyRecovery::FlushBuffers,
        EmergencyCondition::FlashCorruption => EmergencyRecovery::SafeMode,
        EmergencyCondition::HardwareFault | EmergencyCondition::UserRequested => {
            EmergencyRecovery::FullReset
        }
    }
}
