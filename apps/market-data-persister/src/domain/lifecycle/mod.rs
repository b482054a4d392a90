//! Delivery Lifecycle
//!
//! Per-delivery state machine and the outcome vocabulary shared by the
//! delivery controller, metrics and logs.
//!
//! ```text
//! Received → Decoding → Routed → Validating → Persisting ─┬→ Acked
//!                │         │          │            ↺       ├→ DeadLettered
//!                │         └→ Acked   │                    └→ Nacked
//!                └────────────────────┴→ Acked | DeadLettered | Nacked
//! ```
//!
//! Every delivery ends in exactly one terminal state. `DeadLettered`
//! means the message was republished to the dead-letter exchange and the
//! original delivery acknowledged. Failures during decoding or validation
//! settle directly from those states.

use std::fmt;

// =============================================================================
// Message State
// =============================================================================

/// Processing state of a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageState {
    /// Delivery handed to the controller.
    Received,
    /// Body being decoded.
    Decoding,
    /// Data type resolved (or dropped).
    Routed,
    /// Payload being mapped and validated.
    Validating,
    /// Record being written; re-entered on each retry.
    Persisting,
    /// Acknowledged. Terminal.
    Acked,
    /// Republished to the dead-letter exchange and acknowledged. Terminal.
    DeadLettered,
    /// Negatively acknowledged. Terminal.
    Nacked,
}

impl MessageState {
    /// Whether this state ends the lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Acked | Self::DeadLettered | Self::Nacked)
    }

    /// Check if a state transition is valid.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Received, Self::Decoding)
                | (
                    Self::Decoding,
                    Self::Routed | Self::Acked | Self::DeadLettered | Self::Nacked
                )
                | (Self::Routed, Self::Validating | Self::Acked)
                | (
                    Self::Validating,
                    Self::Persisting | Self::Acked | Self::DeadLettered | Self::Nacked
                )
                | (
                    Self::Persisting,
                    Self::Persisting | Self::Acked | Self::DeadLettered | Self::Nacked
                )
        )
    }

    /// Lowercase name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Decoding => "decoding",
            Self::Routed => "routed",
            Self::Validating => "validating",
            Self::Persisting => "persisting",
            Self::Acked => "acked",
            Self::DeadLettered => "dead_lettered",
            Self::Nacked => "nacked",
        }
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid delivery state transition from {from} to {to}")]
pub struct InvalidTransition {
    /// Current state.
    pub from: MessageState,
    /// Requested state.
    pub to: MessageState,
}

/// Tracks the state of one delivery and the path it took.
#[derive(Debug, Clone)]
pub struct MessageLifecycle {
    state: MessageState,
    history: Vec<MessageState>,
}

impl Default for MessageLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLifecycle {
    /// Start a lifecycle in [`MessageState::Received`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: MessageState::Received,
            history: vec![MessageState::Received],
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> MessageState {
        self.state
    }

    /// Every state visited, in order.
    #[must_use]
    pub fn history(&self) -> &[MessageState] {
        &self.history
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if `next` is not reachable from the
    /// current state; the state is left unchanged.
    pub fn advance(&mut self, next: MessageState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

// =============================================================================
// Outcome / Action
// =============================================================================

/// Business outcome of a delivery, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Record stored.
    Success,
    /// Record already stored; treated as success.
    Duplicate,
    /// Processing failed.
    Error,
    /// No data-type tag.
    MissingType,
    /// Unknown data-type tag.
    UnsupportedType,
}

impl Outcome {
    /// Every outcome.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Success,
            Self::Duplicate,
            Self::Error,
            Self::MissingType,
            Self::UnsupportedType,
        ]
    }

    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Duplicate => "duplicate",
            Self::Error => "error",
            Self::MissingType => "missing_type",
            Self::UnsupportedType => "unsupported_type",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What was done with the broker delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryAction {
    /// Acknowledged.
    Ack,
    /// Republished to the dead-letter exchange, then acknowledged.
    DeadLetterThenAck,
    /// Negatively acknowledged.
    Nack {
        /// Whether the broker was asked to requeue.
        requeue: bool,
    },
}

impl DeliveryAction {
    /// Terminal lifecycle state this action produces.
    #[must_use]
    pub const fn terminal_state(self) -> MessageState {
        match self {
            Self::Ack => MessageState::Acked,
            Self::DeadLetterThenAck => MessageState::DeadLettered,
            Self::Nack { .. } => MessageState::Nacked,
        }
    }

    /// Whether the original delivery ends up acknowledged.
    #[must_use]
    pub const fn is_ack(self) -> bool {
        matches!(self, Self::Ack | Self::DeadLetterThenAck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_valid() {
        let mut lifecycle = MessageLifecycle::new();
        for next in [
            MessageState::Decoding,
            MessageState::Routed,
            MessageState::Validating,
            MessageState::Persisting,
            MessageState::Persisting,
            MessageState::Acked,
        ] {
            lifecycle.advance(next).unwrap();
        }
        assert_eq!(lifecycle.state(), MessageState::Acked);
        assert_eq!(lifecycle.history().len(), 7);
    }

    #[test]
    fn terminal_states_accept_nothing() {
        let terminals = [
            MessageState::Acked,
            MessageState::DeadLettered,
            MessageState::Nacked,
        ];
        for from in terminals {
            assert!(from.is_terminal());
            for to in terminals {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn rejected_transition_keeps_state() {
        let mut lifecycle = MessageLifecycle::new();
        let err = lifecycle.advance(MessageState::Persisting).unwrap_err();
        assert_eq!(err.from, MessageState::Received);
        assert_eq!(lifecycle.state(), MessageState::Received);
    }

    #[test]
    fn dropped_messages_ack_straight_from_routing() {
        assert!(MessageState::Routed.can_transition_to(MessageState::Acked));
        assert!(!MessageState::Routed.can_transition_to(MessageState::DeadLettered));
    }

    #[test]
    fn actions_map_to_terminal_states() {
        assert_eq!(DeliveryAction::Ack.terminal_state(), MessageState::Acked);
        assert_eq!(
            DeliveryAction::DeadLetterThenAck.terminal_state(),
            MessageState::DeadLettered
        );
        assert!(!DeliveryAction::Nack { requeue: true }.is_ack());
    }
}
