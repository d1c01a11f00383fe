//! Worklet lifecycle states.
//!
//! ```text
//! Created ──start──► Running ◄──resume── Suspended
//!                       │  └──suspend──►    │
//!                       └──terminate──► Terminated ◄──terminate──┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

// ============================================================================
// LifecycleState
// ============================================================================

/// Lifecycle state of a worklet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Constructed, script not yet started.
    #[default]
    Created,
    /// Script is being driven.
    Running,
    /// Script is parked; channels stay open.
    Suspended,
    /// Runtime torn down. Absorbing.
    Terminated,
}

impl LifecycleState {
    /// Returns the lowercase state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Terminated => "terminated",
        }
    }

    /// Returns `true` for [`LifecycleState::Terminated`].
    #[inline]
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Returns `true` if the transition `self → next` is allowed.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Running)
                | (Self::Running, Self::Suspended)
                | (Self::Suspended, Self::Running)
                | (Self::Created | Self::Running | Self::Suspended, Self::Terminated)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::LifecycleState::{self, *};

    #[test]
    fn test_display_is_lowercase() {
        assert_eq!(Terminated.to_string(), "terminated");
        assert_eq!(Running.to_string(), "running");
    }

    #[test]
    fn test_terminated_is_absorbing() {
        for next in [Created, Running, Suspended, Terminated] {
            assert!(!Terminated.can_transition_to(next));
        }
    }

    #[test]
    fn test_allowed_transitions() {
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Running));
        assert!(Suspended.can_transition_to(Terminated));
        assert!(!Running.can_transition_to(Created));
        assert!(!Created.can_transition_to(Suspended));
    }

    #[test]
    fn test_default_is_created() {
        assert_eq!(LifecycleState::default(), Created);
        assert!(!Created.is_terminal());
    }
}
