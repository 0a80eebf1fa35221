//! Connection lifecycle.
//!
//! Created → Listening/Connecting → ParamsExchanged → QueuePairInit →
//! QueuePairReady → Active, with terminal Closed and Error reachable from
//! every live state. Only Error may still move to Closed.

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Allocated, no network resources bound.
    Created,
    /// Listener waiting for the connector's record.
    Listening,
    /// Connector dialing the listener.
    Connecting,
    /// Both sides know each other's queue pair and region.
    ParamsExchanged,
    /// Local queue pair in INIT, peer address resolved.
    QueuePairInit,
    /// Queue pair can send and receive.
    QueuePairReady,
    /// First successful completion observed.
    Active,
    /// Torn down explicitly.
    Closed,
    /// Non-recoverable fault.
    Error,
}

impl ConnectionState {
    /// Closed or Error.
    pub const fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Error)
    }

    /// Data operations may be posted.
    pub const fn can_post(self) -> bool {
        matches!(self, ConnectionState::QueuePairReady | ConnectionState::Active)
    }
}

/// Which side of the handshake a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// Accepted the rendezvous connection.
    Listener,
    /// Dialed the rendezvous connection.
    Connector,
}

/// Input driving a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Listener starts waiting for a peer.
    Listen,
    /// Connector starts dialing.
    Connect,
    /// Peer record received and own record sent.
    ParamsReceived,
    /// Queue pair moved to INIT.
    QueuePairInitialized,
    /// Queue pair moved through RTR to RTS.
    QueuePairActivated,
    /// A successful completion was observed.
    FirstCompletion,
    /// Explicit teardown.
    Close,
    /// Device or link failure.
    Fault,
}

/// Result of a transition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition succeeded; new state.
    Ok(ConnectionState),
    /// Transition rejected; reason.
    Rejected(&'static str),
}

/// Per-connection transition table.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    role: ConnectionRole,
}

impl ConnectionStateMachine {
    /// New machine in `Created`.
    pub const fn new(role: ConnectionRole) -> Self {
        Self {
            state: ConnectionState::Created,
            role,
        }
    }

    /// Current state.
    #[inline]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Role fixed at creation.
    #[inline]
    pub const fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Attempt a transition given an event.
    pub fn handle_event(&mut self, event: ConnectionEvent) -> TransitionResult {
        use ConnectionEvent::*;
        use ConnectionRole::*;
        use ConnectionState::*;

        let next = match (self.state, event) {
            (Created, Listen) if self.role == Listener => Listening,
            (Created, Connect) if self.role == Connector => Connecting,

            (Listening | Connecting, ParamsReceived) => ParamsExchanged,
            (ParamsExchanged, QueuePairInitialized) => QueuePairInit,
            (QueuePairInit, QueuePairActivated) => QueuePairReady,
            (QueuePairReady, FirstCompletion) => Active,

            // Error still owns resources until closed.
            (Error, Close) => Closed,
            (state, Close) if !state.is_terminal() => Closed,
            (state, Fault) if !state.is_terminal() => Error,

            _ => return TransitionResult::Rejected(invalid_transition_reason(self.state, event, self.role)),
        };

        self.state = next;
        TransitionResult::Ok(next)
    }
}

fn invalid_transition_reason(
    state: ConnectionState,
    event: ConnectionEvent,
    role: ConnectionRole,
) -> &'static str {
    use ConnectionEvent::*;
    use ConnectionRole::*;
    use ConnectionState::*;
    match (state, event, role) {
        (Closed, _, _) => "Closed: no further transitions",
        (Error, _, _) => "Error: only Close allowed",
        (Created, Listen, Connector) => "Listen requires the listener role",
        (Created, Connect, Listener) => "Connect requires the connector role",
        (Created, _, _) => "Created: only Listen or Connect allowed",
        (Listening | Connecting, _, _) => "handshake in flight: only ParamsReceived allowed",
        (ParamsExchanged, _, _) => "ParamsExchanged: only QueuePairInitialized allowed",
        (QueuePairInit, _, _) => "QueuePairInit: only QueuePairActivated allowed",
        (QueuePairReady, _, _) => "QueuePairReady: only FirstCompletion allowed",
        (Active, _, _) => "Active: only Close or Fault allowed",
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent::*;
    use ConnectionState::*;

    fn bring_up(role: ConnectionRole) -> ConnectionStateMachine {
        let mut sm = ConnectionStateMachine::new(role);
        let first = match role {
            ConnectionRole::Listener => Listen,
            ConnectionRole::Connector => Connect,
        };
        for event in [first, ParamsReceived, QueuePairInitialized, QueuePairActivated] {
            assert!(matches!(sm.handle_event(event), TransitionResult::Ok(_)));
        }
        sm
    }

    #[test]
    fn initial_state_is_created() {
        let sm = ConnectionStateMachine::new(ConnectionRole::Listener);
        assert_eq!(sm.state(), Created);
        assert_eq!(sm.role(), ConnectionRole::Listener);
    }

    #[test]
    fn listener_path_reaches_active() {
        let mut sm = ConnectionStateMachine::new(ConnectionRole::Listener);
        assert_eq!(sm.handle_event(Listen), TransitionResult::Ok(Listening));
        assert_eq!(sm.handle_event(ParamsReceived), TransitionResult::Ok(ParamsExchanged));
        assert_eq!(sm.handle_event(QueuePairInitialized), TransitionResult::Ok(QueuePairInit));
        assert_eq!(sm.handle_event(QueuePairActivated), TransitionResult::Ok(QueuePairReady));
        assert_eq!(sm.handle_event(FirstCompletion), TransitionResult::Ok(Active));
    }

    #[test]
    fn both_roles_converge_on_ready() {
        assert_eq!(bring_up(ConnectionRole::Listener).state(), QueuePairReady);
        assert_eq!(bring_up(ConnectionRole::Connector).state(), QueuePairReady);
    }

    #[test]
    fn role_mismatch_rejected() {
        let mut sm = ConnectionStateMachine::new(ConnectionRole::Connector);
        assert!(matches!(sm.handle_event(Listen), TransitionResult::Rejected(_)));
        assert_eq!(sm.state(), Created);
    }

    #[test]
    fn no_regression_or_skipping() {
        let mut sm = bring_up(ConnectionRole::Connector);
        for event in [Connect, ParamsReceived, QueuePairInitialized, QueuePairActivated] {
            assert!(matches!(sm.handle_event(event), TransitionResult::Rejected(_)));
            assert_eq!(sm.state(), QueuePairReady);
        }

        let mut fresh = ConnectionStateMachine::new(ConnectionRole::Listener);
        assert!(matches!(fresh.handle_event(QueuePairActivated), TransitionResult::Rejected(_)));
    }

    #[test]
    fn fault_from_any_live_state() {
        for steps in 0..4 {
            let mut sm = ConnectionStateMachine::new(ConnectionRole::Listener);
            for event in [Listen, ParamsReceived, QueuePairInitialized, QueuePairActivated]
                .into_iter()
                .take(steps)
            {
                sm.handle_event(event);
            }
            assert_eq!(sm.handle_event(Fault), TransitionResult::Ok(Error));
        }
    }

    #[test]
    fn error_only_closes() {
        let mut sm = bring_up(ConnectionRole::Listener);
        sm.handle_event(Fault);
        assert!(matches!(sm.handle_event(FirstCompletion), TransitionResult::Rejected(_)));
        assert!(matches!(sm.handle_event(Fault), TransitionResult::Rejected(_)));
        assert_eq!(sm.handle_event(Close), TransitionResult::Ok(Closed));
    }

    #[test]
    fn closed_is_final() {
        let mut sm = bring_up(ConnectionRole::Connector);
        assert_eq!(sm.handle_event(Close), TransitionResult::Ok(Closed));
        assert_eq!(
            sm.handle_event(Close),
            TransitionResult::Rejected("Closed: no further transitions")
        );
        assert!(matches!(sm.handle_event(Fault), TransitionResult::Rejected(_)));
        assert_eq!(sm.state(), Closed);
    }

    #[test]
    fn predicates() {
        assert!(QueuePairReady.can_post());
        assert!(Active.can_post());
        assert!(!ParamsExchanged.can_post());
        assert!(Closed.is_terminal() && Error.is_terminal());
        assert!(!Active.is_terminal());
    }
}
