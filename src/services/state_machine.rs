//! Lifecycle state machine for a template on a store.
//!
//! `transition` is a pure function over `(state, event)`. It decides the next
//! state and which persistence step the caller has to apply; it never touches
//! storage itself. The orchestrator persists the result with a compare-and-set
//! on the current state, so two racing drivers cannot both win.

use crate::{
    errors::{OrchestratorError, OrchestratorResult},
    models::association::ObjectState,
};
use serde::{Deserialize, Serialize};

/// Events that drive an association through its lifecycle.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    CreateOnlyRequested,
    DestroyRequested,
    OperationSucceeded,
    OperationFailed,
}

/// Persistence step that accompanies a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SideEffect {
    /// The row must exist; it is allocated before the transition is applied.
    EnsureRow,
    /// Store the install path and sizes reported by the endpoint.
    RecordInstall,
    /// Store the failure message.
    RecordError,
    /// Delete the association row.
    RemoveRow,
    Nothing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: ObjectState,
    /// `None` when the association ceases to exist.
    pub to: Option<ObjectState>,
    pub effect: SideEffect,
}

/// Resolve `event` against `state`.
///
/// Returns `IllegalStateTransition` for any pair outside the table. In
/// particular a second create or destroy while one is in flight is rejected
/// here, which is what keeps at most one operation in flight per association.
pub fn transition(state: ObjectState, event: Event) -> OrchestratorResult<Transition> {
    use ObjectState::*;

    let (to, effect) = match (state, event) {
        (Allocated, Event::CreateOnlyRequested) => (Some(Creating), SideEffect::EnsureRow),
        (Creating, Event::OperationSucceeded) => (Some(Ready), SideEffect::RecordInstall),
        (Creating, Event::OperationFailed) => (Some(Failed), SideEffect::RecordError),
        (Ready | Failed, Event::DestroyRequested) => (Some(Destroying), SideEffect::Nothing),
        (Destroying, Event::OperationSucceeded) => (None, SideEffect::RemoveRow),
        (Destroying, Event::OperationFailed) => (Some(Failed), SideEffect::RecordError),
        _ => return Err(OrchestratorError::IllegalStateTransition { state, event }),
    };

    Ok(Transition {
        from: state,
        to,
        effect,
    })
}

/// True while a remote operation owns the association.
pub fn is_in_flight(state: ObjectState) -> bool {
    matches!(state, ObjectState::Creating | ObjectState::Destroying)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ObjectState::*;

    const STATES: [ObjectState; 5] = [Allocated, Creating, Ready, Destroying, Failed];
    const EVENTS: [Event; 4] = [
        Event::CreateOnlyRequested,
        Event::DestroyRequested,
        Event::OperationSucceeded,
        Event::OperationFailed,
    ];

    #[test]
    fn create_path() {
        let t = transition(Allocated, Event::CreateOnlyRequested).unwrap();
        assert_eq!(t.to, Some(Creating));
        assert_eq!(t.effect, SideEffect::EnsureRow);

        let ok = transition(Creating, Event::OperationSucceeded).unwrap();
        assert_eq!(ok.to, Some(Ready));
        assert_eq!(ok.effect, SideEffect::RecordInstall);

        let failed = transition(Creating, Event::OperationFailed).unwrap();
        assert_eq!(failed.to, Some(Failed));
    }

    #[test]
    fn destroy_path_removes_row() {
        for start in [Ready, Failed] {
            let t = transition(start, Event::DestroyRequested).unwrap();
            assert_eq!(t.to, Some(Destroying));
        }
        let done = transition(Destroying, Event::OperationSucceeded).unwrap();
        assert_eq!(done.to, None);
        assert_eq!(done.effect, SideEffect::RemoveRow);

        let failed = transition(Destroying, Event::OperationFailed).unwrap();
        assert_eq!(failed.to, Some(Failed));
    }

    #[test]
    fn second_request_while_in_flight_is_rejected() {
        let err = transition(Creating, Event::CreateOnlyRequested).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::IllegalStateTransition {
                state: Creating,
                event: Event::CreateOnlyRequested
            }
        ));
        assert!(transition(Destroying, Event::DestroyRequested).is_err());
        assert!(transition(Creating, Event::DestroyRequested).is_err());
    }

    #[test]
    fn only_seven_pairs_are_legal() {
        let legal = STATES
            .iter()
            .flat_map(|s| EVENTS.iter().map(move |e| (*s, *e)))
            .filter(|(s, e)| transition(*s, *e).is_ok())
            .count();
        assert_eq!(legal, 7);
    }

    #[test]
    fn ready_cannot_be_recreated() {
        assert!(transition(Ready, Event::CreateOnlyRequested).is_err());
        assert!(transition(Failed, Event::CreateOnlyRequested).is_err());
        assert!(transition(Allocated, Event::DestroyRequested).is_err());
    }

    #[test]
    fn in_flight_states() {
        assert!(is_in_flight(Creating));
        assert!(is_in_flight(Destroying));
        assert!(!is_in_flight(Ready));
    }
}
