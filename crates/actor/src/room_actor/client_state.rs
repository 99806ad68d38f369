//! The client lifecycle state machine from §4.6.

use room_engine_core::UserId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientState {
    Undefined,
    Established,
    Leave(LeaveReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaveReason {
    UnknownRemoteUser,
    TooManyUsers,
    RemoteUserLeft,
}

/// The outcome of a transition: whether the actor should now emit a leave
/// event and/or terminate.
#[derive(Debug, PartialEq, Eq)]
pub struct Transition {
    pub new_state: ClientState,
    pub emit_leave: bool,
    pub terminate: bool,
}

/// Applies one step of the FSM given the current joined-users set (minus
/// the local user) observed after some state change.
pub fn step(
    current: &ClientState,
    local_user: &UserId,
    remote_user: &UserId,
    local_is_joined: bool,
    remote_is_joined: bool,
    other_joined_non_remote: usize,
) -> Transition {
    let _ = local_user;
    match current {
        ClientState::Undefined => {
            if !local_is_joined {
                return Transition { new_state: ClientState::Undefined, emit_leave: false, terminate: false };
            }
            if remote_is_joined && other_joined_non_remote == 0 {
                Transition { new_state: ClientState::Established, emit_leave: false, terminate: false }
            } else if !remote_is_joined && other_joined_non_remote == 1 {
                Transition {
                    new_state: ClientState::Leave(LeaveReason::UnknownRemoteUser),
                    emit_leave: true,
                    terminate: false,
                }
            } else if other_joined_non_remote > 1 || (remote_is_joined && other_joined_non_remote > 0) {
                Transition {
                    new_state: ClientState::Leave(LeaveReason::TooManyUsers),
                    emit_leave: true,
                    terminate: false,
                }
            } else {
                Transition { new_state: ClientState::Undefined, emit_leave: false, terminate: false }
            }
        }
        ClientState::Established => {
            if !local_is_joined {
                Transition { new_state: ClientState::Established, emit_leave: false, terminate: true }
            } else if !remote_is_joined {
                Transition {
                    new_state: ClientState::Leave(LeaveReason::RemoteUserLeft),
                    emit_leave: true,
                    terminate: false,
                }
            } else {
                Transition { new_state: ClientState::Established, emit_leave: false, terminate: false }
            }
        }
        ClientState::Leave(reason) => {
            Transition { new_state: ClientState::Leave(*reason), emit_leave: false, terminate: true }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> (UserId, UserId) {
        (UserId::parse("@local:x").unwrap(), UserId::parse("@remote:y").unwrap())
    }

    #[test]
    fn undefined_to_established_when_exactly_remote_joins() {
        let (local, remote) = users();
        let t = step(&ClientState::Undefined, &local, &remote, true, true, 0);
        assert_eq!(t.new_state, ClientState::Established);
        assert!(!t.terminate);
    }

    #[test]
    fn undefined_stays_undefined_while_nobody_joined() {
        let (local, remote) = users();
        let t = step(&ClientState::Undefined, &local, &remote, true, false, 0);
        assert_eq!(t.new_state, ClientState::Undefined);
    }

    #[test]
    fn undefined_to_leave_on_unknown_remote_user() {
        let (local, remote) = users();
        let t = step(&ClientState::Undefined, &local, &remote, true, false, 1);
        assert_eq!(t.new_state, ClientState::Leave(LeaveReason::UnknownRemoteUser));
        assert!(t.emit_leave);
    }

    #[test]
    fn established_to_leave_when_remote_leaves() {
        let (local, remote) = users();
        let t = step(&ClientState::Established, &local, &remote, true, false, 0);
        assert_eq!(t.new_state, ClientState::Leave(LeaveReason::RemoteUserLeft));
    }

    #[test]
    fn established_terminates_when_local_leaves() {
        let (local, remote) = users();
        let t = step(&ClientState::Established, &local, &remote, false, true, 0);
        assert!(t.terminate);
    }

    #[test]
    fn leave_always_terminates() {
        let (local, remote) = users();
        let t = step(&ClientState::Leave(LeaveReason::RemoteUserLeft), &local, &remote, true, true, 0);
        assert!(t.terminate);
    }
}
