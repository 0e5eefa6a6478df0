use crate::{
    error::SyncError,
    types::{SessionLifecycleState, SyncCommand, SyncEvent},
};

#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionLifecycleState,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self {
            state: SessionLifecycleState::Cold,
        }
    }
}

impl SessionStateMachine {
    pub fn state(&self) -> SessionLifecycleState {
        self.state
    }

    pub fn apply(&mut self, command: &SyncCommand) -> Result<Vec<SyncEvent>, SyncError> {
        use SyncCommand::*;

        match command {
            Register { .. } => {
                if self.is_signed_out() {
                    Ok(Vec::new())
                } else {
                    Err(SyncError::invalid_state(self.state, "register"))
                }
            }
            Login { .. } | RestoreSession => self.transition_from_any_of(
                &[SessionLifecycleState::Cold, SessionLifecycleState::LoggedOut],
                SessionLifecycleState::Authenticating,
                "login_or_restore",
            ),
            Connect => self.transition_from_any_of(
                &[
                    SessionLifecycleState::Authenticated,
                    SessionLifecycleState::Disconnected,
                ],
                SessionLifecycleState::Connected,
                "connect",
            ),
            SendMessage { .. } => {
                if self.state == SessionLifecycleState::Connected {
                    Ok(Vec::new())
                } else {
                    Err(SyncError::invalid_state(self.state, "send_message"))
                }
            }
            Logout => self.transition_from_any_of(
                &[
                    SessionLifecycleState::Authenticated,
                    SessionLifecycleState::Connected,
                    SessionLifecycleState::Disconnected,
                ],
                SessionLifecycleState::LoggedOut,
                "logout",
            ),
            RefreshRoster | OpenConversation { .. } | Scroll(_) => {
                if self.has_session() {
                    Ok(Vec::new())
                } else {
                    Err(SyncError::invalid_state(self.state, "conversation command"))
                }
            }
        }
    }

    pub fn on_auth_result(&mut self, success: bool) -> Result<SyncEvent, SyncError> {
        if self.state != SessionLifecycleState::Authenticating {
            return Err(SyncError::invalid_state(self.state, "on_auth_result"));
        }

        let next = if success {
            SessionLifecycleState::Authenticated
        } else {
            SessionLifecycleState::Cold
        };

        self.state = next;
        Ok(SyncEvent::StateChanged { state: next })
    }

    /// Push connection ended. Returns `None` when no connection was open.
    pub fn on_connection_lost(&mut self) -> Option<SyncEvent> {
        if self.state != SessionLifecycleState::Connected {
            return None;
        }
        self.state = SessionLifecycleState::Disconnected;
        Some(SyncEvent::StateChanged {
            state: SessionLifecycleState::Disconnected,
        })
    }

    /// Whether a `ConversationSession` exists in this state.
    pub fn has_session(&self) -> bool {
        matches!(
            self.state,
            SessionLifecycleState::Authenticated
                | SessionLifecycleState::Connected
                | SessionLifecycleState::Disconnected
        )
    }

    fn is_signed_out(&self) -> bool {
        matches!(
            self.state,
            SessionLifecycleState::Cold | SessionLifecycleState::LoggedOut
        )
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[SessionLifecycleState],
        next: SessionLifecycleState,
        action: &str,
    ) -> Result<Vec<SyncEvent>, SyncError> {
        if !expected.contains(&self.state) {
            return Err(SyncError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(vec![SyncEvent::StateChanged { state: next }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_command() -> SyncCommand {
        SyncCommand::Login {
            username: "alice".to_owned(),
            password: "secret".to_owned(),
        }
    }

    #[test]
    fn runs_happy_path_state_transitions() {
        let mut sm = SessionStateMachine::default();

        sm.apply(&login_command()).expect("login command must work");
        assert_eq!(sm.state(), SessionLifecycleState::Authenticating);

        sm.on_auth_result(true).expect("auth should resolve");
        assert_eq!(sm.state(), SessionLifecycleState::Authenticated);

        sm.apply(&SyncCommand::Connect).expect("connect should work");
        assert_eq!(sm.state(), SessionLifecycleState::Connected);

        sm.apply(&SyncCommand::SendMessage {
            content: "hi".into(),
        })
        .expect("send is allowed while connected");

        sm.apply(&SyncCommand::Logout).expect("logout should work");
        assert_eq!(sm.state(), SessionLifecycleState::LoggedOut);

        sm.apply(&SyncCommand::RestoreSession)
            .expect("restore is allowed after logout");
        assert_eq!(sm.state(), SessionLifecycleState::Authenticating);
    }

    #[test]
    fn failed_auth_returns_to_cold() {
        let mut sm = SessionStateMachine::default();
        sm.apply(&SyncCommand::RestoreSession)
            .expect("restore must start");
        let event = sm.on_auth_result(false).expect("auth should resolve");
        assert_eq!(
            event,
            SyncEvent::StateChanged {
                state: SessionLifecycleState::Cold
            }
        );
    }

    #[test]
    fn rejects_conversation_commands_without_session() {
        let mut sm = SessionStateMachine::default();
        let err = sm
            .apply(&SyncCommand::OpenConversation {
                peer: "bob".into(),
            })
            .expect_err("open must fail before auth");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn connection_loss_keeps_session_usable_but_blocks_send() {
        let mut sm = SessionStateMachine::default();
        sm.apply(&login_command()).expect("login");
        sm.on_auth_result(true).expect("auth");
        sm.apply(&SyncCommand::Connect).expect("connect");

        assert!(sm.on_connection_lost().is_some());
        assert_eq!(sm.state(), SessionLifecycleState::Disconnected);
        assert!(sm.on_connection_lost().is_none());

        sm.apply(&SyncCommand::OpenConversation {
            peer: "bob".into(),
        })
        .expect("history stays reachable after disconnect");
        let err = sm
            .apply(&SyncCommand::SendMessage {
                content: "hi".into(),
            })
            .expect_err("send needs a connection");
        assert_eq!(err.code, "invalid_state_transition");

        sm.apply(&SyncCommand::Connect)
            .expect("explicit reconnect is allowed");
        assert_eq!(sm.state(), SessionLifecycleState::Connected);
    }

    #[test]
    fn register_only_while_signed_out() {
        let mut sm = SessionStateMachine::default();
        let register = SyncCommand::Register {
            username: "alice".into(),
            password: "pw".into(),
        };
        sm.apply(&register).expect("register from cold");
        sm.apply(&login_command()).expect("login");
        assert!(sm.apply(&register).is_err());
    }
}
