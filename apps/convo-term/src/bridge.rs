//! Terminal bridge: stdin lines become runtime commands, runtime events become
//! printed lines.

use std::collections::BTreeMap;

use convo_core::{
    ConversationOp, Message, RosterEntry, ScrollSignal, SessionLifecycleState, SyncCommand,
    SyncEvent,
};
use convo_net::ChatRuntimeHandle;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::broadcast,
};
use tracing::{debug, info, warn};

const HELP: &str = "\
commands:
  /register <user> <password>   create an account
  /login <user> <password>      sign in
  /users                        reload the user list
  /open <user>                  open the conversation with <user>
  /older                        load older messages
  /bottom                       jump back to the newest message
  /connect                      reopen a lost connection
  /logout                       sign out and forget the remembered user
  /quit                         exit
anything else is sent to the open conversation";

/// One parsed line of user input.
#[derive(Debug, Clone, PartialEq)]
pub enum InputAction {
    Command(SyncCommand),
    Help,
    Quit,
}

/// Parse one stdin line. Blank lines yield `None`.
pub fn parse_input(line: &str) -> Result<Option<InputAction>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Ok(Some(InputAction::Command(SyncCommand::SendMessage {
            content: trimmed.to_owned(),
        })));
    };

    let mut parts = rest.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    let action = match (verb, args.as_slice()) {
        ("register", [username, password]) => InputAction::Command(SyncCommand::Register {
            username: (*username).to_owned(),
            password: (*password).to_owned(),
        }),
        ("login", [username, password]) => InputAction::Command(SyncCommand::Login {
            username: (*username).to_owned(),
            password: (*password).to_owned(),
        }),
        ("users", []) => InputAction::Command(SyncCommand::RefreshRoster),
        ("open", [peer]) => InputAction::Command(SyncCommand::OpenConversation {
            peer: (*peer).to_owned(),
        }),
        ("older", []) => InputAction::Command(SyncCommand::Scroll(ScrollSignal {
            offset_from_top_px: 0.0,
            at_bottom: false,
        })),
        ("bottom", []) => InputAction::Command(SyncCommand::Scroll(ScrollSignal {
            offset_from_top_px: f32::MAX,
            at_bottom: true,
        })),
        ("connect", []) => InputAction::Command(SyncCommand::Connect),
        ("logout", []) => InputAction::Command(SyncCommand::Logout),
        ("help", _) => InputAction::Help,
        ("quit" | "exit", []) => InputAction::Quit,
        ("register" | "login", _) => return Err(format!("usage: /{verb} <user> <password>")),
        ("open", _) => return Err("usage: /open <user>".to_owned()),
        _ => return Err(format!("unknown command '/{verb}', try /help")),
    };
    Ok(Some(action))
}

/// Presentation state folded from runtime events.
#[derive(Debug, Default)]
pub struct TermView {
    current_user: Option<String>,
    selected: Option<String>,
    roster: Vec<RosterEntry>,
    unread: BTreeMap<String, u64>,
}

impl TermView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event and return the lines to print.
    pub fn render(&mut self, event: SyncEvent) -> Vec<String> {
        match event {
            SyncEvent::StateChanged { state } => self.render_state(state),
            SyncEvent::RegisterResult { success, message } => {
                if success {
                    vec![format!("registered: {message}; now /login")]
                } else {
                    vec![format!("registration failed: {message}")]
                }
            }
            SyncEvent::AuthResult {
                success: true,
                username,
                ..
            } => {
                self.current_user = username;
                vec![format!(
                    "signed in as {}",
                    self.current_user.as_deref().unwrap_or("?")
                )]
            }
            SyncEvent::AuthResult {
                success: false,
                message,
                ..
            } => vec![format!(
                "sign-in failed: {}",
                message.unwrap_or_else(|| "unknown error".to_owned())
            )],
            SyncEvent::RosterUpdated { entries } => {
                self.roster = entries;
                vec![self.roster_line()]
            }
            SyncEvent::ConversationOpened { peer } => {
                let line = format!("--- conversation with {peer} ---");
                self.selected = Some(peer);
                vec![line]
            }
            SyncEvent::ConversationDelta { peer, ops, .. } => {
                if self.selected.as_deref() != Some(peer.as_str()) {
                    return Vec::new();
                }
                ops.iter().flat_map(|op| self.render_op(op)).collect()
            }
            SyncEvent::UnreadChanged { peer, count } => {
                if count == 0 {
                    self.unread.remove(&peer);
                    Vec::new()
                } else {
                    self.unread.insert(peer.clone(), count);
                    vec![format!("* {count} unread from {peer}")]
                }
            }
            SyncEvent::NotificationSummary(summary) => summary
                .badge_text()
                .map(|badge| vec![format!("({badge} unread)")])
                .unwrap_or_default(),
            SyncEvent::ValidationFailed { reason } => vec![reason],
            SyncEvent::RequestFailed {
                operation, message, ..
            } => vec![format!("! {operation} failed: {message}")],
            SyncEvent::ConnectionClosed { reason } => {
                vec![format!("! connection closed ({reason}); /connect to retry")]
            }
            SyncEvent::FatalError { code, message, .. } => vec![format!("! {code}: {message}")],
        }
    }

    fn render_state(&mut self, state: SessionLifecycleState) -> Vec<String> {
        match state {
            SessionLifecycleState::Connected => vec!["connected".to_owned()],
            SessionLifecycleState::LoggedOut => {
                *self = Self::default();
                vec!["signed out".to_owned()]
            }
            _ => Vec::new(),
        }
    }

    fn render_op(&self, op: &ConversationOp) -> Vec<String> {
        match op {
            ConversationOp::Reset(messages) if messages.is_empty() => {
                vec!["(no messages yet)".to_owned()]
            }
            ConversationOp::Reset(messages) => {
                messages.iter().map(|m| self.message_line(m)).collect()
            }
            ConversationOp::Append(message) => vec![self.message_line(message)],
            ConversationOp::PrependPage(messages) => {
                let mut lines = vec![format!("--- {} older messages ---", messages.len())];
                lines.extend(messages.iter().map(|m| self.message_line(m)));
                lines.push("--- end of older messages ---".to_owned());
                lines
            }
        }
    }

    fn message_line(&self, message: &Message) -> String {
        if self.current_user.as_deref() == Some(message.from.as_str()) {
            format!("You: {}", message.content)
        } else {
            format!("{}: {}", message.from, message.content)
        }
    }

    fn roster_line(&self) -> String {
        if self.roster.is_empty() {
            return "users: (none)".to_owned();
        }
        let entries: Vec<String> = self
            .roster
            .iter()
            .map(|entry| match self.unread.get(&entry.username) {
                Some(count) => format!("{} ({}, {count} unread)", entry.username, entry.status),
                None => format!("{} ({})", entry.username, entry.status),
            })
            .collect();
        format!("users: {}", entries.join(", "))
    }
}

/// Drive the terminal until stdin closes or `/quit`.
pub async fn run(handle: ChatRuntimeHandle) -> std::io::Result<()> {
    let events = handle.subscribe();
    let printer = tokio::spawn(print_events(events));

    if let Err(err) = handle.send(SyncCommand::RestoreSession).await {
        warn!(error = %err, "runtime unavailable at startup");
    }

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_input(&line) {
            Ok(None) => {}
            Ok(Some(InputAction::Command(command))) => {
                debug!(?command, "forwarding command");
                if handle.send(command).await.is_err() {
                    warn!("runtime stopped; exiting");
                    break;
                }
            }
            Ok(Some(InputAction::Help)) => write_line(&mut stdout, HELP).await?,
            Ok(Some(InputAction::Quit)) => break,
            Err(usage) => write_line(&mut stdout, &usage).await?,
        }
    }

    info!("input closed");
    printer.abort();
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<SyncEvent>) {
    let mut view = TermView::new();
    let mut stdout = tokio::io::stdout();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        for line in view.render(event) {
            if write_line(&mut stdout, &line).await.is_err() {
                return;
            }
        }
    }
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

#[cfg(test)]
mod tests {
    use convo_core::{NotificationSummary, ScrollAction};

    use super::*;

    fn message(from: &str, to: &str, content: &str) -> Message {
        Message::new(from, to, content, "2024-01-01T00:00:00.000Z")
    }

    fn signed_in_view() -> TermView {
        let mut view = TermView::new();
        view.render(SyncEvent::AuthResult {
            success: true,
            username: Some("alice".into()),
            message: None,
        });
        view
    }

    #[test]
    fn plain_text_is_sent_and_blank_lines_ignored() {
        assert_eq!(
            parse_input("  hello there "),
            Ok(Some(InputAction::Command(SyncCommand::SendMessage {
                content: "hello there".into()
            })))
        );
        assert_eq!(parse_input("   "), Ok(None));
    }

    #[test]
    fn parses_slash_commands() {
        assert_eq!(
            parse_input("/login alice secret"),
            Ok(Some(InputAction::Command(SyncCommand::Login {
                username: "alice".into(),
                password: "secret".into()
            })))
        );
        assert_eq!(
            parse_input("/open bob"),
            Ok(Some(InputAction::Command(SyncCommand::OpenConversation {
                peer: "bob".into()
            })))
        );
        assert!(matches!(
            parse_input("/older"),
            Ok(Some(InputAction::Command(SyncCommand::Scroll(ScrollSignal {
                at_bottom: false,
                ..
            }))))
        ));
        assert_eq!(parse_input("/quit"), Ok(Some(InputAction::Quit)));
    }

    #[test]
    fn reports_usage_errors() {
        assert_eq!(
            parse_input("/login alice"),
            Err("usage: /login <user> <password>".to_owned())
        );
        assert!(parse_input("/dance").is_err());
    }

    #[test]
    fn renders_own_messages_as_you() {
        let mut view = signed_in_view();
        view.render(SyncEvent::ConversationOpened { peer: "bob".into() });

        let lines = view.render(SyncEvent::ConversationDelta {
            peer: "bob".into(),
            ops: vec![ConversationOp::Reset(vec![
                message("bob", "alice", "hi"),
                message("alice", "bob", "hey"),
            ])],
            scroll: ScrollAction::PinToBottom,
        });
        assert_eq!(lines, ["bob: hi", "You: hey"]);
    }

    #[test]
    fn ignores_deltas_for_other_conversations() {
        let mut view = signed_in_view();
        view.render(SyncEvent::ConversationOpened { peer: "bob".into() });
        let lines = view.render(SyncEvent::ConversationDelta {
            peer: "carol".into(),
            ops: vec![ConversationOp::Append(message("carol", "alice", "x"))],
            scroll: ScrollAction::Keep,
        });
        assert!(lines.is_empty());
    }

    #[test]
    fn roster_line_includes_unread_counts() {
        let mut view = signed_in_view();
        view.render(SyncEvent::UnreadChanged {
            peer: "bob".into(),
            count: 2,
        });
        let lines = view.render(SyncEvent::RosterUpdated {
            entries: vec![
                RosterEntry::new("bob", "online"),
                RosterEntry::new("carol", "offline"),
            ],
        });
        assert_eq!(lines, ["users: bob (online, 2 unread), carol (offline)"]);
    }

    #[test]
    fn hides_badge_at_zero() {
        let mut view = signed_in_view();
        assert!(
            view.render(SyncEvent::NotificationSummary(NotificationSummary { total: 0 }))
                .is_empty()
        );
        assert_eq!(
            view.render(SyncEvent::NotificationSummary(NotificationSummary { total: 3 })),
            ["(3 unread)"]
        );
    }
}
