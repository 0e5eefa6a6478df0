//! Command loop owning the session and all I/O.
//!
//! Commands, push frames and request completions are consumed by one task,
//! so session state is never touched concurrently. Request/response calls
//! run as spawned tasks and come back through the completion channel.

use std::{future::Future, sync::Arc};

use convo_core::{
    ConversationSession, EventStream, HistoryRequest, Message, PaginationConfig, RosterEntry,
    SessionEffect, SessionStateMachine, SyncChannelError, SyncChannels, SyncCommand, SyncError,
    SyncErrorCategory, SyncEvent, UnreadCounts,
};
use convo_platform::{CURRENT_USER_KEY, StateStore, StateStoreError, forget, load_optional};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    api::ChatApi,
    live::{LiveConnection, LiveEvent, PushConnector},
};

#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub pagination: PaginationConfig,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pagination: PaginationConfig::default(),
            command_buffer: 128,
            event_buffer: 512,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChatRuntimeHandle {
    channels: SyncChannels,
}

impl ChatRuntimeHandle {
    pub async fn send(&self, command: SyncCommand) -> Result<(), SyncChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

pub fn spawn_runtime<A, C>(
    api: A,
    connector: C,
    store: Arc<dyn StateStore>,
    config: RuntimeConfig,
) -> ChatRuntimeHandle
where
    A: ChatApi,
    C: PushConnector,
{
    let (channels, command_rx) = SyncChannels::new(config.command_buffer, config.event_buffer);
    let runtime = ChatRuntime::new(
        channels.clone(),
        command_rx,
        Arc::new(api),
        connector,
        store,
        config.pagination,
    );
    tokio::spawn(async move {
        runtime.run().await;
    });

    ChatRuntimeHandle { channels }
}

/// Finished request, tagged with the session epoch it was issued in.
enum Completion {
    Roster {
        epoch: u64,
        result: Result<Vec<RosterEntry>, SyncError>,
    },
    History {
        epoch: u64,
        request: HistoryRequest,
        result: Result<Vec<Message>, SyncError>,
    },
    MarkedRead {
        epoch: u64,
        peer: String,
        result: Result<(), SyncError>,
    },
    UnreadCounts {
        epoch: u64,
        result: Result<UnreadCounts, SyncError>,
    },
}

impl Completion {
    fn epoch(&self) -> u64 {
        match self {
            Completion::Roster { epoch, .. }
            | Completion::History { epoch, .. }
            | Completion::MarkedRead { epoch, .. }
            | Completion::UnreadCounts { epoch, .. } => *epoch,
        }
    }
}

type Transition = (SessionStateMachine, Vec<SyncEvent>);

struct ChatRuntime<A, C> {
    channels: SyncChannels,
    command_rx: mpsc::Receiver<SyncCommand>,
    state_machine: SessionStateMachine,
    api: Arc<A>,
    connector: C,
    store: Arc<dyn StateStore>,
    pagination: PaginationConfig,
    session: Option<ConversationSession>,
    live: Option<LiveConnection>,
    epoch: u64,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    clock: Instant,
}

impl<A: ChatApi, C: PushConnector> ChatRuntime<A, C> {
    fn new(
        channels: SyncChannels,
        command_rx: mpsc::Receiver<SyncCommand>,
        api: Arc<A>,
        connector: C,
        store: Arc<dyn StateStore>,
        pagination: PaginationConfig,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            channels,
            command_rx,
            state_machine: SessionStateMachine::default(),
            api,
            connector,
            store,
            pagination,
            session: None,
            live: None,
            epoch: 0,
            completion_tx,
            completion_rx,
            clock: Instant::now(),
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if let Err(err) = self.handle_command(command).await {
                        self.emit_error(err);
                    }
                }
                event = next_live_event(&mut self.live) => self.handle_live_event(event),
                Some(completion) = self.completion_rx.recv() => self.handle_completion(completion),
            }
        }
        debug!("runtime command channel closed");
    }

    async fn handle_command(&mut self, command: SyncCommand) -> Result<(), SyncError> {
        let transition = self.validate_transition(&command)?;

        match command {
            SyncCommand::Register { username, password } => {
                self.handle_register(transition, username, password).await;
                Ok(())
            }
            SyncCommand::Login { username, password } => {
                self.handle_login(transition, username, password).await
            }
            SyncCommand::RestoreSession => self.handle_restore_session(transition).await,
            SyncCommand::Connect => self.handle_connect(transition).await,
            SyncCommand::RefreshRoster => {
                self.commit_transition(transition);
                self.request_roster()
            }
            SyncCommand::OpenConversation { peer } => {
                self.handle_open_conversation(transition, peer)
            }
            SyncCommand::Scroll(signal) => {
                self.commit_transition(transition);
                let now_ms = self.now_ms();
                let effects = self.require_session_mut()?.on_scroll(signal, now_ms);
                self.run_effects(effects);
                Ok(())
            }
            SyncCommand::SendMessage { content } => {
                let effects = self.require_session_mut()?.send_message(&content)?;
                self.commit_transition(transition);
                self.run_effects(effects);
                Ok(())
            }
            SyncCommand::Logout => self.handle_logout(transition),
        }
    }

    async fn handle_register(&mut self, transition: Transition, username: String, password: String) {
        self.commit_transition(transition);
        let (success, message) = match self.api.register(&username, &password).await {
            Ok(reply) => (reply.success, reply.message),
            Err(err) => {
                warn!(%username, error = %err, "registration request failed");
                (false, err.message)
            }
        };
        info!(%username, success, "registration finished");
        self.channels
            .emit(SyncEvent::RegisterResult { success, message });
    }

    async fn handle_login(
        &mut self,
        transition: Transition,
        username: String,
        password: String,
    ) -> Result<(), SyncError> {
        self.commit_transition(transition);

        match self.api.login(&username, &password).await {
            Ok(reply) if reply.success => {
                if let Err(err) = self.store.set_value(CURRENT_USER_KEY, &username) {
                    let err = map_state_store_error("persist_user", err);
                    warn!(%username, error = %err, "could not remember logged-in user");
                }
                info!(%username, "login succeeded");
                self.finish_auth(true, Some(username.clone()), Some(reply.message));
                self.start_chat(username).await
            }
            Ok(reply) => {
                info!(%username, "login rejected");
                self.finish_auth(false, None, Some(reply.message));
                Ok(())
            }
            Err(err) => {
                warn!(%username, error = %err, "login request failed");
                self.finish_auth(false, None, Some(err.message));
                Ok(())
            }
        }
    }

    async fn handle_restore_session(&mut self, transition: Transition) -> Result<(), SyncError> {
        self.commit_transition(transition);

        match load_optional(self.store.as_ref(), CURRENT_USER_KEY) {
            Ok(Some(username)) if !username.is_empty() => {
                info!(%username, "restoring remembered user");
                self.finish_auth(true, Some(username.clone()), None);
                self.start_chat(username).await
            }
            Ok(_) => {
                debug!("no remembered user to restore");
                self.finish_auth(false, None, Some("no remembered user".to_owned()));
                Ok(())
            }
            Err(err) => {
                let err = map_state_store_error("restore_session", err);
                warn!(error = %err, "session restore failed");
                self.finish_auth(false, None, Some(err.message));
                Ok(())
            }
        }
    }

    /// Connect, then load roster and unread counts. The two loads run even if
    /// the connection could not be opened.
    async fn start_chat(&mut self, username: String) -> Result<(), SyncError> {
        self.epoch += 1;
        self.session = Some(ConversationSession::new(username, self.pagination));

        let connected = match self.validate_transition(&SyncCommand::Connect) {
            Ok(transition) => self.handle_connect(transition).await,
            Err(err) => Err(err),
        };
        self.request_roster()?;
        self.request_unread_counts()?;
        connected
    }

    async fn handle_connect(&mut self, transition: Transition) -> Result<(), SyncError> {
        let username = self.require_session()?.current_user().to_owned();
        let connection = self.connector.connect(&username).await?;
        self.live = Some(connection);
        self.commit_transition(transition);
        Ok(())
    }

    fn handle_open_conversation(
        &mut self,
        transition: Transition,
        peer: String,
    ) -> Result<(), SyncError> {
        if peer.trim().is_empty() {
            return Err(SyncError::validation("Select a user to open a conversation."));
        }
        let effects = self.require_session_mut()?.open_conversation(&peer);
        self.commit_transition(transition);
        self.run_effects(effects);
        Ok(())
    }

    fn handle_logout(&mut self, transition: Transition) -> Result<(), SyncError> {
        if let Some(live) = self.live.take() {
            live.close();
        }
        self.session = None;
        self.epoch += 1;

        let forgotten = forget(self.store.as_ref(), CURRENT_USER_KEY)
            .map_err(|err| map_state_store_error("logout", err));
        self.commit_transition(transition);
        info!("logged out");
        forgotten
    }

    fn handle_live_event(&mut self, event: Option<LiveEvent>) {
        match event {
            Some(LiveEvent::Frame(push)) => {
                let Some(session) = self.session.as_mut() else {
                    debug!("push frame without a session");
                    return;
                };
                let effects = session.handle_push(push);
                self.run_effects(effects);
            }
            Some(LiveEvent::Closed { reason }) => self.on_connection_closed(reason),
            None => self.on_connection_closed("connection dropped".to_owned()),
        }
    }

    fn on_connection_closed(&mut self, reason: String) {
        self.live = None;
        warn!(%reason, "push connection lost");
        if let Some(event) = self.state_machine.on_connection_lost() {
            self.channels.emit(event);
        }
        self.channels.emit(SyncEvent::ConnectionClosed { reason });
    }

    fn handle_completion(&mut self, completion: Completion) {
        if completion.epoch() != self.epoch {
            debug!(
                epoch = completion.epoch(),
                current = self.epoch,
                "discarding completion from an earlier session"
            );
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let effects = match completion {
            Completion::Roster { result, .. } => match result {
                Ok(entries) => session.replace_roster(entries),
                Err(err) => {
                    warn!(error = %err, "roster request failed");
                    vec![SessionEffect::Emit(request_failed("users", err))]
                }
            },
            Completion::History {
                request, result, ..
            } => session.complete_history(request, result),
            Completion::MarkedRead { peer, result, .. } => session.complete_mark_read(&peer, result),
            Completion::UnreadCounts { result, .. } => session.seed_unread_counts(result),
        };
        self.run_effects(effects);
    }

    fn run_effects(&mut self, effects: Vec<SessionEffect>) {
        for effect in effects {
            match effect {
                SessionEffect::FetchHistory(request) => self.request_history(request),
                SessionEffect::MarkRead { peer } => self.request_mark_read(peer),
                SessionEffect::Transmit(message) => self.transmit(&message),
                SessionEffect::RefreshRoster => {
                    if let Err(err) = self.request_roster() {
                        self.emit_error(err);
                    }
                }
                SessionEffect::Emit(event) => self.channels.emit(event),
            }
        }
    }

    fn transmit(&self, message: &Message) {
        let sent = match self.live.as_ref() {
            Some(live) => live.send(message),
            None => Err(SyncError::network(
                "not_connected",
                "push connection is not open",
            )),
        };
        if let Err(err) = sent {
            warn!(to = %message.to, error = %err, "message not sent");
            self.channels.emit(request_failed("send", err));
        }
    }

    fn request_roster(&self) -> Result<(), SyncError> {
        let username = self.require_session()?.current_user().to_owned();
        let api = Arc::clone(&self.api);
        let epoch = self.epoch;
        self.spawn_request(async move {
            let result = api.users(&username).await;
            Completion::Roster { epoch, result }
        });
        Ok(())
    }

    fn request_unread_counts(&self) -> Result<(), SyncError> {
        let username = self.require_session()?.current_user().to_owned();
        let api = Arc::clone(&self.api);
        let epoch = self.epoch;
        self.spawn_request(async move {
            let result = api.unread_counts(&username).await;
            Completion::UnreadCounts { epoch, result }
        });
        Ok(())
    }

    fn request_history(&self, request: HistoryRequest) {
        let Some(username) = self.current_user() else {
            return;
        };
        let api = Arc::clone(&self.api);
        let epoch = self.epoch;
        self.spawn_request(async move {
            let result = api
                .conversation(&username, &request.peer, Some(request.query))
                .await;
            Completion::History {
                epoch,
                request,
                result,
            }
        });
    }

    fn request_mark_read(&self, peer: String) {
        let Some(username) = self.current_user() else {
            return;
        };
        let api = Arc::clone(&self.api);
        let epoch = self.epoch;
        self.spawn_request(async move {
            let result = api.mark_as_read(&username, &peer).await;
            Completion::MarkedRead {
                epoch,
                peer,
                result,
            }
        });
    }

    fn spawn_request<F>(&self, request: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let _ = completion_tx.send(request.await);
        });
    }

    fn validate_transition(&self, command: &SyncCommand) -> Result<Transition, SyncError> {
        let mut candidate = self.state_machine.clone();
        let events = candidate.apply(command)?;
        Ok((candidate, events))
    }

    fn commit_transition(&mut self, (candidate, events): Transition) {
        self.state_machine = candidate;
        for event in events {
            self.channels.emit(event);
        }
    }

    fn require_session(&self) -> Result<&ConversationSession, SyncError> {
        self.session.as_ref().ok_or_else(no_session)
    }

    fn require_session_mut(&mut self) -> Result<&mut ConversationSession, SyncError> {
        self.session.as_mut().ok_or_else(no_session)
    }

    fn current_user(&self) -> Option<String> {
        self.session
            .as_ref()
            .map(|session| session.current_user().to_owned())
    }

    fn finish_auth(&mut self, success: bool, username: Option<String>, message: Option<String>) {
        match self.state_machine.on_auth_result(success) {
            Ok(state_event) => self.channels.emit(state_event),
            Err(err) => warn!(error = %err, "auth result outside authentication"),
        }
        self.channels.emit(SyncEvent::AuthResult {
            success,
            username,
            message,
        });
    }

    fn emit_error(&self, err: SyncError) {
        if err.category == SyncErrorCategory::Validation {
            debug!(reason = %err.message, "command rejected by validation");
            self.channels.emit(SyncEvent::ValidationFailed {
                reason: err.message,
            });
            return;
        }
        let recoverable = err.is_transient();
        self.channels.emit(SyncEvent::FatalError {
            code: err.code,
            message: err.message,
            recoverable,
        });
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.clock.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

async fn next_live_event(live: &mut Option<LiveConnection>) -> Option<LiveEvent> {
    match live.as_mut() {
        Some(connection) => connection.recv().await,
        None => std::future::pending().await,
    }
}

fn no_session() -> SyncError {
    SyncError::new(
        SyncErrorCategory::Auth,
        "no_session",
        "no user is signed in; login or restore first",
    )
}

fn request_failed(operation: &str, err: SyncError) -> SyncEvent {
    SyncEvent::RequestFailed {
        operation: operation.to_owned(),
        code: err.code,
        message: err.message,
    }
}

fn map_state_store_error(operation: &str, err: StateStoreError) -> SyncError {
    match err {
        StateStoreError::NotFound => SyncError::new(
            SyncErrorCategory::Storage,
            "state_not_found",
            format!("state entry missing during {operation}"),
        ),
        StateStoreError::Unavailable(message) => SyncError::new(
            SyncErrorCategory::Storage,
            "state_store_unavailable",
            format!("state store unavailable during {operation}: {message}"),
        ),
        StateStoreError::Backend(message) => SyncError::new(
            SyncErrorCategory::Storage,
            "state_store_error",
            format!("state store backend error during {operation}: {message}"),
        ),
    }
}
