//! Session context: the per-widget facade over a [`Session`].
//!
//! Each context owns one task that holds the session state and applies
//! intents from a single ordered queue. Control collaborators dispatch
//! through [`SessionContext`]; rendering collaborators read the
//! [`SessionView`] or subscribe to [`SessionEvent`]s.

use std::{collections::HashMap, sync::Arc};

use copilot_widget_core::{
    AgentRef, AgentRouter, Applied, BotService, Content, HandoffId, HandoffPayload,
    HandoffReason, Message, MessageId, RoutingDecision, ServiceError, Session, SessionError,
    SessionId, SessionMetadata, SessionMode, SessionView, StateChange, Submission, TurnResult,
};
use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::config::SessionConfig;

/// One observable state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Starts at 1 and increases by one per applied intent. Equal to
    /// [`SessionView::seq`] right after the change.
    pub seq: u64,
    pub session_id: SessionId,
    /// Mode after the change.
    pub mode: SessionMode,
    pub change: StateChange,
}

/// How a handoff attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffOutcome {
    Accepted(AgentRef),
    Rejected(String),
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Intent {
    Submit {
        content: Content,
        reply: Reply<TurnHandle>,
    },
    Resolve {
        id: MessageId,
        result: TurnResult,
        escalate: bool,
        reply: Option<Reply<Message>>,
    },
    RequestHandoff {
        reason: HandoffReason,
        metadata: HashMap<String, String>,
        reply: Reply<HandoffHandle>,
    },
    Accept {
        attempt: Option<HandoffId>,
        agent: AgentRef,
        reply: Option<Reply<()>>,
    },
    Reject {
        attempt: Option<HandoffId>,
        reason: String,
        reply: Option<Reply<()>>,
    },
    AgentMessage {
        content: Content,
        reply: Reply<MessageId>,
    },
    /// Queued after a bot reply that asked for a human.
    Escalate {
        turn: MessageId,
    },
    Close {
        reply: Reply<()>,
    },
}

/// Handle for submitted user input.
#[derive(Debug)]
pub struct TurnHandle {
    /// The user's delivered message.
    pub user_message: MessageId,
    /// The pending bot message; `None` when the input was relayed to an agent.
    pub pending: Option<MessageId>,
    settled: Option<oneshot::Receiver<Result<Message, SessionError>>>,
}

impl TurnHandle {
    /// Whether the input went to a human agent instead of the bot.
    #[must_use]
    pub const fn is_relayed(&self) -> bool {
        self.pending.is_none()
    }

    /// Wait for the bot turn to settle.
    ///
    /// A failed turn is still `Ok`: the message comes back with status
    /// `Failed`. Relayed input yields `None` right away.
    ///
    /// # Errors
    /// `SessionClosed` if the session closed before the turn settled.
    pub async fn reply(self) -> Result<Option<Message>, SessionError> {
        match self.settled {
            None => Ok(None),
            Some(rx) => rx
                .await
                .map_err(|_| SessionError::SessionClosed)?
                .map(Some),
        }
    }
}

/// Handle for a handoff attempt.
#[derive(Debug)]
pub struct HandoffHandle {
    pub attempt: HandoffId,
    outcome: oneshot::Receiver<Result<HandoffOutcome, SessionError>>,
}

impl HandoffHandle {
    /// Wait for the attempt to be accepted or rejected.
    ///
    /// # Errors
    /// `SessionClosed` if the session closed first.
    pub async fn outcome(self) -> Result<HandoffOutcome, SessionError> {
        self.outcome.await.map_err(|_| SessionError::SessionClosed)?
    }
}

/// Per-session facade. Cheap to clone; all clones address the same session.
#[derive(Clone)]
pub struct SessionContext {
    id: SessionId,
    intents: mpsc::Sender<Intent>,
    events: broadcast::Sender<SessionEvent>,
    view: watch::Receiver<SessionView>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.id)
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// Mount a new session and start its task on the current runtime.
    #[must_use]
    pub fn spawn<B, R>(
        bot: Arc<B>,
        router: Arc<R>,
        metadata: SessionMetadata,
        config: SessionConfig,
    ) -> Self
    where
        B: BotService + ?Sized + 'static,
        R: AgentRouter + ?Sized + 'static,
    {
        let session = Session::new(metadata);
        let id = session.id();
        let (intents, rx) = mpsc::channel(config.intent_capacity.max(1));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (view_tx, view) = watch::channel(session.view());

        let task = SessionTask {
            session,
            bot,
            router,
            config,
            intents: intents.downgrade(),
            events: events.clone(),
            view: view_tx,
            turn_waiters: HashMap::new(),
            handoff_waiter: None,
        };
        tokio::spawn(task.run(rx));
        tracing::info!(session_id = %id, "Session mounted");

        Self {
            id,
            intents,
            events,
            view,
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Current read-only projection.
    #[must_use]
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    #[must_use]
    pub fn mode(&self) -> SessionMode {
        self.view.borrow().mode
    }

    #[must_use]
    pub fn transcript(&self) -> Vec<Message> {
        self.view.borrow().transcript.clone()
    }

    #[must_use]
    pub fn active_turn(&self) -> Option<MessageId> {
        self.view.borrow().active_turn
    }

    /// Receiver that always holds the latest view.
    #[must_use]
    pub fn watch_view(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    /// Live notifications, in the order intents were applied.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Notifications as a stream. A subscriber that falls more than
    /// `event_capacity` behind skips ahead and logs how much it missed.
    #[must_use]
    pub fn event_stream(&self) -> BoxStream<'static, SessionEvent> {
        let session_id = self.id;
        BroadcastStream::new(self.subscribe())
            .filter_map(move |res| async move {
                match res {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        tracing::warn!(%session_id, "Subscriber lagged, skipped {n} events");
                        None
                    }
                }
            })
            .boxed()
    }

    async fn dispatch<T>(&self, make: impl FnOnce(Reply<T>) -> Intent) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.intents
            .send(make(tx))
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Submit user input.
    ///
    /// # Errors
    /// `TurnInProgress` while a turn is in flight, `SessionClosed` after close.
    pub async fn submit_user_input(&self, content: impl Into<Content>) -> Result<TurnHandle, SessionError> {
        let content = content.into();
        self.dispatch(|reply| Intent::Submit { content, reply }).await
    }

    /// Settle a pending bot turn, e.g. from an external timer.
    ///
    /// # Errors
    /// `SessionClosed`, `NotFound` or `AlreadyResolved`.
    pub async fn resolve_turn(&self, id: MessageId, result: TurnResult) -> Result<Message, SessionError> {
        self.dispatch(|reply| Intent::Resolve {
            id,
            result,
            escalate: false,
            reply: Some(reply),
        })
        .await
    }

    /// Ask for a human agent.
    ///
    /// # Errors
    /// `InvalidState` outside bot-served mode, `SessionClosed` after close.
    pub async fn request_handoff(&self, reason: HandoffReason) -> Result<HandoffHandle, SessionError> {
        self.request_handoff_with(reason, HashMap::new()).await
    }

    /// Ask for a human agent, attaching metadata to the handoff payload.
    ///
    /// # Errors
    /// Same as [`Self::request_handoff`].
    pub async fn request_handoff_with(
        &self,
        reason: HandoffReason,
        metadata: HashMap<String, String>,
    ) -> Result<HandoffHandle, SessionError> {
        self.dispatch(|reply| Intent::RequestHandoff {
            reason,
            metadata,
            reply,
        })
        .await
    }

    /// Accept the open handoff on behalf of `agent`.
    ///
    /// # Errors
    /// `InvalidState` when no handoff is open, `SessionClosed` after close.
    pub async fn accept_handoff(&self, agent: AgentRef) -> Result<(), SessionError> {
        self.dispatch(|reply| Intent::Accept {
            attempt: None,
            agent,
            reply: Some(reply),
        })
        .await
    }

    /// Abort the open handoff; the bot keeps serving.
    ///
    /// # Errors
    /// Same as [`Self::accept_handoff`].
    pub async fn reject_handoff(&self, reason: impl Into<String>) -> Result<(), SessionError> {
        let reason = reason.into();
        self.dispatch(|reply| Intent::Reject {
            attempt: None,
            reason,
            reply: Some(reply),
        })
        .await
    }

    /// Append a message from the serving agent.
    ///
    /// # Errors
    /// `InvalidState` unless an agent is serving, `SessionClosed` after close.
    pub async fn post_agent_message(&self, content: impl Into<Content>) -> Result<MessageId, SessionError> {
        let content = content.into();
        self.dispatch(|reply| Intent::AgentMessage { content, reply })
            .await
    }

    /// Close the session. Outstanding turns and handoffs end with
    /// `SessionClosed`.
    ///
    /// # Errors
    /// `SessionClosed` if already closed.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.dispatch(|reply| Intent::Close { reply }).await
    }
}

/// Owner of one session's state. Runs until closed or until every sender
/// is gone.
struct SessionTask<B: ?Sized, R: ?Sized> {
    session: Session,
    bot: Arc<B>,
    router: Arc<R>,
    config: SessionConfig,
    intents: mpsc::WeakSender<Intent>,
    events: broadcast::Sender<SessionEvent>,
    view: watch::Sender<SessionView>,
    turn_waiters: HashMap<MessageId, Reply<Message>>,
    handoff_waiter: Option<(HandoffId, Reply<HandoffOutcome>)>,
}

fn respond<T>(reply: Option<Reply<T>>, result: Result<T, SessionError>, what: &str) {
    match reply {
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => {
            if let Err(e) = result {
                tracing::debug!("Dropped late {what}: {e}");
            }
        }
    }
}

impl<B, R> SessionTask<B, R>
where
    B: BotService + ?Sized + 'static,
    R: AgentRouter + ?Sized + 'static,
{
    async fn run(mut self, mut rx: mpsc::Receiver<Intent>) {
        let session_id = self.session.id();
        while let Some(intent) = rx.recv().await {
            self.handle(intent);
            if self.session.mode().is_closed() {
                break;
            }
        }
        tracing::info!(%session_id, "Session task stopped");
    }

    fn handle(&mut self, intent: Intent) {
        match intent {
            Intent::Submit { content, reply } => {
                let _ = reply.send(self.submit(content));
            }
            Intent::Resolve {
                id,
                result,
                escalate,
                reply,
            } => {
                let result = self.resolve(id, result);
                if escalate && result.is_ok() {
                    self.enqueue(Intent::Escalate { turn: id });
                }
                respond(reply, result, "turn result");
            }
            Intent::RequestHandoff {
                reason,
                metadata,
                reply,
            } => {
                let _ = reply.send(self.request_handoff(reason, metadata));
            }
            Intent::Accept {
                attempt,
                agent,
                reply,
            } => {
                let result = self.accept(attempt, agent);
                respond(reply, result, "handoff acceptance");
            }
            Intent::Reject {
                attempt,
                reason,
                reply,
            } => {
                let result = self.reject(attempt, reason);
                respond(reply, result, "handoff rejection");
            }
            Intent::AgentMessage { content, reply } => {
                let result = self
                    .session
                    .post_agent_message(content)
                    .map(|applied| self.publish(applied));
                let _ = reply.send(result);
            }
            Intent::Escalate { turn } => self.escalate(turn),
            Intent::Close { reply } => {
                let result = self.close();
                let _ = reply.send(result);
            }
        }
    }

    /// Broadcast the change and refresh the view. Returns the output.
    fn publish<T>(&mut self, applied: Applied<T>) -> T {
        let event = SessionEvent {
            seq: self.session.seq(),
            session_id: self.session.id(),
            mode: self.session.mode(),
            change: applied.change,
        };
        self.view.send_replace(self.session.view());
        // No subscribers is fine.
        let _ = self.events.send(event);
        applied.output
    }

    fn submit(&mut self, content: Content) -> Result<TurnHandle, SessionError> {
        let relay_content = content.clone();
        let submission = self.session.submit_user_input(content).map(|a| self.publish(a))?;

        match submission {
            Submission::Turn(start) => {
                tracing::debug!(
                    session_id = %self.session.id(),
                    message_id = %start.pending,
                    "Turn started"
                );
                let (tx, rx) = oneshot::channel();
                self.turn_waiters.insert(start.pending, tx);
                self.spawn_bot_call(start.pending, relay_content);
                Ok(TurnHandle {
                    user_message: start.user_message,
                    pending: Some(start.pending),
                    settled: Some(rx),
                })
            }
            Submission::Relayed {
                user_message,
                agent,
            } => {
                if let Some(message) = self.session.store().get(user_message).cloned() {
                    self.spawn_relay(agent, message);
                }
                Ok(TurnHandle {
                    user_message,
                    pending: None,
                    settled: None,
                })
            }
        }
    }

    fn resolve(&mut self, id: MessageId, result: TurnResult) -> Result<Message, SessionError> {
        let message = self.session.resolve_turn(id, result).map(|a| self.publish(a))?;
        tracing::debug!(
            session_id = %self.session.id(),
            message_id = %id,
            status = ?message.status,
            "Turn resolved"
        );
        if let Some(waiter) = self.turn_waiters.remove(&id) {
            let _ = waiter.send(Ok(message.clone()));
        }
        Ok(message)
    }

    /// Follow-up to a bot reply that asked for a human.
    fn escalate(&mut self, turn: MessageId) {
        if self.session.mode() != SessionMode::BotServed {
            tracing::debug!(
                session_id = %self.session.id(),
                message_id = %turn,
                mode = ?self.session.mode(),
                "Ignoring bot escalation"
            );
            return;
        }
        if let Err(e) = self.request_handoff(HandoffReason::BotEscalation, HashMap::new()) {
            tracing::warn!(session_id = %self.session.id(), "Bot escalation failed: {e}");
        }
    }

    fn request_handoff(
        &mut self,
        reason: HandoffReason,
        metadata: HashMap<String, String>,
    ) -> Result<HandoffHandle, SessionError> {
        let payload = self
            .session
            .request_handoff(reason, metadata)
            .map(|a| self.publish(a))?;
        let attempt = payload.attempt();
        tracing::info!(
            session_id = %self.session.id(),
            %attempt,
            reason = ?payload.reason(),
            "Handoff requested"
        );

        let (tx, rx) = oneshot::channel();
        self.handoff_waiter = Some((attempt, tx));
        self.spawn_routing(payload);
        Ok(HandoffHandle {
            attempt,
            outcome: rx,
        })
    }

    fn accept(&mut self, attempt: Option<HandoffId>, agent: AgentRef) -> Result<(), SessionError> {
        let open = self.session.handoff_attempt();
        self.session
            .accept_handoff(attempt, agent.clone())
            .map(|a| self.publish(a))?;
        tracing::info!(session_id = %self.session.id(), %agent, "Handoff accepted");
        self.finish_handoff(open, HandoffOutcome::Accepted(agent));
        Ok(())
    }

    fn reject(&mut self, attempt: Option<HandoffId>, reason: String) -> Result<(), SessionError> {
        let open = self.session.handoff_attempt();
        self.session
            .reject_handoff(attempt, reason.clone())
            .map(|a| self.publish(a))?;
        tracing::info!(session_id = %self.session.id(), %reason, "Handoff rejected");
        self.finish_handoff(open, HandoffOutcome::Rejected(reason));
        Ok(())
    }

    fn finish_handoff(&mut self, attempt: Option<HandoffId>, outcome: HandoffOutcome) {
        match self.handoff_waiter.take() {
            Some((waiting, tx)) if Some(waiting) == attempt => {
                let _ = tx.send(Ok(outcome));
            }
            other => self.handoff_waiter = other,
        }
    }

    fn close(&mut self) -> Result<(), SessionError> {
        self.session.close().map(|a| self.publish(a))?;
        for (_, waiter) in self.turn_waiters.drain() {
            let _ = waiter.send(Err(SessionError::SessionClosed));
        }
        if let Some((_, waiter)) = self.handoff_waiter.take() {
            let _ = waiter.send(Err(SessionError::SessionClosed));
        }
        tracing::info!(session_id = %self.session.id(), "Session closed");
        Ok(())
    }

    /// Put an intent at the back of this session's own queue.
    fn enqueue(&self, intent: Intent) {
        let Some(tx) = self.intents.upgrade() else {
            return;
        };
        let session_id = self.session.id();
        tokio::spawn(async move {
            if tx.send(intent).await.is_err() {
                tracing::debug!(%session_id, "Session ended before a queued intent ran");
            }
        });
    }

    fn spawn_bot_call(&self, pending: MessageId, content: Content) {
        let Some(tx) = self.intents.upgrade() else {
            return;
        };
        let bot = Arc::clone(&self.bot);
        let session_id = self.session.id();
        let timeout = self.config.reply_timeout();

        tokio::spawn(async move {
            let call = bot.send_user_input(session_id, &content);
            let outcome = match timeout {
                Some(limit) => tokio::time::timeout(limit, call)
                    .await
                    .unwrap_or(Err(ServiceError::Timeout)),
                None => call.await,
            };
            let (result, escalate) = match outcome {
                Ok(reply) => (Ok(reply.content), reply.escalate),
                Err(e) => {
                    tracing::warn!(%session_id, message_id = %pending, "Bot service error: {e}");
                    (Err(e.into()), false)
                }
            };
            let intent = Intent::Resolve {
                id: pending,
                result,
                escalate,
                reply: None,
            };
            if tx.send(intent).await.is_err() {
                tracing::debug!(%session_id, "Session ended before the bot replied");
            }
        });
    }

    fn spawn_routing(&self, payload: HandoffPayload) {
        let Some(tx) = self.intents.upgrade() else {
            return;
        };
        let router = Arc::clone(&self.router);
        let session_id = self.session.id();
        let attempt = payload.attempt();

        tokio::spawn(async move {
            let intent = match router.route_handoff(payload).await {
                Ok(RoutingDecision::Accepted { agent }) => Intent::Accept {
                    attempt: Some(attempt),
                    agent,
                    reply: None,
                },
                Ok(RoutingDecision::Rejected { reason }) => Intent::Reject {
                    attempt: Some(attempt),
                    reason,
                    reply: None,
                },
                Ok(RoutingDecision::Deferred) => return,
                Err(e) => {
                    tracing::warn!(%session_id, %attempt, "Agent routing failed: {e}");
                    Intent::Reject {
                        attempt: Some(attempt),
                        reason: e.to_string(),
                        reply: None,
                    }
                }
            };
            if tx.send(intent).await.is_err() {
                tracing::debug!(%session_id, %attempt, "Session ended before routing finished");
            }
        });
    }

    fn spawn_relay(&self, agent: AgentRef, message: Message) {
        let router = Arc::clone(&self.router);
        let session_id = self.session.id();

        tokio::spawn(async move {
            if let Err(e) = router.relay_user_input(&agent, &message).await {
                tracing::warn!(%session_id, %agent, message_id = %message.id, "Relay failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use copilot_widget_core::{
        BotReply, ManualRouting, MessageStatus, RoutingError, TurnFailure,
    };
    use tokio::sync::Mutex;

    use super::*;

    /// Bot whose replies are released by the test.
    #[derive(Default)]
    struct GatedBot {
        gates: Mutex<Vec<oneshot::Sender<Result<BotReply, ServiceError>>>>,
    }

    impl GatedBot {
        async fn release(&self, reply: Result<BotReply, ServiceError>) {
            for _ in 0..100 {
                if let Some(tx) = self.gates.lock().await.pop() {
                    tx.send(reply).unwrap();
                    return;
                }
                tokio::task::yield_now().await;
            }
            panic!("no bot call in flight");
        }
    }

    #[async_trait]
    impl BotService for GatedBot {
        async fn send_user_input(
            &self,
            _session_id: SessionId,
            _content: &Content,
        ) -> Result<BotReply, ServiceError> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().await.push(tx);
            rx.await.unwrap_or(Err(ServiceError::Unavailable))
        }
    }

    struct EchoBot;

    #[async_trait]
    impl BotService for EchoBot {
        async fn send_user_input(
            &self,
            _session_id: SessionId,
            content: &Content,
        ) -> Result<BotReply, ServiceError> {
            match content.as_text() {
                Some("escalate") => Ok(BotReply::escalating("Let me find someone")),
                Some(text) => Ok(BotReply::new(format!("echo: {text}"))),
                None => Err(ServiceError::Failed("unsupported".into())),
            }
        }
    }

    struct NeverBot;

    #[async_trait]
    impl BotService for NeverBot {
        async fn send_user_input(
            &self,
            _session_id: SessionId,
            _content: &Content,
        ) -> Result<BotReply, ServiceError> {
            futures::future::pending().await
        }
    }

    /// Router that accepts immediately and records what it saw.
    #[derive(Default)]
    struct AcceptingRouter {
        payloads: Mutex<Vec<HandoffPayload>>,
        relayed: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl AgentRouter for AcceptingRouter {
        async fn route_handoff(&self, payload: HandoffPayload) -> Result<RoutingDecision, RoutingError> {
            self.payloads.lock().await.push(payload);
            Ok(RoutingDecision::Accepted {
                agent: AgentRef::new("agent-1"),
            })
        }

        async fn relay_user_input(&self, _agent: &AgentRef, message: &Message) -> Result<(), RoutingError> {
            self.relayed.lock().await.push(message.clone());
            Ok(())
        }
    }

    struct FailingRouter;

    #[async_trait]
    impl AgentRouter for FailingRouter {
        async fn route_handoff(&self, _payload: HandoffPayload) -> Result<RoutingDecision, RoutingError> {
            Err(RoutingError::Unavailable)
        }
    }

    fn spawn<B: BotService + 'static, R: AgentRouter + 'static>(bot: Arc<B>, router: Arc<R>) -> SessionContext {
        SessionContext::spawn(bot, router, SessionMetadata::new(), SessionConfig::default())
    }

    #[tokio::test]
    async fn test_hello_turn() {
        let bot = Arc::new(GatedBot::default());
        let ctx = spawn(Arc::clone(&bot), Arc::new(ManualRouting));

        let handle = ctx.submit_user_input("Hello").await.unwrap();
        let view = ctx.view();
        assert_eq!(view.transcript.len(), 2);
        assert_eq!(view.transcript[1].status, MessageStatus::Pending);
        assert_eq!(view.active_turn, handle.pending);

        bot.release(Ok(BotReply::new("Hi there"))).await;
        let reply = handle.reply().await.unwrap().unwrap();
        assert_eq!(reply.content.as_text(), Some("Hi there"));
        assert_eq!(reply.status, MessageStatus::Delivered);

        let view = ctx.view();
        assert_eq!(view.transcript[1], reply);
        assert_eq!(view.active_turn, None);
    }

    #[tokio::test]
    async fn test_single_flight_across_handles() {
        let bot = Arc::new(GatedBot::default());
        let ctx = spawn(Arc::clone(&bot), Arc::new(ManualRouting));
        let other = ctx.clone();

        let first = ctx.submit_user_input("one").await.unwrap();
        let err = other.submit_user_input("two").await.unwrap_err();
        assert_eq!(err, SessionError::TurnInProgress(first.pending.unwrap()));
        assert_eq!(ctx.transcript().len(), 2);
    }

    #[tokio::test]
    async fn test_notifications_in_order() {
        let ctx = spawn(Arc::new(EchoBot), Arc::new(ManualRouting));
        let mut events = ctx.subscribe();

        let handle = ctx.submit_user_input("ping").await.unwrap();
        handle.reply().await.unwrap();
        // Failed dispatch: no notification.
        ctx.accept_handoff(AgentRef::new("nobody")).await.unwrap_err();
        ctx.request_handoff(HandoffReason::UserRequested).await.unwrap();
        ctx.reject_handoff("no agents online").await.unwrap();
        ctx.close().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let seqs: Vec<_> = seen.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert!(matches!(seen[0].change, StateChange::TurnStarted { .. }));
        assert!(matches!(seen[1].change, StateChange::TurnResolved { .. }));
        assert_eq!(seen[2].mode, SessionMode::HandoffRequested);
        assert_eq!(seen[3].mode, SessionMode::BotServed);
        assert_eq!(seen[4].mode, SessionMode::Closed);
        assert_eq!(ctx.view().seq, 5);
    }

    #[tokio::test]
    async fn test_service_error_marks_failed() {
        let bot = Arc::new(GatedBot::default());
        let ctx = spawn(Arc::clone(&bot), Arc::new(ManualRouting));

        let handle = ctx.submit_user_input("q").await.unwrap();
        bot.release(Err(ServiceError::Unavailable)).await;
        let reply = handle.reply().await.unwrap().unwrap();
        assert_eq!(reply.status, MessageStatus::Failed);
        assert!(matches!(reply.failure, Some(TurnFailure::Service { .. })));

        // Still usable.
        ctx.submit_user_input("retry").await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_timeout() {
        let config = SessionConfig::default().with_reply_timeout(Duration::from_millis(20));
        let ctx = SessionContext::spawn(
            Arc::new(NeverBot),
            Arc::new(ManualRouting),
            SessionMetadata::new(),
            config,
        );

        let handle = ctx.submit_user_input("anyone?").await.unwrap();
        let reply = handle.reply().await.unwrap().unwrap();
        assert_eq!(reply.failure, Some(TurnFailure::Timeout));
        assert_eq!(ctx.active_turn(), None);
    }

    #[tokio::test]
    async fn test_external_timeout_then_late_reply() {
        let bot = Arc::new(GatedBot::default());
        let ctx = spawn(Arc::clone(&bot), Arc::new(ManualRouting));

        let handle = ctx.submit_user_input("q").await.unwrap();
        let pending = handle.pending.unwrap();
        let failed = ctx.resolve_turn(pending, Err(TurnFailure::Timeout)).await.unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        let before = ctx.transcript();

        // The late reply from the bot is dropped by the session task.
        bot.release(Ok(BotReply::new("too late"))).await;
        assert_eq!(
            ctx.resolve_turn(pending, Ok("again".into())).await.unwrap_err(),
            SessionError::AlreadyResolved(pending)
        );
        assert_eq!(ctx.transcript(), before);
    }

    #[tokio::test]
    async fn test_routed_handoff_and_relay() {
        let router = Arc::new(AcceptingRouter::default());
        let ctx = spawn(Arc::new(EchoBot), Arc::clone(&router));

        ctx.submit_user_input("hi").await.unwrap().reply().await.unwrap();
        let snapshot = ctx.transcript();

        let handle = ctx.request_handoff(HandoffReason::UserRequested).await.unwrap();
        assert_eq!(
            handle.outcome().await.unwrap(),
            HandoffOutcome::Accepted(AgentRef::new("agent-1"))
        );
        assert_eq!(ctx.mode(), SessionMode::AgentServed);
        assert_eq!(router.payloads.lock().await[0].context(), snapshot.as_slice());

        let err = ctx.request_handoff(HandoffReason::UserRequested).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { .. }));

        let relayed = ctx.submit_user_input("are you human?").await.unwrap();
        assert!(relayed.is_relayed());
        assert_eq!(relayed.reply().await.unwrap(), None);
        ctx.post_agent_message("yes").await.unwrap();

        for _ in 0..100 {
            if !router.relayed.lock().await.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(router.relayed.lock().await[0].content.as_text(), Some("are you human?"));
    }

    #[tokio::test]
    async fn test_bot_escalation() {
        let router = Arc::new(AcceptingRouter::default());
        let ctx = spawn(Arc::new(EchoBot), Arc::clone(&router));
        let mut modes = ctx.watch_view();

        ctx.submit_user_input("escalate").await.unwrap().reply().await.unwrap();
        modes
            .wait_for(|view| view.mode == SessionMode::AgentServed)
            .await
            .unwrap();

        let payload = router.payloads.lock().await[0].clone();
        assert_eq!(payload.reason(), &HandoffReason::BotEscalation);
        assert_eq!(payload.context().len(), 2);
    }

    #[tokio::test]
    async fn test_escalation_is_its_own_intent() {
        let ctx = spawn(Arc::new(EchoBot), Arc::new(ManualRouting));
        let mut events = ctx.subscribe();
        let mut views = ctx.watch_view();

        let reply = ctx.submit_user_input("escalate").await.unwrap().reply().await.unwrap().unwrap();
        views
            .wait_for(|view| view.mode == SessionMode::HandoffRequested)
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1].seq, 2);
        assert_eq!(seen[1].change, StateChange::TurnResolved { message: reply });
        assert_eq!(seen[1].mode, SessionMode::BotServed);
        assert_eq!(seen[2].seq, 3);
        assert!(matches!(
            seen[2].change,
            StateChange::HandoffRequested {
                reason: HandoffReason::BotEscalation,
                ..
            }
        ));
        assert_eq!(ctx.view().seq, 3);
    }

    #[tokio::test]
    async fn test_routing_error_rejects() {
        let ctx = spawn(Arc::new(EchoBot), Arc::new(FailingRouter));

        let handle = ctx.request_handoff(HandoffReason::PolicyTrigger).await.unwrap();
        assert!(matches!(handle.outcome().await.unwrap(), HandoffOutcome::Rejected(_)));
        assert_eq!(ctx.mode(), SessionMode::BotServed);
    }

    #[tokio::test]
    async fn test_close_during_handoff() {
        let bot = Arc::new(GatedBot::default());
        let ctx = spawn(Arc::clone(&bot), Arc::new(ManualRouting));

        let turn = ctx.submit_user_input("q").await.unwrap();
        let handoff = ctx.request_handoff(HandoffReason::UserRequested).await.unwrap();
        ctx.close().await.unwrap();

        assert_eq!(turn.reply().await.unwrap_err(), SessionError::SessionClosed);
        assert_eq!(handoff.outcome().await.unwrap_err(), SessionError::SessionClosed);
        assert_eq!(
            ctx.accept_handoff(AgentRef::new("late")).await.unwrap_err(),
            SessionError::SessionClosed
        );
        assert_eq!(ctx.mode(), SessionMode::Closed);

        let view = ctx.view();
        assert_eq!(view.active_turn, None);
        assert_eq!(view.transcript[1].failure, Some(TurnFailure::Cancelled));
    }
}
