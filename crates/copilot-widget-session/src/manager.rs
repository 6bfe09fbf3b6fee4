//! Session manager for mounting and unmounting widget sessions.

use std::{collections::HashMap, sync::Arc};

use copilot_widget_core::{AgentRouter, BotService, SessionError, SessionId, SessionMetadata};
use tokio::sync::RwLock;

use crate::{config::SessionConfig, context::SessionContext};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Registry of independent sessions sharing one bot and one router.
///
/// Sessions share no mutable state; each owns its transcript and runs on
/// its own task.
pub struct SessionManager<B, R>
where
    B: BotService + 'static,
    R: AgentRouter + 'static,
{
    bot: Arc<B>,
    router: Arc<R>,
    config: SessionConfig,
    sessions: RwLock<HashMap<SessionId, SessionContext>>,
}

impl<B, R> SessionManager<B, R>
where
    B: BotService + 'static,
    R: AgentRouter + 'static,
{
    /// Create a new session manager.
    #[must_use]
    pub fn new(bot: B, router: R, config: SessionConfig) -> Self {
        Self {
            bot: Arc::new(bot),
            router: Arc::new(router),
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Mount a new session.
    pub async fn mount(&self, metadata: SessionMetadata) -> SessionContext {
        let ctx = SessionContext::spawn(
            Arc::clone(&self.bot),
            Arc::clone(&self.router),
            metadata,
            self.config.clone(),
        );
        self.sessions.write().await.insert(ctx.id(), ctx.clone());
        ctx
    }

    /// Get a mounted session.
    pub async fn get(&self, id: SessionId) -> Option<SessionContext> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Ids of all mounted sessions.
    pub async fn list(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Close and forget a session.
    ///
    /// A session that was already closed is still removed.
    ///
    /// # Errors
    /// Returns error if the session is not mounted.
    pub async fn unmount(&self, id: SessionId) -> Result<(), ManagerError> {
        let ctx = self
            .sessions
            .write()
            .await
            .remove(&id)
            .ok_or(ManagerError::NotFound(id))?;

        match ctx.close().await {
            Err(e) if !e.is_fatal() => return Err(e.into()),
            _ => {}
        }
        tracing::info!(session_id = %id, "Session unmounted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use copilot_widget_core::{
        BotReply, Content, HandoffReason, ManualRouting, ServiceError, SessionMode,
    };

    use super::*;

    struct EchoBot;

    #[async_trait]
    impl BotService for EchoBot {
        async fn send_user_input(
            &self,
            _session_id: SessionId,
            content: &Content,
        ) -> Result<BotReply, ServiceError> {
            Ok(BotReply::new(content.clone()))
        }
    }

    fn manager() -> SessionManager<EchoBot, ManualRouting> {
        SessionManager::new(EchoBot, ManualRouting, SessionConfig::default())
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let manager = manager();
        let a = manager.mount(SessionMetadata::new()).await;
        let b = manager.mount(SessionMetadata::new()).await;
        assert_ne!(a.id(), b.id());

        a.submit_user_input("only in a").await.unwrap().reply().await.unwrap();
        a.request_handoff(HandoffReason::UserRequested).await.unwrap();

        assert_eq!(a.transcript().len(), 2);
        assert!(b.transcript().is_empty());
        assert_eq!(b.mode(), SessionMode::BotServed);

        let mut ids = manager.list().await;
        ids.sort();
        let mut expected = vec![a.id(), b.id()];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_unmount_closes() {
        let manager = manager();
        let ctx = manager.mount(SessionMetadata::new()).await;
        let id = ctx.id();

        manager.unmount(id).await.unwrap();
        assert!(manager.get(id).await.is_none());
        assert_eq!(ctx.mode(), SessionMode::Closed);
        assert_eq!(
            ctx.submit_user_input("after").await.unwrap_err(),
            SessionError::SessionClosed
        );
        assert!(matches!(
            manager.unmount(id).await,
            Err(ManagerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unmount_after_close() {
        let manager = manager();
        let ctx = manager.mount(SessionMetadata::new()).await;
        ctx.close().await.unwrap();

        manager.unmount(ctx.id()).await.unwrap();
        assert!(manager.list().await.is_empty());
    }
}
