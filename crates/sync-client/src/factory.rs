use std::sync::Arc;

use sync_worker::{
    HomeserverApi, HomeserverTransport, Reconnector, RequestScheduler, WorkerEnvironment,
    WorkerRegistry,
};
use tracing::info;

use crate::{
    config::SyncClientConfig,
    error::ClientError,
    media::MediaRepository,
    session::{E2eeApplier, NoE2ee, Session, SessionInfo, SessionStore},
};

/// What [`SessionFactory::make`] builds for one login.
#[derive(Debug)]
pub struct SessionParts {
    pub session: Arc<Session>,
    pub scheduler: RequestScheduler,
}

/// Composes scheduler, media helper and session for each login.
///
/// Every scheduler it builds shares one [`Reconnector`], so connectivity seen
/// by one session paces the retries of all of them.
#[derive(Clone)]
pub struct SessionFactory {
    transport: Arc<dyn HomeserverTransport>,
    store: Arc<dyn SessionStore>,
    reconnector: Arc<Reconnector>,
    e2ee: Arc<dyn E2eeApplier>,
    config: SyncClientConfig,
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionFactory {
    pub fn new(
        transport: Arc<dyn HomeserverTransport>,
        store: Arc<dyn SessionStore>,
        reconnector: Arc<Reconnector>,
        config: SyncClientConfig,
    ) -> Self {
        Self {
            transport,
            store,
            reconnector,
            e2ee: Arc::new(NoE2ee),
            config,
        }
    }

    pub fn with_e2ee(mut self, e2ee: Arc<dyn E2eeApplier>) -> Self {
        self.e2ee = e2ee;
        self
    }

    /// Worker environment sharing this factory's transport and tuning.
    pub fn worker_environment(&self) -> WorkerEnvironment {
        WorkerEnvironment::new(Arc::clone(&self.transport)).with_config(self.config.worker.clone())
    }

    /// Registry whose workers talk to the same homeserver transport.
    pub fn worker_registry(&self) -> WorkerRegistry {
        WorkerRegistry::new(self.worker_environment())
    }

    /// Build the session for a login. The access token is bound into the
    /// scheduler's API client and kept private to the session.
    pub async fn make(
        &self,
        info: SessionInfo,
        access_token: impl Into<String>,
    ) -> Result<SessionParts, ClientError> {
        if info.session_id.trim().is_empty() {
            return Err(ClientError::missing_session_id());
        }
        let access_token = access_token.into();

        let api = HomeserverApi::new(
            &info.homeserver,
            access_token.as_str(),
            Arc::clone(&self.transport),
        )
        .map_err(ClientError::Setup)?;
        let scheduler = RequestScheduler::new(
            api,
            Arc::clone(&self.reconnector),
            self.config.worker.scheduler,
        );
        let media = MediaRepository::new(&info.homeserver).map_err(ClientError::Setup)?;

        let session = Session::new(
            info,
            access_token,
            scheduler.clone(),
            media,
            Arc::clone(&self.store),
            Arc::clone(&self.e2ee),
        );
        session.load().await.map_err(ClientError::Store)?;
        info!(
            session_id = %session.session_id(),
            resumed = session.sync_info().is_some(),
            "session created"
        );

        Ok(SessionParts {
            session: Arc::new(session),
            scheduler,
        })
    }
}

#[cfg(test)]
mod tests {
    use sync_core::SyncInfo;
    use sync_worker::testing::ScriptedHomeserver;

    use super::*;
    use crate::session::InMemorySessionStore;

    fn info(homeserver: &str) -> SessionInfo {
        SessionInfo {
            session_id: "s1".into(),
            device_id: "d1".into(),
            user_id: "@a:x".into(),
            homeserver: homeserver.into(),
        }
    }

    fn factory(store: InMemorySessionStore) -> SessionFactory {
        let config = SyncClientConfig::default();
        SessionFactory::new(
            Arc::new(ScriptedHomeserver::default()),
            Arc::new(store),
            Arc::new(Reconnector::new(config.worker.retry)),
            config,
        )
    }

    #[tokio::test]
    async fn binds_token_into_scheduler_but_not_session_info() {
        let parts = factory(InMemorySessionStore::default())
            .make(info("https://x"), "tok")
            .await
            .expect("session built");

        let request = parts
            .scheduler
            .api()
            .sync(None, None, 0)
            .expect("sync request");
        assert_eq!(request.access_token, "tok");
        assert_eq!(parts.session.info(), &info("https://x"));
        assert_eq!(parts.session.start_params().access_token, "tok");
        assert_eq!(
            parts
                .session
                .media()
                .download_url("mxc://x/m1")
                .expect("media url")
                .as_str(),
            "https://x/_matrix/media/v3/download/x/m1"
        );
    }

    #[tokio::test]
    async fn restores_stored_cursor() {
        let store = InMemorySessionStore::default();
        let stored = SyncInfo {
            token: "t7".into(),
            filter_id: "f3".into(),
        };
        store.save_sync_info("s1", &stored).await.expect("seed store");

        let parts = factory(store)
            .make(info("https://x"), "tok")
            .await
            .expect("session built");
        assert_eq!(parts.session.start_params().resume, Some(stored));
    }

    #[tokio::test]
    async fn sessions_share_the_factory_reconnector() {
        let store = InMemorySessionStore::default();
        let reconnector = Arc::new(Reconnector::new(SyncClientConfig::default().worker.retry));
        let factory = SessionFactory::new(
            Arc::new(ScriptedHomeserver::default()),
            Arc::new(store),
            Arc::clone(&reconnector),
            SyncClientConfig::default(),
        );

        let first = factory.make(info("https://x"), "tok").await.expect("first");
        let mut other = info("https://y");
        other.session_id = "s2".into();
        let second = factory.make(other, "tok2").await.expect("second");

        assert!(Arc::ptr_eq(first.scheduler.reconnector(), &reconnector));
        assert!(Arc::ptr_eq(second.scheduler.reconnector(), &reconnector));
    }

    #[tokio::test]
    async fn rejects_bad_identity_before_building_anything() {
        let factory = factory(InMemorySessionStore::default());

        let err = factory
            .make(info("ftp://x"), "tok")
            .await
            .expect_err("bad homeserver");
        assert!(matches!(err, ClientError::Setup(ref e) if e.code == "invalid_homeserver_url"));

        let mut anonymous = info("https://x");
        anonymous.session_id.clear();
        let err = factory.make(anonymous, "tok").await.expect_err("no id");
        assert_eq!(err, ClientError::missing_session_id());
    }
}
