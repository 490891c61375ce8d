use crate::cell::CellFactory;
use crate::config::StreamConfig;
use crate::notify::{Notice, NotificationSink};
use realmstream_catalog::CatalogClient;
use realmstream_common::{CancelScope, RealmDescriptor, SessionId};
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Long-lived collaborators shared by every realm session.
#[derive(Clone)]
pub struct StreamServices {
    pub runtime: Handle,
    pub catalog: Arc<dyn CatalogClient>,
    pub factory: Arc<dyn CellFactory>,
    pub sink: Arc<dyn NotificationSink>,
    pub config: Arc<StreamConfig>,
}

impl fmt::Debug for StreamServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamServices")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Everything one realm session's components share.
///
/// Lives exactly as long as the connection to one realm. Cancelling `scope`
/// cancels every fetch, load and cell loop started during the session.
pub struct SessionContext {
    pub id: SessionId,
    /// Identifier the realm was requested by.
    pub identifier: String,
    pub realm: RealmDescriptor,
    pub scope: CancelScope,
    pub services: StreamServices,
}

impl SessionContext {
    pub fn new(services: StreamServices, identifier: &str, realm: RealmDescriptor) -> Arc<Self> {
        let id = SessionId::new();
        Arc::new(Self {
            id,
            identifier: identifier.to_string(),
            scope: CancelScope::root(format!("session:{id}")),
            realm,
            services,
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.services.config
    }

    pub fn runtime(&self) -> &Handle {
        &self.services.runtime
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogClient> {
        &self.services.catalog
    }

    pub fn factory(&self) -> &Arc<dyn CellFactory> {
        &self.services.factory
    }

    pub fn notify(&self, notice: Notice) {
        self.services.sink.notify(notice);
    }

    pub fn base_url(&self) -> &str {
        &self.realm.base_url
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.id)
            .field("identifier", &self.identifier)
            .field("realm", &self.realm.name)
            .field("cancelled", &self.scope.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Session scaffolding shared by the component tests.

    use super::*;
    use crate::cell::TickingCellFactory;
    use crate::notify::NoticeBuffer;
    use realmstream_catalog::InMemoryCatalog;

    pub const BASE: &str = "mem://content";

    pub struct Fixture {
        pub catalog: Arc<InMemoryCatalog>,
        pub factory: Arc<TickingCellFactory>,
        pub notices: NoticeBuffer,
        pub services: StreamServices,
    }

    impl Fixture {
        pub fn new(config: StreamConfig, extent: i32) -> Self {
            let catalog = Arc::new(InMemoryCatalog::with_grid_world("main", BASE, extent));
            Self::with_catalog(config, catalog)
        }

        pub fn with_catalog(config: StreamConfig, catalog: Arc<InMemoryCatalog>) -> Self {
            let runtime = Handle::current();
            let factory = Arc::new(TickingCellFactory::new(runtime.clone()));
            let notices = NoticeBuffer::new(64);
            let services = StreamServices {
                runtime,
                catalog: catalog.clone(),
                factory: factory.clone(),
                sink: Arc::new(notices.sink()),
                config: Arc::new(config),
            };
            Self {
                catalog,
                factory,
                notices,
                services,
            }
        }

        pub fn session(&self) -> Arc<SessionContext> {
            SessionContext::new(
                self.services.clone(),
                "main",
                RealmDescriptor {
                    name: "main".into(),
                    base_url: BASE.into(),
                    fixed_cells: None,
                },
            )
        }
    }

    /// Run `step` until it returns true, yielding to background work between
    /// attempts.
    pub async fn until(mut step: impl FnMut() -> bool) -> bool {
        for _ in 0..2_000 {
            if step() {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn sessions_have_distinct_scopes() {
        let fixture = Fixture::new(StreamConfig::default(), 1);
        let a = fixture.session();
        let b = fixture.session();
        assert_ne!(a.id, b.id);
        a.scope.cancel();
        assert!(!b.scope.is_cancelled());
        assert_eq!(a.base_url(), BASE);
    }
}
