use crate::error::{StreamError, consistency_violation};
use crate::notify::{Notice, NoticeKind, NotificationSink};
use crate::session::StreamServices;
use realmstream_catalog::{CatalogClient, CatalogError};
use realmstream_common::{CancelScope, Consume, Promise, RealmDescriptor};
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{info, warn};

/// Result of a realm change observed by [`RealmController::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum RealmEvent {
    /// A realm descriptor is available and a session should be built for it.
    /// `fallback` is set when this is the previous realm restored after the
    /// requested one could not be reached.
    Connected {
        identifier: String,
        descriptor: RealmDescriptor,
        fallback: bool,
    },
    Failed {
        identifier: String,
        error: StreamError,
    },
}

#[derive(Debug)]
struct Attempt {
    identifier: String,
    number: u32,
    promise: Promise<RealmDescriptor, CatalogError>,
}

/// Fetches realm descriptors, one change at a time.
pub struct RealmController {
    runtime: Handle,
    catalog: Arc<dyn CatalogClient>,
    sink: Arc<dyn NotificationSink>,
    max_attempts: u32,
    scope: CancelScope,
    current: Option<(String, RealmDescriptor)>,
    previous: Option<(String, RealmDescriptor)>,
    pending: Option<(Attempt, CancelScope)>,
}

impl RealmController {
    pub fn new(services: &StreamServices) -> Self {
        Self {
            runtime: services.runtime.clone(),
            catalog: services.catalog.clone(),
            sink: services.sink.clone(),
            max_attempts: services.config.realm_change_retries.max(1),
            scope: CancelScope::root("realm"),
            current: None,
            previous: None,
            pending: None,
        }
    }

    /// Start switching to `identifier`. Returns false when that realm is
    /// already current or already being fetched.
    pub fn change_realm(&mut self, identifier: &str) -> bool {
        if let Some((attempt, _)) = &self.pending {
            if attempt.identifier == identifier {
                return false;
            }
        } else if self.current.as_ref().is_some_and(|(id, _)| id == identifier) {
            info!(realm = identifier, "already connected, ignoring realm change");
            return false;
        }
        if let Some((attempt, scope)) = self.pending.take() {
            info!(realm = %attempt.identifier, "realm change superseded");
            scope.cancel();
        }
        if let Some(current) = self.current.take() {
            self.previous = Some(current);
        }
        info!(realm = identifier, "changing realm");
        self.start_attempt(identifier.to_string(), 1);
        true
    }

    fn start_attempt(&mut self, identifier: String, number: u32) {
        let scope = self.scope.child(format!("realm:{identifier}"));
        let catalog = self.catalog.clone();
        let realm = identifier.clone();
        let promise = Promise::spawn(&self.runtime, &scope, async move {
            catalog.fetch_realm(&realm).await
        });
        self.pending = Some((
            Attempt {
                identifier,
                number,
                promise,
            },
            scope,
        ));
    }

    /// Poll the pending fetch.
    pub fn poll(&mut self) -> Vec<RealmEvent> {
        let Some((mut attempt, scope)) = self.pending.take() else {
            return Vec::new();
        };
        match attempt.promise.try_consume() {
            Consume::Pending => {
                self.pending = Some((attempt, scope));
                Vec::new()
            }
            Consume::Succeeded(descriptor) => {
                info!(realm = %attempt.identifier, name = %descriptor.name, "realm descriptor fetched");
                self.current = Some((attempt.identifier.clone(), descriptor.clone()));
                vec![RealmEvent::Connected {
                    identifier: attempt.identifier,
                    descriptor,
                    fallback: false,
                }]
            }
            Consume::Failed(e) if attempt.number < self.max_attempts => {
                warn!(realm = %attempt.identifier, attempt = attempt.number, error = %e, "realm fetch failed, retrying");
                self.start_attempt(attempt.identifier, attempt.number + 1);
                Vec::new()
            }
            Consume::Failed(e) => self.give_up(attempt.identifier, e.into()),
            Consume::Cancelled => Vec::new(),
            Consume::AlreadyConsumed => consistency_violation("realm promise consumed twice"),
        }
    }

    fn give_up(&mut self, identifier: String, error: StreamError) -> Vec<RealmEvent> {
        warn!(realm = %identifier, %error, "realm change failed");
        self.sink.notify(Notice::new(
            NoticeKind::RealmChangeFailed,
            format!("Could not connect to realm {identifier}: {error}"),
        ));
        let mut events = vec![RealmEvent::Failed { identifier, error }];
        if let Some((identifier, descriptor)) = self.previous.take() {
            info!(realm = %identifier, "falling back to previous realm");
            self.current = Some((identifier.clone(), descriptor.clone()));
            events.push(RealmEvent::Connected {
                identifier,
                descriptor,
                fallback: true,
            });
        }
        events
    }

    /// Cancel any pending fetch.
    pub fn shutdown(&mut self) {
        self.scope.cancel();
        self.pending = None;
    }

    pub fn current(&self) -> Option<&RealmDescriptor> {
        self.current.as_ref().map(|(_, d)| d)
    }

    pub fn current_identifier(&self) -> Option<&str> {
        self.current.as_ref().map(|(id, _)| id.as_str())
    }

    pub fn is_changing(&self) -> bool {
        self.pending.is_some()
    }

    /// Identifier being fetched, if any.
    pub fn pending_identifier(&self) -> Option<&str> {
        self.pending.as_ref().map(|(a, _)| a.identifier.as_str())
    }
}

impl fmt::Debug for RealmController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealmController")
            .field("current", &self.current_identifier())
            .field("pending", &self.pending_identifier())
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}
