//! Connection lifecycle management.
//!
//! A [`ConnectionManager`] owns at most one store session and a cache of
//! per-database handles that share it. It moves through
//! `Uninitialized -> Connecting -> Connected -> Closed`; connects are
//! single-flight so concurrent callers never open a second session.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use docbridge_mongodb::connection::ConnectionManager;
//! use docbridge_mongodb::driver::memory::MemoryConnector;
//!
//! let manager = ConnectionManager::new(Arc::new(MemoryConnector::new()));
//! manager.connect("memory://local").await?;
//! let billing = manager.get_database("billing")?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::driver::{Command, Connector, DatabaseBackend, Reply, Session};
use crate::error::{DocbridgeError, DocbridgeResult, StoreResult};

/// Lifecycle state of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connect has been attempted.
    #[default]
    Uninitialized,
    /// A connect is in flight.
    Connecting,
    /// A session is open.
    Connected,
    /// `close_all` released the session.
    Closed,
}

/// A cached handle to one database.
///
/// Clones are cheap and share the underlying session.
#[derive(Clone)]
pub struct DatabaseHandle {
    name: Arc<str>,
    backend: Arc<dyn DatabaseBackend>,
}

impl DatabaseHandle {
    fn new(name: &str, backend: Arc<dyn DatabaseBackend>) -> Self {
        Self {
            name: Arc::from(name),
            backend,
        }
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backend view.
    pub fn backend(&self) -> &Arc<dyn DatabaseBackend> {
        &self.backend
    }

    /// Whether both handles are the same cached entry.
    pub fn same_as(&self, other: &DatabaseHandle) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend)
    }

    /// Run one command against `collection`.
    pub async fn execute(&self, collection: &str, command: Command) -> StoreResult<Reply> {
        self.backend.execute(collection, command).await
    }
}

impl fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    session: Option<Arc<dyn Session>>,
    handles: HashMap<String, DatabaseHandle>,
}

impl Inner {
    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
            && self.session.as_ref().is_some_and(|s| s.is_alive())
    }
}

/// Owner of the store session and the per-database handle cache.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    inner: RwLock<Inner>,
    connect_lock: Mutex<()>,
}

impl ConnectionManager {
    /// Create an unconnected manager.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            inner: RwLock::new(Inner::default()),
            connect_lock: Mutex::new(()),
        }
    }

    /// Open the session if it is not already open.
    ///
    /// On failure the manager returns to the state it was in before.
    pub async fn connect(&self, uri: &str) -> StoreResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let _flight = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let previous = {
            let mut inner = self.inner.write();
            let previous = inner.state;
            inner.state = ConnectionState::Connecting;
            previous
        };
        debug!(uri = %uri, "connecting");

        match self.connector.connect(uri).await {
            Ok(session) => {
                let mut inner = self.inner.write();
                inner.session = Some(session);
                inner.handles.clear();
                inner.state = ConnectionState::Connected;
                info!(uri = %uri, "store session opened");
                Ok(())
            }
            Err(e) => {
                self.inner.write().state = previous;
                warn!(uri = %uri, error = %e, "connect failed");
                Err(e)
            }
        }
    }

    /// Whether a live session is open.
    pub fn is_connected(&self) -> bool {
        self.inner.read().is_connected()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.read().state
    }

    /// Names of the cached database handles, sorted.
    pub fn cached_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().handles.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the handle for `name`, creating and caching it on first use.
    pub fn get_database(&self, name: &str) -> DocbridgeResult<DatabaseHandle> {
        {
            let inner = self.inner.read();
            if !inner.is_connected() {
                return Err(not_connected(inner.state, name));
            }
            if let Some(handle) = inner.handles.get(name) {
                return Ok(handle.clone());
            }
        }

        let mut inner = self.inner.write();
        if !inner.is_connected() {
            return Err(not_connected(inner.state, name));
        }
        let Inner {
            session, handles, ..
        } = &mut *inner;
        let handle = match session {
            Some(session) => handles
                .entry(name.to_string())
                .or_insert_with(|| {
                    debug!(database = %name, "database handle created");
                    DatabaseHandle::new(name, session.database(name))
                })
                .clone(),
            None => return Err(not_connected(ConnectionState::Uninitialized, name)),
        };
        Ok(handle)
    }

    /// Drop every handle and release the session.
    pub async fn close_all(&self) {
        let _flight = self.connect_lock.lock().await;
        let (session, dropped) = {
            let mut inner = self.inner.write();
            inner.state = ConnectionState::Closed;
            let dropped = inner.handles.len();
            inner.handles.clear();
            (inner.session.take(), dropped)
        };
        if let Some(session) = session {
            session.close().await;
        }
        info!(handles = dropped, "store session closed");
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ConnectionManager")
            .field("state", &inner.state)
            .field("databases", &inner.handles.len())
            .finish_non_exhaustive()
    }
}

fn not_connected(state: ConnectionState, database: &str) -> DocbridgeError {
    DocbridgeError::not_connected(format!(
        "cannot open database '{database}' while {state:?}"
    ))
}
