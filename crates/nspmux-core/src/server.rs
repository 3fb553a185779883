use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use nspmux_codec::ROOT_NSP;
use nspmux_transport::Connection;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::adapter::{Adapter, MemoryAdapter};
use crate::client::{self, Client, ClientHandle};
use crate::config::ServerConfig;
use crate::handshake::Query;
use crate::namespace::Namespace;
use crate::parent::{Matcher, ParentNamespace};

/// Builds the adapter for a namespace, given its name.
pub type AdapterFactory = Arc<dyn Fn(&str) -> Arc<dyn Adapter> + Send + Sync>;

struct ServerInner {
    config: Arc<ServerConfig>,
    adapter_factory: AdapterFactory,
    nsps: RwLock<HashMap<String, Arc<Namespace>>>,
    parents: RwLock<Vec<Arc<ParentNamespace>>>,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

/// Owns the namespace registries and the live connections.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server with in-memory room storage.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_adapter(
            config,
            Arc::new(|_: &str| Arc::new(MemoryAdapter::new()) as Arc<dyn Adapter>),
        )
    }

    /// Create a server whose namespaces use adapters from `factory`.
    pub fn with_adapter(config: ServerConfig, factory: AdapterFactory) -> Self {
        let server = Self {
            inner: Arc::new(ServerInner {
                config: Arc::new(config),
                adapter_factory: factory,
                nsps: RwLock::new(HashMap::new()),
                parents: RwLock::new(Vec::new()),
                clients: Mutex::new(HashMap::new()),
            }),
        };
        server.of(ROOT_NSP);
        server
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub(crate) fn shared_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.inner.config)
    }

    /// The `/` namespace.
    pub fn sockets(&self) -> Arc<Namespace> {
        self.of(ROOT_NSP)
    }

    /// Look up or create the namespace `name`.
    ///
    /// `""` means `/`, and a missing leading slash is added.
    pub fn of(&self, name: &str) -> Arc<Namespace> {
        let name = canonical_name(name);
        if let Some(nsp) = self.inner.nsps.read().get(&name) {
            return Arc::clone(nsp);
        }
        let mut nsps = self.inner.nsps.write();
        let nsp = nsps.entry(name.clone()).or_insert_with(|| {
            debug!(nsp = %name, "initializing namespace");
            Namespace::new(name.clone(), (self.inner.adapter_factory)(&name))
        });
        Arc::clone(nsp)
    }

    /// Register a parent whose matcher creates namespaces on demand.
    pub fn of_dynamic(&self, matcher: impl Into<Matcher>) -> Arc<ParentNamespace> {
        let parent = ParentNamespace::new(matcher.into(), Arc::clone(&self.inner.adapter_factory));
        self.inner.parents.write().push(Arc::clone(&parent));
        parent
    }

    /// Existing namespace with this exact name.
    pub fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.inner.nsps.read().get(name).cloned()
    }

    /// Registered namespace names, sorted.
    pub fn namespace_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.nsps.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn has_dynamic_namespaces(&self) -> bool {
        !self.inner.parents.read().is_empty()
    }

    /// Ask each parent, in registration order, whether `name` should exist.
    pub(crate) async fn check_namespace(&self, name: &str, query: &Query) -> Option<Arc<Namespace>> {
        let parents = self.inner.parents.read().clone();
        for parent in parents {
            if !parent.matcher().matches(name, query).await {
                continue;
            }
            let mut nsps = self.inner.nsps.write();
            let nsp = nsps
                .entry(name.to_string())
                .or_insert_with(|| parent.create_child(name));
            return Some(Arc::clone(nsp));
        }
        None
    }

    /// Start multiplexing `connection`. Must run inside a tokio runtime.
    pub fn attach(&self, connection: Connection) -> ClientHandle {
        client::spawn(self.clone(), connection)
    }

    pub(crate) fn register_client(&self, client: Arc<Client>) {
        self.inner
            .clients
            .lock()
            .insert(client.id().to_string(), client);
    }

    pub(crate) fn remove_client(&self, id: &str) {
        self.inner.clients.lock().remove(id);
    }

    /// Number of live connections.
    pub fn clients_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Force every live connection closed.
    pub fn close(&self) {
        let clients: Vec<Arc<Client>> = self
            .inner
            .clients
            .lock()
            .drain()
            .map(|(_, client)| client)
            .collect();
        info!(clients = clients.len(), "closing server");
        for client in clients {
            client.close();
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.inner.config)
            .field("namespaces", &self.namespace_names())
            .field("parents", &self.inner.parents.read().len())
            .field("clients", &self.clients_count())
            .finish()
    }
}

fn canonical_name(name: &str) -> String {
    if name.is_empty() {
        ROOT_NSP.to_string()
    } else if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_canonicalized() {
        let server = Server::default();
        assert!(Arc::ptr_eq(&server.of(""), &server.of("/")));
        assert!(Arc::ptr_eq(&server.of("chat"), &server.of("/chat")));
        assert_eq!(server.namespace_names(), vec!["/", "/chat"]);
    }

    #[tokio::test]
    async fn exact_names_win_and_parents_run_in_order() {
        let server = Server::default();
        let exact = server.of("/room-1");
        let first = server.of_dynamic(Matcher::regex(r"^/room-").unwrap());
        let second = server.of_dynamic(Matcher::regex(r"^/room-2").unwrap());

        let query = Query::new();
        assert!(server.namespace("/room-1").is_some_and(|nsp| Arc::ptr_eq(&nsp, &exact)));

        let created = server.check_namespace("/room-2", &query).await.unwrap();
        assert_eq!(created.name(), "/room-2");
        assert_eq!(first.children().len(), 1);
        assert!(second.children().is_empty());

        let again = server.check_namespace("/room-2", &query).await.unwrap();
        assert!(Arc::ptr_eq(&created, &again));
        assert_eq!(first.children().len(), 1);

        assert!(server.check_namespace("/other", &query).await.is_none());
    }
}
