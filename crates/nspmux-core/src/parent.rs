//! Dynamic namespaces.
//!
//! A [`ParentNamespace`] matches requested names that have no exact
//! registration. Each accepted name becomes an ordinary child namespace that
//! starts with the parent's middleware and connection handlers.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use nspmux_codec::Value;
use parking_lot::RwLock;
use regex::Regex;
use tracing::debug;

use crate::broadcast::BroadcastOperator;
use crate::error::{AdmissionError, Result};
use crate::handshake::Query;
use crate::namespace::{boxed_middleware, ConnectionHandler, Middleware, Namespace};
use crate::server::AdapterFactory;
use crate::socket::Socket;

/// Async test deciding whether a requested name becomes a child namespace.
pub type Predicate = Arc<dyn Fn(String, Query) -> BoxFuture<'static, bool> + Send + Sync>;

/// How a parent namespace recognizes its children.
#[derive(Clone)]
pub enum Matcher {
    Regex(Regex),
    Predicate(Predicate),
}

impl Matcher {
    /// Compile `pattern`. Unanchored patterns match anywhere in the name.
    pub fn regex(pattern: &str) -> std::result::Result<Self, regex::Error> {
        Ok(Self::Regex(Regex::new(pattern)?))
    }

    pub fn predicate<F, Fut>(predicate: F) -> Self
    where
        F: Fn(String, Query) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self::Predicate(Arc::new(move |name: String, query: Query| {
            predicate(name, query).boxed()
        }))
    }

    pub async fn matches(&self, name: &str, query: &Query) -> bool {
        match self {
            Matcher::Regex(regex) => regex.is_match(name),
            Matcher::Predicate(predicate) => predicate(name.to_string(), query.clone()).await,
        }
    }
}

impl From<Regex> for Matcher {
    fn from(regex: Regex) -> Self {
        Self::Regex(regex)
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Regex(regex) => f.debug_tuple("Regex").field(&regex.as_str()).finish(),
            Matcher::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

/// Template and broadcast group for dynamically created namespaces.
pub struct ParentNamespace {
    matcher: Matcher,
    adapter_factory: AdapterFactory,
    middleware: RwLock<Vec<Middleware>>,
    connection_handlers: RwLock<Vec<ConnectionHandler>>,
    children: RwLock<Vec<Arc<Namespace>>>,
}

impl ParentNamespace {
    pub(crate) fn new(matcher: Matcher, adapter_factory: AdapterFactory) -> Arc<Self> {
        Arc::new(Self {
            matcher,
            adapter_factory,
            middleware: RwLock::new(Vec::new()),
            connection_handlers: RwLock::new(Vec::new()),
            children: RwLock::new(Vec::new()),
        })
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Middleware copied into children created after this call.
    pub fn use_middleware<F, Fut>(&self, middleware: F) -> &Self
    where
        F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), AdmissionError>> + Send + 'static,
    {
        self.middleware.write().push(boxed_middleware(middleware));
        self
    }

    /// Connection handler copied into children created after this call.
    pub fn on_connection<F>(&self, handler: F) -> &Self
    where
        F: Fn(&Arc<Socket>) + Send + Sync + 'static,
    {
        self.connection_handlers.write().push(Arc::new(handler));
        self
    }

    pub fn children(&self) -> Vec<Arc<Namespace>> {
        self.children.read().clone()
    }

    pub(crate) fn create_child(&self, name: &str) -> Arc<Namespace> {
        debug!(nsp = %name, matcher = ?self.matcher, "creating dynamic namespace");
        let child = Namespace::with_inherited(
            name.to_string(),
            (self.adapter_factory)(name),
            self.middleware.read().clone(),
            self.connection_handlers.read().clone(),
        );
        self.children.write().push(Arc::clone(&child));
        child
    }

    fn operator(&self) -> BroadcastOperator {
        BroadcastOperator::new(self.children())
    }

    /// Target a room in every child.
    pub fn to(&self, room: impl Into<String>) -> BroadcastOperator {
        self.operator().to(room)
    }

    pub fn except(&self, room: impl Into<String>) -> BroadcastOperator {
        self.operator().except(room)
    }

    pub fn volatile(&self) -> BroadcastOperator {
        self.operator().volatile()
    }

    /// Broadcast to every socket of every child.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<()> {
        self.operator().emit(event, args)
    }
}

impl fmt::Debug for ParentNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParentNamespace")
            .field("matcher", &self.matcher)
            .field("children", &self.children.read().len())
            .finish()
    }
}
