//! Cache manager.
//!
//! Owns every cache of a node, the RPC dispatcher and the membership feed.
//! It is an explicit, cloneable handle with an `init` / `shutdown` lifecycle;
//! caches are addressed by [`CacheId`] in its component arena.

use super::api::Cache;
use super::registry::{CacheComponents, CacheId, ComponentRegistry};
use crate::config::CacheConfig;
use crate::distribution::CacheTopology;
use crate::error::{CacheError, Result};
use crate::interceptors::inbound;
use crate::membership::MembershipProvider;
use crate::membership::types::{ClusterView, NodeId};
use crate::rpc::protocol::{CacheResponse, RpcEnvelope};
use crate::rpc::{RequestHandler, RpcManager, Transport};
use crate::statetransfer::coordinator;
use crate::time::{SystemTimeService, TimeService};
use crate::transaction::table;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerState {
    Created,
    Running,
    Stopped,
}

pub struct CacheManagerBuilder {
    node_id: Option<NodeId>,
    transport: Option<Arc<dyn Transport>>,
    membership: Option<Arc<dyn MembershipProvider>>,
    time: Arc<dyn TimeService>,
}

impl Default for CacheManagerBuilder {
    fn default() -> Self {
        Self {
            node_id: None,
            transport: None,
            membership: None,
            time: Arc::new(SystemTimeService),
        }
    }
}

impl CacheManagerBuilder {
    pub fn node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Clusters the manager. Both a transport and a membership provider are needed.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn membership(mut self, membership: Arc<dyn MembershipProvider>) -> Self {
        self.membership = Some(membership);
        self
    }

    pub fn time_service(mut self, time: Arc<dyn TimeService>) -> Self {
        self.time = time;
        self
    }

    pub fn build(self) -> Result<CacheManager> {
        if self.transport.is_some() != self.membership.is_some() {
            return Err(CacheError::Configuration(
                "a clustered cache manager needs both a transport and a membership provider".into(),
            ));
        }

        let local = match (&self.transport, &self.membership, self.node_id) {
            (Some(transport), Some(membership), configured) => {
                let local = transport.local_node();
                if membership.local_node() != local || configured.as_ref().is_some_and(|id| id != &local) {
                    return Err(CacheError::Configuration(format!(
                        "transport node {} does not match the membership or configured node id",
                        local
                    )));
                }
                local
            }
            (_, _, Some(configured)) => configured,
            _ => NodeId::new(),
        };

        Ok(CacheManager::assemble(
            local,
            self.transport,
            self.membership,
            self.time,
        ))
    }
}

#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    local: NodeId,
    rpc: Arc<RpcManager>,
    transport: Option<Arc<dyn Transport>>,
    membership: Option<Arc<dyn MembershipProvider>>,
    time: Arc<dyn TimeService>,
    registry: ComponentRegistry,
    aliases: RwLock<HashMap<String, String>>,
    state: Mutex<ManagerState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheManager {
    pub fn builder() -> CacheManagerBuilder {
        CacheManagerBuilder::default()
    }

    /// A manager for local caches only.
    pub fn local() -> Self {
        Self::assemble(NodeId::new(), None, None, Arc::new(SystemTimeService))
    }

    fn assemble(
        local: NodeId,
        transport: Option<Arc<dyn Transport>>,
        membership: Option<Arc<dyn MembershipProvider>>,
        time: Arc<dyn TimeService>,
    ) -> Self {
        let rpc = Arc::new(RpcManager::new(local.clone(), transport.clone()));
        Self {
            inner: Arc::new(ManagerInner {
                local,
                rpc,
                transport,
                membership,
                time,
                registry: ComponentRegistry::default(),
                aliases: RwLock::new(HashMap::new()),
                state: Mutex::new(ManagerState::Created),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.inner.local
    }

    pub fn is_clustered(&self) -> bool {
        self.inner.transport.is_some()
    }

    pub fn is_running(&self) -> bool {
        *self.inner.state.lock() == ManagerState::Running
    }

    /// Registers a cache. Invalid or conflicting definitions are rejected here,
    /// before any data operation runs.
    pub fn define_configuration(&self, name: &str, config: CacheConfig) -> Result<CacheId> {
        config.validate()?;
        let state = *self.inner.state.lock();
        if state == ManagerState::Stopped {
            return Err(CacheError::NotRunning("cache manager".into()));
        }
        if name.is_empty() {
            return Err(CacheError::Configuration("cache name must not be empty".into()));
        }
        if self.inner.registry.id_of(name).is_some() || self.inner.aliases.read().contains_key(name) {
            return Err(CacheError::Configuration(format!(
                "cache '{}' is already defined",
                name
            )));
        }
        if config.mode.is_clustered() {
            if self.inner.transport.is_none() {
                return Err(CacheError::Configuration(format!(
                    "cache '{}' is {:?} but the cache manager has no transport",
                    name, config.mode
                )));
            }
            if state == ManagerState::Running {
                return Err(CacheError::Configuration(format!(
                    "clustered cache '{}' must be defined before the cache manager starts",
                    name
                )));
            }
        }

        let components = CacheComponents::new(
            name,
            config,
            self.inner.local.clone(),
            self.inner.time.clone(),
            self.inner.rpc.clone(),
        );
        let id = self.inner.registry.register(components.clone());
        if state == ManagerState::Running {
            components.start()?;
        }
        tracing::info!("Defined cache {} ({:?})", name, id);
        Ok(id)
    }

    pub fn define_alias(&self, alias: &str, cache: &str) -> Result<()> {
        if self.inner.registry.id_of(alias).is_some() {
            return Err(CacheError::Configuration(format!(
                "alias '{}' clashes with a cache name",
                alias
            )));
        }
        if self.inner.registry.id_of(cache).is_none() {
            return Err(CacheError::CacheNotFound(cache.to_string()));
        }
        let mut aliases = self.inner.aliases.write();
        if aliases.contains_key(alias) {
            return Err(CacheError::Configuration(format!(
                "alias '{}' is already defined",
                alias
            )));
        }
        aliases.insert(alias.to_string(), cache.to_string());
        Ok(())
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.inner
            .registry
            .all()
            .iter()
            .map(|cache| cache.name.clone())
            .collect()
    }

    /// Starts every defined cache and joins the cluster.
    pub async fn init(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ManagerState::Running => return Ok(()),
                ManagerState::Stopped => return Err(CacheError::NotRunning("cache manager".into())),
                ManagerState::Created => *state = ManagerState::Running,
            }
        }

        for cache in self.inner.registry.all() {
            cache.start()?;
        }

        let handler: Weak<dyn RequestHandler> = Arc::downgrade(&self.inner) as Weak<ManagerInner>;
        self.inner.rpc.set_local_handler(handler.clone());

        if let Some(transport) = &self.inner.transport {
            transport.start(handler).await?;
        }
        if let Some(membership) = &self.inner.membership {
            let views = membership.subscribe();
            let inner = Arc::downgrade(&self.inner);
            let task = tokio::spawn(watch_membership(inner, views));
            self.inner.tasks.lock().push(task);
        }

        tracing::info!(
            "Cache manager on {} started with {} caches",
            self.inner.local,
            self.inner.registry.all().len()
        );
        Ok(())
    }

    /// Leaves the cluster and stops every cache. Later operations fail with
    /// `NotRunning`.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == ManagerState::Stopped {
                return;
            }
            *state = ManagerState::Stopped;
        }

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(transport) = &self.inner.transport {
            transport.stop().await;
        }
        for cache in self.inner.registry.all() {
            cache.stop();
        }
        tracing::info!("Cache manager on {} stopped", self.inner.local);
    }

    fn resolve(&self, name: &str) -> Result<(CacheId, Arc<CacheComponents>)> {
        let target = self
            .inner
            .aliases
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string());
        let id = self
            .inner
            .registry
            .id_of(&target)
            .ok_or_else(|| CacheError::CacheNotFound(name.to_string()))?;
        let components = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| CacheError::CacheNotFound(name.to_string()))?;
        Ok((id, components))
    }

    /// Typed handle to a cache, by name or alias.
    pub fn cache<K, V>(&self, name: &str) -> Result<Cache<K, V>>
    where
        K: ToString + FromStr,
        <K as FromStr>::Err: Display,
        V: Serialize + DeserializeOwned,
    {
        let (id, components) = self.resolve(name)?;
        Ok(Cache::new(id, components))
    }

    /// Inbound RPC entry point, for serving a transport's endpoint.
    pub fn request_handler(&self) -> Arc<dyn RequestHandler> {
        self.inner.clone()
    }

    pub fn topology(&self, name: &str) -> Result<Option<CacheTopology>> {
        let (_, components) = self.resolve(name)?;
        Ok(components.distribution.topology().map(|t| (*t).clone()))
    }
}

#[async_trait]
impl RequestHandler for ManagerInner {
    async fn handle(&self, envelope: RpcEnvelope) -> Result<CacheResponse> {
        let cache = self
            .registry
            .by_name(&envelope.cache)
            .ok_or_else(|| CacheError::CacheNotFound(envelope.cache.clone()))?;
        inbound::dispatch(&cache, envelope.origin, envelope.command).await
    }
}

impl ManagerInner {
    async fn on_view_change(&self, view: &ClusterView) {
        let is_coordinator = view.is_coordinator(&self.local);
        tracing::info!(
            "{} sees view {} with {} members (coordinator: {})",
            self.local,
            view.view_id,
            view.members.len(),
            is_coordinator
        );

        for cache in self.registry.all() {
            if !cache.is_clustered() || !cache.is_running() {
                continue;
            }
            table::cleanup_leavers(&cache, &view.members);
            if is_coordinator {
                if let Err(e) = coordinator::handle_view_change(&cache, view).await {
                    tracing::error!("Cache {}: topology update for view {} failed: {}", cache.name, view.view_id, e);
                }
            } else {
                cache.topology_manager.step_down().await;
            }
        }
    }
}

/// Feeds membership views to the manager until it is dropped or stopped.
/// Views that do not contain this node yet are skipped.
async fn watch_membership(inner: Weak<ManagerInner>, mut views: watch::Receiver<ClusterView>) {
    loop {
        let view = views.borrow_and_update().clone();
        let Some(manager) = inner.upgrade() else {
            break;
        };
        if view.contains(&manager.local) {
            manager.on_view_change(&view).await;
        }
        drop(manager);

        if views.changed().await.is_err() {
            break;
        }
    }
}
