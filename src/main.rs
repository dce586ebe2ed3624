use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use clap::Parser;
use distributed_cache::cache::handlers::{
    handle_delete, handle_get, handle_list_caches, handle_put, handle_stats,
};
use distributed_cache::membership::MembershipProvider;
use distributed_cache::membership::service::MembershipService;
use distributed_cache::rpc::Transport;
use distributed_cache::rpc::handlers::handle_rpc;
use distributed_cache::rpc::http::HttpTransport;
use distributed_cache::rpc::protocol::ENDPOINT_RPC;
use distributed_cache::{CacheConfig, CacheManager, NodeId};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// A distributed cache node. Gossip runs on the bind address, HTTP (RPC and
/// REST) on the same IP with the port shifted by 1000.
#[derive(Debug, Parser)]
#[command(name = "cache-node", version)]
struct Args {
    /// Gossip address of this node.
    #[arg(long, env = "CACHE_BIND")]
    bind: SocketAddr,

    /// Gossip address of an existing member. Repeatable.
    #[arg(long = "seed", env = "CACHE_SEEDS", value_delimiter = ',')]
    seeds: Vec<SocketAddr>,

    /// JSON file mapping cache names to configurations.
    #[arg(long, env = "CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Node id. Generated when omitted.
    #[arg(long, env = "CACHE_NODE_ID")]
    node_id: Option<String>,
}

/// Offset between the gossip port and the HTTP port of a node.
const HTTP_PORT_OFFSET: u16 = 1000;

fn http_addr_for(bind: SocketAddr) -> anyhow::Result<SocketAddr> {
    let port = bind.port().checked_add(HTTP_PORT_OFFSET).ok_or_else(|| {
        anyhow::anyhow!(
            "gossip port {} leaves no room for the HTTP port (+{})",
            bind.port(),
            HTTP_PORT_OFFSET
        )
    })?;
    Ok(SocketAddr::new(bind.ip(), port))
}

fn load_caches(path: Option<&PathBuf>) -> anyhow::Result<BTreeMap<String, CacheConfig>> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(BTreeMap::from([(
            "default".to_string(),
            CacheConfig::distributed(2),
        )])),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let caches = load_caches(args.config.as_ref())?;

    tracing::info!("Starting node on {}", args.bind);
    if !args.seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", args.seeds);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Membership (UDP gossip):
    let http_addr = http_addr_for(args.bind)?;
    let node_id = args.node_id.map(NodeId).unwrap_or_default();
    let membership = MembershipService::new(node_id, args.bind, http_addr, args.seeds).await?;
    tracing::info!("Node ID: {}", membership.local_node.id);

    // 2. Cache manager over the HTTP transport:
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(membership.clone()));
    let provider: Arc<dyn MembershipProvider> = membership.clone();
    let manager = CacheManager::builder()
        .transport(transport)
        .membership(provider)
        .build()?;
    for (name, config) in caches {
        manager.define_configuration(&name, config)?;
    }

    // 3. HTTP Router:
    let app = Router::new()
        .route(ENDPOINT_RPC, post(handle_rpc))
        .route("/cache", get(handle_list_caches))
        .route("/cache/:cache/stats", get(handle_stats))
        .route(
            "/cache/:cache/:key",
            get(handle_get).put(handle_put).delete(handle_delete),
        )
        .layer(Extension(manager.request_handler()))
        .layer(Extension(manager.clone()));

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    tracing::info!("HTTP server listening on {}", http_addr);

    // 4. Join: gossip first, then the caches follow its views.
    tokio::spawn(membership.clone().start());
    manager.init().await?;

    // 5. Spawn stats reporter:
    let stats_manager = manager.clone();
    let stats_membership = membership.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            let alive = stats_membership.get_alive_members();
            tracing::info!("Cluster stats: {} alive nodes", alive.len());
            for name in stats_manager.cache_names() {
                let Ok(cache) = stats_manager.cache::<String, Value>(&name) else {
                    continue;
                };
                let stats = cache.stats();
                let topology = cache.topology().map(|t| t.id).unwrap_or(0);
                tracing::info!(
                    "  - {} topology={} entries={} locks={} hits={} misses={} stores={} evictions={}",
                    name,
                    topology,
                    stats.local_entries,
                    stats.locks_held,
                    stats.hits,
                    stats.misses,
                    stats.stores,
                    stats.evictions
                );
            }
        }
    });

    // 6. Serve until Ctrl+C:
    tracing::info!("Press Ctrl+C to shutdown");
    let shutdown_manager = manager.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
            shutdown_manager.shutdown().await;
        })
        .await?;

    Ok(())
}
