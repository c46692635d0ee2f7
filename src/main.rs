//! txcache - demo host.
//!
//! Serves a batch of simulated requests on blocking worker threads. Every
//! request reads a course's table of contents through the transaction cache
//! and edits the course inside a transaction, some of which roll back.

use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use txcache::cache::{Cached, Clock, LocalCacheStore, SystemClock, TypedCache};
use txcache::config::Config;
use txcache::{CacheStore, Connection, ScopedSingletons, SingletonRegistry, TransactionCache};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableOfContents {
    course_id: usize,
    revision: usize,
    chapters: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file first (before anything else)
    dotenvy::dotenv().ok();

    // If RUST_LOG is not set, default to "info" level for our crate
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("txcache=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting txcache demo...");

    let config = Config::from_env()?;
    info!("Configuration loaded: {:?}", config);

    let store: Arc<dyn CacheStore> =
        Arc::new(LocalCacheStore::new(config.cache_name.clone(), config.cache.clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let registry = TransactionCache::register(
        SingletonRegistry::builder().register_default::<Connection>()?,
        store,
        clock,
    )?
    .build();

    let mut handles = Vec::with_capacity(config.worker_requests);
    for request_id in 0..config.worker_requests {
        let registry = Arc::clone(&registry);
        handles.push(tokio::task::spawn_blocking(move || {
            serve_request(registry, request_id)
        }));
    }

    for handle in handles {
        match handle.await? {
            Ok(summary) => info!("{}", summary),
            Err(err) => warn!("Request failed: {:#}", err),
        }
    }

    info!("Demo finished");
    Ok(())
}

/// Handle one simulated request on the current worker thread.
fn serve_request(registry: Arc<SingletonRegistry>, request_id: usize) -> anyhow::Result<String> {
    let singletons = ScopedSingletons::new(registry);
    let request = singletons.begin_request();

    let conn = request.instance::<Connection>()?;
    let cache = request.instance::<TransactionCache>()?;
    let tocs: TypedCache<TableOfContents> = TypedCache::new(Rc::clone(&cache), "course");

    let course_id = request_id % 3;
    let id = format!("{}:toc", course_id);

    let cached = match tocs.get(&id) {
        Some(Cached::Value(toc)) => format!("hit r{}", toc.revision),
        Some(Cached::Invalidated) | None => {
            let toc = TableOfContents {
                course_id,
                revision: request_id,
                chapters: vec!["introduction".into(), "exercises".into()],
            };
            if tocs.insert(&id, &toc) {
                "miss".to_string()
            } else {
                "miss, newer entry kept".to_string()
            }
        }
    };

    let edit: anyhow::Result<()> = conn.atomic(|conn| {
        tocs.invalidate(&id);

        // Nested savepoint that always rolls back.
        let _ = conn.atomic(|_| -> anyhow::Result<()> {
            tocs.invalidate_many(&["0:toc", "1:toc", "2:toc"]);
            anyhow::bail!("savepoint discarded")
        });

        if request_id % 4 == 3 {
            anyhow::bail!("edit of course {} rejected", course_id);
        }
        Ok(())
    });

    let outcome = match edit {
        Ok(()) => "committed",
        Err(_) => "rolled back",
    };

    Ok(format!(
        "request {} course {}: cache {}, edit {}",
        request_id, course_id, cached, outcome
    ))
}
