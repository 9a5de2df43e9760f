use crate::catalog::DialectCatalog;
use crate::charset::{CharsetDecoder, CharsetHandle};
use crate::config::{AtlasConfig, ManagerSettings};
use crate::handle::{DbDriver, PooledHandle};
use crate::introspect::extract_schema;
use crate::locks::{lock_or_recover, read_or_recover, write_or_recover};
use crate::metadata_cache::{CacheSlot, CacheState, MetadataCache, SharedLoad, load_metadata_cache};
use crate::params::{ConnectionId, ConnectionParams, Dialect};
use crate::schema::SchemaInfo;
use crate::DbError;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Releases a registration gate; the last holder removes it from the map.
struct OpeningGuard<'a> {
    manager: &'a ConnectionManager,
    id: ConnectionId,
    gate: Arc<AsyncMutex<()>>,
    lock: Option<OwnedMutexGuard<()>>,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        self.lock.take();

        let mut opening = lock_or_recover(&self.manager.opening, "Registration gates");
        // one reference in the map, one here: nobody else is waiting
        if Arc::strong_count(&self.gate) == 2 {
            opening.remove(&self.id);
        }
    }
}

/// One registered tenant database: a pooled handle plus its metadata cache.
pub struct ConnectionEntry {
    id: ConnectionId,
    params: ConnectionParams,
    handle: Arc<dyn PooledHandle>,
    catalog: Arc<DialectCatalog>,
    created_at: DateTime<Utc>,
    last_used: Mutex<Instant>,
    cache: Mutex<CacheSlot>,
}

impl ConnectionEntry {
    fn new(
        id: ConnectionId,
        params: ConnectionParams,
        handle: Arc<dyn PooledHandle>,
        catalog: Arc<DialectCatalog>,
    ) -> Self {
        Self {
            id,
            params,
            handle,
            catalog,
            created_at: Utc::now(),
            last_used: Mutex::new(Instant::now()),
            cache: Mutex::new(CacheSlot::default()),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn dialect(&self) -> Dialect {
        self.params.dialect
    }

    pub fn handle(&self) -> &Arc<dyn PooledHandle> {
        &self.handle
    }

    pub fn catalog(&self) -> &Arc<DialectCatalog> {
        &self.catalog
    }

    /// The configuration-sourced entry, exempt from every eviction.
    pub fn is_default(&self) -> bool {
        self.id.is_default()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        *lock_or_recover(&self.last_used, "Last-used timestamp")
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_used())
    }

    pub fn touch(&self) {
        *lock_or_recover(&self.last_used, "Last-used timestamp") = Instant::now();
    }

    pub fn cache_state(&self) -> CacheState {
        lock_or_recover(&self.cache, "Metadata cache").state()
    }

    /// The loaded cache, without triggering a load.
    pub fn cached_metadata(&self) -> Option<Arc<MetadataCache>> {
        lock_or_recover(&self.cache, "Metadata cache").cache.clone()
    }

    /// Returns the metadata cache, loading it on first use.
    ///
    /// Concurrent callers share one load: the first installs it, the rest
    /// await the same future and get the same `Arc`.
    pub async fn metadata_cache(self: &Arc<Self>) -> Arc<MetadataCache> {
        let load = {
            let mut slot = lock_or_recover(&self.cache, "Metadata cache");
            if let Some(cache) = &slot.cache {
                return Arc::clone(cache);
            }

            match &slot.in_flight {
                Some(load) => load.clone(),
                None => {
                    let load = self.start_load(slot.generation);
                    slot.in_flight = Some(load.clone());
                    load
                }
            }
        };

        load.await
    }

    /// Drops the cache and any in-flight load, then loads again.
    pub async fn refresh_metadata_cache(self: &Arc<Self>) -> Arc<MetadataCache> {
        let load = {
            let mut slot = lock_or_recover(&self.cache, "Metadata cache");
            slot.reset();
            let load = self.start_load(slot.generation);
            slot.in_flight = Some(load.clone());
            load
        };

        info!("[CACHE] Refreshing metadata for {}", self.id);
        load.await
    }

    /// Drops the cache and any in-flight load. The next access reloads.
    pub fn invalidate_metadata_cache(&self) {
        lock_or_recover(&self.cache, "Metadata cache").reset();
    }

    fn start_load(self: &Arc<Self>, generation: u64) -> SharedLoad {
        let handle = Arc::clone(&self.handle);
        let catalog = Arc::clone(&self.catalog);
        let entry = Arc::downgrade(self);

        async move {
            let cache = Arc::new(load_metadata_cache(handle.as_ref(), &catalog).await);

            if let Some(entry) = entry.upgrade() {
                let stored = lock_or_recover(&entry.cache, "Metadata cache").complete(generation, &cache);
                if !stored {
                    debug!("[CACHE] Discarding superseded load for {}", entry.id);
                }
            }

            cache
        }
        .boxed()
        .shared()
    }

    pub async fn extract_schema(&self, target_database: Option<&str>) -> Result<SchemaInfo, DbError> {
        extract_schema(self.handle.as_ref(), &self.catalog, target_database).await
    }

    fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            id: self.id.clone(),
            dialect: self.dialect(),
            target: self.params.display_target(),
            target_masked: self.params.display_target_masked(),
            is_default: self.is_default(),
            legacy_charset: self.params.legacy_charset.clone(),
            cache_state: self.cache_state(),
            created_at: self.created_at,
            idle_secs: self.idle_for().as_secs(),
        }
    }
}

/// Non-secret view of a registered connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub dialect: Dialect,
    pub target: String,
    pub target_masked: String,
    pub is_default: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy_charset: Option<String>,
    pub cache_state: CacheState,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
}

/// Owns every pooled handle in the process, keyed by `ConnectionId`.
///
/// The connection table is the only shared mutable state. Network I/O never
/// happens while it is locked: handles are opened before insertion and
/// closed after removal.
pub struct ConnectionManager {
    settings: ManagerSettings,
    drivers: RwLock<HashMap<Dialect, Arc<dyn DbDriver>>>,
    catalogs: RwLock<HashMap<Dialect, Arc<DialectCatalog>>>,
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionEntry>>>,
    /// Per-id gate held while a pool is being opened, so concurrent
    /// registrations of one target share a single connect.
    opening: Mutex<HashMap<ConnectionId, Arc<AsyncMutex<()>>>>,
    shut_down: AtomicBool,
}

impl ConnectionManager {
    pub fn new(settings: ManagerSettings) -> Self {
        Self {
            settings,
            drivers: RwLock::new(HashMap::new()),
            catalogs: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            opening: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn register_driver(&self, driver: Arc<dyn DbDriver>) {
        let dialect = driver.dialect();
        if write_or_recover(&self.drivers, "Driver registry")
            .insert(dialect, driver)
            .is_some()
        {
            debug!("[CONNECT] Replaced driver for {}", dialect);
        }
    }

    /// Overrides the embedded catalog for one dialect. Affects connections
    /// registered afterwards.
    pub fn register_catalog(&self, catalog: DialectCatalog) {
        write_or_recover(&self.catalogs, "Catalog registry")
            .insert(catalog.dialect, Arc::new(catalog));
    }

    pub fn catalog_for(&self, dialect: Dialect) -> Result<Arc<DialectCatalog>, DbError> {
        if let Some(catalog) = read_or_recover(&self.catalogs, "Catalog registry").get(&dialect) {
            return Ok(Arc::clone(catalog));
        }
        DialectCatalog::builtin(dialect)
    }

    fn driver_for(&self, dialect: Dialect) -> Result<Arc<dyn DbDriver>, DbError> {
        read_or_recover(&self.drivers, "Driver registry")
            .get(&dialect)
            .cloned()
            .ok_or_else(|| DbError::NotSupported(format!("no driver registered for {}", dialect)))
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), DbError> {
        if self.is_shut_down() {
            return Err(DbError::ConnectionFailed(
                "connection manager is shut down".to_string(),
            ));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        read_or_recover(&self.connections, "Connection table").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        read_or_recover(&self.connections, "Connection table").contains_key(id)
    }

    /// Registers a connection, reusing the entry when its id already exists.
    ///
    /// Returns the id and whether a new pooled handle was opened. At
    /// capacity the least recently used non-default entry is evicted; if
    /// none can be evicted the call fails with `CapacityExceeded`.
    pub async fn register(&self, params: ConnectionParams) -> Result<(ConnectionId, bool), DbError> {
        params.validate()?;
        self.ensure_running()?;

        let id = ConnectionId::from_params(&params);
        let max = self.settings.max_connections;

        let _opening = self.acquire_opening_gate(&id).await;

        {
            let connections = read_or_recover(&self.connections, "Connection table");
            if let Some(existing) = connections.get(&id) {
                existing.touch();
                debug!("[CONNECT] Reusing {} ({})", id, params.display_target_masked());
                return Ok((id, false));
            }

            if connections.len() >= max && !connections.values().any(|e| !e.is_default()) {
                return Err(DbError::CapacityExceeded { max });
            }
        }

        let entry = self.open_entry(id.clone(), params).await?;

        let mut evicted = None;
        let outcome = {
            let mut connections = write_or_recover(&self.connections, "Connection table");

            if let Some(existing) = connections.get(&id) {
                existing.touch();
                Err(Arc::clone(&entry))
            } else {
                if connections.len() >= max {
                    evicted = evict_least_recently_used(&mut connections);
                }

                if connections.len() >= max {
                    Err(Arc::clone(&entry))
                } else {
                    connections.insert(id.clone(), Arc::clone(&entry));
                    Ok(())
                }
            }
        };

        if let Some(evicted) = evicted {
            info!(
                "[POOL] Evicted {} (idle {:?}) to make room for {}",
                evicted.id,
                evicted.idle_for(),
                id
            );
            close_in_background(evicted);
        }

        match outcome {
            Ok(()) => {
                info!(
                    "[CONNECT] Registered {} ({})",
                    id,
                    entry.params.display_target_masked()
                );
                Ok((id, true))
            }
            Err(unused) => {
                close_in_background(unused);
                if self.contains(&id) {
                    debug!("[CONNECT] {} registered concurrently, keeping existing handle", id);
                    Ok((id, false))
                } else {
                    Err(DbError::CapacityExceeded { max })
                }
            }
        }
    }

    async fn acquire_opening_gate(&self, id: &ConnectionId) -> OpeningGuard<'_> {
        let gate = {
            let mut opening = lock_or_recover(&self.opening, "Registration gates");
            Arc::clone(opening.entry(id.clone()).or_default())
        };

        let lock = Arc::clone(&gate).lock_owned().await;
        OpeningGuard {
            manager: self,
            id: id.clone(),
            gate,
            lock: Some(lock),
        }
    }

    /// Installs the process default connection, replacing any previous one.
    ///
    /// Ignores the connection ceiling.
    pub async fn register_default(&self, params: ConnectionParams) -> Result<ConnectionId, DbError> {
        params.validate()?;
        self.ensure_running()?;

        let id = ConnectionId::default_id();
        let entry = self.open_entry(id.clone(), params).await?;
        let target = entry.params.display_target_masked();

        let previous = write_or_recover(&self.connections, "Connection table").insert(id.clone(), entry);
        if let Some(previous) = previous {
            info!("[CONNECT] Replacing default connection {}", previous.params.display_target_masked());
            close_in_background(previous);
        }

        info!("[CONNECT] Default connection set to {}", target);
        Ok(id)
    }

    /// Registers `config.default_connection`, if there is one.
    pub async fn register_configured_default(
        &self,
        config: &AtlasConfig,
    ) -> Result<Option<ConnectionId>, DbError> {
        match &config.default_connection {
            Some(params) => self.register_default(params.clone()).await.map(Some),
            None => Ok(None),
        }
    }

    async fn open_entry(
        &self,
        id: ConnectionId,
        params: ConnectionParams,
    ) -> Result<Arc<ConnectionEntry>, DbError> {
        let driver = self.driver_for(params.dialect)?;
        let catalog = self.catalog_for(params.dialect)?;

        let started = std::time::Instant::now();
        let handle = driver
            .connect(&params, &self.settings.pool_settings())
            .await?;
        info!(
            "[CONNECT] Opened pool for {} in {:.2?}",
            params.display_target_masked(),
            started.elapsed()
        );

        let handle: Arc<dyn PooledHandle> = match params.legacy_charset.as_deref() {
            Some(label) if !label.trim().is_empty() => {
                info!("[CHARSET] Recovering legacy text as {} for {}", label, id);
                Arc::new(CharsetHandle::new(handle, CharsetDecoder::new(label)))
            }
            _ => handle,
        };

        Ok(Arc::new(ConnectionEntry::new(id, params, handle, catalog)))
    }

    /// Looks up an entry and refreshes its last-used time.
    ///
    /// Without an id: the default entry, else the only entry, else `None`.
    pub fn resolve(&self, id: Option<&ConnectionId>) -> Option<Arc<ConnectionEntry>> {
        let entry = {
            let connections = read_or_recover(&self.connections, "Connection table");
            match id {
                Some(id) => connections.get(id).cloned(),
                None => connections
                    .get(&ConnectionId::default_id())
                    .cloned()
                    .or_else(|| {
                        if connections.len() == 1 {
                            connections.values().next().cloned()
                        } else {
                            None
                        }
                    }),
            }
        };

        if let Some(entry) = &entry {
            entry.touch();
        }
        entry
    }

    fn require(&self, id: Option<&ConnectionId>) -> Result<Arc<ConnectionEntry>, DbError> {
        self.resolve(id).ok_or_else(|| match id {
            Some(id) => DbError::UnknownConnection(id.to_string()),
            None => DbError::UnknownConnection(
                "no default connection and more than one registered".to_string(),
            ),
        })
    }

    /// Removes an entry and closes its handle. `false` when the id is unknown.
    pub async fn disconnect(&self, id: &ConnectionId) -> bool {
        let removed = write_or_recover(&self.connections, "Connection table").remove(id);
        let Some(entry) = removed else {
            return false;
        };

        entry.invalidate_metadata_cache();
        if let Err(e) = entry.handle.close().await {
            warn!("[CONNECT] Closing {} failed: {}", id, e);
        }

        info!("[CONNECT] Disconnected {}", id);
        true
    }

    /// Closes every handle and refuses further registrations.
    pub async fn destroy_all(&self) {
        self.shut_down.store(true, Ordering::SeqCst);

        let entries: Vec<Arc<ConnectionEntry>> = write_or_recover(&self.connections, "Connection table")
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        let closes = entries.iter().map(|entry| async move {
            entry.invalidate_metadata_cache();
            (entry.id(), entry.handle.close().await)
        });

        for (id, result) in futures::future::join_all(closes).await {
            if let Err(e) = result {
                warn!("[CONNECT] Closing {} during shutdown failed: {}", id, e);
            }
        }

        info!("[CONNECT] Closed {} connections", entries.len());
    }

    /// Non-secret summaries, default first, then by id.
    pub fn list_connections(&self) -> Vec<ConnectionSummary> {
        let mut summaries: Vec<ConnectionSummary> = read_or_recover(&self.connections, "Connection table")
            .values()
            .map(|entry| entry.summary())
            .collect();

        summaries.sort_by(|a, b| b.is_default.cmp(&a.is_default).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    /// Evicts every non-default entry idle for longer than the TTL.
    ///
    /// Handles are closed in the background; the evicted ids are returned.
    pub fn sweep_idle(&self) -> Vec<ConnectionId> {
        let ttl = self.settings.idle_ttl();

        let expired: Vec<Arc<ConnectionEntry>> = {
            let mut connections = write_or_recover(&self.connections, "Connection table");
            let ids: Vec<ConnectionId> = connections
                .values()
                .filter(|entry| !entry.is_default() && entry.idle_for() > ttl)
                .map(|entry| entry.id.clone())
                .collect();
            ids.iter().filter_map(|id| connections.remove(id)).collect()
        };

        let ids = expired.iter().map(|entry| entry.id.clone()).collect();
        for entry in expired {
            info!("[SWEEP] Evicting {} after {:?} idle", entry.id, entry.idle_for());
            close_in_background(entry);
        }
        ids
    }

    /// Runs `sweep_idle` every half TTL until the manager is dropped or shut
    /// down.
    pub fn start_idle_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let period = (self.settings.idle_ttl() / 2).max(Duration::from_secs(1));
        let manager = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if manager.is_shut_down() {
                    break;
                }

                let evicted = manager.sweep_idle();
                if !evicted.is_empty() {
                    debug!("[SWEEP] {} idle connections evicted", evicted.len());
                }
            }

            debug!("[SWEEP] Idle sweeper stopped");
        })
    }

    pub async fn extract_schema(
        &self,
        id: Option<&ConnectionId>,
        target_database: Option<&str>,
    ) -> Result<SchemaInfo, DbError> {
        self.require(id)?.extract_schema(target_database).await
    }

    pub async fn ping(&self, id: Option<&ConnectionId>) -> Result<(), DbError> {
        self.require(id)?.handle.ping().await
    }

    /// Cached metadata for an entry, loading it on first use. `None` when
    /// the entry does not resolve.
    pub async fn get_or_init_cache(&self, id: Option<&ConnectionId>) -> Option<Arc<MetadataCache>> {
        let entry = self.resolve(id)?;
        Some(entry.metadata_cache().await)
    }

    pub async fn refresh_cache(&self, id: Option<&ConnectionId>) -> Option<Arc<MetadataCache>> {
        let entry = self.resolve(id)?;
        Some(entry.refresh_metadata_cache().await)
    }

    pub fn invalidate_cache(&self, id: Option<&ConnectionId>) -> bool {
        match self.resolve(id) {
            Some(entry) => {
                entry.invalidate_metadata_cache();
                debug!("[CACHE] Invalidated metadata for {}", entry.id);
                true
            }
            None => false,
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ManagerSettings::default())
    }
}

/// Removes the non-default entry with the oldest `last_used`.
fn evict_least_recently_used(
    connections: &mut HashMap<ConnectionId, Arc<ConnectionEntry>>,
) -> Option<Arc<ConnectionEntry>> {
    let victim = connections
        .values()
        .filter(|entry| !entry.is_default())
        .min_by_key(|entry| entry.last_used())?
        .id
        .clone();
    connections.remove(&victim)
}

fn close_in_background(entry: Arc<ConnectionEntry>) {
    entry.invalidate_metadata_cache();

    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if let Err(e) = entry.handle.close().await {
                    warn!("[POOL] Background close of {} failed: {}", entry.id, e);
                }
            });
        }
        Err(_) => warn!("[POOL] No runtime to close {}; handle dropped", entry.id),
    }
}
