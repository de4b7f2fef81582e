use crate::core::{
    drop::{AlertChannelKind, DropRepository, TokenDrop},
    error::{TrapError, TrapResult},
    hit::Hit,
    token::Token,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::fs;

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u32,
    window_start: Instant,
}

impl WindowCounter {
    fn current(&self, expiry: Duration) -> u32 {
        if self.window_start.elapsed() >= expiry {
            0
        } else {
            self.count
        }
    }
}

/// Expiring per-token counters shared by both repository backends. Alert
/// accounting and channel failure streaks are runtime state, not part of
/// the persisted drop.
#[derive(Default)]
struct Counters {
    accounting: HashMap<Token, WindowCounter>,
    failures: HashMap<(Token, AlertChannelKind), u32>,
}

impl Counters {
    fn increment_accounting(&mut self, token: &Token, expiry: Duration) -> u32 {
        let now = Instant::now();
        let counter = self
            .accounting
            .entry(token.clone())
            .or_insert(WindowCounter {
                count: 0,
                window_start: now,
            });
        if counter.window_start.elapsed() >= expiry {
            counter.count = 0;
            counter.window_start = now;
        }
        counter.count += 1;
        counter.count
    }

    fn accounting_count(&self, token: &Token, expiry: Duration) -> u32 {
        self.accounting
            .get(token)
            .map(|c| c.current(expiry))
            .unwrap_or(0)
    }

    fn record_failure(&mut self, token: &Token, channel: AlertChannelKind) -> u32 {
        let count = self
            .failures
            .entry((token.clone(), channel))
            .or_insert(0);
        *count += 1;
        *count
    }

    fn clear_failures(&mut self, token: &Token, channel: AlertChannelKind) {
        self.failures.remove(&(token.clone(), channel));
    }
}

/// Bounded per-token hit history with a monotone sequence. The sequence
/// keeps counting across evictions so ordering stays total.
#[derive(Default, Serialize, Deserialize)]
struct HitLog {
    entries: VecDeque<Hit>,
    next_seq: u64,
}

impl HitLog {
    fn append(&mut self, mut hit: Hit, retention: usize) -> Hit {
        hit.seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(hit.clone());
        while self.entries.len() > retention {
            self.entries.pop_front();
        }
        hit
    }
}

// ---------------------------------------------------------------------------
// In-memory repository
// ---------------------------------------------------------------------------

struct MemState {
    drops: HashMap<Token, TokenDrop>,
    hits: HashMap<Token, HitLog>,
    counters: Counters,
}

/// In-memory repository. The single mutex is the per-token critical
/// section: every read-modify-write on drops, history or counters happens
/// under it.
pub struct InMemoryDropRepository {
    state: Mutex<MemState>,
    retention: usize,
}

impl InMemoryDropRepository {
    pub fn new(retention: usize) -> Self {
        Self {
            state: Mutex::new(MemState {
                drops: HashMap::new(),
                hits: HashMap::new(),
                counters: Counters::default(),
            }),
            retention,
        }
    }

    fn lock(&self) -> TrapResult<std::sync::MutexGuard<'_, MemState>> {
        self.state
            .lock()
            .map_err(|e| TrapError::DatabaseError(format!("lock poisoned: {}", e)))
    }
}

#[async_trait]
impl DropRepository for InMemoryDropRepository {
    async fn get(&self, token: &Token) -> TrapResult<Option<TokenDrop>> {
        Ok(self.lock()?.drops.get(token).cloned())
    }

    async fn save(&self, drop: &TokenDrop) -> TrapResult<()> {
        drop.validate()?;
        self.lock()?.drops.insert(drop.token.clone(), drop.clone());
        Ok(())
    }

    async fn remove(&self, token: &Token) -> TrapResult<()> {
        let mut state = self.lock()?;
        state.drops.remove(token);
        state.hits.remove(token);
        Ok(())
    }

    async fn all(&self) -> TrapResult<Vec<TokenDrop>> {
        Ok(self.lock()?.drops.values().cloned().collect())
    }

    async fn record_hit(&self, hit: Hit) -> TrapResult<Hit> {
        let mut state = self.lock()?;
        if !state.drops.contains_key(&hit.token) {
            return Err(TrapError::UnknownDrop(hit.token.to_string()));
        }
        let retention = self.retention;
        let log = state.hits.entry(hit.token.clone()).or_default();
        Ok(log.append(hit, retention))
    }

    async fn hits(&self, token: &Token) -> TrapResult<Vec<Hit>> {
        Ok(self
            .lock()?
            .hits
            .get(token)
            .map(|log| log.entries.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn increment_accounting(&self, token: &Token, expiry: Duration) -> TrapResult<u32> {
        Ok(self.lock()?.counters.increment_accounting(token, expiry))
    }

    async fn accounting_count(&self, token: &Token, expiry: Duration) -> TrapResult<u32> {
        Ok(self.lock()?.counters.accounting_count(token, expiry))
    }

    async fn record_delivery_failure(
        &self,
        token: &Token,
        channel: AlertChannelKind,
    ) -> TrapResult<u32> {
        Ok(self.lock()?.counters.record_failure(token, channel))
    }

    async fn clear_delivery_failures(
        &self,
        token: &Token,
        channel: AlertChannelKind,
    ) -> TrapResult<()> {
        self.lock()?.counters.clear_failures(token, channel);
        Ok(())
    }

    async fn disable_channel(&self, token: &Token, channel: AlertChannelKind) -> TrapResult<()> {
        let mut state = self.lock()?;
        if let Some(drop) = state.drops.get_mut(token) {
            drop.disable_channel(channel);
        }
        state.counters.clear_failures(token, channel);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-backed repository
// ---------------------------------------------------------------------------

#[derive(Default, Serialize, Deserialize)]
struct DbDocument {
    drops: Vec<TokenDrop>,
    hits: HashMap<Token, HitLog>,
}

/// JSON-file repository. Drops and hit history survive restarts; the
/// expiring counters deliberately do not (a restart re-opens the alert
/// window). One async mutex serializes every read-modify-write cycle.
pub struct FileDropRepository {
    db_path: PathBuf,
    io_lock: tokio::sync::Mutex<()>,
    counters: Mutex<Counters>,
    retention: usize,
}

impl FileDropRepository {
    pub fn new<P: AsRef<Path>>(db_path: P, retention: usize) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            io_lock: tokio::sync::Mutex::new(()),
            counters: Mutex::new(Counters::default()),
            retention,
        }
    }

    fn lock_counters(&self) -> TrapResult<std::sync::MutexGuard<'_, Counters>> {
        self.counters
            .lock()
            .map_err(|e| TrapError::DatabaseError(format!("lock poisoned: {}", e)))
    }

    async fn read_db(&self) -> TrapResult<DbDocument> {
        if !self.db_path.exists() {
            return Ok(DbDocument::default());
        }
        let content = fs::read_to_string(&self.db_path)
            .await
            .map_err(|e| TrapError::FileReadError {
                path: self.db_path.clone(),
                source: e,
            })?;
        if content.trim().is_empty() {
            return Ok(DbDocument::default());
        }
        let doc: DbDocument = serde_json::from_str(&content)
            .map_err(|e| TrapError::DatabaseError(format!("failed to parse database: {}", e)))?;
        for drop in &doc.drops {
            drop.validate()?;
        }
        Ok(doc)
    }

    async fn write_db(&self, doc: &DbDocument) -> TrapResult<()> {
        let content = serde_json::to_string_pretty(doc)
            .map_err(|e| TrapError::DatabaseError(format!("failed to serialize database: {}", e)))?;
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| TrapError::FileWriteError {
                        path: parent.to_path_buf(),
                        source: e,
                    })?;
            }
        }
        fs::write(&self.db_path, content)
            .await
            .map_err(|e| TrapError::FileWriteError {
                path: self.db_path.clone(),
                source: e,
            })
    }
}

#[async_trait]
impl DropRepository for FileDropRepository {
    async fn get(&self, token: &Token) -> TrapResult<Option<TokenDrop>> {
        let _guard = self.io_lock.lock().await;
        let doc = self.read_db().await?;
        Ok(doc.drops.into_iter().find(|d| &d.token == token))
    }

    async fn save(&self, drop: &TokenDrop) -> TrapResult<()> {
        drop.validate()?;
        let _guard = self.io_lock.lock().await;
        let mut doc = self.read_db().await?;
        doc.drops.retain(|d| d.token != drop.token);
        doc.drops.push(drop.clone());
        self.write_db(&doc).await
    }

    async fn remove(&self, token: &Token) -> TrapResult<()> {
        let _guard = self.io_lock.lock().await;
        let mut doc = self.read_db().await?;
        doc.drops.retain(|d| &d.token != token);
        doc.hits.remove(token);
        self.write_db(&doc).await
    }

    async fn all(&self) -> TrapResult<Vec<TokenDrop>> {
        let _guard = self.io_lock.lock().await;
        Ok(self.read_db().await?.drops)
    }

    async fn record_hit(&self, hit: Hit) -> TrapResult<Hit> {
        let _guard = self.io_lock.lock().await;
        let mut doc = self.read_db().await?;
        if !doc.drops.iter().any(|d| d.token == hit.token) {
            return Err(TrapError::UnknownDrop(hit.token.to_string()));
        }
        let log = doc.hits.entry(hit.token.clone()).or_default();
        let stored = log.append(hit, self.retention);
        self.write_db(&doc).await?;
        Ok(stored)
    }

    async fn hits(&self, token: &Token) -> TrapResult<Vec<Hit>> {
        let _guard = self.io_lock.lock().await;
        let doc = self.read_db().await?;
        Ok(doc
            .hits
            .get(token)
            .map(|log| log.entries.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn increment_accounting(&self, token: &Token, expiry: Duration) -> TrapResult<u32> {
        Ok(self.lock_counters()?.increment_accounting(token, expiry))
    }

    async fn accounting_count(&self, token: &Token, expiry: Duration) -> TrapResult<u32> {
        Ok(self.lock_counters()?.accounting_count(token, expiry))
    }

    async fn record_delivery_failure(
        &self,
        token: &Token,
        channel: AlertChannelKind,
    ) -> TrapResult<u32> {
        Ok(self.lock_counters()?.record_failure(token, channel))
    }

    async fn clear_delivery_failures(
        &self,
        token: &Token,
        channel: AlertChannelKind,
    ) -> TrapResult<()> {
        self.lock_counters()?.clear_failures(token, channel);
        Ok(())
    }

    async fn disable_channel(&self, token: &Token, channel: AlertChannelKind) -> TrapResult<()> {
        let _guard = self.io_lock.lock().await;
        let mut doc = self.read_db().await?;
        if let Some(drop) = doc.drops.iter_mut().find(|d| &d.token == token) {
            drop.disable_channel(channel);
            self.write_db(&doc).await?;
        }
        self.lock_counters()?.clear_failures(token, channel);
        Ok(())
    }
}
