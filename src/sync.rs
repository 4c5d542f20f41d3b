//! Cursor-based schedule reconciliation for one client session.
//!
//! Remote changes are pulled "since cursor" and handed to `on_update`; local
//! edits are queued before they are published and stay queued until a pull
//! whose cursor covers them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{StoreError, SyncFailed};
use crate::models::{ChangeBatch, EntityType, ScheduleUpdate, UpdateType};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_PAGES: u32 = 10;
pub const DEFAULT_ERROR_LOG_LIMIT: usize = 50;

/// Remote side of the schedule feed.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Changes recorded after `cursor` (everything when `None`) within `scope`.
    async fn fetch_changes_since(
        &self,
        cursor: Option<DateTime<Utc>>,
        scope: &str,
    ) -> Result<ChangeBatch, StoreError>;

    async fn publish_change(&self, update: &ScheduleUpdate) -> Result<(), StoreError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncOptions {
    pub poll_interval: Duration,
    pub enabled: bool,
    pub max_pages: u32,
    pub error_log_limit: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            enabled: true,
            max_pages: DEFAULT_MAX_PAGES,
            error_log_limit: DEFAULT_ERROR_LOG_LIMIT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Syncing,
    Degraded,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SyncError {
    pub id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PendingUpdate {
    pub update: ScheduleUpdate,
    pub delivered: bool,
    #[serde(skip)]
    seq: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SyncConflict {
    pub entity_id: String,
    pub local: ScheduleUpdate,
    pub remote: ScheduleUpdate,
    pub detected_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictResolution {
    KeepLocal,
    AcceptRemote,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub is_online: bool,
    pub last_sync_cursor: Option<DateTime<Utc>>,
    pub pending_updates: usize,
    pub unresolved_conflicts: usize,
    pub sync_errors: Vec<SyncError>,
}

pub type UpdateHook = Box<dyn Fn(&ScheduleUpdate) + Send + Sync>;
pub type SyncErrorHook = Box<dyn Fn(&SyncError) + Send + Sync>;

struct Inner {
    phase: SyncPhase,
    online: bool,
    cursor: Option<DateTime<Utc>>,
    pending: Vec<PendingUpdate>,
    next_seq: u64,
    errors: Vec<SyncError>,
    conflicts: Vec<SyncConflict>,
}

impl Inner {
    /// Moves the cursor forward; an older server timestamp is ignored.
    fn commit(&mut self, timestamp: DateTime<Utc>) {
        match self.cursor {
            Some(current) if timestamp < current => {
                log::warn!(
                    "Ignoring sync cursor {timestamp} older than {current}; keeping current cursor"
                );
            }
            _ => self.cursor = Some(timestamp),
        }
        if let Some(cursor) = self.cursor {
            let before = self.pending.len();
            self.pending
                .retain(|pending| pending.update.timestamp > cursor);
            let pruned = before - self.pending.len();
            if pruned > 0 {
                log::debug!("Pruned {pruned} pending update(s) covered by cursor {cursor}");
            }
        }
    }

    fn detect_conflict(&mut self, remote: &ScheduleUpdate) {
        let Some(local) = self
            .pending
            .iter()
            .rev()
            .find(|pending| pending.update.entity_id == remote.entity_id)
        else {
            return;
        };
        if local.update.origin_user == remote.origin_user {
            return;
        }
        log::info!(
            "Conflict on {} between local edit and change by {}",
            remote.entity_id,
            remote.origin_user
        );
        let conflict = SyncConflict {
            entity_id: remote.entity_id.clone(),
            local: local.update.clone(),
            remote: remote.clone(),
            detected_at: Utc::now(),
        };
        self.conflicts
            .retain(|existing| existing.entity_id != conflict.entity_id);
        self.conflicts.push(conflict);
    }

    fn record_error(&mut self, message: String, limit: usize) -> SyncError {
        let error = SyncError {
            id: Uuid::new_v4().to_string(),
            message,
            timestamp: Utc::now(),
            resolved: false,
        };
        self.errors.push(error.clone());
        if self.errors.len() > limit {
            let excess = self.errors.len() - limit;
            self.errors.drain(..excess);
        }
        error
    }
}

/// Puts the phase back if a pull is dropped before it settles.
struct SyncingGuard<'a> {
    inner: &'a Mutex<Inner>,
    scope: &'a str,
    previous: SyncPhase,
    armed: bool,
}

impl<'a> SyncingGuard<'a> {
    fn new(inner: &'a Mutex<Inner>, scope: &'a str, previous: SyncPhase) -> Self {
        Self {
            inner,
            scope,
            previous,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.phase == SyncPhase::Syncing {
            inner.phase = self.previous;
        }
        log::warn!("Sync for {} was abandoned; cursor left at {:?}", self.scope, inner.cursor);
    }
}

pub struct ScheduleSync<F> {
    feed: F,
    scope: String,
    user_id: String,
    options: SyncOptions,
    inner: Mutex<Inner>,
    on_update: Option<UpdateHook>,
    on_error: Option<SyncErrorHook>,
}

impl<F: ChangeFeed> ScheduleSync<F> {
    pub fn new(
        feed: F,
        scope: impl Into<String>,
        user_id: impl Into<String>,
        options: SyncOptions,
    ) -> Self {
        Self {
            feed,
            scope: scope.into(),
            user_id: user_id.into(),
            options,
            inner: Mutex::new(Inner {
                phase: SyncPhase::Idle,
                online: true,
                cursor: None,
                pending: Vec::new(),
                next_seq: 0,
                errors: Vec::new(),
                conflicts: Vec::new(),
            }),
            on_update: None,
            on_error: None,
        }
    }

    pub fn on_update(mut self, hook: impl Fn(&ScheduleUpdate) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Box::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn status(&self) -> SyncStatus {
        let inner = self.lock();
        SyncStatus {
            phase: inner.phase,
            is_online: inner.online,
            last_sync_cursor: inner.cursor,
            pending_updates: inner.pending.len(),
            unresolved_conflicts: inner.conflicts.len(),
            sync_errors: inner.errors.clone(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.lock().phase
    }

    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    pub fn last_sync_cursor(&self) -> Option<DateTime<Utc>> {
        self.lock().cursor
    }

    pub fn pending_updates(&self) -> Vec<PendingUpdate> {
        self.lock().pending.clone()
    }

    pub fn sync_errors(&self) -> Vec<SyncError> {
        self.lock().errors.clone()
    }

    pub fn conflicts(&self) -> Vec<SyncConflict> {
        self.lock().conflicts.clone()
    }

    pub fn unresolved_conflict_count(&self) -> usize {
        self.lock().conflicts.len()
    }

    /// Pulls every change since the cursor and returns how many were applied.
    /// The cursor is committed only once every page of the pull succeeded.
    pub async fn sync(&self) -> Result<usize, SyncFailed> {
        let (guard, mut cursor) = {
            let mut inner = self.lock();
            if !inner.online {
                log::debug!("Skipping sync for {} while offline", self.scope);
                return Err(SyncFailed::Offline);
            }
            if inner.phase == SyncPhase::Syncing {
                return Err(SyncFailed::InProgress);
            }
            let previous = std::mem::replace(&mut inner.phase, SyncPhase::Syncing);
            (SyncingGuard::new(&self.inner, &self.scope, previous), inner.cursor)
        };

        let mut applied = 0;
        for page in 1..=self.options.max_pages.max(1) {
            let batch = match self.feed.fetch_changes_since(cursor, &self.scope).await {
                Ok(batch) => batch,
                Err(err) => {
                    guard.disarm();
                    return Err(self.fail(err));
                }
            };

            {
                let mut inner = self.lock();
                for change in &batch.changes {
                    inner.detect_conflict(change);
                }
            }
            if let Some(hook) = &self.on_update {
                for change in &batch.changes {
                    hook(change);
                }
            }
            applied += batch.changes.len();
            cursor = match cursor {
                Some(current) if batch.timestamp < current => {
                    log::warn!(
                        "Ignoring sync cursor {} older than {current}; keeping current cursor",
                        batch.timestamp
                    );
                    Some(current)
                }
                _ => Some(batch.timestamp),
            };

            if !batch.has_more {
                break;
            }
            if page == self.options.max_pages {
                log::debug!(
                    "Stopping {} sync after {page} page(s); the rest waits for the next cycle",
                    self.scope
                );
            }
        }

        guard.disarm();
        let mut inner = self.lock();
        if let Some(cursor) = cursor {
            inner.commit(cursor);
        }
        inner.phase = SyncPhase::Idle;
        for error in inner.errors.iter_mut() {
            error.resolved = true;
        }
        if applied > 0 {
            log::info!("Synced {applied} change(s) for {}", self.scope);
        }
        Ok(applied)
    }

    /// Queues a local change and publishes it. While offline the change is
    /// only queued; `flush_pending` delivers it later.
    pub async fn broadcast_update(
        &self,
        update_type: UpdateType,
        entity_type: EntityType,
        entity_id: &str,
        changes: Map<String, Value>,
    ) -> Result<ScheduleUpdate, StoreError> {
        let update = ScheduleUpdate {
            update_type,
            entity_id: entity_id.to_string(),
            entity_type,
            changes,
            timestamp: Utc::now(),
            origin_user: self.user_id.clone(),
            salon_id: self.scope.clone(),
        };

        let (seq, online) = {
            let mut inner = self.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.pending.push(PendingUpdate {
                update: update.clone(),
                delivered: false,
                seq,
            });
            (seq, inner.online)
        };
        if !online {
            log::debug!("Queued {} update for {entity_id} while offline", update_type.as_str());
            return Ok(update);
        }

        match self.feed.publish_change(&update).await {
            Ok(()) => {
                self.mark_delivered(seq);
                Ok(update)
            }
            Err(err) => {
                self.report(format!("failed to publish change for {entity_id}: {err}"));
                Err(err)
            }
        }
    }

    /// Publishes queued changes that never reached the feed, oldest first.
    pub async fn flush_pending(&self) -> Result<usize, StoreError> {
        let queued: Vec<PendingUpdate> = self
            .lock()
            .pending
            .iter()
            .filter(|pending| !pending.delivered)
            .cloned()
            .collect();

        let mut delivered = 0;
        for pending in queued {
            if let Err(err) = self.feed.publish_change(&pending.update).await {
                self.report(format!(
                    "failed to publish queued change for {}: {err}",
                    pending.update.entity_id
                ));
                return Err(err);
            }
            self.mark_delivered(pending.seq);
            delivered += 1;
        }
        if delivered > 0 {
            log::info!("Delivered {delivered} queued change(s) for {}", self.scope);
        }
        Ok(delivered)
    }

    pub fn clear_pending_updates(&self) {
        self.lock().pending.clear();
    }

    /// Going online delivers queued changes and syncs right away.
    pub async fn set_online(&self, online: bool) {
        let was_online = {
            let mut inner = self.lock();
            let was_online = inner.online;
            inner.online = online;
            was_online
        };
        if !online {
            if was_online {
                log::info!("Schedule sync for {} is offline", self.scope);
            }
            return;
        }
        if was_online {
            return;
        }

        log::info!("Schedule sync for {} is back online", self.scope);
        if let Err(err) = self.flush_pending().await {
            log::warn!("Queued changes for {} stay pending: {err}", self.scope);
        }
        if let Err(err) = self.sync().await {
            log::debug!("Sync after reconnect failed: {err}");
        }
    }

    pub fn resolve_conflict(&self, entity_id: &str, resolution: ConflictResolution) -> bool {
        let mut inner = self.lock();
        let before = inner.conflicts.len();
        inner
            .conflicts
            .retain(|conflict| conflict.entity_id != entity_id);
        if inner.conflicts.len() == before {
            return false;
        }
        if resolution == ConflictResolution::AcceptRemote {
            inner
                .pending
                .retain(|pending| pending.update.entity_id != entity_id);
        }
        log::info!("Resolved conflict on {entity_id} with {resolution:?}");
        true
    }

    pub fn resolve_sync_error(&self, id: &str) -> bool {
        let mut inner = self.lock();
        match inner.errors.iter_mut().find(|error| error.id == id) {
            Some(error) => {
                error.resolved = true;
                true
            }
            None => false,
        }
    }

    fn fail(&self, err: StoreError) -> SyncFailed {
        log::warn!("Schedule sync for {} failed: {err}", self.scope);
        let error = {
            let mut inner = self.lock();
            inner.phase = SyncPhase::Degraded;
            inner.record_error(err.to_string(), self.options.error_log_limit)
        };
        if let Some(hook) = &self.on_error {
            hook(&error);
        }
        SyncFailed::Remote(err)
    }

    fn report(&self, message: String) {
        log::warn!("{message}");
        let error = self
            .lock()
            .record_error(message, self.options.error_log_limit);
        if let Some(hook) = &self.on_error {
            hook(&error);
        }
    }

    fn mark_delivered(&self, seq: u64) {
        let mut inner = self.lock();
        if let Some(pending) = inner.pending.iter_mut().find(|pending| pending.seq == seq) {
            pending.delivered = true;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<F: ChangeFeed + 'static> ScheduleSync<F> {
    /// Polls on a fixed interval until `shutdown` flips to `true`. The first
    /// sync runs immediately; ticks are skipped while offline.
    pub fn spawn_polling(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.options.enabled {
                log::info!("Schedule polling for {} is disabled", self.scope);
                return;
            }
            let mut interval = tokio::time::interval(self.options.poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !self.is_online() {
                            log::debug!("Offline; skipping poll for {}", self.scope);
                            continue;
                        }
                        if let Err(err) = self.sync().await {
                            log::debug!("Poll for {} did not sync: {err}", self.scope);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            log::info!("Schedule polling for {} stopped", self.scope);
                            break;
                        }
                    }
                }
            }
        })
    }
}
