//! Optimistic mutations over an identifiable collection.
//!
//! The visible collection is always the confirmed base overlaid with at most
//! one speculative action per id. Speculation is dropped on failure and the
//! authoritative record replaces it on success. An operation whose future is
//! dropped before it settles rolls its speculation back.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use uuid::Uuid;

use crate::error::CrudError;
use crate::retry::{execute_counted, RetryPolicy};

pub const TEMP_ID_PREFIX: &str = "temp-";

pub trait Record: Clone {
    /// Payload for a record the server has not assigned an id to yet.
    type Draft;
    /// Partial change applied by `update`.
    type Patch;

    fn id(&self) -> &str;
    fn speculative(id: String, draft: &Self::Draft) -> Self;
    fn apply(&mut self, patch: &Self::Patch);
}

/// A mutation of the collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrudAction {
    Create,
    Update,
    Delete,
}

/// Anything that settles: a mutation or a refresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Refresh,
}

impl From<CrudAction> for Operation {
    fn from(action: CrudAction) -> Self {
        match action {
            CrudAction::Create => Operation::Create,
            CrudAction::Update => Operation::Update,
            CrudAction::Delete => Operation::Delete,
        }
    }
}

impl Operation {
    fn success_message(self, count: usize) -> String {
        let verb = match self {
            Operation::Create => "created",
            Operation::Update => "updated",
            Operation::Delete => "deleted",
            Operation::Refresh => "refreshed",
        };
        match (self, count) {
            (Operation::Refresh, _) => format!("Items {verb}"),
            (_, 1) => format!("Item {verb}"),
            (_, count) => format!("{count} items {verb}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeKind {
    Success,
    Error,
}

/// User-facing feedback sink; called once per terminal outcome.
pub trait Notifier: Send + Sync {
    fn notify(&self, kind: NoticeKind, message: &str);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, kind: NoticeKind, message: &str) {
        match kind {
            NoticeKind::Success => log::info!("{message}"),
            NoticeKind::Error => log::warn!("{message}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OptimisticCrudState<T> {
    pub items: Vec<T>,
    pub is_updating: bool,
    pub last_error: Option<String>,
    pub last_action: Option<CrudAction>,
    pub last_action_id: Option<String>,
}

pub type SuccessHook<T> = Box<dyn Fn(&T) + Send + Sync>;
pub type ErrorHook<E> = Box<dyn Fn(&CrudError<E>) + Send + Sync>;
pub type SettledHook = Box<dyn Fn(Operation) + Send + Sync>;

enum Speculation<T> {
    Create(T),
    Update(T),
    Delete,
}

struct Pending<T> {
    token: u64,
    id: String,
    speculation: Speculation<T>,
}

struct Inner<T> {
    base: Vec<T>,
    pending: Vec<Pending<T>>,
    in_flight: HashMap<String, u64>,
    next_token: u64,
    generation: u64,
    last_error: Option<String>,
    last_action: Option<CrudAction>,
    last_action_id: Option<String>,
}

impl<T: Record> Inner<T> {
    fn new(items: Vec<T>) -> Self {
        Self {
            base: items,
            pending: Vec::new(),
            in_flight: HashMap::new(),
            next_token: 0,
            generation: 0,
            last_error: None,
            last_action: None,
            last_action_id: None,
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.base.iter().position(|record| record.id() == id)
    }

    fn speculation_for(&self, id: &str) -> Option<&Speculation<T>> {
        self.pending
            .iter()
            .find(|pending| pending.id == id)
            .map(|pending| &pending.speculation)
    }

    fn project(&self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.base.len() + self.pending.len());
        for record in &self.base {
            match self.speculation_for(record.id()) {
                Some(Speculation::Delete) => {}
                Some(Speculation::Update(next)) => items.push(next.clone()),
                _ => items.push(record.clone()),
            }
        }
        for pending in &self.pending {
            if let Speculation::Create(record) = &pending.speculation {
                items.push(record.clone());
            }
        }
        items
    }

    /// Snapshots of every id, or the first reason one of them cannot be claimed.
    fn claim<E>(&self, ids: &[&str]) -> Result<Vec<T>, CrudError<E>> {
        let mut seen = HashSet::new();
        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
            let snapshot = self
                .position(id)
                .map(|index| self.base[index].clone())
                .ok_or_else(|| CrudError::NotFound { id: id.to_string() })?;
            if self.in_flight.contains_key(*id) || !seen.insert(*id) {
                return Err(CrudError::InFlight { id: id.to_string() });
            }
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }

    fn begin(&mut self, id: &str, speculation: Speculation<T>, action: CrudAction) -> Ticket {
        self.next_token += 1;
        let token = self.next_token;
        self.in_flight.insert(id.to_string(), token);
        self.pending.push(Pending {
            token,
            id: id.to_string(),
            speculation,
        });
        self.last_error = None;
        self.last_action = Some(action);
        self.last_action_id = Some(id.to_string());
        Ticket {
            token,
            generation: self.generation,
        }
    }

    fn finish(&mut self, id: &str, ticket: Ticket) {
        self.pending.retain(|pending| pending.token != ticket.token);
        if self.in_flight.get(id) == Some(&ticket.token) {
            self.in_flight.remove(id);
        }
    }

    fn upsert(&mut self, record: T) {
        match self.position(record.id()) {
            Some(index) => self.base[index] = record,
            None => self.base.push(record),
        }
    }

    /// Puts `snapshot` back unless a refresh replaced the base or the record is gone.
    fn restore(&mut self, snapshot: T, ticket: Ticket) -> bool {
        if self.generation != ticket.generation {
            return false;
        }
        match self.position(snapshot.id()) {
            Some(index) => {
                self.base[index] = snapshot;
                true
            }
            None => false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Ticket {
    token: u64,
    generation: u64,
}

struct Claim<T> {
    id: String,
    ticket: Ticket,
    snapshot: Option<T>,
}

/// Speculation owned by one running operation. Settles exactly once: through
/// `commit`, `roll_back`, or on drop when the caller stopped polling.
struct Flight<'a, T: Record> {
    inner: &'a Mutex<Inner<T>>,
    claims: Vec<Claim<T>>,
    settled: bool,
}

impl<'a, T: Record> Flight<'a, T> {
    fn commit<R>(mut self, apply: impl FnOnce(&mut Inner<T>) -> R) -> R {
        self.settled = true;
        let mut inner = lock(self.inner);
        for claim in &self.claims {
            inner.finish(&claim.id, claim.ticket);
        }
        apply(&mut *inner)
    }

    fn roll_back(mut self) -> usize {
        self.settled = true;
        release(&mut *lock(self.inner), &mut self.claims)
    }
}

impl<T: Record> Drop for Flight<'_, T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let restored = release(&mut *lock(self.inner), &mut self.claims);
        let ids: Vec<&str> = self.claims.iter().map(|claim| claim.id.as_str()).collect();
        log::warn!(
            "Abandoned mutation of {} rolled back ({restored} record(s) restored)",
            ids.join(", ")
        );
    }
}

fn release<T: Record>(inner: &mut Inner<T>, claims: &mut [Claim<T>]) -> usize {
    let mut restored = 0;
    for claim in claims.iter_mut() {
        inner.finish(&claim.id, claim.ticket);
        if let Some(snapshot) = claim.snapshot.take() {
            if inner.restore(snapshot, claim.ticket) {
                restored += 1;
            }
        }
    }
    restored
}

fn lock<T>(inner: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct OptimisticCrud<T, E> {
    inner: Mutex<Inner<T>>,
    policy: RetryPolicy,
    notifier: Arc<dyn Notifier>,
    on_success: Option<SuccessHook<T>>,
    on_error: Option<ErrorHook<E>>,
    on_settled: Option<SettledHook>,
}

impl<T, E> OptimisticCrud<T, E>
where
    T: Record,
    E: Display,
{
    pub fn new(items: Vec<T>, policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::new(items)),
            policy,
            notifier: Arc::new(LogNotifier),
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn on_success(mut self, hook: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Box::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&CrudError<E>) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    pub fn on_settled(mut self, hook: impl Fn(Operation) + Send + Sync + 'static) -> Self {
        self.on_settled = Some(Box::new(hook));
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn items(&self) -> Vec<T> {
        self.lock().project()
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.items().into_iter().find(|record| record.id() == id)
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.lock().in_flight.contains_key(id)
    }

    pub fn state(&self) -> OptimisticCrudState<T> {
        let inner = self.lock();
        OptimisticCrudState {
            items: inner.project(),
            is_updating: !inner.in_flight.is_empty(),
            last_error: inner.last_error.clone(),
            last_action: inner.last_action,
            last_action_id: inner.last_action_id.clone(),
        }
    }

    pub async fn create<F, Fut>(&self, draft: T::Draft, remote_op: F) -> Result<T, CrudError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let temp_id = format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4());
        let speculative = T::speculative(temp_id.clone(), &draft);
        let ticket = self
            .lock()
            .begin(&temp_id, Speculation::Create(speculative), CrudAction::Create);
        let flight = self.flight(vec![Claim {
            id: temp_id.clone(),
            ticket,
            snapshot: None,
        }]);

        match execute_counted(remote_op, self.policy).await {
            Ok(record) => {
                flight.commit(|inner| {
                    inner.upsert(record.clone());
                    inner.last_action_id = Some(record.id().to_string());
                });
                self.succeeded(Operation::Create, std::slice::from_ref(&record));
                Ok(record)
            }
            Err((source, attempts)) => {
                flight.roll_back();
                log::warn!("Rolled back speculative create {temp_id}");
                Err(self.failed(
                    Operation::Create,
                    CrudError::RemoteOperationFailed { attempts, source },
                ))
            }
        }
    }

    pub async fn update<F, Fut>(
        &self,
        id: &str,
        patch: T::Patch,
        remote_op: F,
    ) -> Result<T, CrudError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.update_with(id, |_| patch, remote_op).await
    }

    /// Update whose patch is derived from the current record, e.g. flipping a flag.
    pub async fn toggle<P, F, Fut>(
        &self,
        id: &str,
        flip: P,
        remote_op: F,
    ) -> Result<T, CrudError<E>>
    where
        P: FnOnce(&T) -> T::Patch,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.update_with(id, flip, remote_op).await
    }

    async fn update_with<P, F, Fut>(
        &self,
        id: &str,
        make_patch: P,
        remote_op: F,
    ) -> Result<T, CrudError<E>>
    where
        P: FnOnce(&T) -> T::Patch,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let claims = {
            let mut inner = self.lock();
            inner.claim(&[id]).map(|mut snapshots| {
                let snapshot = snapshots.remove(0);
                let mut next = snapshot.clone();
                next.apply(&make_patch(&snapshot));
                let ticket = inner.begin(id, Speculation::Update(next), CrudAction::Update);
                vec![Claim {
                    id: id.to_string(),
                    ticket,
                    snapshot: Some(snapshot),
                }]
            })
        };
        let flight = match claims {
            Ok(claims) => self.flight(claims),
            Err(err) => return Err(self.failed(Operation::Update, err)),
        };

        match execute_counted(remote_op, self.policy).await {
            Ok(record) => {
                flight.commit(|inner| inner.upsert(record.clone()));
                self.succeeded(Operation::Update, std::slice::from_ref(&record));
                Ok(record)
            }
            Err((source, attempts)) => {
                let restored = flight.roll_back();
                log::warn!("Rolled back speculative update of {id} ({restored} restored)");
                Err(self.failed(
                    Operation::Update,
                    CrudError::RemoteOperationFailed { attempts, source },
                ))
            }
        }
    }

    /// Removes `id`; resolves to the removed record.
    pub async fn remove<F, Fut>(&self, id: &str, remote_op: F) -> Result<T, CrudError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let mut removed = self.batch_remove(&[id], remote_op).await?;
        Ok(removed.remove(0))
    }

    /// Applies every patch at once through a single remote call. Either all
    /// ids are claimed or none are.
    pub async fn batch_update<F, Fut>(
        &self,
        patches: Vec<(String, T::Patch)>,
        remote_op: F,
    ) -> Result<Vec<T>, CrudError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<T>, E>>,
    {
        if patches.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<&str> = patches.iter().map(|(id, _)| id.as_str()).collect();
        let claims = {
            let mut inner = self.lock();
            inner.claim(&ids).map(|snapshots| {
                snapshots
                    .into_iter()
                    .zip(&patches)
                    .map(|(snapshot, (id, patch))| {
                        let mut next = snapshot.clone();
                        next.apply(patch);
                        let ticket =
                            inner.begin(id, Speculation::Update(next), CrudAction::Update);
                        Claim {
                            id: id.clone(),
                            ticket,
                            snapshot: Some(snapshot),
                        }
                    })
                    .collect::<Vec<_>>()
            })
        };
        let flight = match claims {
            Ok(claims) => self.flight(claims),
            Err(err) => return Err(self.failed(Operation::Update, err)),
        };

        match execute_counted(remote_op, self.policy).await {
            Ok(records) => {
                flight.commit(|inner| {
                    for record in &records {
                        inner.upsert(record.clone());
                    }
                });
                self.succeeded(Operation::Update, &records);
                Ok(records)
            }
            Err((source, attempts)) => {
                let restored = flight.roll_back();
                log::warn!(
                    "Rolled back batch update of {} record(s) ({restored} restored)",
                    ids.len()
                );
                Err(self.failed(
                    Operation::Update,
                    CrudError::RemoteOperationFailed { attempts, source },
                ))
            }
        }
    }

    /// Removes every id through a single remote call; resolves to the removed records.
    pub async fn batch_remove<F, Fut>(
        &self,
        ids: &[&str],
        remote_op: F,
    ) -> Result<Vec<T>, CrudError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let claims = {
            let mut inner = self.lock();
            inner.claim(ids).map(|snapshots| {
                snapshots
                    .into_iter()
                    .map(|snapshot| {
                        let id = snapshot.id().to_string();
                        let ticket = inner.begin(&id, Speculation::Delete, CrudAction::Delete);
                        Claim {
                            id,
                            ticket,
                            snapshot: Some(snapshot),
                        }
                    })
                    .collect::<Vec<_>>()
            })
        };
        let flight = match claims {
            Ok(claims) => self.flight(claims),
            Err(err) => return Err(self.failed(Operation::Delete, err)),
        };
        let snapshots: Vec<T> = flight
            .claims
            .iter()
            .filter_map(|claim| claim.snapshot.clone())
            .collect();

        match execute_counted(remote_op, self.policy).await {
            Ok(()) => {
                flight.commit(|inner| {
                    inner.base.retain(|record| !ids.iter().any(|id| *id == record.id()));
                });
                self.succeeded(Operation::Delete, &snapshots);
                Ok(snapshots)
            }
            Err((source, attempts)) => {
                let reinserted = flight.roll_back();
                log::warn!(
                    "Rolled back speculative delete of {} ({reinserted} reinserted)",
                    ids.join(", ")
                );
                Err(self.failed(
                    Operation::Delete,
                    CrudError::RemoteOperationFailed { attempts, source },
                ))
            }
        }
    }

    /// Replaces the base wholesale and discards every speculative action.
    /// Operations still in flight keep their claim; their success is still
    /// applied, their rollback is not.
    pub async fn refresh<F, Fut>(&self, fetch_op: F) -> Result<usize, CrudError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<T>, E>>,
    {
        match execute_counted(fetch_op, self.policy).await {
            Ok(items) => {
                let count = items.len();
                {
                    let mut inner = self.lock();
                    inner.base = items;
                    inner.pending.clear();
                    inner.generation += 1;
                    inner.last_error = None;
                }
                log::debug!("Refreshed collection with {count} record(s)");
                self.notifier
                    .notify(NoticeKind::Success, &Operation::Refresh.success_message(count));
                self.settled(Operation::Refresh);
                Ok(count)
            }
            Err((source, attempts)) => Err(self.failed(
                Operation::Refresh,
                CrudError::RemoteOperationFailed { attempts, source },
            )),
        }
    }

    fn flight(&self, claims: Vec<Claim<T>>) -> Flight<'_, T> {
        Flight {
            inner: &self.inner,
            claims,
            settled: false,
        }
    }

    fn succeeded(&self, operation: Operation, records: &[T]) {
        self.notifier
            .notify(NoticeKind::Success, &operation.success_message(records.len()));
        if let Some(hook) = &self.on_success {
            for record in records {
                hook(record);
            }
        }
        self.settled(operation);
    }

    fn failed(&self, operation: Operation, err: CrudError<E>) -> CrudError<E> {
        let message = err.to_string();
        self.lock().last_error = Some(message.clone());
        self.notifier.notify(NoticeKind::Error, &message);
        if let Some(hook) = &self.on_error {
            hook(&err);
        }
        self.settled(operation);
        err
    }

    fn settled(&self, operation: Operation) {
        if let Some(hook) = &self.on_settled {
            hook(operation);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        lock(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Service {
        id: String,
        name: String,
        active: bool,
        notes: String,
        revision: u32,
    }

    #[derive(Debug, Clone, Default)]
    struct ServicePatch {
        name: Option<String>,
        active: Option<bool>,
        notes: Option<String>,
    }

    impl Record for Service {
        type Draft = String;
        type Patch = ServicePatch;

        fn id(&self) -> &str {
            &self.id
        }

        fn speculative(id: String, draft: &String) -> Self {
            service(&id, draft)
        }

        fn apply(&mut self, patch: &ServicePatch) {
            if let Some(name) = &patch.name {
                self.name = name.clone();
            }
            if let Some(active) = patch.active {
                self.active = active;
            }
            if let Some(notes) = &patch.notes {
                self.notes = notes.clone();
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("backend unavailable")]
    struct Unavailable;

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<(NoticeKind, String)>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, kind: NoticeKind, message: &str) {
            self.notices.lock().unwrap().push((kind, message.to_string()));
        }
    }

    fn service(id: &str, name: &str) -> Service {
        Service {
            id: id.to_string(),
            name: name.to_string(),
            active: true,
            notes: String::new(),
            revision: 1,
        }
    }

    fn fixture() -> (OptimisticCrud<Service, Unavailable>, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let crud = OptimisticCrud::new(
            vec![service("svc-1", "Signature Cut"), service("svc-2", "Beard Sculpt")],
            RetryPolicy::new(3, Duration::from_millis(1000)),
        )
        .with_notifier(notifier.clone());
        (crud, notifier)
    }

    fn failing<T>(calls: &Arc<AtomicU32>) -> impl FnMut() -> std::future::Ready<Result<T, Unavailable>> {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(Unavailable))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn create_replaces_temporary_record_with_canonical() {
        let (crud, notifier) = fixture();

        let created = crud
            .create("Full Grooming".to_string(), || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(service("svc-3", "Full Grooming"))
            })
            .await
            .unwrap();

        assert_eq!(created.id, "svc-3");
        let ids: Vec<_> = crud.items().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["svc-1", "svc-2", "svc-3"]);
        let state = crud.state();
        assert_eq!(state.last_action, Some(CrudAction::Create));
        assert_eq!(state.last_action_id.as_deref(), Some("svc-3"));
        assert!(!state.is_updating);
        assert_eq!(
            notifier.notices.lock().unwrap().as_slice(),
            &[(NoticeKind::Success, "Item created".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn create_is_visible_while_in_flight() {
        let (crud, _) = fixture();

        let (created, during) = tokio::join!(
            crud.create("Fade".to_string(), || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(service("svc-9", "Fade"))
            }),
            async {
                tokio::task::yield_now().await;
                crud.state()
            }
        );

        assert!(created.is_ok());
        assert!(during.is_updating);
        let temp = during.items.last().unwrap();
        assert!(temp.id.starts_with(TEMP_ID_PREFIX));
        assert_eq!(temp.name, "Fade");
    }

    #[tokio::test(start_paused = true)]
    async fn create_failure_leaves_no_temporary_record() {
        let (crud, notifier) = fixture();
        let calls = Arc::new(AtomicU32::new(0));

        let err = crud
            .create("Fade".to_string(), failing(&calls))
            .await
            .unwrap_err();

        assert!(err.is_max_retries_exceeded(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(crud
            .items()
            .iter()
            .all(|record| !record.id.starts_with(TEMP_ID_PREFIX)));
        assert_eq!(crud.items().len(), 2);
        let notices = notifier.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, NoticeKind::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn update_failure_restores_exact_snapshot() {
        let errors = Arc::new(AtomicU32::new(0));
        let notifier = Arc::new(RecordingNotifier::default());
        let crud: OptimisticCrud<Service, Unavailable> = OptimisticCrud::new(
            vec![service("svc-1", "Signature Cut")],
            RetryPolicy::default(),
        )
        .with_notifier(notifier.clone())
        .on_error({
            let errors = Arc::clone(&errors);
            move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            }
        });
        let before = crud.get("svc-1").unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let patch = ServicePatch {
            notes: Some("x".to_string()),
            ..ServicePatch::default()
        };
        let err = crud.update("svc-1", patch, failing(&calls)).await.unwrap_err();

        assert!(matches!(
            err,
            CrudError::RemoteOperationFailed { attempts: 3, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(crud.get("svc-1").unwrap(), before);
        assert_eq!(crud.get("svc-1").unwrap().notes, "");
        assert!(crud.state().last_error.is_some());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.notices.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn update_success_takes_server_record() {
        let (crud, _) = fixture();

        let patch = ServicePatch {
            name: Some("Signature Cut+".to_string()),
            ..ServicePatch::default()
        };
        let updated = crud
            .update("svc-1", patch, || async {
                let mut server = service("svc-1", "Signature Cut+");
                server.revision = 2;
                Ok(server)
            })
            .await
            .unwrap();

        assert_eq!(updated.revision, 2);
        assert_eq!(crud.get("svc-1").unwrap().revision, 2);
        assert_eq!(crud.items()[0].id, "svc-1");
    }

    #[tokio::test(start_paused = true)]
    async fn update_of_missing_record_never_calls_remote() {
        let (crud, notifier) = fixture();
        let calls = Arc::new(AtomicU32::new(0));

        let err = crud
            .update("svc-404", ServicePatch::default(), failing(&calls))
            .await
            .unwrap_err();

        assert!(matches!(err, CrudError::NotFound { ref id } if id == "svc-404"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.notices.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_mutation_on_same_id_is_rejected() {
        let (crud, _) = fixture();

        let (first, second) = tokio::join!(
            crud.update(
                "svc-1",
                ServicePatch {
                    name: Some("A".to_string()),
                    ..ServicePatch::default()
                },
                || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(service("svc-1", "A"))
                }
            ),
            async {
                tokio::task::yield_now().await;
                crud.remove("svc-1", || async { Ok(()) }).await
            }
        );

        assert_eq!(first.unwrap().name, "A");
        assert!(matches!(second, Err(CrudError::InFlight { .. })));
        assert_eq!(crud.items().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_flips_from_current_value() {
        let (crud, _) = fixture();

        let toggled = crud
            .toggle(
                "svc-2",
                |current| ServicePatch {
                    active: Some(!current.active),
                    ..ServicePatch::default()
                },
                || async {
                    let mut server = service("svc-2", "Beard Sculpt");
                    server.active = false;
                    Ok(server)
                },
            )
            .await
            .unwrap();

        assert!(!toggled.active);
        assert!(!crud.get("svc-2").unwrap().active);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_failure_reinserts_record() {
        let (crud, _) = fixture();
        let calls = Arc::new(AtomicU32::new(0));

        let err = crud.remove("svc-2", failing(&calls)).await.unwrap_err();

        assert!(matches!(err, CrudError::RemoteOperationFailed { .. }));
        assert_eq!(crud.get("svc-2").unwrap().name, "Beard Sculpt");
        assert_eq!(crud.state().last_action, Some(CrudAction::Delete));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_success_confirms_removal() {
        let (crud, _) = fixture();

        let removed = crud.remove("svc-1", || async { Ok(()) }).await.unwrap();

        assert_eq!(removed.id, "svc-1");
        assert!(crud.get("svc-1").is_none());
        assert_eq!(crud.items().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_discards_speculation_and_stale_rollback() {
        let (crud, _) = fixture();
        let calls = Arc::new(AtomicU32::new(0));

        let (removal, refreshed) = tokio::join!(
            crud.remove("svc-1", failing(&calls)),
            async {
                tokio::task::yield_now().await;
                assert!(crud.get("svc-1").is_none());
                crud.refresh(|| async {
                    Ok(vec![service("svc-2", "Beard Sculpt"), service("svc-5", "Kids Cut")])
                })
                .await
            }
        );

        assert!(removal.is_err());
        assert_eq!(refreshed.unwrap(), 2);
        let ids: Vec<_> = crud.items().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["svc-2", "svc-5"]);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_fires_for_every_outcome() {
        let settled = Arc::new(Mutex::new(Vec::new()));
        let crud: OptimisticCrud<Service, Unavailable> =
            OptimisticCrud::new(vec![service("svc-1", "Cut")], RetryPolicy::default())
                .on_settled({
                    let settled = Arc::clone(&settled);
                    move |action| settled.lock().unwrap().push(action)
                });
        let calls = Arc::new(AtomicU32::new(0));

        let _ = crud.remove("svc-1", failing(&calls)).await;
        let _ = crud.create("Fade".to_string(), || async { Ok(service("svc-2", "Fade")) }).await;

        let _ = crud.refresh(|| async { Ok(vec![service("svc-1", "Cut")]) }).await;

        assert_eq!(
            settled.lock().unwrap().as_slice(),
            &[Operation::Delete, Operation::Create, Operation::Refresh]
        );
        assert_eq!(crud.state().last_action, Some(CrudAction::Create));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_update_restores_record_and_releases_id() {
        let (crud, _) = fixture();
        let before = crud.get("svc-1").unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            crud.update(
                "svc-1",
                ServicePatch {
                    name: Some("Never Saved".to_string()),
                    ..ServicePatch::default()
                },
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Err::<Service, _>(Unavailable)
                },
            ),
        )
        .await;

        assert!(abandoned.is_err());
        assert_eq!(crud.get("svc-1").unwrap(), before);
        assert!(!crud.is_in_flight("svc-1"));
        assert!(!crud.state().is_updating);

        let renamed = crud
            .update(
                "svc-1",
                ServicePatch {
                    name: Some("Signature Cut II".to_string()),
                    ..ServicePatch::default()
                },
                || async { Ok(service("svc-1", "Signature Cut II")) },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "Signature Cut II");
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_create_leaves_no_temporary_record() {
        let (crud, _) = fixture();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            crud.create("Fade".to_string(), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(service("svc-9", "Fade"))
            }),
        )
        .await;

        assert!(abandoned.is_err());
        let state = crud.state();
        assert!(!state.is_updating);
        assert_eq!(state.items.len(), 2);
        assert!(state
            .items
            .iter()
            .all(|record| !record.id.starts_with(TEMP_ID_PREFIX)));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_then_update_success_upserts_server_record() {
        let (crud, _) = fixture();

        let (updated, refreshed) = tokio::join!(
            crud.update(
                "svc-1",
                ServicePatch {
                    name: Some("Signature Cut+".to_string()),
                    ..ServicePatch::default()
                },
                || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    let mut server = service("svc-1", "Signature Cut+");
                    server.revision = 3;
                    Ok(server)
                }
            ),
            async {
                tokio::task::yield_now().await;
                crud.refresh(|| async {
                    let mut stale = service("svc-1", "Signature Cut");
                    stale.revision = 2;
                    Ok(vec![stale, service("svc-2", "Beard Sculpt")])
                })
                .await
            }
        );

        assert_eq!(refreshed.unwrap(), 2);
        assert_eq!(updated.unwrap().revision, 3);
        let current = crud.get("svc-1").unwrap();
        assert_eq!(current.revision, 3);
        assert_eq!(current.name, "Signature Cut+");
        assert!(!crud.is_in_flight("svc-1"));
        assert_eq!(crud.items().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_then_create_success_keeps_server_record() {
        let (crud, _) = fixture();

        let (created, refreshed) = tokio::join!(
            crud.create("Kids Cut".to_string(), || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(service("svc-7", "Kids Cut"))
            }),
            async {
                tokio::task::yield_now().await;
                crud.refresh(|| async { Ok(vec![service("svc-1", "Signature Cut")]) })
                    .await
            }
        );

        assert_eq!(refreshed.unwrap(), 1);
        assert_eq!(created.unwrap().id, "svc-7");
        let ids: Vec<_> = crud.items().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["svc-1", "svc-7"]);
        assert!(!crud.state().is_updating);
    }

    fn rename(id: &str, name: &str) -> (String, ServicePatch) {
        (
            id.to_string(),
            ServicePatch {
                name: Some(name.to_string()),
                ..ServicePatch::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn batch_update_applies_every_patch_and_notifies_once() {
        let succeeded = Arc::new(AtomicU32::new(0));
        let notifier = Arc::new(RecordingNotifier::default());
        let crud: OptimisticCrud<Service, Unavailable> = OptimisticCrud::new(
            vec![service("svc-1", "Signature Cut"), service("svc-2", "Beard Sculpt")],
            RetryPolicy::default(),
        )
        .with_notifier(notifier.clone())
        .on_success({
            let succeeded = Arc::clone(&succeeded);
            move |_| {
                succeeded.fetch_add(1, Ordering::SeqCst);
            }
        });

        let (updated, during) = tokio::join!(
            crud.batch_update(
                vec![rename("svc-1", "Cut"), rename("svc-2", "Beard")],
                || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(vec![service("svc-1", "Cut"), service("svc-2", "Beard")])
                }
            ),
            async {
                tokio::task::yield_now().await;
                crud.items()
            }
        );

        assert_eq!(updated.unwrap().len(), 2);
        let names: Vec<_> = during.into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["Cut", "Beard"]);
        assert_eq!(succeeded.load(Ordering::SeqCst), 2);
        assert_eq!(
            notifier.notices.lock().unwrap().as_slice(),
            &[(NoticeKind::Success, "2 items updated".to_string())]
        );
        assert!(!crud.state().is_updating);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_update_failure_restores_every_record() {
        let (crud, notifier) = fixture();
        let before = crud.items();
        let calls = Arc::new(AtomicU32::new(0));

        let err = crud
            .batch_update(
                vec![rename("svc-1", "Cut"), rename("svc-2", "Beard")],
                failing(&calls),
            )
            .await
            .unwrap_err();

        assert!(err.is_max_retries_exceeded(3));
        assert_eq!(crud.items(), before);
        assert!(!crud.is_in_flight("svc-1"));
        assert!(!crud.is_in_flight("svc-2"));
        assert_eq!(notifier.notices.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_claims_every_id_or_none() {
        let (crud, _) = fixture();
        let calls = Arc::new(AtomicU32::new(0));

        let (first, batch) = tokio::join!(
            crud.update(
                "svc-2",
                ServicePatch::default(),
                || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(service("svc-2", "Beard Sculpt"))
                }
            ),
            async {
                tokio::task::yield_now().await;
                let batch = crud
                    .batch_update(
                        vec![rename("svc-1", "Cut"), rename("svc-2", "Beard")],
                        failing(&calls),
                    )
                    .await;
                (batch, crud.get("svc-1").unwrap().name, crud.is_in_flight("svc-1"))
            }
        );

        assert!(first.is_ok());
        let (batch, name, svc1_in_flight) = batch;
        assert!(matches!(batch, Err(CrudError::InFlight { ref id }) if id == "svc-2"));
        assert_eq!(name, "Signature Cut");
        assert!(!svc1_in_flight);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let duplicate = crud
            .batch_remove(&["svc-1", "svc-1"], failing(&calls))
            .await
            .unwrap_err();
        assert!(matches!(duplicate, CrudError::InFlight { .. }));
        let missing = crud
            .batch_remove(&["svc-1", "svc-404"], failing(&calls))
            .await
            .unwrap_err();
        assert!(matches!(missing, CrudError::NotFound { ref id } if id == "svc-404"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(crud.items().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_remove_confirms_or_reinserts_all() {
        let (crud, notifier) = fixture();
        let calls = Arc::new(AtomicU32::new(0));

        let err = crud
            .batch_remove(&["svc-1", "svc-2"], failing(&calls))
            .await
            .unwrap_err();
        assert!(matches!(err, CrudError::RemoteOperationFailed { .. }));
        assert_eq!(crud.items().len(), 2);

        let removed = crud
            .batch_remove(&["svc-1", "svc-2"], || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(removed.len(), 2);
        assert!(crud.items().is_empty());
        assert_eq!(
            notifier.notices.lock().unwrap().last(),
            Some(&(NoticeKind::Success, "2 items deleted".to_string()))
        );

        assert!(crud.batch_remove(&[], || async { Ok(()) }).await.unwrap().is_empty());
    }
}
