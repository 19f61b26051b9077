//! The per-machine resource store: namespaced maps with optimistic
//! concurrency, a watch fan-out with bounded history, and an optional
//! journal for durability.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use talemu_resource::{AnyResource, LabelQuery, Phase, Resource, ResourceRef, ResourceSpec};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::journal::Journal;

/// Capacity of the in-memory event history serving late watchers.
pub const HISTORY_CAPACITY: usize = 5000;
/// Watchers tailing more than the history holds may observe a gap; tails are
/// padded by this much to absorb races between sizing and subscribing.
pub const HISTORY_GAP_TOLERANCE: usize = 20;

/// Write attribution. Every write from a controller's scoped writer carries
/// the controller name; edge writers (RPC handlers, bootstrap seeding) write
/// unowned.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub owner: Option<String>,
}

impl WriteOptions {
    /// Unowned write from the machine runtime or an RPC handler.
    pub fn system() -> Self {
        Self::default()
    }

    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WatchOptions {
    /// Deliver the current matching set as `Created` events followed by a
    /// `Bootstrapped` marker before going live.
    pub bootstrap: bool,
    /// Replay up to N prior events from history instead of the snapshot.
    /// The store delivers what its history still holds; older events are
    /// silently gone and the consumer must tolerate the gap.
    pub tail_events: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            bootstrap: true,
            tail_events: 0,
        }
    }
}

impl WatchOptions {
    pub fn tail(tail_events: usize) -> Self {
        Self {
            bootstrap: false,
            tail_events,
        }
    }
}

pub type WatchReceiver = mpsc::UnboundedReceiver<Event>;

struct Subscriber {
    namespace: String,
    kind: String,
    id: Option<String>,
    tx: mpsc::UnboundedSender<Event>,
}

impl Subscriber {
    fn matches(&self, resource: &AnyResource) -> bool {
        resource.metadata.namespace == self.namespace
            && resource.metadata.kind == self.kind
            && self
                .id
                .as_ref()
                .is_none_or(|id| *id == resource.metadata.id)
    }
}

type Key = (String, String, String);

fn key(meta: &ResourceRef) -> Key {
    (
        meta.namespace.clone(),
        meta.kind.clone(),
        meta.id.clone(),
    )
}

struct Inner {
    resources: BTreeMap<Key, AnyResource>,
    history: VecDeque<Event>,
    subscribers: Vec<Subscriber>,
    kind_sequences: HashMap<(String, String), u64>,
    journal: Option<Journal>,
    failed: bool,
}

impl Inner {
    fn next_sequence(&mut self, namespace: &str, kind: &str) -> u64 {
        let counter = self
            .kind_sequences
            .entry((namespace.to_string(), kind.to_string()))
            .or_insert(0);
        *counter += 1;
        *counter
    }

    fn journal_put(&mut self, resource: &AnyResource) -> Result<()> {
        if let Some(journal) = self.journal.as_mut() {
            if let Err(e) = journal.append_put(resource) {
                self.fail();
                return Err(Error::Journal("append failed".to_string(), e));
            }
        }
        Ok(())
    }

    fn journal_delete(&mut self, reference: &ResourceRef) -> Result<()> {
        if let Some(journal) = self.journal.as_mut() {
            if let Err(e) =
                journal.append_delete(&reference.namespace, &reference.kind, &reference.id)
            {
                self.fail();
                return Err(Error::Journal("append failed".to_string(), e));
            }
        }
        Ok(())
    }

    /// Catastrophic store failure: terminate every watcher with `Errored`.
    fn fail(&mut self) {
        self.failed = true;
        for sub in self.subscribers.drain(..) {
            let _ = sub.tx.send(Event::marker(EventKind::Errored));
        }
    }

    fn publish(&mut self, kind: EventKind, resource: AnyResource, old: Option<AnyResource>) {
        let (namespace, kind_name) = (
            resource.metadata.namespace.clone(),
            resource.metadata.kind.clone(),
        );
        let sequence = self.next_sequence(&namespace, &kind_name);
        let event = Event {
            kind,
            sequence,
            resource: Some(resource),
            old,
        };

        self.history.push_back(event.clone());
        while self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }

        let subject = event.resource.as_ref().expect("publish always has a subject");
        self.subscribers
            .retain(|sub| !sub.matches(subject) || sub.tx.send(event.clone()).is_ok());
    }

    /// Owner gate: matching owners pass, and a controller may adopt a
    /// resource seeded without an owner. Everything else is a permission
    /// error.
    fn check_owner(&self, stored: &AnyResource, opts: &WriteOptions) -> Result<()> {
        match (&stored.metadata.owner, &opts.owner) {
            (held, requested) if held == requested => Ok(()),
            (None, Some(_)) => Ok(()),
            (held, requested) => Err(Error::Permission {
                reference: stored.reference(),
                held: held.clone(),
                requested: requested.clone(),
            }),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.failed {
            return Err(Error::Failed("store entered failed state".to_string()));
        }
        Ok(())
    }
}

pub struct Store {
    inner: Mutex<Inner>,
}

impl Store {
    /// Volatile store; nothing survives the process.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                resources: BTreeMap::new(),
                history: VecDeque::new(),
                subscribers: Vec::new(),
                kind_sequences: HashMap::new(),
                journal: None,
                failed: false,
            }),
        }
    }

    /// Open a journalled store rooted at `dir`, replaying and compacting the
    /// journal. Replayed resources keep their metadata, including versions.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let (journal, live) =
            Journal::open(dir).map_err(|e| Error::Journal("open failed".to_string(), e))?;

        let store = Self::in_memory();
        {
            let mut inner = store.inner.lock().expect("store lock poisoned");
            inner.journal = Some(journal);
            for resource in live {
                inner
                    .resources
                    .insert(key(&resource.reference()), resource);
            }
        }
        Ok(store)
    }

    pub fn get_any(&self, reference: &ResourceRef) -> Result<AnyResource> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner.ensure_live()?;
        inner
            .resources
            .get(&key(reference))
            .cloned()
            .ok_or_else(|| Error::NotFound(reference.clone()))
    }

    pub fn get<T: ResourceSpec>(&self, id: &str) -> Result<Resource<T>> {
        let reference = ResourceRef::new(T::NAMESPACE, T::KIND, id);
        Ok(self.get_any(&reference)?.typed()?)
    }

    /// List a kind, ordered by id, optionally filtered by labels.
    pub fn list_any(&self, namespace: &str, kind: &str, query: &LabelQuery) -> Result<Vec<AnyResource>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner.ensure_live()?;
        let from = (namespace.to_string(), kind.to_string(), String::new());
        Ok(inner
            .resources
            .range(from..)
            .take_while(|((ns, k, _), _)| ns == namespace && k == kind)
            .map(|(_, r)| r)
            .filter(|r| query.matches(&r.metadata))
            .cloned()
            .collect())
    }

    pub fn list<T: ResourceSpec>(&self, query: &LabelQuery) -> Result<Vec<Resource<T>>> {
        self.list_any(T::NAMESPACE, T::KIND, query)?
            .iter()
            .map(|any| any.typed().map_err(Error::from))
            .collect()
    }

    pub fn create_any(&self, mut resource: AnyResource, opts: &WriteOptions) -> Result<AnyResource> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.ensure_live()?;

        let k = key(&resource.reference());
        if inner.resources.contains_key(&k) {
            return Err(Error::AlreadyExists(resource.reference()));
        }

        let now = chrono_now();
        resource.metadata.version = 1;
        resource.metadata.phase = Phase::Running;
        resource.metadata.owner = opts.owner.clone();
        resource.metadata.created = now;
        resource.metadata.updated = now;

        inner.journal_put(&resource)?;
        inner.resources.insert(k, resource.clone());
        inner.publish(EventKind::Created, resource.clone(), None);
        Ok(resource)
    }

    pub fn create<T: ResourceSpec>(
        &self,
        resource: Resource<T>,
        opts: &WriteOptions,
    ) -> Result<Resource<T>> {
        Ok(self.create_any(resource.into_any()?, opts)?.typed()?)
    }

    /// Update payload and labels. The passed resource must carry the version
    /// last observed; a stale version is a conflict.
    pub fn update_any(&self, resource: AnyResource, opts: &WriteOptions) -> Result<AnyResource> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.ensure_live()?;

        let k = key(&resource.reference());
        let stored = inner
            .resources
            .get(&k)
            .ok_or_else(|| Error::NotFound(resource.reference()))?
            .clone();

        inner.check_owner(&stored, opts)?;
        if stored.metadata.phase == Phase::TearingDown {
            return Err(Error::PhaseConflict(resource.reference()));
        }
        if stored.metadata.version != resource.metadata.version {
            return Err(Error::Conflict {
                reference: resource.reference(),
                expected: resource.metadata.version,
                found: stored.metadata.version,
            });
        }

        let mut next = stored.clone();
        next.spec = resource.spec;
        next.metadata.labels = resource.metadata.labels;
        if next.metadata.owner.is_none() {
            next.metadata.owner = opts.owner.clone();
        }
        next.metadata.version += 1;
        next.metadata.updated = chrono_now();

        inner.journal_put(&next)?;
        inner.resources.insert(k, next.clone());
        inner.publish(EventKind::Updated, next.clone(), Some(stored));
        Ok(next)
    }

    pub fn update<T: ResourceSpec>(
        &self,
        resource: Resource<T>,
        opts: &WriteOptions,
    ) -> Result<Resource<T>> {
        Ok(self.update_any(resource.into_any()?, opts)?.typed()?)
    }

    /// Read-modify-write loop retrying on version conflicts until the write
    /// lands.
    pub fn modify<T: ResourceSpec>(
        &self,
        id: &str,
        opts: &WriteOptions,
        mut mutate: impl FnMut(&mut Resource<T>) -> Result<()>,
    ) -> Result<Resource<T>> {
        loop {
            let mut current = self.get::<T>(id)?;
            mutate(&mut current)?;
            match self.update(current, opts) {
                Ok(updated) => return Ok(updated),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Create the resource, or modify it in place when it already exists.
    /// An update that would not change spec or labels is skipped (delivered
    /// to watchers as `Noop`), so reconcilers converging on the same desired
    /// state do not generate version churn.
    pub fn apply<T: ResourceSpec>(
        &self,
        resource: Resource<T>,
        opts: &WriteOptions,
    ) -> Result<Resource<T>> {
        match self.create(resource.clone(), opts) {
            Ok(created) => Ok(created),
            Err(e) if e.is_already_exists() => {
                let existing = self.get::<T>(&resource.metadata.id)?;
                if existing.spec == resource.spec
                    && existing.metadata.labels == resource.metadata.labels
                {
                    self.publish_noop(existing.clone().into_any()?);
                    return Ok(existing);
                }
                self.modify(&resource.metadata.id, opts, |r| {
                    r.spec = resource.spec.clone();
                    r.metadata.labels = resource.metadata.labels.clone();
                    Ok(())
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Announce a write that changed nothing.
    fn publish_noop(&self, resource: AnyResource) {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if inner.failed {
            return;
        }
        inner.publish(EventKind::Noop, resource, None);
    }

    /// Move the resource into tearing-down. Returns true iff the finalizer
    /// set is already empty, so the caller may destroy immediately.
    pub fn teardown(&self, reference: &ResourceRef, opts: &WriteOptions) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.ensure_live()?;

        let k = key(reference);
        let stored = inner
            .resources
            .get(&k)
            .ok_or_else(|| Error::NotFound(reference.clone()))?
            .clone();
        inner.check_owner(&stored, opts)?;

        if stored.metadata.phase == Phase::TearingDown {
            return Ok(stored.metadata.finalizers.is_empty());
        }

        let mut next = stored.clone();
        next.metadata.phase = Phase::TearingDown;
        next.metadata.version += 1;
        next.metadata.updated = chrono_now();

        inner.journal_put(&next)?;
        let ready = next.metadata.finalizers.is_empty();
        inner.resources.insert(k, next.clone());
        inner.publish(EventKind::Updated, next, Some(stored));
        Ok(ready)
    }

    /// Remove the resource. Rejected while finalizers remain.
    pub fn destroy(&self, reference: &ResourceRef, opts: &WriteOptions) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.ensure_live()?;

        let k = key(reference);
        let stored = inner
            .resources
            .get(&k)
            .ok_or_else(|| Error::NotFound(reference.clone()))?
            .clone();
        inner.check_owner(&stored, opts)?;

        if !stored.metadata.finalizers.is_empty() {
            return Err(Error::PhaseConflict(reference.clone()));
        }

        inner.journal_delete(reference)?;
        inner.resources.remove(&k);
        inner.publish(EventKind::Destroyed, stored, None);
        Ok(())
    }

    /// Finalizer edits are allowed in any phase and regardless of owner.
    pub fn add_finalizer(&self, reference: &ResourceRef, finalizer: &str) -> Result<()> {
        self.edit_finalizers(reference, |meta| meta.add_finalizer(finalizer))
    }

    pub fn remove_finalizer(&self, reference: &ResourceRef, finalizer: &str) -> Result<()> {
        self.edit_finalizers(reference, |meta| meta.remove_finalizer(finalizer))
    }

    fn edit_finalizers(
        &self,
        reference: &ResourceRef,
        edit: impl FnOnce(&mut talemu_resource::Metadata) -> bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.ensure_live()?;

        let k = key(reference);
        let stored = inner
            .resources
            .get(&k)
            .ok_or_else(|| Error::NotFound(reference.clone()))?
            .clone();

        let mut next = stored.clone();
        if !edit(&mut next.metadata) {
            return Ok(());
        }
        next.metadata.version += 1;

        inner.journal_put(&next)?;
        inner.resources.insert(k, next.clone());
        inner.publish(EventKind::Updated, next, Some(stored));
        Ok(())
    }

    /// Watch one resource.
    pub fn watch(&self, reference: &ResourceRef, opts: WatchOptions) -> WatchReceiver {
        self.subscribe(
            &reference.namespace,
            &reference.kind,
            Some(reference.id.clone()),
            opts,
        )
    }

    /// Watch every resource of a kind.
    pub fn watch_kind(&self, namespace: &str, kind: &str, opts: WatchOptions) -> WatchReceiver {
        self.subscribe(namespace, kind, None, opts)
    }

    fn subscribe(
        &self,
        namespace: &str,
        kind: &str,
        id: Option<String>,
        opts: WatchOptions,
    ) -> WatchReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("store lock poisoned");

        if inner.failed {
            let _ = tx.send(Event::marker(EventKind::Errored));
            return rx;
        }

        let sub = Subscriber {
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            id,
            tx,
        };

        if opts.tail_events > 0 {
            let tail = opts.tail_events + HISTORY_GAP_TOLERANCE;
            let matching: Vec<&Event> = inner
                .history
                .iter()
                .filter(|e| e.resource.as_ref().is_some_and(|r| sub.matches(r)))
                .collect();
            let start = matching.len().saturating_sub(tail);
            let replay: Vec<Event> = matching[start..].iter().map(|e| (*e).clone()).collect();
            for event in replay {
                let _ = sub.tx.send(event);
            }
        } else if opts.bootstrap {
            let snapshot: Vec<AnyResource> = inner
                .resources
                .values()
                .filter(|r| sub.matches(r))
                .cloned()
                .collect();
            for resource in snapshot {
                let _ = sub.tx.send(Event {
                    kind: EventKind::Created,
                    sequence: 0,
                    resource: Some(resource),
                    old: None,
                });
            }
            let _ = sub.tx.send(Event::marker(EventKind::Bootstrapped));
        }

        inner.subscribers.push(sub);
        rx
    }

    /// Wait until the resource satisfies the predicate. The current state
    /// counts; there is no upper bound on the wait beyond the caller's own
    /// cancellation.
    pub async fn watch_for<T: ResourceSpec>(
        &self,
        id: &str,
        predicate: impl Fn(&Resource<T>) -> bool,
    ) -> Result<Resource<T>> {
        let reference = ResourceRef::new(T::NAMESPACE, T::KIND, id);
        let mut rx = self.watch(&reference, WatchOptions::default());

        while let Some(event) = rx.recv().await {
            match event.kind {
                EventKind::Created | EventKind::Updated => {
                    let resource: Resource<T> =
                        event.resource.as_ref().expect("subject present").typed()?;
                    if predicate(&resource) {
                        return Ok(resource);
                    }
                }
                EventKind::Errored => {
                    return Err(Error::Failed("watch terminated".to_string()));
                }
                _ => {}
            }
        }
        Err(Error::Failed("watch closed".to_string()))
    }

    /// Wait until the resource's finalizer set empties or the resource is
    /// gone. No upper bound; run under a cancellable context.
    pub async fn wait_finalizers_empty(&self, reference: &ResourceRef) -> Result<()> {
        let mut rx = self.watch(reference, WatchOptions::default());

        match self.get_any(reference) {
            Ok(current) if current.metadata.finalizers.is_empty() => return Ok(()),
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }

        while let Some(event) = rx.recv().await {
            match event.kind {
                EventKind::Updated | EventKind::Created => {
                    if event
                        .resource
                        .as_ref()
                        .is_some_and(|r| r.metadata.finalizers.is_empty())
                    {
                        return Ok(());
                    }
                }
                EventKind::Destroyed => return Ok(()),
                EventKind::Errored => {
                    return Err(Error::Failed("watch terminated".to_string()));
                }
                _ => {}
            }
        }
        Err(Error::Failed("watch closed".to_string()))
    }

    /// Current per-kind delivery sequence, for sizing tail replays.
    pub fn kind_sequence(&self, namespace: &str, kind: &str) -> u64 {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner
            .kind_sequences
            .get(&(namespace.to_string(), kind.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use talemu_resource::runtime::{RebootSpec, Service};

    fn service(id: &str, running: bool) -> Resource<Service> {
        Resource::new(
            id,
            Service {
                running,
                healthy: false,
            },
        )
    }

    #[test]
    fn test_create_get_list_ordered_by_id() {
        let store = Store::in_memory();
        store
            .create(service("kubelet", false), &WriteOptions::system())
            .unwrap();
        store
            .create(service("apid", true), &WriteOptions::system())
            .unwrap();
        store
            .create(service("etcd", false), &WriteOptions::system())
            .unwrap();

        let all = store.list::<Service>(&LabelQuery::new()).unwrap();
        let ids: Vec<&str> = all.iter().map(|s| s.metadata.id.as_str()).collect();
        assert_eq!(ids, vec!["apid", "etcd", "kubelet"]);

        let apid = store.get::<Service>("apid").unwrap();
        assert!(apid.spec.running);
        assert_eq!(apid.metadata.version, 1);
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let store = Store::in_memory();
        store
            .create(service("apid", false), &WriteOptions::system())
            .unwrap();
        let err = store
            .create(service("apid", false), &WriteOptions::system())
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_stale_update_conflicts() {
        let store = Store::in_memory();
        let created = store
            .create(service("apid", false), &WriteOptions::system())
            .unwrap();

        let mut fresh = created.clone();
        fresh.spec.running = true;
        let updated = store.update(fresh, &WriteOptions::system()).unwrap();
        assert_eq!(updated.metadata.version, 2);

        // Re-issuing the first observation now carries a stale version.
        let mut stale = created;
        stale.spec.healthy = true;
        let err = store.update(stale, &WriteOptions::system()).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_modify_retries_conflicts() {
        let store = Store::in_memory();
        store
            .create(service("apid", false), &WriteOptions::system())
            .unwrap();

        let updated = store
            .modify::<Service>("apid", &WriteOptions::system(), |s| {
                s.spec.running = true;
                Ok(())
            })
            .unwrap();
        assert!(updated.spec.running);
        assert_eq!(updated.metadata.version, 2);
    }

    #[test]
    fn test_owner_exclusivity() {
        let store = Store::in_memory();
        let owned = WriteOptions::owned_by("ServiceController");
        let created = store.create(service("apid", false), &owned).unwrap();
        assert_eq!(created.metadata.owner.as_deref(), Some("ServiceController"));

        let mut update = created.clone();
        update.spec.running = true;
        let err = store
            .update(update, &WriteOptions::owned_by("Intruder"))
            .unwrap_err();
        assert!(matches!(err, Error::Permission { .. }));

        let err = store
            .destroy(&created.reference(), &WriteOptions::system())
            .unwrap_err();
        assert!(matches!(err, Error::Permission { .. }));
    }

    #[test]
    fn test_teardown_and_finalizers() {
        let store = Store::in_memory();
        let created = store
            .create(service("etcd", true), &WriteOptions::system())
            .unwrap();
        let reference = created.reference();

        store.add_finalizer(&reference, "EtcdController").unwrap();

        let ready = store.teardown(&reference, &WriteOptions::system()).unwrap();
        assert!(!ready);

        // Payload writes are rejected while tearing down.
        let current = store.get_any(&reference).unwrap();
        let err = store
            .update_any(current, &WriteOptions::system())
            .unwrap_err();
        assert!(err.is_phase_conflict());

        // Destroy is blocked until the finalizer clears.
        let err = store
            .destroy(&reference, &WriteOptions::system())
            .unwrap_err();
        assert!(err.is_phase_conflict());

        store
            .remove_finalizer(&reference, "EtcdController")
            .unwrap();
        store.destroy(&reference, &WriteOptions::system()).unwrap();
        assert!(store.get::<Service>("etcd").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_watch_bootstrap_then_live() {
        let store = Store::in_memory();
        store
            .create(service("apid", false), &WriteOptions::system())
            .unwrap();

        let mut rx = store.watch_kind(
            Service::NAMESPACE,
            Service::KIND,
            WatchOptions::default(),
        );

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::Created);
        let boundary = rx.recv().await.unwrap();
        assert_eq!(boundary.kind, EventKind::Bootstrapped);

        store
            .modify::<Service>("apid", &WriteOptions::system(), |s| {
                s.spec.running = true;
                Ok(())
            })
            .unwrap();

        let live = rx.recv().await.unwrap();
        assert_eq!(live.kind, EventKind::Updated);
        let resource: Resource<Service> = live.resource.unwrap().typed().unwrap();
        assert!(resource.spec.running);
    }

    #[tokio::test]
    async fn test_apply_unchanged_emits_noop() {
        let store = Store::in_memory();
        store
            .create(service("apid", true), &WriteOptions::system())
            .unwrap();

        let mut rx = store.watch_kind(
            Service::NAMESPACE,
            Service::KIND,
            WatchOptions::default(),
        );
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Created);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Bootstrapped);

        // Re-applying the same state does not advance the version; watchers
        // see a Noop marker instead of an update.
        let applied = store
            .apply(service("apid", true), &WriteOptions::system())
            .unwrap();
        assert_eq!(applied.metadata.version, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Noop);
        assert_eq!(
            event.resource.unwrap().metadata.id,
            "apid".to_string()
        );

        // A changed apply is a plain update.
        store
            .apply(service("apid", false), &WriteOptions::system())
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Updated);
    }

    #[tokio::test]
    async fn test_watch_tail_replays_history() {
        let store = Store::in_memory();
        store
            .create(service("apid", false), &WriteOptions::system())
            .unwrap();
        for _ in 0..3 {
            store
                .modify::<Service>("apid", &WriteOptions::system(), |s| {
                    s.spec.running = !s.spec.running;
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(store.kind_sequence(Service::NAMESPACE, Service::KIND), 4);

        let mut rx = store.watch_kind(Service::NAMESPACE, Service::KIND, WatchOptions::tail(2));
        // Gap tolerance padding means all four deliveries are still held.
        let mut versions = Vec::new();
        for _ in 0..4 {
            let event = rx.recv().await.unwrap();
            versions.push(event.resource.unwrap().metadata.version);
        }
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_wait_finalizers_empty() {
        let store = std::sync::Arc::new(Store::in_memory());
        let created = store
            .create(service("apid", false), &WriteOptions::system())
            .unwrap();
        let reference = created.reference();
        store.add_finalizer(&reference, "a").unwrap();

        let waiter = {
            let store = store.clone();
            let reference = reference.clone();
            tokio::spawn(async move { store.wait_finalizers_empty(&reference).await })
        };

        store.remove_finalizer(&reference, "a").unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[test]
    fn test_version_strictly_increases() {
        let store = Store::in_memory();
        let created = store
            .create(service("apid", false), &WriteOptions::system())
            .unwrap();
        let reference = created.reference();

        let mut last = created.metadata.version;
        for _ in 0..5 {
            let updated = store
                .modify::<Service>("apid", &WriteOptions::system(), |s| {
                    s.spec.running = !s.spec.running;
                    Ok(())
                })
                .unwrap();
            assert!(updated.metadata.version > last);
            last = updated.metadata.version;
        }

        store.add_finalizer(&reference, "f").unwrap();
        let after = store.get::<Service>("apid").unwrap();
        assert!(after.metadata.version > last);
    }

    #[test]
    fn test_journalled_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = Store::open(dir.path()).unwrap();
            store
                .create(service("apid", true), &WriteOptions::system())
                .unwrap();
            store
                .create(
                    Resource::new("current", RebootSpec { downtime_secs: 2 }),
                    &WriteOptions::owned_by("RebootController"),
                )
                .unwrap();
            store
                .modify::<Service>("apid", &WriteOptions::system(), |s| {
                    s.spec.healthy = true;
                    Ok(())
                })
                .unwrap();
        }

        let store = Store::open(dir.path()).unwrap();
        let apid = store.get::<Service>("apid").unwrap();
        assert!(apid.spec.healthy);
        assert_eq!(apid.metadata.version, 2);

        let reboot = store.get::<RebootSpec>("current").unwrap();
        assert_eq!(
            reboot.metadata.owner.as_deref(),
            Some("RebootController")
        );
    }
}
