//! In-memory resource store with a spec/status split, optimistic concurrency
//! and a broadcast watch.

use chrono::Utc;
use dashmap::DashMap;
use hs_types::{
    Deployment, Experiment, HsResult, ObjectKey, OwnerReference, PersistentVolume,
    PersistentVolumeClaim, Resource, Role, RoleBinding, Service, ServiceAccount, StoreError,
    Suggestion, Trial,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::events::EventRecorder;

const WATCH_CAPACITY: usize = 1024;
const EVENT_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WatchAction {
    Added,
    Modified,
    Deleted,
}

/// Change notification broadcast to every watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: &'static str,
    pub key: ObjectKey,
    pub owner: Option<OwnerReference>,
    pub action: WatchAction,
}

/// Record kinds the store keeps a collection for.
pub trait Stored: Resource {
    fn collection(store: &Store) -> &DashMap<ObjectKey, Self>;
}

macro_rules! stored {
    ($ty:ty, $field:ident) => {
        impl Stored for $ty {
            fn collection(store: &Store) -> &DashMap<ObjectKey, Self> {
                &store.$field
            }
        }
    };
}

stored!(Experiment, experiments);
stored!(Trial, trials);
stored!(Suggestion, suggestions);
stored!(Deployment, deployments);
stored!(Service, services);
stored!(PersistentVolumeClaim, volume_claims);
stored!(PersistentVolume, volumes);
stored!(ServiceAccount, service_accounts);
stored!(Role, roles);
stored!(RoleBinding, role_bindings);

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub creates: u64,
    pub updates: u64,
    pub status_updates: u64,
    pub deletes: u64,
    pub conflicts: u64,
}

/// Shared store of every record the controllers read and write.
#[derive(Debug)]
pub struct Store {
    experiments: DashMap<ObjectKey, Experiment>,
    trials: DashMap<ObjectKey, Trial>,
    suggestions: DashMap<ObjectKey, Suggestion>,
    deployments: DashMap<ObjectKey, Deployment>,
    services: DashMap<ObjectKey, Service>,
    volume_claims: DashMap<ObjectKey, PersistentVolumeClaim>,
    volumes: DashMap<ObjectKey, PersistentVolume>,
    service_accounts: DashMap<ObjectKey, ServiceAccount>,
    roles: DashMap<ObjectKey, Role>,
    role_bindings: DashMap<ObjectKey, RoleBinding>,

    version: AtomicU64,
    watch_tx: broadcast::Sender<WatchEvent>,
    events: EventRecorder,
    stats: RwLock<StoreStats>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let (watch_tx, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            experiments: DashMap::new(),
            trials: DashMap::new(),
            suggestions: DashMap::new(),
            deployments: DashMap::new(),
            services: DashMap::new(),
            volume_claims: DashMap::new(),
            volumes: DashMap::new(),
            service_accounts: DashMap::new(),
            roles: DashMap::new(),
            role_bindings: DashMap::new(),
            version: AtomicU64::new(0),
            watch_tx,
            events: EventRecorder::new(EVENT_CAPACITY),
            stats: RwLock::new(StoreStats::default()),
        }
    }

    pub fn events(&self) -> &EventRecorder {
        &self.events
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.read().clone()
    }

    /// Subscribe to change notifications of every kind.
    pub fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.watch_tx.subscribe()
    }

    /// Insert a new record. Assigns uid, creation timestamp, resource
    /// version and generation 1.
    pub fn create<R: Stored>(&self, mut obj: R) -> HsResult<R> {
        let key = obj.key();
        let collection = R::collection(self);

        let stored = match collection.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StoreError::AlreadyExists {
                    kind: R::KIND.to_string(),
                    key: key.to_string(),
                }
                .into());
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let meta = obj.meta_mut();
                meta.uid = Some(Uuid::new_v4());
                meta.creation_timestamp = Some(Utc::now());
                meta.deletion_timestamp = None;
                meta.generation = 1;
                meta.resource_version = self.next_version();
                slot.insert(obj.clone());
                obj
            }
        };

        self.stats.write().creates += 1;
        debug!(kind = R::KIND, key = %key, "created");
        self.notify(&stored, WatchAction::Added);
        Ok(stored)
    }

    pub fn get<R: Stored>(&self, key: &ObjectKey) -> HsResult<R> {
        self.try_get(key).ok_or_else(|| not_found::<R>(key).into())
    }

    pub fn try_get<R: Stored>(&self, key: &ObjectKey) -> Option<R> {
        R::collection(self).get(key).map(|r| r.value().clone())
    }

    pub fn exists<R: Stored>(&self, key: &ObjectKey) -> bool {
        R::collection(self).contains_key(key)
    }

    /// Records of a namespace whose labels match every entry of `selector`,
    /// ordered by name.
    pub fn list<R: Stored>(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Vec<R> {
        let mut items: Vec<R> = R::collection(self)
            .iter()
            .filter(|r| r.key().namespace == namespace && r.value().meta().matches_labels(selector))
            .map(|r| r.value().clone())
            .collect();
        items.sort_by(|a, b| a.meta().name.cmp(&b.meta().name));
        items
    }

    /// Records whose owner reference points at `owner_uid`, ordered by name.
    pub fn list_owned<R: Stored>(&self, owner_uid: Uuid) -> Vec<R> {
        let mut items: Vec<R> = R::collection(self)
            .iter()
            .filter(|r| {
                r.value()
                    .meta()
                    .owner
                    .as_ref()
                    .map(|o| o.uid == owner_uid)
                    .unwrap_or(false)
            })
            .map(|r| r.value().clone())
            .collect();
        items.sort_by(|a, b| a.meta().name.cmp(&b.meta().name));
        items
    }

    /// Keys of every record of a kind, across namespaces.
    pub fn keys<R: Stored>(&self) -> Vec<ObjectKey> {
        R::collection(self).iter().map(|r| r.key().clone()).collect()
    }

    /// Write spec and metadata. The stored status is kept, the generation is
    /// bumped, and a deleting record whose last finalizer was removed is
    /// purged.
    pub fn update<R: Stored>(&self, mut obj: R) -> HsResult<R> {
        let key = obj.key();
        let collection = R::collection(self);

        let purge = {
            let mut current = collection
                .get_mut(&key)
                .ok_or_else(|| not_found::<R>(&key))?;
            self.check_version(current.value(), &obj)?;

            obj.replace_status(current.value());
            let previous = current.meta().clone();
            let meta = obj.meta_mut();
            meta.uid = previous.uid;
            meta.creation_timestamp = previous.creation_timestamp;
            meta.deletion_timestamp = previous.deletion_timestamp;
            meta.generation = previous.generation + 1;
            meta.resource_version = self.next_version();

            *current.value_mut() = obj.clone();
            obj.meta().is_deleting() && obj.meta().finalizers.is_empty()
        };

        self.stats.write().updates += 1;
        if purge {
            collection.remove(&key);
            debug!(kind = R::KIND, key = %key, "finalizers cleared, purged");
            self.notify(&obj, WatchAction::Deleted);
        } else {
            self.notify(&obj, WatchAction::Modified);
        }
        Ok(obj)
    }

    /// Write the status document only.
    pub fn update_status<R: Stored>(&self, obj: &R) -> HsResult<R> {
        let key = obj.key();
        let stored = {
            let mut current = R::collection(self)
                .get_mut(&key)
                .ok_or_else(|| not_found::<R>(&key))?;
            self.check_version(current.value(), obj)?;

            current.value_mut().replace_status(obj);
            current.meta_mut().resource_version = self.next_version();
            current.value().clone()
        };

        self.stats.write().status_updates += 1;
        self.notify(&stored, WatchAction::Modified);
        Ok(stored)
    }

    /// Delete a record. One carrying finalizers is only stamped with a
    /// deletion timestamp; it disappears once its finalizers are removed.
    pub fn delete<R: Stored>(&self, key: &ObjectKey) -> HsResult<()> {
        let collection = R::collection(self);

        let marked = {
            let mut current = collection
                .get_mut(key)
                .ok_or_else(|| not_found::<R>(key))?;
            if current.meta().finalizers.is_empty() {
                None
            } else if current.meta().is_deleting() {
                return Ok(());
            } else {
                current.meta_mut().deletion_timestamp = Some(Utc::now());
                current.meta_mut().resource_version = self.next_version();
                Some(current.value().clone())
            }
        };

        self.stats.write().deletes += 1;
        match marked {
            Some(obj) => {
                debug!(kind = R::KIND, key = %key, "marked for deletion");
                self.notify(&obj, WatchAction::Modified);
            }
            None => {
                if let Some((_, obj)) = collection.remove(key) {
                    debug!(kind = R::KIND, key = %key, "deleted");
                    self.notify(&obj, WatchAction::Deleted);
                }
            }
        }
        Ok(())
    }

    fn check_version<R: Stored>(&self, current: &R, incoming: &R) -> HsResult<()> {
        let expected = incoming.meta().resource_version;
        let actual = current.meta().resource_version;
        if expected != actual {
            self.stats.write().conflicts += 1;
            return Err(StoreError::Conflict {
                kind: R::KIND.to_string(),
                key: current.key().to_string(),
                expected,
                actual,
            }
            .into());
        }
        Ok(())
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify<R: Stored>(&self, obj: &R, action: WatchAction) {
        // No receivers is fine; controllers may not be running yet.
        let _ = self.watch_tx.send(WatchEvent {
            kind: R::KIND,
            key: obj.key(),
            owner: obj.meta().owner.clone(),
            action,
        });
    }
}

fn not_found<R: Resource>(key: &ObjectKey) -> StoreError {
    StoreError::NotFound {
        kind: R::KIND.to_string(),
        key: key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_types::{
        AlgorithmSpec, ExperimentSpec, ObjectMeta, ObjectiveSpec, ObjectiveType, TrialConditionType,
        TrialSpec, LABEL_EXPERIMENT_NAME,
    };

    fn experiment(name: &str) -> Experiment {
        Experiment::new(
            ObjectMeta::new("default", name),
            ExperimentSpec {
                objective: ObjectiveSpec::new(ObjectiveType::Maximize, "accuracy"),
                algorithm: AlgorithmSpec::new("random"),
                ..Default::default()
            },
        )
    }

    fn trial(name: &str, experiment: &Experiment) -> Trial {
        let meta = ObjectMeta::new("default", name)
            .with_label(LABEL_EXPERIMENT_NAME, experiment.meta.name.clone())
            .with_owner(experiment.owner_reference().unwrap());
        Trial::new(meta, TrialSpec::default())
    }

    #[test]
    fn test_create_assigns_identity() {
        let store = Store::new();
        let exp = store.create(experiment("mnist")).unwrap();

        assert!(exp.meta.uid.is_some());
        assert!(exp.meta.creation_timestamp.is_some());
        assert_eq!(exp.meta.generation, 1);
        assert!(exp.meta.resource_version > 0);

        let err = store.create(experiment("mnist")).unwrap_err();
        assert!(matches!(
            err,
            hs_types::HsError::Store(StoreError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_update_preserves_status_and_bumps_generation() {
        let store = Store::new();
        let mut exp = store.create(experiment("mnist")).unwrap();

        exp.mark_created("ExperimentCreated", "");
        let exp = store.update_status(&exp).unwrap();
        assert!(exp.is_created());
        assert_eq!(exp.meta.generation, 1);

        let mut edited = exp.clone();
        edited.spec.max_trial_count = Some(20);
        edited.status = Default::default();
        let updated = store.update(edited).unwrap();

        assert_eq!(updated.meta.generation, 2);
        assert_eq!(updated.spec.max_trial_count, Some(20));
        assert!(updated.is_created());
    }

    #[test]
    fn test_status_update_keeps_spec() {
        let store = Store::new();
        let exp = store.create(experiment("mnist")).unwrap();

        let mut stale_spec = exp.clone();
        stale_spec.spec.max_trial_count = Some(99);
        stale_spec.status.trials = 4;
        let stored = store.update_status(&stale_spec).unwrap();

        assert_eq!(stored.spec.max_trial_count, None);
        assert_eq!(stored.status.trials, 4);
    }

    #[test]
    fn test_stale_write_conflicts() {
        let store = Store::new();
        let first = store.create(experiment("mnist")).unwrap();
        let stale = first.clone();

        store.update_status(&first).unwrap();
        let err = store.update_status(&stale).unwrap_err();
        assert!(err.is_conflict());

        let err = store.update(stale).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.stats().conflicts, 2);
    }

    #[test]
    fn test_finalizer_delays_purge() {
        let store = Store::new();
        let mut exp = experiment("mnist");
        exp.meta.finalizers.push("hypersearch.io/cascade-delete".to_string());
        let exp = store.create(exp).unwrap();

        store.delete::<Experiment>(&exp.key()).unwrap();
        let deleting: Experiment = store.get(&exp.key()).unwrap();
        assert!(deleting.meta.is_deleting());

        let mut released = deleting.clone();
        released.meta.finalizers.clear();
        store.update(released).unwrap();
        assert!(!store.exists::<Experiment>(&exp.key()));
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let store = Store::new();
        let err = store
            .delete::<Trial>(&ObjectKey::new("default", "nope"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_list_by_label_and_owner() {
        let store = Store::new();
        let mnist = store.create(experiment("mnist")).unwrap();
        let cifar = store.create(experiment("cifar")).unwrap();

        store.create(trial("mnist-b", &mnist)).unwrap();
        store.create(trial("mnist-a", &mnist)).unwrap();
        store.create(trial("cifar-a", &cifar)).unwrap();

        let mut selector = BTreeMap::new();
        selector.insert(LABEL_EXPERIMENT_NAME.to_string(), "mnist".to_string());
        let listed: Vec<Trial> = store.list("default", &selector);
        let names: Vec<_> = listed.iter().map(|t| t.meta.name.as_str()).collect();
        assert_eq!(names, vec!["mnist-a", "mnist-b"]);

        let owned: Vec<Trial> = store.list_owned(cifar.meta.uid.unwrap());
        assert_eq!(owned.len(), 1);

        let elsewhere: Vec<Trial> = store.list("other", &selector);
        assert!(elsewhere.is_empty());
    }

    #[tokio::test]
    async fn test_watch_reports_changes() {
        let store = Store::new();
        let mut rx = store.watch();

        let exp = store.create(experiment("mnist")).unwrap();
        let mut t = store.create(trial("mnist-a", &exp)).unwrap();
        t.set_condition(TrialConditionType::Created, "TrialCreated", "");
        store.update_status(&t).unwrap();
        store.delete::<Trial>(&t.key()).unwrap();

        let added = rx.recv().await.unwrap();
        assert_eq!(added.kind, "Experiment");
        assert_eq!(added.action, WatchAction::Added);

        let trial_added = rx.recv().await.unwrap();
        assert_eq!(trial_added.kind, "Trial");
        assert_eq!(trial_added.owner.unwrap().name, "mnist");

        assert_eq!(rx.recv().await.unwrap().action, WatchAction::Modified);
        assert_eq!(rx.recv().await.unwrap().action, WatchAction::Deleted);
    }
}
