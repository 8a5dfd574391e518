//! Replicated job store.
//!
//! The store keeps the newest known [`MeshEntry`] of every job.  Entries
//! coming from the local API and from peers are all funnelled through
//! [`Store::merge`], which resolves conflicts with a last-writer-wins rule
//! on the `updated` timestamp and tells every registered [`Observer`] about
//! the entries it accepted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::sync::{Mutex, RwLock};

use crate::codec::{self, Decoder};
use crate::types::MeshEntry;

/// Something interested in accepted entries, the task reconciler being
/// the main one.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Called once for every entry the store accepted.  Observers may
    /// read the store, but must not merge into it.
    async fn on_update(&self, entry: Arc<MeshEntry>);
}

#[derive(Default)]
pub struct Store {
    entries: RwLock<HashMap<String, Arc<MeshEntry>>>,
    observers: RwLock<Vec<(String, Arc<dyn Observer>)>>,

    /// Serializes whole merge calls, so observers see the entries of one
    /// job in the order they were accepted.
    merging: Mutex<()>,
}

enum Outcome {
    Accepted,
    /// Same content as the stored entry.
    Unchanged,
    Rejected,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `observer` under `key`.  Registering an existing key
    /// replaces the previous observer and keeps its position.
    pub async fn register_observer(&self, key: impl Into<String>, observer: Arc<dyn Observer>) {
        let key = key.into();
        let mut observers = self.observers.write().await;
        match observers.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = observer,
            None => observers.push((key, observer)),
        }
    }

    /// Merges a stream of length delimited entries and returns the number
    /// of entries accepted.
    ///
    /// A malformed frame aborts the call, entries decoded before it stay
    /// merged.
    pub async fn merge(&self, buf: &[u8]) -> Result<usize, codec::Error> {
        let _merging = self.merging.lock().await;

        let mut accepted = 0;
        for entry in Decoder::new(buf) {
            let entry = Arc::new(entry?);

            let outcome = {
                let mut entries = self.entries.write().await;
                Self::merge_one(&mut entries, &entry)
            };

            match outcome {
                Outcome::Accepted => {
                    accepted += 1;
                    self.notify(entry).await;
                }
                Outcome::Unchanged => accepted += 1,
                Outcome::Rejected => {
                    debug!("Discard stale entry {} updated at {}", entry.name, entry.updated);
                }
            }
        }

        Ok(accepted)
    }

    fn merge_one(entries: &mut HashMap<String, Arc<MeshEntry>>, entry: &Arc<MeshEntry>) -> Outcome {
        match entries.get(&entry.name) {
            Some(prev) if prev.updated > entry.updated => Outcome::Rejected,
            Some(prev) if **prev == **entry => Outcome::Unchanged,
            _ => {
                entries.insert(entry.name.clone(), Arc::clone(entry));
                Outcome::Accepted
            }
        }
    }

    async fn notify(&self, entry: Arc<MeshEntry>) {
        let observers = self
            .observers
            .read()
            .await
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect::<Vec<_>>();

        for observer in observers {
            observer.on_update(Arc::clone(&entry)).await;
        }
    }

    /// Encodes every entry, for a full state exchange with a peer.
    pub async fn serialize_all(&self) -> Result<Vec<u8>, codec::Error> {
        let entries = self.entries.read().await;

        let mut buf = Vec::new();
        for entry in entries.values() {
            codec::write_delimited(&mut buf, entry)?;
        }

        Ok(buf)
    }

    /// Sorted names of all known jobs, tombstones included.
    pub async fn job_names(&self) -> Vec<String> {
        let mut names = self
            .entries
            .read()
            .await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    /// All entries, sorted by job name.
    pub async fn snapshot(&self) -> Vec<Arc<MeshEntry>> {
        let mut entries = self
            .entries
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub async fn get(&self, name: &str) -> Option<Arc<MeshEntry>> {
        self.entries.read().await.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::types::{Status, TargetGroup};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn active(name: &str, secs: i64, targets: &[&str]) -> MeshEntry {
        MeshEntry::active(
            name,
            at(secs),
            TargetGroup {
                targets: targets.iter().map(|t| t.to_string()).collect(),
                labels: [("dc".to_string(), "eu".to_string())].into_iter().collect(),
            },
        )
    }

    fn frames(entries: &[MeshEntry]) -> Vec<u8> {
        let mut buf = Vec::new();
        for entry in entries {
            codec::write_delimited(&mut buf, entry).unwrap();
        }
        buf
    }

    #[derive(Default)]
    struct Recorder {
        tag: &'static str,
        seen: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Observer for Recorder {
        async fn on_update(&self, entry: Arc<MeshEntry>) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}@{}", self.tag, entry.name, entry.updated.timestamp()));
        }
    }

    #[tokio::test]
    async fn idempotent_merge() {
        let store = Store::new();
        let entry = active("j", 10, &["10.0.0.1"]);

        store.merge(&frames(&[entry.clone()])).await.unwrap();
        store.merge(&frames(&[entry.clone()])).await.unwrap();

        assert_eq!(*store.get("j").await.unwrap(), entry);
        assert_eq!(store.job_names().await, vec!["j".to_string()]);
    }

    #[tokio::test]
    async fn last_writer_wins_in_any_order() {
        let newer = active("j", 20, &["10.0.0.1"]);
        let older = active("j", 10, &["10.0.0.2"]);

        let store = Store::new();
        store.merge(&frames(&[newer.clone()])).await.unwrap();
        assert_eq!(store.merge(&frames(&[older.clone()])).await.unwrap(), 0);
        assert_eq!(*store.get("j").await.unwrap(), newer);

        let store = Store::new();
        store.merge(&frames(&[older])).await.unwrap();
        assert_eq!(store.merge(&frames(&[newer.clone()])).await.unwrap(), 1);
        assert_eq!(*store.get("j").await.unwrap(), newer);
    }

    #[tokio::test]
    async fn equal_timestamps_favor_incoming() {
        let store = Store::new();
        store.merge(&frames(&[active("j", 10, &["10.0.0.1"])])).await.unwrap();

        let incoming = active("j", 10, &["10.0.0.9"]);
        store.merge(&frames(&[incoming.clone()])).await.unwrap();
        assert_eq!(*store.get("j").await.unwrap(), incoming);
    }

    #[tokio::test]
    async fn tombstone_outranks_older_active() {
        let store = Store::new();
        store
            .merge(&frames(&[MeshEntry::inactive("j", at(20)), active("j", 10, &["10.0.0.1"])]))
            .await
            .unwrap();

        let entry = store.get("j").await.unwrap();
        assert_eq!(entry.status, Status::Inactive);
        assert!(entry.target_group.is_none());
        assert_eq!(store.job_names().await, vec!["j".to_string()]);
    }

    #[tokio::test]
    async fn decode_error_keeps_earlier_entries() {
        let store = Store::new();
        let mut buf = frames(&[active("a", 1, &[]), active("b", 1, &[])]);
        buf.extend_from_slice(&[0x05, b'{']);

        let result = store.merge(&buf).await;
        assert!(matches!(result, Err(codec::Error::TruncatedPayload { .. })));
        assert_eq!(store.job_names().await, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn observers_notified_in_order_on_accept_only() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let store = Store::new();
        store
            .register_observer(
                "first",
                Arc::new(Recorder {
                    tag: "1",
                    seen: Arc::clone(&seen),
                }),
            )
            .await;
        store
            .register_observer(
                "second",
                Arc::new(Recorder {
                    tag: "2",
                    seen: Arc::clone(&seen),
                }),
            )
            .await;

        let entry = active("j", 10, &["10.0.0.1"]);
        store.merge(&frames(&[entry.clone()])).await.unwrap();
        // stale, then retransmitted
        store.merge(&frames(&[active("j", 5, &[])])).await.unwrap();
        store.merge(&frames(&[entry])).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["1:j@10", "2:j@10"]);
    }

    /// Reads the store back while being notified.
    struct Reader {
        store: Arc<Store>,
        seen: Arc<StdMutex<Vec<(Option<Arc<MeshEntry>>, Vec<String>)>>>,
    }

    #[async_trait]
    impl Observer for Reader {
        async fn on_update(&self, entry: Arc<MeshEntry>) {
            let stored = self.store.get(&entry.name).await;
            let names = self.store.job_names().await;
            self.seen.lock().unwrap().push((stored, names));
        }
    }

    #[tokio::test]
    async fn observers_can_read_the_store() {
        let store = Arc::new(Store::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        store
            .register_observer(
                "reader",
                Arc::new(Reader {
                    store: Arc::clone(&store),
                    seen: Arc::clone(&seen),
                }),
            )
            .await;

        let entry = active("j", 10, &["10.0.0.1"]);
        let accepted = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            store.merge(&frames(&[entry.clone()])),
        )
        .await
        .expect("merge must not wait on its own observers")
        .unwrap();
        assert_eq!(accepted, 1);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.as_deref(), Some(&entry));
        assert_eq!(seen[0].1, vec!["j".to_string()]);
    }

    #[tokio::test]
    async fn register_replaces_by_key() {
        let old = Arc::new(StdMutex::new(Vec::new()));
        let new = Arc::new(StdMutex::new(Vec::new()));
        let store = Store::new();
        store
            .register_observer(
                "recorder",
                Arc::new(Recorder {
                    tag: "old",
                    seen: Arc::clone(&old),
                }),
            )
            .await;
        store
            .register_observer(
                "recorder",
                Arc::new(Recorder {
                    tag: "new",
                    seen: Arc::clone(&new),
                }),
            )
            .await;

        store.merge(&frames(&[active("j", 1, &[])])).await.unwrap();
        assert!(old.lock().unwrap().is_empty());
        assert_eq!(new.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn serialize_all_round_trip() {
        let store = Store::new();
        let entries = vec![
            active("web", 10, &["10.0.0.1", "10.0.0.2"]),
            active("db", 11, &["10.0.1.1"]),
            MeshEntry::inactive("old", at(12)),
        ];
        store.merge(&frames(&entries)).await.unwrap();

        let copy = Store::new();
        let accepted = copy.merge(&store.serialize_all().await.unwrap()).await.unwrap();
        assert_eq!(accepted, 3);

        let original = store.snapshot().await;
        let replica = copy.snapshot().await;
        assert_eq!(original, replica);
    }

    #[tokio::test]
    async fn empty_merge() {
        let store = Store::new();
        assert_eq!(store.merge(&[]).await.unwrap(), 0);
        assert!(store.serialize_all().await.unwrap().is_empty());
    }
}
