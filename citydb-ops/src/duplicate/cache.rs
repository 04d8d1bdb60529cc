//! Cache d'identités pour la détection de doublons
//!
//! Quatre tables clé/valeur: occurrences par objectid dans le fichier,
//! objectids déjà acceptés, objectids confirmés en base (→ id), ids
//! confirmés (→ objectid). Le backend disque (fjall) vit dans un répertoire
//! temporaire supprimé à la fermeture, y compris en cas de panique.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tempfile::TempDir;
use tracing::debug;

use crate::error::{CacheError, Result};

/// Table clé/valeur du cache
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), CacheError>;

    fn contains(&self, key: &[u8]) -> Result<bool, CacheError>;

    /// Insère si la clé est absente; retourne vrai si l'insertion a eu lieu
    fn insert_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool, CacheError>;

    /// Parcourt les entrées; `f` retourne faux pour arrêter
    fn for_each(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> Result<(), CacheError>;

    fn len(&self) -> Result<usize, CacheError>;

    fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// Supprime une clé; retourne vrai si elle était présente
    fn remove(&self, key: &[u8]) -> Result<bool, CacheError>;

    /// Libère la table; les appels suivants échouent avec `Closed`
    fn close(&self) -> Result<(), CacheError>;
}

fn ensure_open(closed: &AtomicBool) -> Result<(), CacheError> {
    if closed.load(Ordering::SeqCst) {
        return Err(CacheError::Closed);
    }
    Ok(())
}

/// Table en mémoire
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: DashMap<Vec<u8>, Vec<u8>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError> {
        ensure_open(&self.closed)?;
        Ok(self.map.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), CacheError> {
        ensure_open(&self.closed)?;
        self.map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn contains(&self, key: &[u8]) -> Result<bool, CacheError> {
        ensure_open(&self.closed)?;
        Ok(self.map.contains_key(key))
    }

    fn insert_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool, CacheError> {
        ensure_open(&self.closed)?;
        match self.map.entry(key.to_vec()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(value.to_vec());
                Ok(true)
            }
        }
    }

    fn for_each(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> Result<(), CacheError> {
        ensure_open(&self.closed)?;
        // Copie: `f` peut accéder à la même table
        let entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (key, value) in &entries {
            if !f(key, value) {
                break;
            }
        }
        Ok(())
    }

    fn len(&self) -> Result<usize, CacheError> {
        ensure_open(&self.closed)?;
        Ok(self.map.len())
    }

    fn remove(&self, key: &[u8]) -> Result<bool, CacheError> {
        ensure_open(&self.closed)?;
        Ok(self.map.remove(key).is_some())
    }

    fn close(&self) -> Result<(), CacheError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.map.clear();
        }
        Ok(())
    }
}

/// Table sur disque (une partition fjall)
///
/// `close` supprime la partition du keyspace.
pub struct DiskStore {
    keyspace: fjall::Keyspace,
    partition: fjall::PartitionHandle,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl DiskStore {
    fn open(keyspace: &fjall::Keyspace, name: &str) -> Result<Self, CacheError> {
        let partition = keyspace.open_partition(name, fjall::PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace: keyspace.clone(),
            partition,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }
}

impl KeyValueStore for DiskStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError> {
        ensure_open(&self.closed)?;
        Ok(self.partition.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock();
        ensure_open(&self.closed)?;
        self.partition.insert(key, value)?;
        Ok(())
    }

    fn contains(&self, key: &[u8]) -> Result<bool, CacheError> {
        ensure_open(&self.closed)?;
        Ok(self.partition.contains_key(key)?)
    }

    fn insert_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool, CacheError> {
        let _guard = self.write_lock.lock();
        ensure_open(&self.closed)?;
        if self.partition.contains_key(key)? {
            return Ok(false);
        }
        self.partition.insert(key, value)?;
        Ok(true)
    }

    fn for_each(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> Result<(), CacheError> {
        ensure_open(&self.closed)?;
        for entry in self.partition.iter() {
            let (key, value) = entry?;
            if !f(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    fn len(&self) -> Result<usize, CacheError> {
        ensure_open(&self.closed)?;
        Ok(self.partition.len()?)
    }

    fn remove(&self, key: &[u8]) -> Result<bool, CacheError> {
        let _guard = self.write_lock.lock();
        ensure_open(&self.closed)?;
        if !self.partition.contains_key(key)? {
            return Ok(false);
        }
        self.partition.remove(key)?;
        Ok(true)
    }

    fn close(&self) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.keyspace.delete_partition(self.partition.clone())?;
        Ok(())
    }
}

/// Backend du cache
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CacheBackend {
    /// Tables en mémoire (DashMap)
    #[default]
    Memory,
    /// Tables fjall dans un répertoire temporaire (sous `base_dir` si fourni)
    Disk { base_dir: Option<std::path::PathBuf> },
}

struct DiskResources {
    keyspace: fjall::Keyspace,
    dir: TempDir,
}

/// Cache d'identités d'un passage de détection
///
/// Les tables sont déclarées avant les ressources disque: elles sont
/// détruites d'abord, puis le keyspace, puis le répertoire.
pub struct IdentityCache {
    seen: Box<dyn KeyValueStore>,
    accepted: Box<dyn KeyValueStore>,
    objectids: Box<dyn KeyValueStore>,
    ids: Box<dyn KeyValueStore>,
    disk: Option<DiskResources>,
}

fn decode_u64(key: &[u8], bytes: &[u8]) -> Result<u64, CacheError> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| CacheError::Corrupted {
        key: String::from_utf8_lossy(key).into_owned(),
    })?;
    Ok(u64::from_be_bytes(array))
}

fn decode_id(key: &[u8], bytes: &[u8]) -> Result<i64, CacheError> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| CacheError::Corrupted {
        key: String::from_utf8_lossy(key).into_owned(),
    })?;
    Ok(i64::from_be_bytes(array))
}

impl IdentityCache {
    pub fn open(backend: &CacheBackend) -> Result<Self, CacheError> {
        match backend {
            CacheBackend::Memory => Ok(Self::in_memory()),
            CacheBackend::Disk { base_dir } => Self::on_disk(base_dir.as_deref()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            seen: Box::new(MemoryStore::new()),
            accepted: Box::new(MemoryStore::new()),
            objectids: Box::new(MemoryStore::new()),
            ids: Box::new(MemoryStore::new()),
            disk: None,
        }
    }

    pub fn on_disk(base_dir: Option<&Path>) -> Result<Self, CacheError> {
        let dir = match base_dir {
            Some(base) => tempfile::Builder::new().prefix("citydb-dedup-").tempdir_in(base)?,
            None => tempfile::Builder::new().prefix("citydb-dedup-").tempdir()?,
        };
        let keyspace = fjall::Config::new(dir.path()).open()?;
        let cache = Self {
            seen: Box::new(DiskStore::open(&keyspace, "seen")?),
            accepted: Box::new(DiskStore::open(&keyspace, "accepted")?),
            objectids: Box::new(DiskStore::open(&keyspace, "objectids")?),
            ids: Box::new(DiskStore::open(&keyspace, "ids")?),
            disk: Some(DiskResources { keyspace, dir }),
        };
        debug!(path = %cache.path().map(|p| p.display().to_string()).unwrap_or_default(), "Opened disk cache");
        Ok(cache)
    }

    /// Répertoire du backend disque
    pub fn path(&self) -> Option<&Path> {
        self.disk.as_ref().map(|d| d.dir.path())
    }

    /// Compte une occurrence; retourne le nombre d'occurrences après ajout
    pub fn record_seen(&self, objectid: &str) -> Result<u64, CacheError> {
        let key = objectid.as_bytes();
        let count = match self.seen.get(key)? {
            Some(bytes) => decode_u64(key, &bytes)? + 1,
            None => 1,
        };
        self.seen.put(key, &count.to_be_bytes())?;
        Ok(count)
    }

    pub fn seen_count(&self, objectid: &str) -> Result<u64, CacheError> {
        let key = objectid.as_bytes();
        match self.seen.get(key)? {
            Some(bytes) => decode_u64(key, &bytes),
            None => Ok(0),
        }
    }

    /// Objectids distincts vus
    pub fn distinct_seen(&self) -> Result<usize, CacheError> {
        self.seen.len()
    }

    /// Enregistre une feature existante en base
    pub fn confirm(&self, objectid: &str, id: i64) -> Result<(), CacheError> {
        self.objectids.put(objectid.as_bytes(), &id.to_be_bytes())?;
        self.ids.put(&id.to_be_bytes(), objectid.as_bytes())
    }

    pub fn is_confirmed(&self, objectid: &str) -> Result<bool, CacheError> {
        self.objectids.contains(objectid.as_bytes())
    }

    pub fn confirmed_id(&self, objectid: &str) -> Result<Option<i64>, CacheError> {
        let key = objectid.as_bytes();
        self.objectids
            .get(key)?
            .map(|bytes| decode_id(key, &bytes))
            .transpose()
    }

    /// Nombre d'ids confirmés en base
    pub fn confirmed_count(&self) -> Result<usize, CacheError> {
        self.ids.len()
    }

    pub fn confirmed_objectids(&self) -> Result<BTreeSet<String>, CacheError> {
        let mut objectids = BTreeSet::new();
        self.objectids.for_each(&mut |key, _| {
            objectids.insert(String::from_utf8_lossy(key).into_owned());
            true
        })?;
        Ok(objectids)
    }

    /// Parcourt les features confirmées (`id`, `objectid`); `f` retourne faux
    /// pour arrêter
    pub fn for_each_confirmed(&self, f: &mut dyn FnMut(i64, &str) -> bool) -> Result<(), CacheError> {
        let mut failure = None;
        self.ids.for_each(&mut |key, value| match decode_id(key, key) {
            Ok(id) => f(id, &String::from_utf8_lossy(value)),
            Err(e) => {
                failure = Some(e);
                false
            }
        })?;
        failure.map_or(Ok(()), Err)
    }

    /// Marque un objectid comme accepté; faux s'il l'était déjà
    pub fn mark_accepted(&self, objectid: &str) -> Result<bool, CacheError> {
        self.accepted.insert_if_absent(objectid.as_bytes(), &[])
    }

    /// Ferme le cache et supprime le répertoire disque
    ///
    /// Toutes les tables sont fermées même si l'une échoue; la première
    /// erreur est retournée après suppression du répertoire.
    pub fn close(self) -> Result<(), CacheError> {
        let Self {
            seen,
            accepted,
            objectids,
            ids,
            disk,
        } = self;
        let mut failure = None;
        for store in [&seen, &accepted, &objectids, &ids] {
            if let Err(e) = store.close() {
                failure.get_or_insert(e);
            }
        }
        drop((seen, accepted, objectids, ids));
        if let Some(DiskResources { keyspace, dir }) = disk {
            drop(keyspace);
            let path = dir.path().to_path_buf();
            dir.close()?;
            debug!(path = %path.display(), "Removed disk cache");
        }
        failure.map_or(Ok(()), Err)
    }
}
