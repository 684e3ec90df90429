//! Persistent result cache.
//!
//! The cache keeps two tiers of the same table. Reads and writes made while a
//! run is in progress go to the draft; a successful run promotes the draft to
//! the committed tier and writes it to disk, a failed or cancelled run throws
//! the draft away. Entries of a node that was evaluated in full, but which the
//! run neither read nor wrote, are pruned on save.
//!
//! On disk, everything lives under the cache directory:
//!
//! - `results/<hash>` the committed table for the pipeline entry,
//! - `inputs/<hash>` content hashes of every query input at the last save,
//! - `snapshots/<hash>` content hashes of the pipeline scripts, per
//!   collapsed source directory.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Display;
use std::sync::{Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::File;
use crate::core::{Hash32, fingerprint};
use crate::error::CacheError;
use crate::node::NodeId;
use crate::utils::{collapse_paths, parent_dir};

type Table = HashMap<String, Vec<File>>;
type Inputs = BTreeMap<Utf8PathBuf, Hash32>;

#[derive(Debug, Default)]
struct Draft {
    table: Table,
    /// Keys read or written since the last save or reset.
    used: HashSet<String>,
    /// Nodes whose entries were all produced anew since the last save or reset.
    evaluated: HashSet<NodeId>,
}

/// Key of a cache entry. Each variant is a separate namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Whole output of a group, context or bulk query node.
    Pipeline(NodeId),
    /// Output of a per-file query node for one source file.
    QueryFile(NodeId, Utf8PathBuf),
    /// Output of a grouping query node for one tag.
    QueryGroup(NodeId, String),
    /// Running output of a node right before the pull batch at an index.
    BeforePull(NodeId, usize),
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::Pipeline(id) => write!(f, "{id}"),
            CacheKey::QueryFile(id, path) => write!(f, "{id}${path}"),
            CacheKey::QueryGroup(id, tag) => write!(f, "{id}@{tag}"),
            CacheKey::BeforePull(id, index) => write!(f, "{id}#{index}"),
        }
    }
}

#[derive(Debug)]
pub struct Cache {
    dir: Utf8PathBuf,
    name: String,
    committed: Table,
    draft: Mutex<Draft>,
    inputs: Inputs,
    inputs_draft: Inputs,
}

impl Cache {
    /// An empty cache for the pipeline at `entry`, persisted under `dir`.
    pub fn new(dir: impl Into<Utf8PathBuf>, entry: &Utf8Path) -> Self {
        Self {
            dir: dir.into(),
            name: Hash32::hash(entry.as_str()).to_short_hex(),
            committed: Table::new(),
            draft: Mutex::new(Draft::default()),
            inputs: Inputs::new(),
            inputs_draft: Inputs::new(),
        }
    }

    /// Loads the committed table for `entry`.
    ///
    /// A missing or unreadable table yields an empty cache. If the snapshot
    /// of any script directory differs from the current `scripts`, the whole
    /// cache is discarded and saved empty.
    pub fn load(
        dir: impl Into<Utf8PathBuf>,
        entry: &Utf8Path,
        scripts: &[Utf8PathBuf],
    ) -> Result<Self, CacheError> {
        let mut cache = Self::new(dir, entry);

        cache.committed = read_or_default(&cache.results_path());
        cache.inputs = read_or_default(&cache.inputs_path());
        cache.reset();

        let snapshots = snapshot(scripts);
        let stale: Vec<_> = snapshots
            .iter()
            .filter(|(dir, current)| read_or_default::<Inputs>(&cache.snapshot_path(dir)) != **current)
            .collect();

        if !stale.is_empty() {
            tracing::info!("pipeline scripts changed, discarding cache");
            for (dir, current) in stale {
                write(&cache.snapshot_path(dir), current)?;
            }
            cache.clear();
            cache.save()?;
        } else {
            tracing::debug!("loaded {} cache entries", cache.committed.len());
        }

        Ok(cache)
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn results_path(&self) -> Utf8PathBuf {
        self.dir.join("results").join(&self.name)
    }

    fn inputs_path(&self) -> Utf8PathBuf {
        self.dir.join("inputs").join(&self.name)
    }

    fn snapshot_path(&self, dir: &Utf8Path) -> Utf8PathBuf {
        let name = Hash32::hash(dir.as_str()).to_short_hex();
        self.dir.join("snapshots").join(name)
    }

    fn draft(&self) -> std::sync::MutexGuard<'_, Draft> {
        self.draft.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn draft_mut(&mut self) -> &mut Draft {
        self.draft.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has(&self, key: &CacheKey) -> bool {
        self.draft().table.contains_key(&key.to_string())
    }

    pub fn read(&self, key: &CacheKey) -> Option<Vec<File>> {
        let key = key.to_string();
        let mut draft = self.draft();

        let files = draft.table.get(&key).cloned();
        if files.is_some() {
            draft.used.insert(key);
        }

        files
    }

    pub fn write(&self, key: &CacheKey, files: &[File]) {
        let key = key.to_string();
        let mut draft = self.draft();

        draft.table.insert(key.clone(), files.to_vec());
        draft.used.insert(key);
    }

    /// Notes that `id` is being evaluated from scratch, so its entries left
    /// unused by the end of the run are stale.
    pub(crate) fn evaluating(&self, id: NodeId) {
        self.draft().evaluated.insert(id);
    }

    /// Number of entries in the committed tier.
    pub fn len(&self) -> usize {
        self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    /// Prunes stale entries, persists the draft and promotes it to the
    /// committed tier.
    pub fn save(&mut self) -> Result<(), CacheError> {
        let Draft {
            table,
            used,
            evaluated,
        } = self.draft_mut();

        let before = table.len();
        table.retain(|key, _| used.contains(key) || !owner(key).is_some_and(|id| evaluated.contains(&id)));
        if table.len() < before {
            tracing::debug!("pruned {} stale cache entries", before - table.len());
        }

        used.clear();
        evaluated.clear();
        let table = table.clone();

        write(&self.results_path(), &table)?;
        write(&self.inputs_path(), &self.inputs_draft)?;

        self.committed = table;
        self.inputs = self.inputs_draft.clone();

        Ok(())
    }

    /// Throws the draft away, restoring it from the committed tier.
    pub fn reset(&mut self) {
        let committed = self.committed.clone();
        *self.draft_mut() = Draft {
            table: committed,
            ..Default::default()
        };
        self.inputs_draft = self.inputs.clone();
    }

    /// Empties both tiers.
    pub fn clear(&mut self) {
        self.committed.clear();
        *self.draft_mut() = Draft::default();
        self.inputs.clear();
        self.inputs_draft.clear();
    }

    /// Input hashes recorded at the last save.
    pub(crate) fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    /// Replaces the drafted input hashes wholesale.
    pub(crate) fn stage_inputs(&mut self, inputs: Inputs) {
        self.inputs_draft = inputs;
    }

    /// Updates the drafted hash of each path; paths missing from `hashes`
    /// are forgotten.
    pub(crate) fn stage_input_changes<'a>(
        &mut self,
        paths: impl IntoIterator<Item = &'a Utf8PathBuf>,
        hashes: &Inputs,
    ) {
        for path in paths {
            match hashes.get(path) {
                Some(hash) => self.inputs_draft.insert(path.clone(), *hash),
                None => self.inputs_draft.remove(path),
            };
        }
    }
}

/// Node that owns a key: every key starts with the decimal node id.
fn owner(key: &str) -> Option<NodeId> {
    let end = key.find(|c: char| !c.is_ascii_digit()).unwrap_or(key.len());
    key[..end].parse().ok().map(NodeId)
}

/// Hashes scripts grouped by their collapsed source directory.
fn snapshot(scripts: &[Utf8PathBuf]) -> BTreeMap<Utf8PathBuf, Inputs> {
    let dirs = collapse_paths(scripts.iter().map(|path| parent_dir(path)));
    let hashes = fingerprint(scripts.iter().cloned());

    let mut snapshots: BTreeMap<Utf8PathBuf, Inputs> =
        dirs.iter().map(|dir| (dir.clone(), Inputs::new())).collect();

    for (path, hash) in hashes {
        let dir = parent_dir(&path);
        if let Some(root) = dirs.iter().find(|root| dir.starts_with(root))
            && let Some(snapshot) = snapshots.get_mut(root)
        {
            snapshot.insert(path, hash);
        }
    }

    snapshots
}

fn read_or_default<T: DeserializeOwned + Default>(path: &Utf8Path) -> T {
    let Ok(file) = std::fs::File::open(path) else {
        return T::default();
    };

    match ciborium::from_reader(std::io::BufReader::new(file)) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("ignoring unreadable cache file {path}: {e}");
            T::default()
        }
    }
}

fn write<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = std::io::BufWriter::new(std::fs::File::create(path)?);
    ciborium::into_writer(value, &mut writer)?;
    std::io::Write::flush(&mut writer)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    fn file(name: &str) -> File {
        File::new("", name, format!("/src/{name}"))
    }

    #[test]
    fn test_key_namespaces() {
        assert_eq!(CacheKey::Pipeline(NodeId(3)).to_string(), "3");
        assert_eq!(CacheKey::QueryFile(NodeId(3), "/a/b.md".into()).to_string(), "3$/a/b.md");
        assert_eq!(CacheKey::QueryGroup(NodeId(3), "md".into()).to_string(), "3@md");
        assert_eq!(CacheKey::BeforePull(NodeId(3), 2).to_string(), "3#2");
    }

    #[test]
    fn test_draft_discipline() {
        let (_dir, root) = tempdir();
        let mut cache = Cache::new(root.join("cache"), Utf8Path::new("/entry.rs"));
        let key = CacheKey::Pipeline(NodeId(0));

        cache.write(&key, &[file("a")]);
        assert!(cache.has(&key));
        assert!(cache.is_empty());

        cache.reset();
        assert!(!cache.has(&key));

        cache.write(&key, &[file("a")]);
        cache.save().unwrap();
        assert_eq!(cache.len(), 1);

        cache.write(&key, &[file("b")]);
        cache.reset();
        assert_eq!(cache.read(&key), Some(vec![file("a")]));

        cache.clear();
        assert!(cache.read(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, root) = tempdir();
        let entry = root.join("pipeline.rs");
        std::fs::write(&entry, "v1").unwrap();
        let scripts = vec![entry.clone()];
        let key = CacheKey::QueryFile(NodeId(1), "/src/a".into());

        let mut cache = Cache::load(root.join("cache"), &entry, &scripts).unwrap();
        assert!(cache.is_empty());
        cache.write(&key, &[file("a")]);
        cache.stage_inputs(Inputs::from([(Utf8PathBuf::from("/src/a"), Hash32::hash(b"a"))]));
        cache.save().unwrap();

        let cache = Cache::load(root.join("cache"), &entry, &scripts).unwrap();
        assert_eq!(cache.read(&key), Some(vec![file("a")]));
        assert_eq!(cache.inputs().len(), 1);
    }

    #[test]
    fn test_script_change_discards() {
        let (_dir, root) = tempdir();
        let entry = root.join("pipeline.rs");
        std::fs::write(&entry, "v1").unwrap();
        let scripts = vec![entry.clone()];
        let key = CacheKey::Pipeline(NodeId(0));

        let mut cache = Cache::load(root.join("cache"), &entry, &scripts).unwrap();
        cache.write(&key, &[file("a")]);
        cache.save().unwrap();

        std::fs::write(&entry, "v2").unwrap();
        let cache = Cache::load(root.join("cache"), &entry, &scripts).unwrap();
        assert!(cache.read(&key).is_none());

        let cache = Cache::load(root.join("cache"), &entry, &scripts).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_corrupt_table_is_empty() {
        let (_dir, root) = tempdir();
        let cache = Cache::new(root.join("cache"), Utf8Path::new("/entry.rs"));
        std::fs::create_dir_all(root.join("cache/results")).unwrap();
        std::fs::write(cache.results_path(), b"\xff\x00garbage").unwrap();

        let cache = Cache::load(root.join("cache"), Utf8Path::new("/entry.rs"), &[]).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_key_owner() {
        assert_eq!(owner("12"), Some(NodeId(12)));
        assert_eq!(owner("3$/a/b.md"), Some(NodeId(3)));
        assert_eq!(owner("3@md"), Some(NodeId(3)));
        assert_eq!(owner("40#2"), Some(NodeId(40)));
        assert_eq!(owner("$x"), None);
    }

    #[test]
    fn test_save_prunes_unused_entries() {
        let (_dir, root) = tempdir();
        let mut cache = Cache::new(root.join("cache"), Utf8Path::new("/entry.rs"));
        let kept = CacheKey::QueryFile(NodeId(1), "/src/a".into());
        let gone = CacheKey::QueryFile(NodeId(1), "/src/b".into());
        let other = CacheKey::Pipeline(NodeId(2));

        cache.write(&kept, &[file("a")]);
        cache.write(&gone, &[file("b")]);
        cache.write(&other, &[file("c")]);
        cache.save().unwrap();
        assert_eq!(cache.len(), 3);

        // node 1 is evaluated again and only touches one of its entries,
        // node 2 is never looked at
        cache.evaluating(NodeId(1));
        assert!(cache.read(&kept).is_some());
        cache.save().unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.has(&kept));
        assert!(!cache.has(&gone));
        assert!(cache.has(&other));

        // a save without evaluations keeps everything
        cache.save().unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_stage_input_changes() {
        let (_dir, root) = tempdir();
        let mut cache = Cache::new(root.join("cache"), Utf8Path::new("/entry.rs"));
        let a = Utf8PathBuf::from("/a");
        let b = Utf8PathBuf::from("/b");

        cache.stage_inputs(Inputs::from([(a.clone(), Hash32::hash(b"a")), (b.clone(), Hash32::hash(b"b"))]));
        cache.stage_input_changes([&a, &b], &Inputs::from([(a.clone(), Hash32::hash(b"a2"))]));
        cache.save().unwrap();

        assert_eq!(cache.inputs().get(&a), Some(&Hash32::hash(b"a2")));
        assert!(cache.inputs().get(&b).is_none());
    }
}
