use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use fs2::FileExt;
use rolelens_schema::{ClassificationRecord, Manifest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::task;

use crate::{ConsistencyReport, RecordStore, StoreError};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const LOCK_FILE: &str = ".rolelens.lock";
/// Subdirectories of the output root that never hold records.
pub const RESERVED_DIRS: &[&str] = &["logs", "reports"];

/// How records of one group are laid out on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLayout {
    /// `<group>/<id>.json`, one file per record.
    #[default]
    Individual,
    /// `<group>.json`, an array holding every record of the group.
    Combined,
}

/// Flat-file record store rooted at an output directory.
///
/// New records go to the configured group and layout. A record the manifest
/// already knows is rewritten where it currently lives, so re-running with a
/// different group never leaves a stale copy behind.
///
/// The parsed manifest and combined group files are cached between calls and
/// reloaded whenever their size or modification time changes on disk.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    group: String,
    layout: OutputLayout,
    cache: Arc<Mutex<Cache>>,
}

impl FileStore {
    pub async fn open(
        root: impl Into<PathBuf>,
        group: impl Into<String>,
        layout: OutputLayout,
    ) -> Result<Self, StoreError> {
        let root = root.into();
        let group = group.into();
        validate_group(&group)?;
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::io(&root, e))?;
        tracing::debug!(root = %root.display(), group = %group, ?layout, "opened file store");
        Ok(Self {
            root,
            group,
            layout,
            cache: Arc::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    pub async fn manifest(&self) -> Result<Manifest, StoreError> {
        let root = self.root.clone();
        let cache = Arc::clone(&self.cache);
        task::spawn_blocking(move || {
            let mut cache = lock_cache(&cache);
            Ok(cache.manifest(&root)?.clone())
        })
        .await?
    }

    /// Compare the manifest against what is actually on disk.
    pub async fn check(&self) -> Result<ConsistencyReport, StoreError> {
        let root = self.root.clone();
        task::spawn_blocking(move || check_blocking(&root)).await?
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn put(&self, record: &ClassificationRecord) -> Result<(), StoreError> {
        if record.id().is_empty() {
            return Err(StoreError::InvalidId(String::new()));
        }
        let root = self.root.clone();
        let group = self.group.clone();
        let layout = self.layout;
        let record = record.clone();
        let cache = Arc::clone(&self.cache);
        task::spawn_blocking(move || {
            with_lock(&root, || {
                let mut cache = lock_cache(&cache);
                let result = put_blocking(&root, &group, layout, &record, &mut cache);
                if result.is_err() {
                    cache.clear();
                }
                result
            })
        })
        .await?
    }

    async fn get(&self, id: &str) -> Result<Option<ClassificationRecord>, StoreError> {
        let root = self.root.clone();
        let id = id.to_string();
        let cache = Arc::clone(&self.cache);
        task::spawn_blocking(move || get_blocking(&root, &id, &mut lock_cache(&cache))).await?
    }

    async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.manifest().await?.ids())
    }

    async fn list_raw(&self) -> Result<Vec<String>, StoreError> {
        let root = self.root.clone();
        task::spawn_blocking(move || list_raw_blocking(&root)).await?
    }
}

/// Size and modification time of a file, or `None` when it does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Result<Option<Self>, StoreError> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(Self {
                modified: meta.modified().map_err(|e| StoreError::io(path, e))?,
                len: meta.len(),
            })),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io(path, err)),
        }
    }
}

#[derive(Debug)]
struct Cached<T> {
    stamp: Option<FileStamp>,
    value: T,
}

/// Records of one combined group file with an id index.
#[derive(Debug, Default)]
struct CombinedGroup {
    records: Vec<ClassificationRecord>,
    index: HashMap<String, usize>,
}

impl CombinedGroup {
    fn new(records: Vec<ClassificationRecord>) -> Self {
        let mut index = HashMap::with_capacity(records.len());
        for (slot, record) in records.iter().enumerate() {
            index.entry(record.id().to_string()).or_insert(slot);
        }
        Self { records, index }
    }

    fn get(&self, id: &str) -> Option<&ClassificationRecord> {
        self.index.get(id).map(|&slot| &self.records[slot])
    }

    fn upsert(&mut self, record: ClassificationRecord) {
        match self.index.get(record.id()) {
            Some(&slot) => self.records[slot] = record,
            None => {
                self.index.insert(record.id().to_string(), self.records.len());
                self.records.push(record);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Cache {
    manifest: Option<Cached<Manifest>>,
    groups: HashMap<PathBuf, Cached<CombinedGroup>>,
    /// Number of files parsed from disk.
    loads: usize,
}

impl Cache {
    fn clear(&mut self) {
        self.manifest = None;
        self.groups.clear();
    }

    fn manifest(&mut self, root: &Path) -> Result<&mut Manifest, StoreError> {
        let path = root.join(MANIFEST_FILE);
        let stamp = FileStamp::of(&path)?;
        let fresh = self.manifest.as_ref().is_some_and(|c| c.stamp == stamp);
        if !fresh {
            let value = read_manifest(root)?;
            self.loads += 1;
            self.manifest = Some(Cached { stamp, value });
        }
        Ok(&mut self
            .manifest
            .get_or_insert_with(|| Cached {
                stamp,
                value: Manifest::new(),
            })
            .value)
    }

    fn restamp_manifest(&mut self, root: &Path) -> Result<(), StoreError> {
        let stamp = FileStamp::of(&root.join(MANIFEST_FILE))?;
        if let Some(cached) = self.manifest.as_mut() {
            cached.stamp = stamp;
        }
        Ok(())
    }

    fn group(&mut self, path: &Path) -> Result<&mut CombinedGroup, StoreError> {
        let stamp = FileStamp::of(path)?;
        let fresh = self.groups.get(path).is_some_and(|c| c.stamp == stamp);
        if !fresh {
            let records: Vec<ClassificationRecord> = read_json(path)?.unwrap_or_default();
            self.loads += 1;
            self.groups.insert(
                path.to_path_buf(),
                Cached {
                    stamp,
                    value: CombinedGroup::new(records),
                },
            );
        }
        Ok(&mut self
            .groups
            .entry(path.to_path_buf())
            .or_insert_with(|| Cached {
                stamp,
                value: CombinedGroup::default(),
            })
            .value)
    }

    fn restamp_group(&mut self, path: &Path) -> Result<(), StoreError> {
        let stamp = FileStamp::of(path)?;
        if let Some(cached) = self.groups.get_mut(path) {
            cached.stamp = stamp;
        }
        Ok(())
    }
}

fn lock_cache(cache: &Mutex<Cache>) -> MutexGuard<'_, Cache> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

fn validate_group(group: &str) -> Result<(), StoreError> {
    let valid = !group.is_empty()
        && sanitize(group) == group
        && !group.starts_with('.')
        && !RESERVED_DIRS.contains(&group)
        && format!("{group}.json") != MANIFEST_FILE;
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(group.to_string()))
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// File name for an individual record. Ids that are not already safe file
/// names get a hash suffix so two ids never share a file.
pub fn record_file_name(id: &str) -> String {
    let safe = sanitize(id);
    if safe == id && !safe.starts_with('.') {
        return format!("{safe}.json");
    }
    let digest = Sha256::digest(id.as_bytes());
    let suffix: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("{safe}-{suffix}.json")
}

fn default_file(group: &str, layout: OutputLayout, id: &str) -> String {
    match layout {
        OutputLayout::Individual => format!("{group}/{}", record_file_name(id)),
        OutputLayout::Combined => format!("{group}.json"),
    }
}

/// Combined files live at the root; individual files one directory down.
fn is_combined(file: &str) -> bool {
    !file.contains('/')
}

fn with_lock<T>(
    root: &Path,
    f: impl FnOnce() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let path = root.join(LOCK_FILE);
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|e| StoreError::Lock {
            path: path.clone(),
            source: e,
        })?;
    lock.lock_exclusive().map_err(|e| StoreError::Lock {
        path: path.clone(),
        source: e,
    })?;
    let result = f();
    if let Err(err) = FileExt::unlock(&lock) {
        tracing::warn!(path = %path.display(), "failed to release store lock: {err}");
    }
    result
}

fn read_manifest(root: &Path) -> Result<Manifest, StoreError> {
    let path = root.join(MANIFEST_FILE);
    match fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str(&text).map_err(|e| StoreError::json(&path, e)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Manifest::new()),
        Err(err) => Err(StoreError::io(&path, err)),
    }
}

/// Write to a sibling temp file, then rename over the target.
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    let tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut writer, value).map_err(|e| StoreError::json(path, e))?;
        writer.write_all(b"\n").map_err(|e| StoreError::io(path, e))?;
        writer.flush().map_err(|e| StoreError::io(path, e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(path, e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, StoreError> {
    match File::open(path) {
        Ok(file) => serde_json::from_reader(std::io::BufReader::new(file))
            .map(Some)
            .map_err(|e| StoreError::json(path, e)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

fn put_blocking(
    root: &Path,
    group: &str,
    layout: OutputLayout,
    record: &ClassificationRecord,
    cache: &mut Cache,
) -> Result<(), StoreError> {
    let id = record.id();
    let (group, file) = match cache.manifest(root)?.locate(id) {
        Some((existing_group, entry)) => (existing_group.to_string(), entry.file.clone()),
        None => (group.to_string(), default_file(group, layout, id)),
    };
    let path = root.join(&file);

    if is_combined(&file) {
        let combined = cache.group(&path)?;
        combined.upsert(record.clone());
        write_json_atomic(&path, &combined.records)?;
        cache.restamp_group(&path)?;
    } else {
        write_json_atomic(&path, record)?;
    }

    let manifest = cache.manifest(root)?;
    manifest.upsert(&group, id, &file);
    write_json_atomic(&root.join(MANIFEST_FILE), &*manifest)?;
    cache.restamp_manifest(root)?;
    tracing::debug!(conversation_id = id, file = %file, "record persisted");
    Ok(())
}

fn get_blocking(
    root: &Path,
    id: &str,
    cache: &mut Cache,
) -> Result<Option<ClassificationRecord>, StoreError> {
    let Some((_, entry)) = cache.manifest(root)?.locate(id) else {
        return Ok(None);
    };
    let file = entry.file.clone();
    let path = root.join(&file);

    let found = if is_combined(&file) {
        cache.group(&path)?.get(id).cloned()
    } else {
        match read_json::<ClassificationRecord>(&path)? {
            Some(record) if record.id() != id => {
                return Err(StoreError::Corrupt {
                    path,
                    message: format!("expected record {id:?}, found {:?}", record.id()),
                });
            }
            other => other,
        }
    };

    if found.is_none() {
        tracing::warn!(conversation_id = id, file = %file, "manifest entry has no record on disk");
    }
    Ok(found)
}

fn json_files(dir: &Path) -> Result<Vec<String>, StoreError> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(out),
        Err(err) => return Err(StoreError::io(dir, err)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        let file_type = entry.file_type().map_err(|e| StoreError::io(entry.path(), e))?;
        if file_type.is_file() {
            out.push(name);
        }
    }
    Ok(out)
}

fn list_raw_blocking(root: &Path) -> Result<Vec<String>, StoreError> {
    let mut out: Vec<String> = json_files(root)?
        .into_iter()
        .filter(|name| name != MANIFEST_FILE)
        .collect();

    let entries = fs::read_dir(root).map_err(|e| StoreError::io(root, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(root, e))?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') || RESERVED_DIRS.contains(&name.as_str()) {
            continue;
        }
        let file_type = entry.file_type().map_err(|e| StoreError::io(entry.path(), e))?;
        if file_type.is_dir() {
            out.extend(
                json_files(&entry.path())?
                    .into_iter()
                    .map(|file| format!("{name}/{file}")),
            );
        }
    }

    out.sort();
    Ok(out)
}

fn check_blocking(root: &Path) -> Result<ConsistencyReport, StoreError> {
    let manifest = read_manifest(root)?;
    let raw: BTreeSet<String> = list_raw_blocking(root)?.into_iter().collect();
    let referenced: BTreeSet<&str> = manifest.entries().map(|(_, e)| e.file.as_str()).collect();

    let mut report = ConsistencyReport {
        records: manifest.len(),
        orphaned_files: raw
            .iter()
            .filter(|file| !referenced.contains(file.as_str()))
            .cloned()
            .collect(),
        ..Default::default()
    };

    let mut combined: HashMap<&str, BTreeSet<String>> = HashMap::new();
    for (_, entry) in manifest.entries() {
        if !raw.contains(&entry.file) {
            report.missing_files.push(entry.file.clone());
            continue;
        }
        let path = root.join(&entry.file);
        let present = if is_combined(&entry.file) {
            if !combined.contains_key(entry.file.as_str()) {
                let ids = read_json::<Vec<ClassificationRecord>>(&path)?
                    .unwrap_or_default()
                    .into_iter()
                    .map(|r| r.conversation.id)
                    .collect();
                combined.insert(entry.file.as_str(), ids);
            }
            combined
                .get(entry.file.as_str())
                .is_some_and(|ids| ids.contains(&entry.id))
        } else {
            read_json::<ClassificationRecord>(&path)?.is_some_and(|r| r.id() == entry.id)
        };
        if !present {
            report.missing_records.push(entry.id.clone());
        }
    }
    report.missing_files.dedup();

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolelens_schema::{Conversation, Message};

    fn record(id: &str) -> ClassificationRecord {
        ClassificationRecord::unclassified(Conversation::new(
            id,
            vec![Message::user("hello"), Message::assistant("hi there")],
        ))
    }

    async fn store(dir: &Path, layout: OutputLayout) -> FileStore {
        FileStore::open(dir, "conversations", layout).await.unwrap()
    }

    #[tokio::test]
    async fn individual_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputLayout::Individual).await;

        store.put(&record("c1")).await.unwrap();

        assert!(dir.path().join("conversations/c1.json").exists());
        let loaded = store.get("c1").await.unwrap().unwrap();
        assert_eq!(loaded, record("c1"));
        assert_eq!(store.list_ids().await.unwrap(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn overwrite_keeps_single_manifest_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputLayout::Individual).await;

        store.put(&record("a")).await.unwrap();
        store.put(&record("b")).await.unwrap();
        let mut changed = record("a");
        changed.conversation.messages.push(Message::user("more"));
        store.put(&changed).await.unwrap();

        assert_eq!(store.list_ids().await.unwrap(), vec!["a", "b"]);
        let loaded = store.get("a").await.unwrap().unwrap();
        assert_eq!(loaded.conversation.messages.len(), 3);
    }

    #[tokio::test]
    async fn combined_layout_shares_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputLayout::Combined).await;

        store.put(&record("x")).await.unwrap();
        store.put(&record("y")).await.unwrap();
        store.put(&record("x")).await.unwrap();

        let raw = fs::read_to_string(dir.path().join("conversations.json")).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(store.get("y").await.unwrap().unwrap().id(), "y");
        assert_eq!(store.list_raw().await.unwrap(), vec!["conversations.json"]);
    }

    #[tokio::test]
    async fn unsafe_ids_get_distinct_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputLayout::Individual).await;

        store.put(&record("a/b")).await.unwrap();
        store.put(&record("a_b")).await.unwrap();

        let raw = store.list_raw().await.unwrap();
        assert_eq!(raw.len(), 2);
        assert!(raw.contains(&"conversations/a_b.json".to_string()));
        assert_eq!(store.get("a/b").await.unwrap().unwrap().id(), "a/b");
        assert_eq!(store.get("a_b").await.unwrap().unwrap().id(), "a_b");
    }

    #[test]
    fn record_file_name_hashes_dotfiles() {
        assert_eq!(record_file_name("conv-1"), "conv-1.json");
        let name = record_file_name("..");
        assert!(name.starts_with("..-"));
        assert_ne!(name, "...json");
    }

    #[tokio::test]
    async fn manifest_is_authoritative_for_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputLayout::Individual).await;
        fs::create_dir_all(dir.path().join("conversations")).unwrap();
        fs::write(
            dir.path().join("conversations/stray.json"),
            serde_json::to_string(&record("stray")).unwrap(),
        )
        .unwrap();

        assert!(store.get("stray").await.unwrap().is_none());
        assert!(store.list_ids().await.unwrap().is_empty());
        let report = store.check().await.unwrap();
        assert_eq!(report.orphaned_files, vec!["conversations/stray.json"]);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn check_reports_missing_files_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputLayout::Individual).await;
        store.put(&record("gone")).await.unwrap();
        store.put(&record("kept")).await.unwrap();
        fs::remove_file(dir.path().join("conversations/gone.json")).unwrap();

        let report = store.check().await.unwrap();
        assert_eq!(report.records, 2);
        assert_eq!(report.missing_files, vec!["conversations/gone.json"]);
        assert!(report.orphaned_files.is_empty());
        assert!(store.get("gone").await.unwrap().is_none());

        let combined = FileStore::open(dir.path(), "merged", OutputLayout::Combined)
            .await
            .unwrap();
        combined.put(&record("m1")).await.unwrap();
        fs::write(dir.path().join("merged.json"), "[]").unwrap();
        let report = combined.check().await.unwrap();
        assert_eq!(report.missing_records, vec!["m1"]);
    }

    #[tokio::test]
    async fn existing_record_stays_in_its_group() {
        let dir = tempfile::tempdir().unwrap();
        let first = store(dir.path(), OutputLayout::Individual).await;
        first.put(&record("c1")).await.unwrap();

        let second = FileStore::open(dir.path(), "rerun", OutputLayout::Combined)
            .await
            .unwrap();
        second.put(&record("c1")).await.unwrap();
        second.put(&record("c2")).await.unwrap();

        let manifest = second.manifest().await.unwrap();
        let (group, entry) = manifest.locate("c1").unwrap();
        assert_eq!(group, "conversations");
        assert_eq!(entry.file, "conversations/c1.json");
        assert_eq!(manifest.locate("c2").unwrap().0, "rerun");
        assert!(second.check().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn raw_listing_skips_bookkeeping_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputLayout::Individual).await;
        store.put(&record("c1")).await.unwrap();
        fs::create_dir_all(dir.path().join("logs")).unwrap();
        fs::write(dir.path().join("logs/x.json"), "{}").unwrap();
        fs::write(dir.path().join("conversations/.tmpAbc.json"), "{}").unwrap();

        assert_eq!(store.list_raw().await.unwrap(), vec!["conversations/c1.json"]);
        assert!(dir.path().join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn passthrough_fields_survive_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputLayout::Individual).await;
        let mut rec = record("c1");
        rec.conversation
            .extra
            .insert("source".into(), serde_json::json!("wildchat"));
        store.put(&rec).await.unwrap();

        let loaded = store.get("c1").await.unwrap().unwrap();
        assert_eq!(loaded.conversation.extra["source"], "wildchat");
    }

    #[tokio::test]
    async fn reserved_group_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for group in ["", "logs", "manifest", "a/b", ".hidden"] {
            assert!(
                FileStore::open(dir.path(), group, OutputLayout::Individual)
                    .await
                    .is_err(),
                "group {group:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn combined_group_is_parsed_once_while_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputLayout::Combined).await;

        for i in 0..50 {
            store.put(&record(&format!("c{i}"))).await.unwrap();
        }
        for i in 0..50 {
            assert!(store.get(&format!("c{i}")).await.unwrap().is_some());
        }

        // One read of the (missing) manifest and one of the (missing) group file.
        assert_eq!(lock_cache(&store.cache).loads, 2);
        let raw = fs::read_to_string(dir.path().join("conversations.json")).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 50);
    }

    #[tokio::test]
    async fn external_rewrite_of_combined_file_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputLayout::Combined).await;
        store.put(&record("x")).await.unwrap();
        store.put(&record("y")).await.unwrap();
        assert_eq!(store.get("x").await.unwrap().unwrap().conversation.messages.len(), 2);

        let mut edited = record("x");
        edited.conversation.messages.push(Message::user("edited elsewhere"));
        fs::write(
            dir.path().join("conversations.json"),
            serde_json::to_string(&vec![edited, record("y")]).unwrap(),
        )
        .unwrap();

        assert_eq!(store.get("x").await.unwrap().unwrap().conversation.messages.len(), 3);
        store.put(&record("z")).await.unwrap();
        let raw = fs::read_to_string(dir.path().join("conversations.json")).unwrap();
        let parsed: Vec<ClassificationRecord> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].conversation.messages.len(), 3);
    }

    #[tokio::test]
    async fn clones_share_the_cache_and_see_each_others_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputLayout::Combined).await;
        let other = FileStore::open(dir.path(), "conversations", OutputLayout::Combined)
            .await
            .unwrap();

        store.clone().put(&record("a")).await.unwrap();
        other.put(&record("b")).await.unwrap();
        store.put(&record("c")).await.unwrap();

        assert_eq!(store.list_ids().await.unwrap(), vec!["a", "b", "c"]);
        assert!(other.get("c").await.unwrap().is_some());
        assert!(store.check().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn unreadable_record_is_a_record_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputLayout::Individual).await;
        store.put(&record("bad")).await.unwrap();
        fs::write(dir.path().join("conversations/bad.json"), "{ truncated").unwrap();

        let err = store.get("bad").await.unwrap_err();
        assert!(err.is_record_error());

        fs::write(dir.path().join(MANIFEST_FILE), "not a manifest").unwrap();
        let err = store.get("bad").await.unwrap_err();
        assert!(!err.is_record_error());
    }

    #[tokio::test]
    async fn mismatched_record_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputLayout::Individual).await;
        store.put(&record("c1")).await.unwrap();
        fs::write(
            dir.path().join("conversations/c1.json"),
            serde_json::to_string(&record("other")).unwrap(),
        )
        .unwrap();

        let err = store.get("c1").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(err.is_record_error());
    }
}
