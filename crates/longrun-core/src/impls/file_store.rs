//! FileTaskStore - ディレクトリベースの永続 store
//!
//! # レイアウト
//! ```text
//! <base>/<task-id>/metadata.json
//! <base>/<task-id>/checkpoint.json
//! <base>/<task-id>/journal.jsonl   (1 行 1 イベント、追記のみ)
//! <base>/<task-id>/.lock           (書き込み中のみ存在)
//! <base>/<task-id>/.lock.takeover  (古い .lock を奪う間だけ存在)
//! ```
//!
//! # 実装詳細
//! - JSON ファイルは「一時ファイルに書く → fsync → rename」で丸ごと置き換える
//! - 書き込み系はタスク単位で 2 段のロックを取る
//!   - プロセス内: tokio Mutex（同じ store を共有するタスク同士）
//!   - プロセス間: `.lock` ファイルの排他作成（create_new）
//! - `.lock` が `stale_lock_after` より古ければ、持ち主は死んだとみなして奪う
//!   - 奪うのは `.lock.takeover` を排他作成できた 1 プロセスだけ。取れたら鮮度を再確認してから消す
//! - ジャーナルの書きかけ（改行なしの末尾）は次の追記の前に切り落とす。
//!   読み込み時は壊れた行をすべて警告付きで読み飛ばす
//! - std::fs は blocking なので spawn_blocking で実行する

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::{
    Checkpoint, ConfigError, StoreError, TaskEvent, TaskId, TaskMetadata, TaskStatus,
};
use crate::ports::TaskExecutionStore;

const METADATA_FILE: &str = "metadata.json";
const CHECKPOINT_FILE: &str = "checkpoint.json";
const JOURNAL_FILE: &str = "journal.jsonl";
const LOCK_FILE: &str = ".lock";
const TAKEOVER_FILE: &str = ".lock.takeover";

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Settings for [`FileTaskStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct FileStoreConfig {
    pub base_dir: PathBuf,

    /// How long a writer waits for another process's `.lock`.
    pub lock_timeout: Duration,

    /// A `.lock` older than this is considered abandoned.
    pub stale_lock_after: Duration,
}

impl FileStoreConfig {
    pub const ENV_STORE_DIR: &'static str = "LONGRUN_STORE_DIR";
    pub const ENV_LOCK_TIMEOUT_MS: &'static str = "LONGRUN_LOCK_TIMEOUT_MS";
    pub const ENV_STALE_LOCK_MS: &'static str = "LONGRUN_STALE_LOCK_MS";

    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            lock_timeout: Duration::from_secs(5),
            stale_lock_after: Duration::from_secs(30),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_stale_lock_after(mut self, age: Duration) -> Self {
        self.stale_lock_after = age;
        self
    }

    /// Reads `LONGRUN_STORE_DIR` (default `./longrun-data`) and the optional
    /// millisecond overrides for the lock settings.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_dir = std::env::var(Self::ENV_STORE_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("longrun-data"));
        let mut config = Self::new(base_dir);

        if let Some(ms) = env_millis(Self::ENV_LOCK_TIMEOUT_MS)? {
            config.lock_timeout = ms;
        }
        if let Some(ms) = env_millis(Self::ENV_STALE_LOCK_MS)? {
            config.stale_lock_after = ms;
        }
        Ok(config)
    }
}

pub(crate) fn env_millis(var: &'static str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| ConfigError::invalid(var, raw, e)),
        Err(_) => Ok(None),
    }
}

/// Durable `TaskExecutionStore` on the local filesystem.
///
/// # 使用例
/// ```ignore
/// let store = FileTaskStore::new(FileStoreConfig::new("/var/lib/longrun"));
/// let service = LongLivedTaskService::builder(Arc::new(store)).build();
/// ```
#[derive(Clone)]
pub struct FileTaskStore {
    config: Arc<FileStoreConfig>,

    /// タスクごとのプロセス内ロック
    locks: Arc<Mutex<HashMap<TaskId, Arc<Mutex<()>>>>>,
}

impl FileTaskStore {
    pub fn new(config: FileStoreConfig) -> Self {
        Self {
            config: Arc::new(config),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.config.base_dir
    }

    fn task_dir(&self, task_id: TaskId) -> TaskDir {
        TaskDir {
            root: self.config.base_dir.join(task_id.to_string()),
            lock_timeout: self.config.lock_timeout,
            stale_lock_after: self.config.stale_lock_after,
        }
    }

    async fn local_lock(&self, task_id: TaskId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // map の Arc しか残っていないエントリは誰も使っていない
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(task_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Runs blocking filesystem work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Background(format!("filesystem task failed: {e}")))?
}

#[async_trait]
impl TaskExecutionStore for FileTaskStore {
    async fn save_metadata(&self, metadata: &TaskMetadata) -> Result<(), StoreError> {
        let dir = self.task_dir(metadata.id());
        let metadata = metadata.clone();
        let _local = self.local_lock(metadata.id()).await;
        blocking(move || {
            dir.ensure()?;
            let _lock = dir.lock()?;
            write_json_atomic(&dir.metadata(), &metadata, "metadata", metadata.id())
        })
        .await
    }

    async fn create_metadata(&self, metadata: &TaskMetadata) -> Result<bool, StoreError> {
        let dir = self.task_dir(metadata.id());
        let metadata = metadata.clone();
        let _local = self.local_lock(metadata.id()).await;
        blocking(move || {
            dir.ensure()?;
            let _lock = dir.lock()?;
            if dir.metadata().exists() {
                return Ok(false);
            }
            write_json_atomic(&dir.metadata(), &metadata, "metadata", metadata.id())?;
            Ok(true)
        })
        .await
    }

    async fn load_metadata(&self, task_id: TaskId) -> Result<Option<TaskMetadata>, StoreError> {
        let dir = self.task_dir(task_id);
        blocking(move || read_json(&dir.metadata(), "metadata", task_id)).await
    }

    async fn compare_and_set_status(
        &self,
        task_id: TaskId,
        expected: TaskStatus,
        target: TaskStatus,
        reason: Option<&str>,
    ) -> Result<Option<TaskMetadata>, StoreError> {
        let dir = self.task_dir(task_id);
        let reason = reason.map(str::to_string);
        let _local = self.local_lock(task_id).await;
        blocking(move || {
            if !dir.exists() {
                return Ok(None);
            }
            let _lock = dir.lock()?;
            let Some(mut metadata) = read_json::<TaskMetadata>(&dir.metadata(), "metadata", task_id)?
            else {
                return Ok(None);
            };
            if !metadata.compare_and_transition(expected, target, reason.as_deref()) {
                return Ok(None);
            }
            write_json_atomic(&dir.metadata(), &metadata, "metadata", task_id)?;
            Ok(Some(metadata))
        })
        .await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let task_id = checkpoint.task_id();
        let dir = self.task_dir(task_id);
        let checkpoint = checkpoint.clone();
        let _local = self.local_lock(task_id).await;
        blocking(move || {
            dir.ensure()?;
            let _lock = dir.lock()?;
            write_json_atomic(&dir.checkpoint(), &checkpoint, "checkpoint", task_id)
        })
        .await
    }

    async fn load_checkpoint(&self, task_id: TaskId) -> Result<Option<Checkpoint>, StoreError> {
        let dir = self.task_dir(task_id);
        blocking(move || read_json(&dir.checkpoint(), "checkpoint", task_id)).await
    }

    async fn append_event(&self, event: &TaskEvent) -> Result<(), StoreError> {
        let task_id = event.task_id;
        let dir = self.task_dir(task_id);
        let line = serde_json::to_string(event).map_err(|source| StoreError::Serde {
            what: "event",
            task_id,
            source,
        })?;
        let _local = self.local_lock(task_id).await;
        blocking(move || {
            dir.ensure()?;
            let _lock = dir.lock()?;
            let path = dir.journal();
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)
                .map_err(|e| StoreError::io(&path, e))?;
            trim_torn_tail(&mut file, task_id).map_err(|e| StoreError::io(&path, e))?;
            writeln!(file, "{line}").map_err(|e| StoreError::io(&path, e))?;
            file.sync_all().map_err(|e| StoreError::io(&path, e))
        })
        .await
    }

    async fn load_events(&self, task_id: TaskId) -> Result<Vec<TaskEvent>, StoreError> {
        let dir = self.task_dir(task_id);
        let _local = self.local_lock(task_id).await;
        blocking(move || read_journal(&dir.journal(), task_id)).await
    }

    async fn task_ids(&self) -> Result<BTreeSet<TaskId>, StoreError> {
        let base = self.config.base_dir.clone();
        blocking(move || {
            let entries = match fs::read_dir(&base) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
                Err(e) => return Err(StoreError::io(&base, e)),
            };

            let mut ids = BTreeSet::new();
            for entry in entries {
                let entry = entry.map_err(|e| StoreError::io(&base, e))?;
                if let Some(name) = entry.file_name().to_str()
                    && let Ok(task_id) = name.parse::<TaskId>()
                    && entry.path().join(METADATA_FILE).is_file()
                {
                    ids.insert(task_id);
                }
            }
            Ok(ids)
        })
        .await
    }

    async fn delete(&self, task_id: TaskId) -> Result<bool, StoreError> {
        let dir = self.task_dir(task_id);
        let local = self.local_lock(task_id).await;
        let removed = blocking(move || {
            if !dir.exists() {
                return Ok(false);
            }
            let lock = dir.lock()?;
            for file in [dir.metadata(), dir.checkpoint(), dir.journal()] {
                match fs::remove_file(&file) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(StoreError::io(&file, e)),
                }
            }
            drop(lock);
            // 他プロセスが同時に lock を取り直していれば空にならないので、そのときは残す
            let _ = fs::remove_dir(&dir.root);
            Ok(true)
        })
        .await?;
        drop(local);

        self.locks.lock().await.remove(&task_id);
        Ok(removed)
    }
}

/// Paths of one task's directory plus the lock settings.
struct TaskDir {
    root: PathBuf,
    lock_timeout: Duration,
    stale_lock_after: Duration,
}

impl TaskDir {
    fn metadata(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    fn checkpoint(&self) -> PathBuf {
        self.root.join(CHECKPOINT_FILE)
    }

    fn journal(&self) -> PathBuf {
        self.root.join(JOURNAL_FILE)
    }

    fn exists(&self) -> bool {
        self.root.is_dir()
    }

    fn ensure(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).map_err(|e| StoreError::io(&self.root, e))
    }

    /// Cross-process exclusive lock on the task directory.
    fn lock(&self) -> Result<LockFile, StoreError> {
        let path = self.root.join(LOCK_FILE);
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(LockFile { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.is_stale(&path) && self.take_over_stale_lock(&path)? {
                        continue;
                    }
                    if started.elapsed() >= self.lock_timeout {
                        return Err(StoreError::LockTimeout {
                            path,
                            waited: started.elapsed(),
                        });
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
    }

    fn is_stale(&self, path: &Path) -> bool {
        lock_age(path).is_some_and(|age| age > self.stale_lock_after)
    }

    /// Removes a stale `.lock`. Only the process that creates `.lock.takeover`
    /// may judge and remove it, so a fresh lock that replaced the stale one
    /// in the meantime is never deleted. True when the stale lock is gone.
    fn take_over_stale_lock(&self, lock: &Path) -> Result<bool, StoreError> {
        let marker = self.root.join(TAKEOVER_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // takeover の途中で落ちたプロセスの marker
                if self.is_stale(&marker) {
                    tracing::warn!(path = %marker.display(), "removing abandoned takeover marker");
                    let _ = fs::remove_file(&marker);
                }
                return Ok(false);
            }
            Err(e) => return Err(StoreError::io(&marker, e)),
        }
        let _marker = LockFile { path: marker };

        if !self.is_stale(lock) {
            return Ok(false);
        }
        tracing::warn!(path = %lock.display(), "removing stale lock file");
        match fs::remove_file(lock) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(StoreError::io(lock, e)),
        }
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    fs::metadata(path).ok()?.modified().ok()?.elapsed().ok()
}

/// Held `.lock` file, removed on drop.
struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release lock file");
        }
    }
}

fn read_json<T: DeserializeOwned>(
    path: &Path,
    what: &'static str,
    task_id: TaskId,
) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Serde {
            what,
            task_id,
            source,
        })
}

/// Whole-file replace: temp file in the same directory, fsync, rename.
fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
    what: &'static str,
    task_id: TaskId,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serde {
        what,
        task_id,
        source,
    })?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let tmp = path.with_file_name(format!(".{file_name}.{:016x}.tmp", rand::random::<u64>()));

    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

fn read_journal(path: &Path, task_id: TaskId) -> Result<Vec<TaskEvent>, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let mut events = Vec::new();
    for (i, line) in BufReader::new(file).split(b'\n').enumerate() {
        let line = line.map_err(|e| StoreError::io(path, e))?;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice(&line) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!(task_id = %task_id, line = i + 1, error = %e, "skipping unreadable journal line");
            }
        }
    }
    Ok(events)
}

/// Cuts a last line that has no newline (a crash mid-append), so the next
/// event starts on a line of its own.
fn trim_torn_tail(file: &mut File, task_id: TaskId) -> std::io::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut bytes)?;
    let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    tracing::warn!(task_id = %task_id, dropped_bytes = bytes.len() - keep, "truncating torn journal tail");
    file.set_len(keep as u64)
}
