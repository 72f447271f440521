//! 记忆存储：键值文档（JSON），load / save / update 三个操作
//!
//! 键形如 `state/current_work`、`learned/failures`，按 `/` 分段映射到 memory 目录下的 `.json` 文件。
//! 同一个键的写入经由 [`Memory`] 串行化（单文档单写者），不同键之间互不阻塞。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Invalid memory key: {0}")]
    InvalidKey(String),

    #[error("Memory I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Memory document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// 底层存储契约：只需要 load / save
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// 读取文档；不存在时返回 None
    async fn load(&self, key: &str) -> Result<Option<Value>, MemoryError>;

    /// 整体覆盖写入文档
    async fn save(&self, key: &str, doc: &Value) -> Result<(), MemoryError>;
}

/// 校验键：只允许字母数字、`-`、`_`、`.`，以 `/` 分段，禁止 `..`
fn validate_key(key: &str) -> Result<(), MemoryError> {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        return Err(MemoryError::InvalidKey(key.to_string()));
    }
    for seg in key.split('/') {
        let ok = !seg.is_empty()
            && seg != "."
            && seg != ".."
            && seg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !ok {
            return Err(MemoryError::InvalidKey(key.to_string()));
        }
    }
    Ok(())
}

/// 文件存储：每个键一个 JSON 文件，先写临时文件再 rename
#[derive(Debug)]
pub struct FileMemoryStore {
    root: PathBuf,
}

impl FileMemoryStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, MemoryError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.json")))
    }
}

#[async_trait]
impl MemoryStore for FileMemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Value>, MemoryError> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, doc: &Value) -> Result<(), MemoryError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(doc)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// 内存存储（测试 / 无持久化运行）
#[derive(Debug, Default)]
pub struct InMemoryStore {
    docs: RwLock<HashMap<String, Value>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Value>, MemoryError> {
        validate_key(key)?;
        Ok(self.docs.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, doc: &Value) -> Result<(), MemoryError> {
        validate_key(key)?;
        self.docs.write().await.insert(key.to_string(), doc.clone());
        Ok(())
    }
}

/// 带单文档写锁的存储门面，所有组件通过它读写记忆
pub struct Memory {
    store: Arc<dyn MemoryStore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Memory {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 内存版，便于测试
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }

    pub async fn load(&self, key: &str) -> Result<Option<Value>, MemoryError> {
        self.store.load(key).await
    }

    /// 读取并反序列化为具体类型
    pub async fn load_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, MemoryError> {
        match self.store.load(key).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn save(&self, key: &str, doc: &Value) -> Result<(), MemoryError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        self.store.save(key, doc).await
    }

    pub async fn save_as<T: Serialize>(&self, key: &str, doc: &T) -> Result<(), MemoryError> {
        self.save(key, &serde_json::to_value(doc)?).await
    }

    /// 读-改-写：同一键上的 update 串行执行
    pub async fn update<F>(&self, key: &str, f: F) -> Result<Value, MemoryError>
    where
        F: FnOnce(Option<Value>) -> Value + Send,
    {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let current = self.store.load(key).await?;
        let next = f(current);
        self.store.save(key, &next).await?;
        Ok(next)
    }

    /// 向数组文档追加一条；`cap` 为保留上限，超出时丢弃最旧的条目
    pub async fn append(&self, key: &str, entry: Value, cap: Option<usize>) -> Result<(), MemoryError> {
        self.update(key, move |doc| {
            let mut items = match doc {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            items.push(entry);
            if let Some(cap) = cap {
                if items.len() > cap {
                    let excess = items.len() - cap;
                    items.drain(..excess);
                }
            }
            Value::Array(items)
        })
        .await?;
        Ok(())
    }

    /// 读取数组文档；不存在或不是数组时返回空
    pub async fn load_list(&self, key: &str) -> Result<Vec<Value>, MemoryError> {
        match self.store.load(key).await? {
            Some(Value::Array(items)) => Ok(items),
            _ => Ok(Vec::new()),
        }
    }
}
