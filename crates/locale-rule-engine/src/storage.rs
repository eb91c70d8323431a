//! 键值持久化后端
//!
//! 规则、版本历史和实验定义按命名空间存为 JSON 值。存储层只负责读写，
//! 写入的串行化由上层 store 的写锁保证。

use crate::error::{Result, RuleError};
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// 存储命名空间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Rules,
    Versions,
    Experiments,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rules => "rules",
            Self::Versions => "versions",
            Self::Experiments => "experiments",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 键值存储后端
pub trait KeyValueBackend: Send + Sync {
    fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Value>>;

    fn set(&self, namespace: Namespace, key: &str, value: &Value) -> Result<()>;

    /// 删除键，返回键是否存在
    fn delete(&self, namespace: Namespace, key: &str) -> Result<bool>;

    /// 列出命名空间下的全部键（已排序）
    fn keys(&self, namespace: Namespace) -> Result<Vec<String>>;
}

/// 内存后端
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<(Namespace, String), Value>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueBackend for MemoryBackend {
    fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Value>> {
        Ok(self
            .entries
            .get(&(namespace, key.to_string()))
            .map(|v| v.value().clone()))
    }

    fn set(&self, namespace: Namespace, key: &str, value: &Value) -> Result<()> {
        self.entries
            .insert((namespace, key.to_string()), value.clone());
        Ok(())
    }

    fn delete(&self, namespace: Namespace, key: &str) -> Result<bool> {
        Ok(self.entries.remove(&(namespace, key.to_string())).is_some())
    }

    fn keys(&self, namespace: Namespace) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| e.key().1.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// 本地文件后端：`<root>/<namespace>/<key>.json`
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

const FILE_EXTENSION: &str = "json";

impl FileBackend {
    /// 打开后端目录，不存在时创建
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for namespace in [Namespace::Rules, Namespace::Versions, Namespace::Experiments] {
            fs::create_dir_all(root.join(namespace.as_str()))?;
        }
        debug!(root = %root.display(), "文件存储后端已打开");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, namespace: Namespace, key: &str) -> Result<PathBuf> {
        Self::check_key(key)?;
        Ok(self
            .root
            .join(namespace.as_str())
            .join(format!("{}.{}", key, FILE_EXTENSION)))
    }

    /// 键直接作为文件名，禁止路径分隔符和隐藏文件
    fn check_key(key: &str) -> Result<()> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@'));
        if valid {
            Ok(())
        } else {
            Err(RuleError::Storage(format!("非法的存储键: {:?}", key)))
        }
    }
}

impl KeyValueBackend for FileBackend {
    fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(namespace, key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, namespace: Namespace, key: &str, value: &Value) -> Result<()> {
        let path = self.path_for(namespace, key)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, namespace: Namespace, key: &str) -> Result<bool> {
        let path = self.path_for(namespace, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self, namespace: Namespace) -> Result<Vec<String>> {
        let dir = self.root.join(namespace.as_str());
        let mut keys = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exercise(backend: &dyn KeyValueBackend) {
        assert_eq!(backend.get(Namespace::Rules, "lang-001").unwrap(), None);

        backend
            .set(Namespace::Rules, "lang-001", &json!({"id": "lang-001"}))
            .unwrap();
        backend
            .set(Namespace::Rules, "comp-001", &json!({"id": "comp-001"}))
            .unwrap();
        backend
            .set(Namespace::Experiments, "abtest-1", &json!({"id": "abtest-1"}))
            .unwrap();

        assert_eq!(
            backend.get(Namespace::Rules, "lang-001").unwrap(),
            Some(json!({"id": "lang-001"}))
        );
        assert_eq!(
            backend.keys(Namespace::Rules).unwrap(),
            vec!["comp-001".to_string(), "lang-001".to_string()]
        );
        assert_eq!(backend.keys(Namespace::Versions).unwrap(), Vec::<String>::new());

        assert!(backend.delete(Namespace::Rules, "lang-001").unwrap());
        assert!(!backend.delete(Namespace::Rules, "lang-001").unwrap());
        assert_eq!(backend.keys(Namespace::Rules).unwrap().len(), 1);
    }

    #[test]
    fn test_memory_backend() {
        let backend = MemoryBackend::new();
        exercise(&backend);
        assert_eq!(backend.len(), 2);
    }

    #[test]
    fn test_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        exercise(&backend);
        assert!(dir.path().join("experiments").join("abtest-1.json").exists());
    }

    #[test]
    fn test_file_backend_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        FileBackend::open(dir.path())
            .unwrap()
            .set(Namespace::Versions, "rule-1", &json!([{"version": "1.0.0"}]))
            .unwrap();

        let reopened = FileBackend::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get(Namespace::Versions, "rule-1").unwrap(),
            Some(json!([{"version": "1.0.0"}]))
        );
    }

    #[test]
    fn test_file_backend_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        let err = backend
            .set(Namespace::Rules, "../escape", &json!({}))
            .unwrap_err();
        assert_eq!(err.code(), "STORAGE_ERROR");
    }
}
