//! История чатов: JSON файлы по conf_uid

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub avatar: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryInfo {
    pub uid: String,
    pub latest_message: HistoryMessage,
    pub timestamp: String,
}

/// Хранилище историй: каталог на conf_uid, файл на историю.
#[derive(Clone)]
pub struct HistoryStore {
    base_dir: PathBuf,
}

impl HistoryStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Создает новую историю с метазаписью, возвращает uid.
    pub fn create(&self, conf_uid: &str) -> Result<String> {
        anyhow::ensure!(!conf_uid.is_empty(), "conf_uid is empty");
        let dir = self.ensure_conf_dir(conf_uid)?;
        let uid = format!(
            "{}_{}",
            Utc::now().format("%Y-%m-%d_%H-%M-%S"),
            Uuid::new_v4().simple()
        );
        let meta = vec![HistoryMessage {
            role: "metadata".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            content: String::new(),
            name: String::new(),
            avatar: String::new(),
        }];
        write_history(&dir.join(format!("{}.json", uid)), &meta)?;
        Ok(uid)
    }

    /// Читает историю без служебных записей metadata/system.
    pub fn get(&self, conf_uid: &str, history_uid: &str) -> Result<Vec<HistoryMessage>> {
        let path = self.history_path(conf_uid, history_uid)?;
        let messages = read_history(&path)?;
        Ok(messages
            .into_iter()
            .filter(|msg| msg.role != "metadata" && msg.role != "system")
            .collect())
    }

    pub fn delete(&self, conf_uid: &str, history_uid: &str) -> bool {
        let path = match self.history_path(conf_uid, history_uid) {
            Ok(path) => path,
            Err(_) => return false,
        };
        if !path.is_file() {
            return false;
        }
        std::fs::remove_file(path).is_ok()
    }

    /// Список историй по последнему сообщению, новые первыми.
    pub fn list(&self, conf_uid: &str) -> Vec<HistoryInfo> {
        let mut list = Vec::new();
        let dir = match self.ensure_conf_dir(conf_uid) {
            Ok(dir) => dir,
            Err(_) => return list,
        };
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return list,
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(history_uid) = name.strip_suffix(".json") else {
                continue;
            };
            let Ok(messages) = read_history(&entry.path()) else {
                continue;
            };
            let Some(latest) = messages
                .into_iter()
                .rev()
                .find(|msg| msg.role != "metadata")
            else {
                continue;
            };
            list.push(HistoryInfo {
                uid: history_uid.to_string(),
                timestamp: latest.timestamp.clone(),
                latest_message: latest,
            });
        }
        list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        list
    }

    fn ensure_conf_dir(&self, conf_uid: &str) -> Result<PathBuf> {
        anyhow::ensure!(
            !self.base_dir.as_os_str().is_empty(),
            "chat history base dir is empty"
        );
        anyhow::ensure!(is_safe_name(conf_uid), "invalid conf_uid");
        let path = self.base_dir.join(conf_uid);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("create history dir {:?}", path))?;
        Ok(path)
    }

    fn history_path(&self, conf_uid: &str, history_uid: &str) -> Result<PathBuf> {
        anyhow::ensure!(
            !self.base_dir.as_os_str().is_empty(),
            "chat history base dir is empty"
        );
        anyhow::ensure!(
            is_safe_name(conf_uid) && is_safe_name(history_uid),
            "invalid history path"
        );
        Ok(self
            .base_dir
            .join(conf_uid)
            .join(format!("{}.json", history_uid)))
    }
}

// Имена каталогов и файлов историй: только [A-Za-z0-9_-.]
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

fn read_history(path: &Path) -> Result<Vec<HistoryMessage>> {
    let data = std::fs::read(path).with_context(|| format!("read history {:?}", path))?;
    serde_json::from_slice(&data).with_context(|| format!("parse history {:?}", path))
}

fn write_history(path: &Path, messages: &[HistoryMessage]) -> Result<()> {
    let data = serde_json::to_vec_pretty(messages).context("serialize history")?;
    std::fs::write(path, data).with_context(|| format!("write history {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn push_message(store: &HistoryStore, conf_uid: &str, uid: &str, content: &str, ts: &str) {
        let path = store.history_path(conf_uid, uid).expect("path");
        let mut messages = read_history(&path).expect("read");
        messages.push(HistoryMessage {
            role: "human".to_string(),
            timestamp: ts.to_string(),
            content: content.to_string(),
            name: String::new(),
            avatar: String::new(),
        });
        write_history(&path, &messages).expect("write");
    }

    #[test]
    fn test_create_get_delete() {
        let dir = TempDir::new().expect("tempdir");
        let store = HistoryStore::new(dir.path());

        let uid = store.create("conf1").expect("create");
        assert!(store.get("conf1", &uid).expect("get").is_empty());

        push_message(&store, "conf1", &uid, "hi", "2025-01-01T00:00:00Z");
        let messages = store.get("conf1", &uid).expect("get");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hi");

        assert!(store.delete("conf1", &uid));
        assert!(!store.delete("conf1", &uid));
    }

    #[test]
    fn test_list_sorted_by_latest_message() {
        let dir = TempDir::new().expect("tempdir");
        let store = HistoryStore::new(dir.path());

        let old = store.create("conf1").expect("create old");
        let fresh = store.create("conf1").expect("create fresh");
        push_message(&store, "conf1", &old, "old", "2025-01-01T00:00:00Z");
        push_message(&store, "conf1", &fresh, "fresh", "2025-06-01T00:00:00Z");

        let list = store.list("conf1");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].uid, fresh);
        assert_eq!(list[0].latest_message.content, "fresh");
    }

    #[test]
    fn test_list_skips_empty_histories() {
        let dir = TempDir::new().expect("tempdir");
        let store = HistoryStore::new(dir.path());
        store.create("conf1").expect("create");
        // История только с метазаписью в список не попадает
        assert!(store.list("conf1").is_empty());
    }

    #[test]
    fn test_rejects_unsafe_names() {
        let dir = TempDir::new().expect("tempdir");
        let store = HistoryStore::new(dir.path());
        assert!(store.get("../evil", "x").is_err());
        assert!(store.get("conf1", "../../etc/passwd").is_err());
        assert!(!store.delete("conf1", "a/b"));
    }
}
