//! Конфигурация шлюза
//!
//! Настройки загружаются из переменных окружения или .env файла:
//! дефолты перезаписываются только заданными переменными.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Главная структура конфигурации приложения.
#[derive(Debug, Clone)]
pub struct Config {
    /// Настройки HTTP/WebSocket сервера
    pub server: ServerConfig,
    /// Подключение к бэкенду XiaoZhi и параметры восходящего аудио
    pub xiaozhi: XiaoZhiConfig,
    /// Активный персонаж (Live2D модель, имя, аватар)
    pub character: CharacterConfig,
    /// Пути хранилища: история чатов, словарь моделей, фоны, альтернативные конфиги
    pub storage: StorageConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Настройки клиента XiaoZhi.
#[derive(Debug, Clone)]
pub struct XiaoZhiConfig {
    pub backend_url: String,
    pub protocol_version: u32,
    /// Формат восходящего аудио: "opus", "pcm16" или "pcm"
    pub audio_format: String,
    pub sample_rate: u32,
    pub channels: u32,
    /// Целевой размер кадра в миллисекундах
    pub frame_duration: u32,
    pub listen_mode: String,
    pub device_id: String,
    pub client_id: String,
    pub access_token: String,
    pub feature_aec: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacterConfig {
    #[serde(default)]
    pub conf_name: String,
    #[serde(default)]
    pub conf_uid: String,
    #[serde(default)]
    pub live2d_model_name: String,
    #[serde(default)]
    pub character_name: String,
    #[serde(default)]
    pub avatar: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub chat_history_dir: PathBuf,
    pub model_dict_path: PathBuf,
    pub backgrounds_dir: PathBuf,
    pub config_alts_dir: PathBuf,
}

impl Config {
    /// Загружает конфигурацию: .env файл (если есть), затем переменные окружения.
    pub fn load() -> Result<Self> {
        match dotenv::dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(dotenv::Error::Io(_)) => {
                tracing::debug!(".env file not found, using environment variables")
            }
            Err(e) => tracing::warn!("Failed to load .env file: {}", e),
        }

        let mut cfg = Self::default();

        if let Ok(host) = std::env::var("SERVER_HOST") {
            cfg.server.host = host;
        }
        if let Ok(port) = std::env::var("SERVER_PORT") {
            cfg.server.port = port.parse().unwrap_or(8101);
        }

        if let Ok(url) = std::env::var("XIAOZHI_BACKEND_URL") {
            cfg.xiaozhi.backend_url = url;
        }
        if let Ok(version) = std::env::var("XIAOZHI_PROTOCOL_VERSION") {
            if let Ok(value) = version.parse() {
                cfg.xiaozhi.protocol_version = value;
            }
        }
        if let Ok(format) = std::env::var("XIAOZHI_AUDIO_FORMAT") {
            cfg.xiaozhi.audio_format = format;
        }
        if let Ok(rate) = std::env::var("XIAOZHI_SAMPLE_RATE") {
            if let Ok(value) = rate.parse() {
                cfg.xiaozhi.sample_rate = value;
            }
        }
        if let Ok(channels) = std::env::var("XIAOZHI_CHANNELS") {
            if let Ok(value) = channels.parse() {
                cfg.xiaozhi.channels = value;
            }
        }
        if let Ok(duration) = std::env::var("XIAOZHI_FRAME_DURATION") {
            if let Ok(value) = duration.parse() {
                cfg.xiaozhi.frame_duration = value;
            }
        }
        if let Ok(mode) = std::env::var("XIAOZHI_LISTEN_MODE") {
            cfg.xiaozhi.listen_mode = mode;
        }
        if let Ok(device_id) = std::env::var("XIAOZHI_DEVICE_ID") {
            cfg.xiaozhi.device_id = device_id;
        }
        if let Ok(client_id) = std::env::var("XIAOZHI_CLIENT_ID") {
            cfg.xiaozhi.client_id = client_id;
        }
        if let Ok(token) = std::env::var("XIAOZHI_ACCESS_TOKEN") {
            cfg.xiaozhi.access_token = token;
        }
        if let Ok(aec) = std::env::var("XIAOZHI_FEATURE_AEC") {
            cfg.xiaozhi.feature_aec = aec.parse().unwrap_or(false);
        }

        if let Ok(name) = std::env::var("CHARACTER_CONF_NAME") {
            cfg.character.conf_name = name;
        }
        if let Ok(uid) = std::env::var("CHARACTER_CONF_UID") {
            cfg.character.conf_uid = uid;
        }
        if let Ok(model) = std::env::var("CHARACTER_LIVE2D_MODEL") {
            cfg.character.live2d_model_name = model;
        }
        if let Ok(name) = std::env::var("CHARACTER_NAME") {
            cfg.character.character_name = name;
        }
        if let Ok(avatar) = std::env::var("CHARACTER_AVATAR") {
            cfg.character.avatar = avatar;
        }

        if let Ok(path) = std::env::var("CHAT_HISTORY_DIR") {
            cfg.storage.chat_history_dir = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("MODEL_DICT_PATH") {
            cfg.storage.model_dict_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("BACKGROUNDS_DIR") {
            cfg.storage.backgrounds_dir = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("CONFIG_ALTS_DIR") {
            cfg.storage.config_alts_dir = PathBuf::from(path);
        }

        derive_character_config(&mut cfg);
        Ok(cfg)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8101,
            },
            xiaozhi: XiaoZhiConfig {
                backend_url: String::new(),
                protocol_version: 1,
                audio_format: "opus".to_string(),
                sample_rate: 16000,
                channels: 1,
                frame_duration: 20,
                listen_mode: "auto".to_string(),
                device_id: String::new(),
                client_id: String::new(),
                access_token: String::new(),
                feature_aec: false,
            },
            character: CharacterConfig::default(),
            storage: StorageConfig {
                chat_history_dir: PathBuf::from("./data/chat"),
                model_dict_path: PathBuf::from("./webassets/model_dict.json"),
                backgrounds_dir: PathBuf::from("./webassets/backgrounds"),
                config_alts_dir: PathBuf::from("./config_alts"),
            },
        }
    }
}

/// Достраивает незаданные поля персонажа: модель из словаря, uid из имени.
fn derive_character_config(cfg: &mut Config) {
    let character = &mut cfg.character;
    if character.live2d_model_name.is_empty() {
        if let Ok(name) = load_first_model_name(&cfg.storage.model_dict_path) {
            character.live2d_model_name = name;
        }
    }
    if character.conf_uid.is_empty() {
        let base = if character.conf_name.is_empty() {
            &character.live2d_model_name
        } else {
            &character.conf_name
        };
        character.conf_uid = sanitize_conf_uid(base);
    }
    if character.conf_name.is_empty() {
        character.conf_name = if character.live2d_model_name.is_empty() {
            character.conf_uid.clone()
        } else {
            character.live2d_model_name.clone()
        };
    }
    if character.character_name.is_empty() {
        character.character_name = character.conf_name.clone();
    }
}

fn sanitize_conf_uid(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return "default".to_string();
    }
    let sanitized: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches(|c| c == '.' || c == '_' || c == '-');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}

fn load_first_model_name(model_dict_path: &Path) -> Result<String> {
    let data = std::fs::read(model_dict_path)
        .with_context(|| format!("read model dict {:?}", model_dict_path))?;
    let entries: Vec<Value> = serde_json::from_slice(&data).context("parse model dict")?;
    entries
        .iter()
        .filter_map(|entry| entry.get("name").and_then(Value::as_str))
        .find(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("no model name found in {:?}", model_dict_path))
}

/// Запись о доступном файле конфигурации персонажа.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFileInfo {
    pub filename: String,
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
struct CharacterConfigFile {
    #[serde(default)]
    character_config: CharacterConfig,
}

/// Читает персонажа из JSON файла `{"character_config": {...}}`.
pub fn read_character_config(path: &Path) -> Result<CharacterConfig> {
    let data =
        std::fs::read(path).with_context(|| format!("read character config {:?}", path))?;
    let payload: CharacterConfigFile =
        serde_json::from_slice(&data).with_context(|| format!("parse character config {:?}", path))?;
    let mut character = payload.character_config;
    if character.conf_name.is_empty() {
        character.conf_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
    }
    Ok(character)
}

/// Перечисляет активный конфиг и альтернативы из config_alts_dir.
pub fn scan_config_files(
    active: &CharacterConfig,
    config_alts_dir: &Path,
) -> Vec<ConfigFileInfo> {
    let mut configs = vec![ConfigFileInfo {
        filename: "default".to_string(),
        name: if active.conf_name.is_empty() {
            "default".to_string()
        } else {
            active.conf_name.clone()
        },
    }];

    let Ok(entries) = std::fs::read_dir(config_alts_dir) else {
        return configs;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(".json") {
            continue;
        }
        let display = match read_character_config(&entry.path()) {
            Ok(conf) if !conf.conf_name.is_empty() => conf.conf_name,
            _ => name.clone(),
        };
        configs.push(ConfigFileInfo {
            filename: name,
            name: display,
        });
    }
    configs
}

/// Перечисляет фоновые изображения.
pub fn scan_backgrounds(backgrounds_dir: &Path) -> Vec<String> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(backgrounds_dir) else {
        return files;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let ext = name.rsplit('.').next().unwrap_or("").to_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" => files.push(name),
            _ => {}
        }
    }
    files
}

/// Находит запись модели по имени в model_dict.json.
pub fn load_model_info(model_name: &str, model_dict_path: &Path) -> Result<Value> {
    let data = std::fs::read(model_dict_path)
        .with_context(|| format!("read model dict {:?}", model_dict_path))?;
    let entries: Vec<Value> = serde_json::from_slice(&data).context("parse model dict")?;
    entries
        .into_iter()
        .find(|entry| {
            entry.get("name").and_then(Value::as_str) == Some(model_name)
        })
        .ok_or_else(|| anyhow::anyhow!("model not found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_conf_uid() {
        assert_eq!(sanitize_conf_uid("Mio Chan!"), "Mio_Chan");
        assert_eq!(sanitize_conf_uid("  "), "default");
        assert_eq!(sanitize_conf_uid("___"), "default");
        assert_eq!(sanitize_conf_uid("ok-name.v2"), "ok-name.v2");
    }

    #[test]
    fn test_load_model_info() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("model_dict.json");
        std::fs::write(
            &path,
            r#"[{"name":"mio","url":"/live2d/mio.model3.json"},{"name":"ran"}]"#,
        )
        .expect("write dict");

        let info = load_model_info("mio", &path).expect("model info");
        assert_eq!(info["url"], "/live2d/mio.model3.json");
        assert!(load_model_info("ghost", &path).is_err());
    }

    #[test]
    fn test_scan_config_files() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(
            dir.path().join("miko.json"),
            r#"{"character_config":{"conf_name":"Miko","conf_uid":"miko"}}"#,
        )
        .expect("write alt");
        std::fs::write(dir.path().join("notes.txt"), "skip me").expect("write txt");

        let active = CharacterConfig {
            conf_name: "Mio".to_string(),
            ..CharacterConfig::default()
        };
        let configs = scan_config_files(&active, dir.path());
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].filename, "default");
        assert_eq!(configs[0].name, "Mio");
        assert_eq!(configs[1].filename, "miko.json");
        assert_eq!(configs[1].name, "Miko");
    }

    #[test]
    fn test_read_character_config_falls_back_to_filename() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("anon.json");
        std::fs::write(&path, r#"{"character_config":{}}"#).expect("write");
        let character = read_character_config(&path).expect("read");
        assert_eq!(character.conf_name, "anon.json");
    }
}
