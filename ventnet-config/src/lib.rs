use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// 指定配置文件路径的环境变量。
pub const CONFIG_ENV: &str = "VENTNET_CONFIG";

/// 应用配置的根结构。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scene: SceneConfig,
}

impl AppConfig {
    /// 从显式路径加载配置。
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 自动发现配置文件：优先读取环境变量 `VENTNET_CONFIG`，否则寻找 `./config/default.toml`。
    /// 若文件缺失，则返回默认配置。
    pub fn discover() -> Result<Self, ConfigError> {
        let current_dir = env::current_dir().map_err(|source| ConfigError::Context {
            message: "获取当前工作目录失败".to_string(),
            source,
        })?;
        Self::discover_in(env::var_os(CONFIG_ENV).map(PathBuf::from), &current_dir)
    }

    /// `discover` 的可测试形式：显式给出覆盖路径与基准目录。
    pub fn discover_in(
        override_path: Option<PathBuf>,
        base_dir: &Path,
    ) -> Result<Self, ConfigError> {
        if let Some(path) = override_path {
            return Self::from_file(path);
        }

        let default_path = base_dir.join("config").join("default.toml");
        if default_path.exists() {
            Self::from_file(default_path)
        } else {
            Ok(Self::default())
        }
    }
}

/// 日志配置，支持设置默认等级。
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// 撤销栈容量，0 按 1 处理。
    #[serde(default = "HistoryConfig::default_max_size")]
    pub max_size: usize,
}

impl HistoryConfig {
    fn default_max_size() -> usize {
        50
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_size: Self::default_max_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Filesystem,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// 文件系统后端的记录目录。
    #[serde(default = "StorageConfig::default_root")]
    pub root: PathBuf,
}

impl StorageConfig {
    fn default_root() -> PathBuf {
        PathBuf::from("scenes")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            root: Self::default_root(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SceneConfig {
    /// 坐标写入时保留的小数位数。
    #[serde(default = "SceneConfig::default_decimals")]
    pub decimals: u32,
    #[serde(default = "SceneConfig::default_name")]
    pub default_name: String,
    #[serde(default = "SceneConfig::default_scale")]
    pub scale: f64,
}

impl SceneConfig {
    fn default_decimals() -> u32 {
        6
    }

    fn default_name() -> String {
        "未命名场景".to_string()
    }

    fn default_scale() -> f64 {
        1.0
    }
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            decimals: Self::default_decimals(),
            default_name: Self::default_name(),
            scale: Self::default_scale(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件 {path:?} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("解析配置文件 {path:?} 失败: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: std::io::Error,
    },
}
