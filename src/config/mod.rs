// 配置管理模块

pub mod folder_store;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

use crate::downloader::PART_SIZE;

pub use folder_store::{FolderStore, State, TomlFolderStore};

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 持久化配置（断点文件、目录记忆）
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 待下载地址列表（命令行追加的地址排在后面）
    #[serde(default)]
    pub urls: Vec<String>,
    /// 默认下载目录（没有记忆目录时使用）
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 分段大小（字节）
    ///
    /// ⚠️ 服务器清单的分段校验和按 100MB 对齐，仅测试或工具场景才应修改
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    /// 校验时每次读取的缓冲区大小（字节）
    #[serde(default = "default_verify_buffer_size")]
    pub verify_buffer_size: usize,
    /// 进度轮询间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 发出停止信号后等待任务退出的最长时间（毫秒）
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// 下载过程中重新检查清单的间隔（秒）
    #[serde(default = "default_manifest_recheck_secs")]
    pub manifest_recheck_secs: u64,
    /// 一轮扫描存在失败时，下一轮开始前的等待时间（毫秒）
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// 清单、探测等短请求的超时时间（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 建立连接的超时时间（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 分段下载时两次收到数据之间允许的最长间隔（秒）
    #[serde(default = "default_read_idle_timeout_secs")]
    pub read_idle_timeout_secs: u64,
    /// 请求使用的 User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 下载前检查磁盘剩余空间
    #[serde(default = "default_true")]
    pub check_free_space: bool,
    /// 全部下载完成后自动解包
    #[serde(default = "default_true")]
    pub unpack_after_download: bool,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_part_size() -> u64 {
    PART_SIZE
}

fn default_verify_buffer_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_manifest_recheck_secs() -> u64 {
    60
}

fn default_retry_delay_ms() -> u64 {
    3000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_read_idle_timeout_secs() -> u64 {
    60
}

fn default_user_agent() -> String {
    format!("resumable-downloader/{}", env!("CARGO_PKG_VERSION"))
}

fn default_true() -> bool {
    true
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            download_dir: default_download_dir(),
            part_size: default_part_size(),
            verify_buffer_size: default_verify_buffer_size(),
            poll_interval_ms: default_poll_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            manifest_recheck_secs: default_manifest_recheck_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_idle_timeout_secs: default_read_idle_timeout_secs(),
            user_agent: default_user_agent(),
            check_free_space: default_true(),
            unpack_after_download: default_true(),
        }
    }
}

impl DownloadConfig {
    /// 检查数值配置是否有效
    pub fn validate(&self) -> Result<()> {
        if self.part_size == 0 {
            anyhow::bail!("part_size 必须大于 0");
        }
        if self.verify_buffer_size == 0 {
            anyhow::bail!("verify_buffer_size 必须大于 0");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms 必须大于 0");
        }
        if self.manifest_recheck_secs == 0 {
            anyhow::bail!("manifest_recheck_secs 必须大于 0");
        }
        if self.part_size != PART_SIZE {
            tracing::warn!(
                "⚠️ part_size={} 与服务器清单约定的 {} 不一致，校验可能失败",
                self.part_size,
                PART_SIZE
            );
        }
        Ok(())
    }

    /// 添加地址（去除首尾空白，忽略空串和重复项）
    pub fn add_urls<I>(&mut self, urls: I)
    where
        I: IntoIterator<Item = String>,
    {
        for url in urls {
            let url = url.trim().to_string();
            if url.is_empty() || self.urls.contains(&url) {
                continue;
            }
            self.urls.push(url);
        }
    }
}

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 断点文件路径
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
    /// 下载过程中保存断点的间隔（毫秒）
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
    /// 记忆下载目录的状态文件（TOML 格式）
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("downloader.checkpoint.json")
}

fn default_checkpoint_interval_ms() -> u64 {
    1000
}

fn default_state_file() -> PathBuf {
    PathBuf::from("downloader.state.toml")
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: default_checkpoint_path(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            state_file: default_state_file(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .download
            .validate()
            .context("配置文件中的下载参数验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 文件存在但内容无效时不覆盖用户的文件
                if std::path::Path::new(path).exists() {
                    return default_config;
                }

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}

/// 命令行参数
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(name = "resumable-downloader", version, about = "多线程断点续传下载器")]
pub struct CliArgs {
    /// 配置文件路径
    #[arg(short, long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    pub config_path: String,
    /// 追加的下载地址（排在配置文件中的地址之后）
    #[arg(value_name = "URL")]
    pub urls: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.download.part_size, 100 * 1024 * 1024);
        assert_eq!(config.download.poll_interval_ms, 100);
        assert_eq!(config.download.stop_timeout_ms, 5000);
        assert_eq!(
            config.persistence.state_file,
            PathBuf::from("downloader.state.toml")
        );
        assert!(config.download.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.download.urls = vec!["http://example.com/a.zip".to_string()];
        config.persistence.checkpoint_interval_ms = 500;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.download.urls, config.download.urls);
        assert_eq!(loaded.persistence.checkpoint_interval_ms, 500);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.toml");
        tokio::fs::write(&path, "[download]\nurls = [\"http://h/f.bin\"]\n")
            .await
            .unwrap();

        let loaded = AppConfig::load_from_file(path.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(loaded.download.urls.len(), 1);
        assert_eq!(loaded.download.retry_delay_ms, 3000);
        assert!(loaded.log.enabled);
    }

    #[tokio::test]
    async fn test_load_or_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.toml");
        let path_str = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path_str).await;
        assert!(config.download.urls.is_empty());
        assert!(path.exists());
    }

    #[test]
    fn test_zero_part_size_rejected() {
        let config = DownloadConfig {
            part_size: 0,
            ..DownloadConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_add_urls_dedup() {
        let mut config = DownloadConfig::default();
        config.urls = vec!["http://h/a".to_string()];
        config.add_urls(vec![
            " http://h/a ".to_string(),
            "".to_string(),
            "http://h/b".to_string(),
        ]);
        assert_eq!(config.urls, vec!["http://h/a", "http://h/b"]);
    }

    #[test]
    fn test_cli_args() {
        let args =
            CliArgs::try_parse_from(["resumable-downloader", "--config", "my.toml", "http://h/a"])
                .unwrap();
        assert_eq!(args.config_path, "my.toml");
        assert_eq!(args.urls, vec!["http://h/a"]);

        let args = CliArgs::try_parse_from(["resumable-downloader", "--config=x.toml"]).unwrap();
        assert_eq!(args.config_path, "x.toml");
        assert!(args.urls.is_empty());

        let args = CliArgs::try_parse_from(["resumable-downloader", "-c", "y.toml"]).unwrap();
        assert_eq!(args.config_path, "y.toml");

        let args = CliArgs::try_parse_from(["resumable-downloader"]).unwrap();
        assert_eq!(args.config_path, DEFAULT_CONFIG_PATH);

        assert!(CliArgs::try_parse_from(["resumable-downloader", "--config"]).is_err());
        assert!(CliArgs::try_parse_from(["resumable-downloader", "--threads", "4"]).is_err());
    }
}
