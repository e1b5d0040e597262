//! 下载目录记忆
//!
//! 状态文件为 TOML 格式，记住用户选择过的下载目录

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 下载目录存储
pub trait FolderStore: Send + Sync {
    /// 获取记忆的下载目录
    fn get_saved_folder(&self) -> Option<PathBuf>;

    /// 保存下载目录
    fn save_folder(&self, path: &Path) -> Result<()>;
}

/// 状态文件内容
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// 记忆的下载目录
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_name: Option<PathBuf>,
}

/// 基于 TOML 状态文件的目录存储
pub struct TomlFolderStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl TomlFolderStore {
    /// 打开状态文件，文件不存在或无法解析时视为空
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
                warn!("状态文件格式无效，忽略: {:?}, 错误: {}", path, e);
                State::default()
            }),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("读取状态文件失败: {:?}, 错误: {}", path, e);
                }
                State::default()
            }
        };

        debug!("状态文件已加载: {:?}, {:?}", path, state);
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// 当前状态
    pub fn state(&self) -> State {
        self.state.lock().clone()
    }

    /// 写入状态文件（先写临时文件再替换）
    fn write_state(&self, state: &State) -> Result<()> {
        let content = toml::to_string_pretty(state).context("序列化状态失败")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("创建状态文件目录失败")?;
            }
        }

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, content)
            .with_context(|| format!("写入状态文件失败: {:?}", temp_path))?;
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("替换状态文件失败: {:?}", self.path))?;
        Ok(())
    }
}

impl FolderStore for TomlFolderStore {
    fn get_saved_folder(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .folder_name
            .clone()
            .filter(|folder| !folder.as_os_str().is_empty())
    }

    fn save_folder(&self, path: &Path) -> Result<()> {
        let mut next = self.state();
        next.folder_name = Some(path.to_path_buf());

        // 写入成功后才更新内存状态
        self.write_state(&next)?;
        *self.state.lock() = next;
        Ok(())
    }
}
