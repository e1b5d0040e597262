//! 错误类型定义
//!
//! 组件边界上使用 `thiserror` 定义的枚举，内部 I/O 与网络细节使用 `anyhow` 携带上下文

use thiserror::Error;

/// 清单获取与解析错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManifestError {
    /// 网络请求失败（可重试）
    #[error("获取清单失败: {0}")]
    Fetch(String),
    /// 清单第一行缺少线程数
    #[error("清单缺少线程数")]
    MissingThreadCount,
    /// 线程数不是正整数
    #[error("清单线程数无效: {0:?}")]
    InvalidThreadCount(String),
    /// 清单中没有任何校验和
    #[error("清单校验和列表为空")]
    EmptyChecksumList,
}

/// 下载运行级错误
///
/// 只有协调器会根据这些类别决定重试、中止或回滚
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DownloadError {
    /// 网络暂时不可用，外层扫描会重试
    #[error("网络暂时不可用: {0}")]
    Transient(String),
    /// 本地资源错误（无法创建或写入目标文件、空间不足等）
    #[error("本地资源错误: {0}")]
    LocalResource(String),
    /// 校验失败，文件已损坏
    #[error("文件已损坏，校验失败: {0}")]
    Integrity(String),
    /// 服务器清单在下载过程中发生变化
    #[error("服务器文件已更新: {0}")]
    Drift(String),
    /// 用户取消
    #[error("用户已取消下载")]
    Cancelled,
    /// 解包时磁盘空间不足
    #[error("磁盘空间不足，请清理磁盘后重新运行: {0}")]
    NoSpace(String),
    /// 没有任何地址成功获取清单
    #[error("无法获取任何下载清单")]
    NoManifest,
    /// 下载地址无法得到有效文件名
    #[error("无效的下载地址: {0}")]
    InvalidUrl(String),
}

impl DownloadError {
    /// 是否需要向用户显示错误信息（用户取消是静默的）
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_silent() {
        assert!(!DownloadError::Cancelled.is_user_visible());
        assert!(DownloadError::NoManifest.is_user_visible());
        assert!(DownloadError::Integrity("a.bin".into()).is_user_visible());
    }

    #[test]
    fn test_messages_carry_detail() {
        let err = DownloadError::NoSpace("D:\\".to_string());
        assert!(err.to_string().contains("D:\\"));

        let err = ManifestError::InvalidThreadCount("abc".to_string());
        assert!(err.to_string().contains("abc"));
    }
}
