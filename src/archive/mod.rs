//! 下载完成后的解包步骤
//!
//! 协调器只依赖 [`Unpacker`] 接口；分卷压缩包按文件名判断，
//! 只有第 1 卷触发解包，其余分卷跳过

pub mod zip_unpacker;

pub use zip_unpacker::ZipUnpacker;

use regex::Regex;
use std::path::Path;

/// 解包结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackResult {
    Success,
    /// 不是可识别的压缩包
    NotAnArchive,
    /// 磁盘空间不足
    NoSpace,
    /// 压缩包损坏
    InvalidArchive,
    /// 其他系统错误
    SystemError,
    /// 压缩包需要密码
    NoPassword,
}

/// 解包器
pub trait Unpacker: Send + Sync {
    /// 把 `file` 解包到 `dest_dir`
    fn unpack(&self, file: &Path, dest_dir: &Path) -> UnpackResult;
}

/// 判断文件名是否为 `*.partNNN.rar` 分卷，返回 (基础名, 卷号)
pub fn multipart_member(file_name: &str) -> Option<(String, u32)> {
    let re = Regex::new(r"(?i)^(.*)\.part0*(\d+)\.rar$").ok()?;
    let caps = re.captures(file_name)?;
    let base = caps.get(1)?.as_str().to_string();
    let part = caps.get(2)?.as_str().parse().ok()?;
    Some((base, part))
}

/// 是否需要对该文件执行解包（分卷只解第 1 卷）
pub fn should_unpack(file_name: &str) -> bool {
    match multipart_member(file_name) {
        Some((_, part)) => part <= 1,
        None => true,
    }
}
