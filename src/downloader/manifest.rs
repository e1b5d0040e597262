//! 下载清单
//!
//! 每个下载地址对应一个 `<url>.md5` 文本清单：
//!
//! ```text
//! 4                                   <- 每个分段的并发线程数
//! 9E107D9D372BB6826BD81D3542A419D6    <- 第 1 个 100MB 区域的校验和
//! E4D909C290D0FB1CA068FFADDF22CBD0    <- ...
//! 0CC175B9C0F1B6A831C399E269772661    <- 最后一行：整个文件的校验和
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::ManifestError;
use crate::http::HttpClient;

/// 清单地址后缀
pub const MANIFEST_SUFFIX: &str = ".md5";
/// 单个校验和的最大长度（32 个十六进制字符）
pub const MAX_CHECKSUM_LEN: usize = 32;
/// 每个分段允许的最大并发线程数，清单中更大的值会被截断
pub const MAX_THREAD_COUNT: usize = 32;

/// 解析后的清单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// 每个分段的并发线程数
    pub thread_count: usize,
    /// 区域校验和 + 末尾的整文件校验和（大写）
    pub checksums: Vec<String>,
}

impl Manifest {
    /// 解析清单文本
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let text = text.trim_start_matches('\u{feff}');
        let mut lines = text.lines().map(str::trim);

        // 线程数固定在第一行
        let first = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or(ManifestError::MissingThreadCount)?;
        let requested = match first.parse::<u64>() {
            Ok(n) if n > 0 => n,
            _ => return Err(ManifestError::InvalidThreadCount(first.to_string())),
        };
        let thread_count = requested.min(MAX_THREAD_COUNT as u64) as usize;
        if requested > thread_count as u64 {
            warn!(
                "⚠️ 清单线程数 {} 超过上限，使用 {}",
                requested, MAX_THREAD_COUNT
            );
        }

        let checksums: Vec<String> = lines
            .filter_map(|line| line.split_whitespace().next())
            .map(|token| {
                let token = token.get(..MAX_CHECKSUM_LEN).unwrap_or(token);
                token.to_ascii_uppercase()
            })
            .collect();

        if checksums.is_empty() {
            return Err(ManifestError::EmptyChecksumList);
        }

        Ok(Self {
            thread_count,
            checksums,
        })
    }
}

/// 清单变化标记
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFlags {
    pub thread_count_changed: bool,
    pub checksums_changed: bool,
}

/// 比较新旧清单
///
/// 没有旧清单（首次获取）时永远不报告变化
pub fn diff_manifest(old: Option<&Manifest>, new: &Manifest) -> ChangeFlags {
    match old {
        None => ChangeFlags::default(),
        Some(old) => ChangeFlags {
            thread_count_changed: old.thread_count != new.thread_count,
            checksums_changed: old.checksums != new.checksums,
        },
    }
}

/// 清单客户端
#[derive(Debug, Clone)]
pub struct ManifestClient {
    http: Arc<HttpClient>,
}

impl ManifestClient {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }

    /// 清单地址
    pub fn manifest_url(url: &str) -> String {
        format!("{}{}", url, MANIFEST_SUFFIX)
    }

    /// 获取并解析清单
    pub async fn fetch_manifest(&self, url: &str) -> Result<Manifest, ManifestError> {
        let manifest_url = Self::manifest_url(url);
        let text = self
            .http
            .fetch_text(&manifest_url)
            .await
            .map_err(|e| ManifestError::Fetch(format!("{:#}", e)))?;

        let manifest = Manifest::parse(&text)?;
        debug!(
            "清单获取成功: {}, 线程数={}, 校验和 {} 项",
            manifest_url,
            manifest.thread_count,
            manifest.checksums.len()
        );
        Ok(manifest)
    }
}

/// 下载描述：每个地址一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub url: String,
    /// 最近一次获取到的清单
    pub manifest: Manifest,
    /// 最近一次刷新清单时的变化
    #[serde(default)]
    pub change_flags: ChangeFlags,
    /// 是否已下载并校验完成
    #[serde(default)]
    pub finished: bool,
    /// 完成后记录的文件名
    #[serde(default)]
    pub file_name: Option<String>,
    /// 完成后记录的文件大小
    #[serde(default)]
    pub file_size: Option<u64>,
}

impl FileDescriptor {
    pub fn new(url: String, manifest: Manifest) -> Self {
        Self {
            url,
            manifest,
            change_flags: ChangeFlags::default(),
            finished: false,
            file_name: None,
            file_size: None,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.manifest.thread_count
    }

    pub fn checksums(&self) -> &[String] {
        &self.manifest.checksums
    }

    /// 用新清单替换旧清单，返回变化标记
    pub fn update(&mut self, manifest: Manifest) -> ChangeFlags {
        let flags = diff_manifest(Some(&self.manifest), &manifest);
        if flags.thread_count_changed {
            info!(
                "清单线程数变化: {} ({} -> {})",
                self.url, self.manifest.thread_count, manifest.thread_count
            );
        }
        if flags.checksums_changed {
            warn!("⚠️ 清单校验和变化: {}", self.url);
        }
        self.manifest = manifest;
        self.change_flags = flags;
        flags
    }

    /// 标记为已完成
    pub fn mark_finished(&mut self, file_name: String, file_size: u64) {
        self.finished = true;
        self.file_name = Some(file_name);
        self.file_size = Some(file_size);
    }

    /// 清除完成状态（文件需要重新下载）
    pub fn mark_unfinished(&mut self) {
        self.finished = false;
        self.file_size = None;
    }
}
