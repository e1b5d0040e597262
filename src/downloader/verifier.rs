// 完整性校验
//
// 顺序读取已下载的文件，同时计算两个 MD5：
// 1. 每个区域（与分段大小对齐）的 MD5，在区域边界处与清单逐项比较
// 2. 整个文件的 MD5，读完后与清单最后一项比较

use anyhow::{Context, Result};
use md5::Context as Md5Context;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 校验结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// 全部匹配
    Matched,
    /// 第 `index` 个区域不匹配
    RegionMismatch {
        index: usize,
        expected: String,
        actual: String,
    },
    /// 文件的区域数多于清单的区域校验和数
    ManifestTooShort { regions: usize, listed: usize },
    /// 整文件校验和不匹配
    WholeFileMismatch { expected: String, actual: String },
    /// 清单为空
    EmptyManifest,
}

impl VerifyOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matched)
    }
}

impl fmt::Display for VerifyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matched => write!(f, "校验通过"),
            Self::RegionMismatch {
                index,
                expected,
                actual,
            } => write!(
                f,
                "第 {} 个区域校验和不匹配 (期望 {}, 实际 {})",
                index + 1,
                expected,
                actual
            ),
            Self::ManifestTooShort { regions, listed } => write!(
                f,
                "清单过短: 文件有 {} 个区域, 清单只有 {} 项",
                regions, listed
            ),
            Self::WholeFileMismatch { expected, actual } => {
                write!(f, "整文件校验和不匹配 (期望 {}, 实际 {})", expected, actual)
            }
            Self::EmptyManifest => write!(f, "清单中没有校验和"),
        }
    }
}

/// 完整性校验器
#[derive(Debug, Clone, Copy)]
pub struct IntegrityVerifier {
    /// 区域大小（与分段大小一致）
    region_size: u64,
    /// 每次读取的字节数，与区域大小无关
    buffer_size: usize,
}

impl IntegrityVerifier {
    pub fn new(region_size: u64, buffer_size: usize) -> Self {
        Self {
            region_size: region_size.max(1),
            buffer_size: buffer_size.max(1),
        }
    }

    /// 在阻塞线程池中校验文件
    pub async fn verify_file(&self, path: &Path, checksums: &[String]) -> Result<VerifyOutcome> {
        let verifier = *self;
        let path: PathBuf = path.to_path_buf();
        let checksums = checksums.to_vec();

        tokio::task::spawn_blocking(move || verifier.verify(&path, &checksums))
            .await
            .context("校验任务执行失败")?
    }

    /// 校验文件
    ///
    /// # 参数
    /// * `path` - 本地文件路径
    /// * `checksums` - 清单校验和（区域校验和 + 末尾整文件校验和，大写）
    pub fn verify(&self, path: &Path, checksums: &[String]) -> Result<VerifyOutcome> {
        let Some((whole_expected, region_expected)) = checksums.split_last() else {
            return Ok(VerifyOutcome::EmptyManifest);
        };

        let mut file = File::open(path).context(format!("无法打开文件: {:?}", path))?;
        let file_size = file.metadata().context("无法获取文件元数据")?.len();

        let mut whole_hasher = Md5Context::new();
        let mut region_hasher = Md5Context::new();
        let mut region_filled: u64 = 0;
        let mut region_index: usize = 0;
        let mut buffer = vec![0u8; self.buffer_size];

        loop {
            let bytes_read = file.read(&mut buffer).context("读取文件失败")?;
            if bytes_read == 0 {
                break;
            }

            whole_hasher.consume(&buffer[..bytes_read]);

            // 一次读取可能跨越区域边界
            let mut data = &buffer[..bytes_read];
            while !data.is_empty() {
                let room = (self.region_size - region_filled) as usize;
                let take = room.min(data.len());
                region_hasher.consume(&data[..take]);
                region_filled += take as u64;
                data = &data[take..];

                if region_filled == self.region_size {
                    let hasher = std::mem::replace(&mut region_hasher, Md5Context::new());
                    if let Some(outcome) = check_region(hasher, region_index, region_expected) {
                        return Ok(outcome);
                    }
                    region_index += 1;
                    region_filled = 0;
                }
            }
        }

        if region_filled > 0 {
            if let Some(outcome) = check_region(region_hasher, region_index, region_expected) {
                return Ok(outcome);
            }
            region_index += 1;
        }

        let actual = format!("{:X}", whole_hasher.compute());
        if &actual != whole_expected {
            warn!(
                "整文件校验和不匹配: {:?}, 期望 {}, 实际 {}",
                path, whole_expected, actual
            );
            return Ok(VerifyOutcome::WholeFileMismatch {
                expected: whole_expected.clone(),
                actual,
            });
        }

        info!(
            "✓ 文件校验通过: {:?}, 大小={} bytes, {} 个区域",
            path, file_size, region_index
        );
        Ok(VerifyOutcome::Matched)
    }
}

fn check_region(hasher: Md5Context, index: usize, listed: &[String]) -> Option<VerifyOutcome> {
    let Some(expected) = listed.get(index) else {
        warn!(
            "清单过短: 第 {} 个区域没有对应的校验和 (清单 {} 项)",
            index + 1,
            listed.len()
        );
        return Some(VerifyOutcome::ManifestTooShort {
            regions: index + 1,
            listed: listed.len(),
        });
    };

    let actual = format!("{:X}", hasher.compute());
    if &actual != expected {
        warn!(
            "第 {} 个区域校验和不匹配: 期望 {}, 实际 {}",
            index + 1,
            expected,
            actual
        );
        return Some(VerifyOutcome::RegionMismatch {
            index,
            expected: expected.clone(),
            actual,
        });
    }

    debug!("第 {} 个区域校验通过", index + 1);
    None
}
