// ZIP 解包器
//
// 按文件头识别格式：ZIP 使用 zip crate 解包，RAR 无解码器，其余视为非压缩包

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use tracing::{debug, error, info, warn};
use zip::result::ZipError;
use zip::ZipArchive;

use super::{UnpackResult, Unpacker};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: &[u8] = b"PK\x05\x06";
const RAR_MAGIC: &[u8] = b"Rar!";

/// ZIP 解包器
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipUnpacker;

impl ZipUnpacker {
    pub fn new() -> Self {
        Self
    }

    fn extract(&self, file: &Path, dest_dir: &Path) -> Result<usize, ZipError> {
        let mut archive = ZipArchive::new(File::open(file)?)?;
        let mut extracted = 0;

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
                warn!("跳过不安全的条目路径: {}", entry.name());
                continue;
            };
            let out_path = dest_dir.join(relative);

            if entry.is_dir() {
                fs::create_dir_all(&out_path)?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }

            let mut outfile = File::create(&out_path)?;
            io::copy(&mut entry, &mut outfile)?;
            extracted += 1;
            debug!("已解包: {:?}", out_path);
        }
        Ok(extracted)
    }
}

impl Unpacker for ZipUnpacker {
    fn unpack(&self, file: &Path, dest_dir: &Path) -> UnpackResult {
        let mut magic = [0u8; 4];
        let read = match File::open(file).and_then(|mut f| f.read(&mut magic)) {
            Ok(n) => n,
            Err(e) => {
                error!("打开文件失败: {:?}, 错误: {}", file, e);
                return UnpackResult::SystemError;
            }
        };
        let magic = &magic[..read];

        if magic == RAR_MAGIC {
            warn!("不支持 RAR 格式: {:?}", file);
            return UnpackResult::SystemError;
        }
        if magic != ZIP_MAGIC && magic != ZIP_EMPTY_MAGIC {
            debug!("不是压缩包: {:?}", file);
            return UnpackResult::NotAnArchive;
        }

        match self.extract(file, dest_dir) {
            Ok(count) => {
                info!("✓ 解包完成: {:?} -> {:?}, {} 个文件", file, dest_dir, count);
                UnpackResult::Success
            }
            Err(ZipError::UnsupportedArchive(msg)) if msg == ZipError::PASSWORD_REQUIRED => {
                warn!("压缩包需要密码: {:?}", file);
                UnpackResult::NoPassword
            }
            Err(ZipError::Io(e)) if is_no_space(&e) => {
                error!("解包时磁盘空间不足: {:?}", file);
                UnpackResult::NoSpace
            }
            Err(ZipError::Io(e)) => {
                error!("解包失败: {:?}, 错误: {}", file, e);
                UnpackResult::SystemError
            }
            Err(e) => {
                error!("压缩包损坏: {:?}, 错误: {}", file, e);
                UnpackResult::InvalidArchive
            }
        }
    }
}

fn is_no_space(e: &io::Error) -> bool {
    #[cfg(unix)]
    const NO_SPACE_CODES: &[i32] = &[28];
    #[cfg(windows)]
    const NO_SPACE_CODES: &[i32] = &[39, 112];
    #[cfg(not(any(unix, windows)))]
    const NO_SPACE_CODES: &[i32] = &[];

    e.raw_os_error()
        .map(|code| NO_SPACE_CODES.contains(&code))
        .unwrap_or(false)
}
