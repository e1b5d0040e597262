//! 输出文件：按绝对偏移写入
//!
//! 不依赖共享的文件游标，每次写入都携带偏移量

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// 下载目标文件
#[derive(Debug)]
pub struct OutputFile {
    file: File,
    path: PathBuf,
}

impl OutputFile {
    /// 打开（不存在则创建）目标文件并设置为最终大小
    ///
    /// 不截断已有内容，断点续传依赖已写入的数据
    pub fn open(path: &Path, total_size: u64) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        if file.metadata()?.len() != total_size {
            file.set_len(total_size)?;
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 在 `offset` 处写入全部数据，实际写入量与请求量不一致视为错误
    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let written = positioned_write(&self.file, offset, data)?;
        if written != data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!(
                    "写入不完整: offset={}, 请求 {} bytes, 实际 {} bytes",
                    offset,
                    data.len(),
                    written
                ),
            ));
        }
        Ok(())
    }

    /// 以只读方式打开已有文件，写入必然失败
    #[cfg(test)]
    pub(crate) fn open_read_only(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
            path: path.to_path_buf(),
        })
    }

    /// 刷新到磁盘
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

#[cfg(unix)]
fn positioned_write(file: &File, offset: u64, data: &[u8]) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(data, offset)
}

#[cfg(windows)]
fn positioned_write(file: &File, offset: u64, data: &[u8]) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(data, offset)
}
