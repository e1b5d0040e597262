//! 断点文件读写
//!
//! 写入时先写临时文件再原子重命名，防止写入中断导致文件损坏

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::types::{CheckpointRecord, JobSnapshot, CHECKPOINT_VERSION};
use crate::downloader::FileDescriptor;

/// 断点存储（固定路径）
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    // ========================================================================
    // 写入
    // ========================================================================

    /// 保存断点
    ///
    /// # Arguments
    /// * `descriptors` - 全部下载描述
    /// * `active_job` - 正在下载的文件任务快照（没有时为 None）
    pub fn save(
        &self,
        descriptors: &[FileDescriptor],
        active_job: Option<&JobSnapshot>,
    ) -> io::Result<()> {
        let record = CheckpointRecord::new(descriptors.to_vec(), active_job.cloned());
        self.save_record(&record)
    }

    /// 保存完整记录
    pub fn save_record(&self, record: &CheckpointRecord) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.temp_path();
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);

        serde_json::to_writer_pretty(&mut writer, record).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to serialize checkpoint: {}", e),
            )
        })?;

        writer.flush()?;
        writer.get_ref().sync_data()?;
        drop(writer);

        fs::rename(&temp_path, &self.path)?;

        debug!(
            "已保存断点: {:?} ({} 项, 活动任务={:?})",
            self.path,
            record.descriptors.len(),
            record.active_job.as_ref().map(|j| j.url.as_str())
        );
        Ok(())
    }

    // ========================================================================
    // 读取
    // ========================================================================

    /// 加载断点
    ///
    /// 文件不存在、无法解析或版本不符时返回 None（冷启动）
    pub fn load(&self) -> Option<CheckpointRecord> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("打开断点文件失败: {:?}, 错误: {}", self.path, e);
                }
                return None;
            }
        };

        let record: CheckpointRecord = match serde_json::from_reader(BufReader::new(file)) {
            Ok(r) => r,
            Err(e) => {
                warn!("断点文件损坏，忽略: {:?}, 错误: {}", self.path, e);
                return None;
            }
        };

        if record.version != CHECKPOINT_VERSION {
            warn!(
                "断点文件版本不兼容 (文件={}, 当前={})，忽略",
                record.version, CHECKPOINT_VERSION
            );
            return None;
        }

        info!(
            "已加载断点: {} 项下载描述, 保存于 {}",
            record.descriptors.len(),
            record.saved_at
        );
        Some(record)
    }

    // ========================================================================
    // 删除
    // ========================================================================

    /// 删除断点文件（不存在视为成功）
    pub fn erase(&self) -> io::Result<()> {
        for path in [self.path.clone(), self.temp_path()] {
            match fs::remove_file(&path) {
                Ok(()) => debug!("已删除断点文件: {:?}", path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{JobStatus, Manifest};
    use crate::persistence::SegmentSnapshot;
    use tempfile::TempDir;

    fn descriptor(url: &str, finished: bool) -> FileDescriptor {
        let mut d = FileDescriptor::new(
            url.to_string(),
            Manifest {
                thread_count: 4,
                checksums: vec!["AA".to_string(), "BB".to_string()],
            },
        );
        if finished {
            d.mark_finished("a.bin".to_string(), 123);
        }
        d
    }

    fn snapshot() -> JobSnapshot {
        JobSnapshot {
            url: "http://h/b.bin".to_string(),
            destination: PathBuf::from("/tmp/b.bin"),
            total_size: 250,
            status: JobStatus::Started,
            downloaded_bytes: 130,
            current_part_index: 1,
            thread_count: 2,
            segments: vec![
                SegmentSnapshot {
                    seg_offset: 0,
                    length: 50,
                    bytes_written: 20,
                },
                SegmentSnapshot {
                    seg_offset: 50,
                    length: 50,
                    bytes_written: 10,
                },
            ],
        }
    }

    #[test]
    fn test_missing_file_is_cold_start() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("cp.json"));
        assert!(store.load().is_none());
        assert!(store.erase().is_ok());
    }

    #[test]
    fn test_save_load_erase() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("state").join("cp.json"));

        let descriptors = vec![
            descriptor("http://h/a.bin", true),
            descriptor("http://h/b.bin", false),
        ];
        let snap = snapshot();
        store.save(&descriptors, Some(&snap)).unwrap();
        assert!(!store.temp_path().exists());

        let record = store.load().unwrap();
        assert_eq!(record.descriptors, descriptors);
        assert_eq!(record.active_job, Some(snap));
        assert!(record.descriptor("http://h/a.bin").unwrap().finished);

        store.erase().unwrap();
        assert!(!store.path().exists());
        assert!(store.load().is_none());
    }

    #[test]
    fn test_corrupt_file_is_cold_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.json");
        fs::write(&path, b"{ not json").unwrap();

        let store = CheckpointStore::new(&path);
        assert!(store.load().is_none());
    }

    #[test]
    fn test_version_mismatch_is_cold_start() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("cp.json"));

        let mut record = CheckpointRecord::new(vec![descriptor("http://h/a", false)], None);
        record.version = CHECKPOINT_VERSION + 1;
        store.save_record(&record).unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn test_overwrite_replaces_previous() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("cp.json"));

        store
            .save(&[descriptor("http://h/a", false)], Some(&snapshot()))
            .unwrap();
        store.save(&[descriptor("http://h/a", true)], None).unwrap();

        let record = store.load().unwrap();
        assert!(record.active_job.is_none());
        assert!(record.descriptors[0].finished);
    }
}
