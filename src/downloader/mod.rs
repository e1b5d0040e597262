pub mod control;
pub mod coordinator;
pub mod job;
pub mod manifest;
pub mod output;
pub mod progress;
pub mod segment;
pub mod verifier;

/// 分段大小：100MB
///
/// 文件按该大小顺序下载，清单中的分段校验和也按该大小对齐
pub const PART_SIZE: u64 = 100 * 1024 * 1024;

pub use control::{SegmentSignal, TransferControl};
pub use coordinator::{DownloadCoordinator, RunOutcome};
pub use job::{FileJob, JobOptions, JobStatus};
pub use manifest::{diff_manifest, ChangeFlags, FileDescriptor, Manifest, ManifestClient};
pub use output::OutputFile;
pub use progress::{LogProgressView, MessageKind, ProgressView, SpeedCalculator};
pub use segment::{relayout_segments, split_part, Segment, SegmentStatus, SegmentWorker};
pub use verifier::{IntegrityVerifier, VerifyOutcome};
