//! 暂存目录定期清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::TEMP_CLEAN_INTERVAL_SECS;
use crate::storage::Storage;
use crate::upload::{UploadConfig, cleanup_upload_temp};

/// 启动后台清理任务；首次清理在启动时立即执行。
pub fn spawn_background_tasks(storage: Arc<Storage>, upload: Arc<UploadConfig>) {
    if upload.temp_ttl.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(TEMP_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = cleanup_upload_temp(&storage, &upload).await {
                warn!(error = %err, "staged upload cleanup failed");
            }
        }
    });
}
