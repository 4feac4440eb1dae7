//! 存储配额：实时扫描存储目录统计用量，并据此判断是否允许上传。

use serde::Serialize;
use std::sync::Arc;

use crate::storage::{Storage, StorageError};

/// 当前用量与上限（字节）。
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    pub used: u64,
    pub max: u64,
}

/// 以磁盘上的文件计算用量，上限在启动时确定。
#[derive(Debug)]
pub struct StorageAccountant {
    storage: Arc<Storage>,
    max_bytes: u64,
}

impl StorageAccountant {
    pub fn new(storage: Arc<Storage>, max_bytes: u64) -> Self {
        Self { storage, max_bytes }
    }

    /// 重新扫描存储目录，不做缓存。
    pub async fn compute_usage(&self) -> Result<StorageUsage, StorageError> {
        let used = self.storage.total_size().await?;
        Ok(StorageUsage {
            used,
            max: self.max_bytes,
        })
    }

    /// 不带大小时判断用量是否仍低于上限；带大小时判断再加这些字节是否仍不超限。
    pub async fn has_capacity(&self, incoming: Option<u64>) -> Result<bool, StorageError> {
        let usage = self.compute_usage().await?;
        Ok(match incoming {
            Some(size) => usage.used.saturating_add(size) <= usage.max,
            None => usage.used < usage.max,
        })
    }

    pub async fn ensure_capacity(&self, incoming: Option<u64>) -> Result<(), StorageError> {
        if self.has_capacity(incoming).await? {
            Ok(())
        } else {
            Err(StorageError::CapacityExceeded {
                max: self.max_bytes,
            })
        }
    }
}
