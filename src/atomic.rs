//! 上传暂存文件：写入完成后以不覆盖的方式发布到存储目录。

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use uuid::Uuid;

/// 暂存目录中的临时文件，发布前对其他请求不可见。
///
/// 字段按声明顺序释放：先关闭文件句柄，再由 `guard` 删除未发布的暂存文件。
pub struct AtomicFile {
    file: File,
    temp_path: PathBuf,
    guard: StagingGuard,
}

/// 上传中途被取消（future 被丢弃）时删除暂存文件。
struct StagingGuard {
    path: PathBuf,
    armed: bool,
}

impl StagingGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl AtomicFile {
    /// 在暂存目录中创建临时文件。
    pub async fn create_in(dir: &Path) -> io::Result<Self> {
        let temp_path = dir.join(format!("upload-{}.part", Uuid::new_v4()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            file,
            guard: StagingGuard {
                path: temp_path.clone(),
                armed: true,
            },
            temp_path,
        })
    }

    /// 返回临时文件的可写句柄。
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        let mut guard = self.guard;
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
        guard.disarm();
    }

    /// 同步数据后发布到 `next_target` 给出的路径，目标已存在时换下一个名字重试。
    ///
    /// 返回最终发布的路径；失败时暂存文件随 `guard` 一并删除。
    pub async fn publish_new<F>(self, mut next_target: F, attempts: usize) -> io::Result<PathBuf>
    where
        F: FnMut() -> PathBuf,
    {
        let mut guard = self.guard;
        if let Err(err) = self.file.sync_all().await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }
        drop(self.file);

        let mut last_err = io::Error::new(ErrorKind::AlreadyExists, "no free target name");
        for _ in 0..attempts {
            let target = next_target();
            match link_or_copy(&self.temp_path, &target).await {
                Ok(()) => {
                    let _ = fs::remove_file(&self.temp_path).await;
                    guard.disarm();
                    if let Some(parent) = target.parent() {
                        let _ = sync_dir(parent).await;
                    }
                    return Ok(target);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => last_err = err,
                Err(err) => {
                    let _ = fs::remove_file(&self.temp_path).await;
                    return Err(err);
                }
            }
        }

        let _ = fs::remove_file(&self.temp_path).await;
        Err(last_err)
    }
}

/// 硬链接到目标（目标存在时失败）；跨设备或不支持硬链接时退化为 create_new 复制。
async fn link_or_copy(source: &Path, target: &Path) -> io::Result<()> {
    match fs::hard_link(source, target).await {
        Ok(()) => Ok(()),
        Err(err) if matches!(err.kind(), ErrorKind::CrossesDevices | ErrorKind::Unsupported) => {
            let mut output = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(target)
                .await?;
            let mut input = File::open(source).await?;
            let copied = tokio::io::copy(&mut input, &mut output).await;
            let synced = match copied {
                Ok(_) => output.sync_all().await,
                Err(err) => Err(err),
            };
            if let Err(err) = synced {
                drop(output);
                let _ = fs::remove_file(target).await;
                return Err(err);
            }
            Ok(())
        }
        Err(err) => Err(err),
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
