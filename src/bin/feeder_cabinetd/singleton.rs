//! 单例文件锁
//!
//! 文件锁保证同一台机器上只有一个守护进程实例；
//! 进程崩溃时锁随文件句柄自动释放，比 pgrep 判定可靠。

use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

pub struct SingletonLock {
    file: File,
}

impl SingletonLock {
    /// 尝试获取排他锁（非阻塞）
    pub fn try_lock(lock_path: impl AsRef<Path>) -> Result<Self, io::Error> {
        // 先打开再加锁，拿到锁之前不能截断文件
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path.as_ref())?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == io::ErrorKind::WouldBlock {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "feeder_cabinetd is already running (lock held)",
                ));
            }
            return Err(e);
        }

        // 拿到锁后清掉残留内容，写入本进程 PID 便于排查
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(&file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(Self { file })
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_lock_writes_pid_and_releases() {
        let lock_path = std::env::temp_dir().join(format!(
            "feeder_cabinetd_test_{}.lock",
            std::process::id()
        ));
        let _ = fs::remove_file(&lock_path);

        let lock = SingletonLock::try_lock(&lock_path).unwrap();
        assert!(lock_path.exists());
        drop(lock);

        let content = fs::read_to_string(&lock_path).unwrap();
        assert!(content.contains(&std::process::id().to_string()));

        // 释放后可再次获取
        let lock = SingletonLock::try_lock(&lock_path).unwrap();
        drop(lock);
        let _ = fs::remove_file(&lock_path);
    }
}
