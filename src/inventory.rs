//! 세그먼트 파일 목록
//!
//! 목록 파일에는 한 줄에 하나씩 절대 경로가 기록된다. 마지막 항목이 현재 쓰고 있는
//! (활성) 세그먼트다. 모든 공개 연산은 하나의 뮤텍스를 잡은 채로 수행되고
//! 밖으로는 복사본만 돌려준다.

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::notify::{ChangeNotifier, WaitHandle};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct Inventory {
    datadir: PathBuf,
    inventory_file: PathBuf,
    file_names: Mutex<Vec<PathBuf>>,
    notifier: ChangeNotifier,
}

impl Inventory {
    /// 목록 파일 로드. 파일이 없으면 빈 목록으로 시작한다
    pub fn open(config: &Config) -> Result<Self> {
        let datadir = absolute_datadir(&config.datadir)?;
        let inventory_file = datadir.join(&config.inventory_file);
        let mut file_names = Vec::new();

        match fs::read(&inventory_file) {
            Ok(bytes) => {
                let contents = String::from_utf8(bytes).map_err(|_| {
                    RelayError::MalformedState(format!(
                        "{} is not valid UTF-8",
                        inventory_file.display()
                    ))
                })?;
                for (lineno, line) in contents.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let path = PathBuf::from(line);
                    if !path.is_absolute() {
                        return Err(RelayError::MalformedState(format!(
                            "{}:{}: not an absolute path: {}",
                            inventory_file.display(),
                            lineno + 1,
                            line
                        )));
                    }
                    file_names.push(path);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(RelayError::StorageError(format!(
                    "Failed to read {}: {}",
                    inventory_file.display(),
                    e
                )))
            }
        }

        info!(
            "Loaded inventory {} with {} files",
            inventory_file.display(),
            file_names.len()
        );

        Ok(Inventory {
            datadir,
            inventory_file,
            file_names: Mutex::new(file_names),
            notifier: ChangeNotifier::new(config.notify_poll_interval),
        })
    }

    /// 상대 경로를 datadir 기준 절대 경로로 정규화
    pub fn path(&self, file_name: impl AsRef<Path>) -> PathBuf {
        let file_name = file_name.as_ref();
        if file_name.is_absolute() {
            file_name.to_path_buf()
        } else {
            self.datadir.join(file_name)
        }
    }

    /// 목록 파일에 기록한 뒤에 메모리 목록에 추가한다
    pub fn add(&self, file_name: impl AsRef<Path>) -> Result<()> {
        let full_name = self.path(file_name);
        let line = full_name.to_str().ok_or_else(|| {
            RelayError::StorageError(format!("Non UTF-8 path: {}", full_name.display()))
        })?;

        let mut file_names = self.file_names.lock();

        let created = !self.inventory_file.exists();
        let mut ofs = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inventory_file)
            .map_err(|e| self.storage_error("open", e))?;
        writeln!(ofs, "{}", line).map_err(|e| self.storage_error("append to", e))?;
        ofs.sync_data().map_err(|e| self.storage_error("sync", e))?;
        if created {
            self.sync_datadir()?;
        }

        file_names.push(full_name.clone());
        drop(file_names);

        debug!("Added {} to inventory", full_name.display());
        self.notifier.notify();
        Ok(())
    }

    /// 항목 제거. 목록 파일도 다시 써서 메모리 목록과 일치시킨다
    pub fn remove(&self, file_name: impl AsRef<Path>) -> Result<bool> {
        let full_name = self.path(file_name);
        let mut file_names = self.file_names.lock();

        let remaining: Vec<PathBuf> = file_names
            .iter()
            .filter(|name| **name != full_name)
            .cloned()
            .collect();
        if remaining.len() == file_names.len() {
            return Ok(false);
        }

        self.rewrite(&remaining)?;
        *file_names = remaining;
        drop(file_names);

        debug!("Removed {} from inventory", full_name.display());
        self.notifier.notify();
        Ok(true)
    }

    /// 목록 전체의 복사본
    pub fn file_names(&self) -> Vec<PathBuf> {
        self.file_names.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.file_names.lock().len()
    }

    /// 활성 세그먼트 (마지막 항목)
    pub fn active(&self) -> Option<PathBuf> {
        self.file_names.lock().last().cloned()
    }

    pub fn is_listed(&self, file_name: impl AsRef<Path>) -> bool {
        let full_name = self.path(file_name);
        self.file_names.lock().contains(&full_name)
    }

    /// 목록에 있고 디스크에도 존재하는지
    pub fn exists(&self, file_name: impl AsRef<Path>) -> bool {
        let full_name = self.path(file_name);
        let file_names = self.file_names.lock();
        file_names.contains(&full_name) && full_name.is_file()
    }

    pub fn subscribe(&self) -> WaitHandle {
        self.notifier.subscribe()
    }

    /// 활성 세그먼트에 데이터가 덧붙었음을 알린다
    pub fn notify_change(&self) {
        self.notifier.notify();
    }

    pub fn datadir(&self) -> &Path {
        &self.datadir
    }

    fn rewrite(&self, file_names: &[PathBuf]) -> Result<()> {
        let tmp_path = self.inventory_file.with_extension("tmp");
        let mut contents = String::new();
        for name in file_names {
            contents.push_str(&name.to_string_lossy());
            contents.push('\n');
        }

        let mut tmp = File::create(&tmp_path).map_err(|e| self.storage_error("create temp for", e))?;
        tmp.write_all(contents.as_bytes())
            .map_err(|e| self.storage_error("write temp for", e))?;
        tmp.sync_all().map_err(|e| self.storage_error("sync temp for", e))?;
        fs::rename(&tmp_path, &self.inventory_file)
            .map_err(|e| self.storage_error("replace", e))?;
        self.sync_datadir()
    }

    /// 새로 만든 파일이나 rename이 디렉터리 엔트리에 남도록 fsync
    fn sync_datadir(&self) -> Result<()> {
        let Some(parent) = self.inventory_file.parent() else {
            return Ok(());
        };
        OpenOptions::new()
            .read(true)
            .open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| self.storage_error("sync directory of", e))
    }

    fn storage_error(&self, what: &str, e: std::io::Error) -> RelayError {
        RelayError::StorageError(format!(
            "Failed to {} inventory file {}: {}",
            what,
            self.inventory_file.display(),
            e
        ))
    }
}

/// 상대 datadir은 현재 작업 디렉터리 기준 절대 경로로 바꾼다
fn absolute_datadir(datadir: &Path) -> Result<PathBuf> {
    if datadir.is_absolute() {
        return Ok(datadir.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| {
        RelayError::StorageError(format!(
            "Failed to resolve datadir {}: {}",
            datadir.display(),
            e
        ))
    })?;
    Ok(cwd.join(datadir))
}
