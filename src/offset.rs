//! 복제 위치(GTID 목록) 영속화와 Writer 상태
//!
//! 상태 파일은 "여기까지는 완전히 기록됨"을 뜻하는 GTID 목록 한 줄이다.
//! 임시 파일에 쓰고 fsync 후 rename 하므로 중간 상태가 보이지 않는다.

use crate::error::{RelayError, Result};
use crate::gtid::GtidList;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// GTID 상태 파일
#[derive(Debug, Clone)]
pub struct GtidStateFile {
    path: PathBuf,
}

impl GtidStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        GtidStateFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 저장된 목록 읽기. 파일이 없거나 비어 있으면 None
    pub fn load(&self) -> Result<Option<GtidList>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RelayError::MalformedState(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let line = contents.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let list: GtidList = line.parse().map_err(|e| {
            RelayError::MalformedState(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(Some(list))
    }

    /// 원자적으로 목록 저장
    pub fn save(&self, list: &GtidList) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");

        let mut file = File::create(&tmp_path).map_err(|e| self.storage_error("create", &tmp_path, e))?;
        writeln!(file, "{}", list).map_err(|e| self.storage_error("write", &tmp_path, e))?;

        // fsync is mandatory
        file.sync_all().map_err(|e| self.storage_error("fsync", &tmp_path, e))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| self.storage_error("rename", &tmp_path, e))?;

        if let Some(parent) = self.path.parent() {
            let dir = OpenOptions::new()
                .read(true)
                .open(parent)
                .map_err(|e| self.storage_error("open directory of", parent, e))?;
            dir.sync_all().map_err(|e| self.storage_error("fsync directory of", parent, e))?;
        }

        debug!("Saved gtid state {}", list);
        Ok(())
    }

    fn storage_error(&self, what: &str, path: &Path, e: std::io::Error) -> RelayError {
        RelayError::StorageError(format!("Failed to {} {}: {}", what, path.display(), e))
    }
}

/// Writer 처리 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriterState {
    /// 저장된 위치 없이 새 기준점에서 시작
    Bootstrapping,
    Streaming,
    /// 업스트림 재접속 대기 중
    Reconnecting,
    /// 운영자 개입이 필요한 치명적 중단
    Aborted,
    Stopped,
}

impl fmt::Display for WriterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WriterState::Bootstrapping => "Bootstrapping",
            WriterState::Streaming => "Streaming",
            WriterState::Reconnecting => "Reconnecting",
            WriterState::Aborted => "Aborted",
            WriterState::Stopped => "Stopped",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtid::Gtid;

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let state = GtidStateFile::new(dir.path().join("rpl_state"));
        assert!(state.load().unwrap().is_none());
    }

    #[test]
    fn test_empty_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpl_state");
        fs::write(&path, "\n").unwrap();
        assert!(GtidStateFile::new(path).load().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let state = GtidStateFile::new(dir.path().join("rpl_state"));

        let mut list = GtidList::new();
        list.replace(Gtid::new(0, 1, 100));
        list.replace(Gtid::new(2, 1, 7));
        state.save(&list).unwrap();

        assert_eq!(fs::read_to_string(state.path()).unwrap(), "0-1-100,2-1-7\n");
        assert_eq!(state.load().unwrap(), Some(list));
        assert!(!dir.path().join("rpl_state.tmp").exists());
    }

    #[test]
    fn test_malformed_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpl_state");
        fs::write(&path, "0-1-100,oops").unwrap();

        let err = GtidStateFile::new(path).load().unwrap_err();
        assert!(matches!(err, RelayError::MalformedState(_)));
    }
}
