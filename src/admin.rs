//! 운영자용 관리 기능 (PURGE BINARY LOGS, SHOW BINARY LOGS, SHOW MASTER STATUS)

use crate::error::{RelayError, Result};
use crate::gtid::GtidList;
use crate::inventory::Inventory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 세그먼트 파일 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BinlogFileInfo {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// 현재 기록 위치
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterStatus {
    pub file: String,
    pub position: u64,
    pub gtid_list: String,
}

impl MasterStatus {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "file": self.file,
            "pos": self.position,
            "gtid_binlog_pos": self.gtid_list,
        })
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `up_to` 이전의 세그먼트를 모두 지운다. `up_to`와 활성 세그먼트는 남긴다.
///
/// Inventory에서 먼저 빼고 디스크에서 지우므로, 새 구독자는 지워지는 파일을 찾지 않는다.
pub fn purge_logs(inventory: &Inventory, up_to: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let target = inventory.path(up_to);
    let file_names = inventory.file_names();

    let Some(idx) = file_names.iter().position(|name| *name == target) else {
        return Err(RelayError::StorageError(format!(
            "Target log {} not found in inventory",
            target.display()
        )));
    };
    let active = file_names.last().cloned();

    let mut purged = Vec::new();
    for name in &file_names[..idx] {
        if Some(name) == active.as_ref() {
            break;
        }
        if !inventory.remove(name)? {
            continue;
        }
        match fs::remove_file(name) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Purged segment {} was already missing", name.display());
            }
            Err(e) => {
                return Err(RelayError::StorageError(format!(
                    "Failed to delete {}: {}",
                    name.display(),
                    e
                )))
            }
        }
        purged.push(name.clone());
    }

    info!("Purged {} segments before {}", purged.len(), display_name(&target));
    Ok(purged)
}

/// 목록 순서대로 세그먼트 이름과 크기
pub fn show_binlogs(inventory: &Inventory) -> Vec<BinlogFileInfo> {
    inventory
        .file_names()
        .iter()
        .map(|path| {
            let metadata = fs::metadata(path).ok();
            BinlogFileInfo {
                name: display_name(path),
                size: metadata.as_ref().map(|m| m.len()).unwrap_or(0),
                modified: metadata
                    .and_then(|m| m.modified().ok())
                    .map(DateTime::<Utc>::from),
            }
        })
        .collect()
}

pub fn master_status(inventory: &Inventory, gtid_list: &GtidList) -> Option<MasterStatus> {
    let active = inventory.active()?;
    let position = fs::metadata(&active).map(|m| m.len()).unwrap_or(0);
    Some(MasterStatus {
        file: display_name(&active),
        position,
        gtid_list: gtid_list.to_string(),
    })
}
