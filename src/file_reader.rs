//! 구독자 한 명의 순차 읽기 커서
//!
//! 주어진 GTID 이후의 이벤트를 세그먼트 순서대로 돌려준다. 활성 세그먼트 끝에
//! 도달하면 `None`을 돌려주고 대기 핸들을 통해 변경을 기다린다. 알림은 참고용이므로
//! 읽을 때마다 파일 길이와 회전 여부를 다시 확인한다.

use crate::binlog::{self, ReadOutcome, BINLOG_MAGIC};
use crate::error::{RelayError, Result};
use crate::events::RplEvent;
use crate::gtid::Gtid;
use crate::inventory::Inventory;
use crate::notify::{WaitHandle, EVENT_MODIFIED};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 복제를 시작할 세그먼트와 위치
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtidPosition {
    pub file_name: PathBuf,
    pub file_pos: u64,
}

struct ReadPosition {
    name: PathBuf,
    file: File,
    next_pos: u64,
}

/// 감시 중인 활성 세그먼트와 마지막으로 본 길이
struct Watch {
    file: PathBuf,
    len: u64,
}

pub struct FileReader {
    inventory: Arc<Inventory>,
    read_pos: ReadPosition,
    wait_handle: WaitHandle,
    watch: Option<Watch>,
    /// 감시 중인 세그먼트가 줄어들었다 (읽은 위치를 더 이상 믿을 수 없음)
    truncated: bool,
    server_id: u32,
}

impl FileReader {
    /// 유효하지 않은 GTID면 첫 세그먼트 처음부터 읽는다
    pub fn new(gtid: &Gtid, inventory: Arc<Inventory>) -> Result<Self> {
        let wait_handle = inventory.subscribe();
        let position = if gtid.is_valid() {
            find_gtid_position(gtid, &inventory)?
        } else {
            let first = inventory.file_names().into_iter().next().ok_or_else(|| {
                RelayError::SubscriberError("No binlog files in inventory".to_string())
            })?;
            GtidPosition {
                file_name: first,
                file_pos: BINLOG_MAGIC.len() as u64,
            }
        };

        info!(
            "Reader starting at {}:{} for gtid {}",
            position.file_name.display(),
            position.file_pos,
            gtid
        );

        let read_pos = open_segment(&position.file_name, &inventory, position.file_pos)?;
        Ok(FileReader {
            inventory,
            read_pos,
            wait_handle,
            watch: None,
            truncated: false,
            server_id: 0,
        })
    }

    /// 다음 이벤트. `None`이면 새 데이터가 올 때까지 기다려야 한다
    pub fn fetch_event(&mut self) -> Result<Option<RplEvent>> {
        if self.truncated {
            return Err(RelayError::SubscriberError(format!(
                "{} was truncated under the reader at {}",
                self.read_pos.name.display(),
                self.read_pos.next_pos
            )));
        }

        loop {
            // 읽기 전에 활성 여부를 확인해야 회전 직전 바이트를 놓치지 않는다
            let file_names = self.inventory.file_names();
            let is_active = file_names.last() == Some(&self.read_pos.name);

            let outcome = binlog::read_event_at(&mut self.read_pos.file, self.read_pos.next_pos)
                .map_err(|e| self.subscriber_error("read", e))?;

            match outcome {
                ReadOutcome::Event(event) => {
                    self.read_pos.next_pos += event.len() as u64;
                    self.server_id = event.server_id();
                    return Ok(Some(event));
                }
                ReadOutcome::Incomplete | ReadOutcome::End if is_active => {
                    self.set_watch();
                    return Ok(None);
                }
                ReadOutcome::Incomplete => {
                    return Err(RelayError::SubscriberError(format!(
                        "Truncated event at {}:{}",
                        self.read_pos.name.display(),
                        self.read_pos.next_pos
                    )));
                }
                ReadOutcome::End => {
                    let next = next_file(&file_names, &self.read_pos.name).ok_or_else(|| {
                        RelayError::SubscriberError(format!(
                            "{} is no longer listed in the inventory",
                            self.read_pos.name.display()
                        ))
                    })?;
                    debug!(
                        "Reached end of {}, continuing with {}",
                        self.read_pos.name.display(),
                        next.display()
                    );
                    self.read_pos = open_segment(&next, &self.inventory, BINLOG_MAGIC.len() as u64)?;
                }
            }
        }
    }

    /// 워커가 기다릴 핸들
    pub fn wait_handle(&self) -> WaitHandle {
        self.wait_handle.clone()
    }

    /// 대기 핸들이 깨어났을 때 호출된다. 실제 상태를 다시 확인한다
    ///
    /// 세그먼트는 덧붙이기만 하므로 감시 중인 파일이 줄었다면 다음 `fetch_event`가
    /// 에러를 돌려준다.
    pub fn fd_notify(&mut self, events: u32) {
        let Some(watch) = self.watch.as_mut() else {
            return;
        };

        let active = self.inventory.active();
        if active.as_ref() != Some(&watch.file) {
            debug!(
                "Active segment changed from {} to {:?}",
                watch.file.display(),
                active
            );
            self.watch = None;
            return;
        }

        let len = std::fs::metadata(&watch.file).map(|m| m.len()).unwrap_or(watch.len);
        if len < watch.len {
            warn!(
                "{} shrank from {} to {} bytes",
                watch.file.display(),
                watch.len,
                len
            );
            self.truncated = true;
        } else if len == watch.len && events & EVENT_MODIFIED != 0 {
            debug!("Spurious change notification for {}", watch.file.display());
        }
        watch.len = len;
    }

    pub fn current_file(&self) -> &Path {
        &self.read_pos.name
    }

    pub fn position(&self) -> u64 {
        self.read_pos.next_pos
    }

    /// 마지막으로 읽은 이벤트의 server id
    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    fn set_watch(&mut self) {
        let Some(active) = self.inventory.active() else {
            return;
        };
        if self.watch.as_ref().map(|w| &w.file) == Some(&active) {
            return;
        }
        let len = std::fs::metadata(&active).map(|m| m.len()).unwrap_or(0);
        debug!("Watching {} for changes", active.display());
        self.watch = Some(Watch { file: active, len });
    }

    fn subscriber_error(&self, what: &str, e: RelayError) -> RelayError {
        RelayError::SubscriberError(format!(
            "Failed to {} {}: {}",
            what,
            self.read_pos.name.display(),
            e
        ))
    }
}

fn open_segment(path: &Path, inventory: &Inventory, next_pos: u64) -> Result<ReadPosition> {
    if !inventory.exists(path) {
        return Err(RelayError::SubscriberError(format!(
            "Binlog file {} is missing",
            path.display()
        )));
    }

    let mut file = File::open(path).map_err(|e| {
        RelayError::SubscriberError(format!("Failed to open {}: {}", path.display(), e))
    })?;
    binlog::verify_segment(&mut file).map_err(|e| {
        RelayError::SubscriberError(format!("{} is not a binlog file: {}", path.display(), e))
    })?;

    Ok(ReadPosition {
        name: path.to_path_buf(),
        file,
        next_pos,
    })
}

fn next_file(file_names: &[PathBuf], current: &Path) -> Option<PathBuf> {
    file_names
        .iter()
        .position(|name| name == current)
        .and_then(|idx| file_names.get(idx + 1))
        .cloned()
}

/// 같은 도메인에서 `gtid`보다 sequence가 큰 첫 GTID 이벤트 위치를 찾는다.
/// 없으면 활성 세그먼트의 현재 끝에서 시작한다.
pub fn find_gtid_position(gtid: &Gtid, inventory: &Inventory) -> Result<GtidPosition> {
    let file_names = inventory.file_names();
    let last = file_names.last().cloned().ok_or_else(|| {
        RelayError::SubscriberError("No binlog files in inventory".to_string())
    })?;

    let mut end_of_last = BINLOG_MAGIC.len() as u64;
    for name in &file_names {
        let mut read_pos = open_segment(name, inventory, BINLOG_MAGIC.len() as u64)?;
        loop {
            let outcome = binlog::read_event_at(&mut read_pos.file, read_pos.next_pos).map_err(|e| {
                RelayError::SubscriberError(format!("Failed to scan {}: {}", name.display(), e))
            })?;
            let ReadOutcome::Event(event) = outcome else {
                break;
            };
            if let Some((found, _)) = event.gtid().map_err(|e| {
                RelayError::SubscriberError(format!("Corrupt GTID event in {}: {}", name.display(), e))
            })? {
                if found.domain_id() == gtid.domain_id() && found.sequence_nr() > gtid.sequence_nr() {
                    return Ok(GtidPosition {
                        file_name: name.clone(),
                        file_pos: read_pos.next_pos,
                    });
                }
            }
            read_pos.next_pos += event.len() as u64;
        }
        if *name == last {
            end_of_last = read_pos.next_pos;
        }
    }

    Ok(GtidPosition {
        file_name: last,
        file_pos: end_of_last,
    })
}
