//! 활성 세그먼트에 이벤트 덧붙이기
//!
//! 세그먼트 회전은 트랜잭션 경계에서만 일어난다. 이전 세그먼트의 마지막 바이트가
//! 모두 기록된 다음에 새 세그먼트가 Inventory에 등록되므로, 읽는 쪽은 활성 여부를
//! 먼저 확인하고 읽으면 이벤트를 놓치지 않는다.
//!
//! 진행 중인 트랜잭션은 메모리에 모아 두고 `end_transaction`에서 한 번에 기록한다.
//! 구독자는 끝난 트랜잭션의 바이트만 보게 되고, 롤백은 디스크를 건드리지 않는다.

use crate::binlog::{self, ReadOutcome, BINLOG_MAGIC};
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::events::{EventType, RplEvent};
use crate::gtid::GtidList;
use crate::inventory::Inventory;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct WritePosition {
    name: PathBuf,
    file: File,
    write_pos: u64,
}

pub struct FileWriter {
    inventory: Arc<Inventory>,
    basename: String,
    max_segment_size: u64,
    current: WritePosition,
    /// 자체 ROTATE 이벤트에 쓰는 업스트림 server id
    upstream_server_id: u32,
    in_transaction: bool,
    /// 진행 중인 트랜잭션의 이벤트 (next_pos 보정 완료)
    pending: Vec<u8>,
}

impl FileWriter {
    /// `continuation`이면 활성 세그먼트를 복구해서 이어 쓰고, 아니면 새 세그먼트로 시작
    pub fn open(
        inventory: Arc<Inventory>,
        config: &Config,
        continuation: bool,
        persisted: &GtidList,
    ) -> Result<Self> {
        let current = match inventory.active() {
            Some(active) if continuation => Self::recover(&active, persisted)?,
            _ => {
                let name = next_file_name(&inventory, &config.binlog_basename);
                Self::create_segment(&inventory, &name)?
            }
        };

        info!(
            "Writing to {} at position {}",
            current.name.display(),
            current.write_pos
        );

        Ok(FileWriter {
            inventory,
            basename: config.binlog_basename.clone(),
            max_segment_size: config.max_segment_size,
            current,
            upstream_server_id: 0,
            in_transaction: false,
            pending: Vec::new(),
        })
    }

    /// 이벤트 하나를 활성 세그먼트에 기록
    pub fn add_event(&mut self, event: &RplEvent) -> Result<()> {
        match event.event_type() {
            // 업스트림 하트비트는 기록하지 않는다
            EventType::HeartbeatEvent => return Ok(()),
            EventType::RotateEvent => {
                if !event.is_artificial() && !self.in_transaction {
                    self.rotate()?;
                }
                return Ok(());
            }
            EventType::GtidEvent => {
                if self.in_transaction {
                    warn!("GTID event inside an open transaction, discarding the partial one");
                    self.rollback_transaction()?;
                }
                if self.current.write_pos >= self.max_segment_size {
                    self.rotate()?;
                }
                self.in_transaction = true;
            }
            _ => {}
        }

        self.upstream_server_id = event.server_id();
        if self.in_transaction {
            self.buffer(event)
        } else {
            self.write(event)
        }
    }

    /// 트랜잭션 경계: 모아 둔 트랜잭션을 기록하고 디스크에 내린 뒤 구독자를 깨운다
    pub fn end_transaction(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            self.current
                .file
                .write_all(&pending)
                .map_err(|e| self.storage_error("append to", e))?;
            self.current.write_pos += pending.len() as u64;
        }
        self.sync()?;
        self.in_transaction = false;

        self.inventory.notify_change();
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.current
            .file
            .sync_data()
            .map_err(|e| self.storage_error("sync", e))
    }

    /// 끝나지 않은 트랜잭션을 버린다 (재접속 전에 호출)
    pub fn rollback_transaction(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }

        warn!(
            "Discarding {} bytes of an incomplete transaction for {}",
            self.pending.len(),
            self.current.name.display()
        );
        self.pending.clear();
        self.in_transaction = false;
        Ok(())
    }

    pub fn current_file(&self) -> &Path {
        &self.current.name
    }

    /// 마지막으로 끝난 트랜잭션 뒤의 위치
    pub fn position(&self) -> u64 {
        self.current.write_pos
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn buffer(&mut self, event: &RplEvent) -> Result<()> {
        let start = self.current.write_pos + self.pending.len() as u64;
        let event = event.with_next_pos(self.next_pos(start, event)?);
        self.pending.extend_from_slice(event.raw());
        Ok(())
    }

    fn write(&mut self, event: &RplEvent) -> Result<()> {
        let next_pos = self.next_pos(self.current.write_pos, event)?;
        let event = event.with_next_pos(next_pos);

        self.current
            .file
            .write_all(event.raw())
            .map_err(|e| self.storage_error("append to", e))?;
        self.current.write_pos = next_pos as u64;

        self.inventory.notify_change();
        Ok(())
    }

    /// 헤더의 next_pos는 32비트라서 4 GiB를 넘는 위치는 기록할 수 없다
    fn next_pos(&self, start: u64, event: &RplEvent) -> Result<u32> {
        let end = start + event.len() as u64;
        u32::try_from(end).map_err(|_| {
            RelayError::StorageError(format!(
                "Event at {} in {} ends past the 32-bit position limit",
                start,
                self.current.name.display()
            ))
        })
    }

    fn rotate(&mut self) -> Result<()> {
        let next_name = next_file_name(&self.inventory, &self.basename);

        let rotate = RplEvent::from_raw(binlog::encode_event(
            EventType::RotateEvent as u8,
            self.upstream_server_id,
            Utc::now().timestamp() as u32,
            0,
            0,
            &binlog::rotate_event_body(BINLOG_MAGIC.len() as u64, &next_name),
        ))?;
        self.write(&rotate)?;
        self.sync()?;

        let next = Self::create_segment(&self.inventory, &next_name)?;
        info!(
            "Rotated {} -> {}",
            self.current.name.display(),
            next.name.display()
        );
        self.current = next;
        Ok(())
    }

    /// 새 세그먼트 생성 후 Inventory 등록
    fn create_segment(inventory: &Inventory, name: &str) -> Result<WritePosition> {
        let path = inventory.path(name);

        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                RelayError::StorageError(format!("Failed to create {}: {}", path.display(), e))
            })?;
        file.write_all(&BINLOG_MAGIC)
            .and_then(|_| file.sync_all())
            .map_err(|e| {
                RelayError::StorageError(format!("Failed to initialize {}: {}", path.display(), e))
            })?;

        inventory.add(&path)?;
        debug!("Created segment {}", path.display());

        Ok(WritePosition {
            name: path,
            file,
            write_pos: BINLOG_MAGIC.len() as u64,
        })
    }

    /// 활성 세그먼트 복구
    ///
    /// 저장된 목록에 포함되지 않은 첫 트랜잭션과 그 뒤, 그리고 잘린 마지막 이벤트를
    /// 잘라낸다. 잘린 트랜잭션은 업스트림에서 다시 받는다.
    fn recover(path: &Path, persisted: &GtidList) -> Result<WritePosition> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                RelayError::StorageError(format!("Failed to open {}: {}", path.display(), e))
            })?;
        binlog::verify_segment(&mut file).map_err(|e| {
            RelayError::MalformedState(format!("{}: {}", path.display(), e))
        })?;

        let mut pos = BINLOG_MAGIC.len() as u64;
        let mut cut = None;
        loop {
            match binlog::read_event_at(&mut file, pos)? {
                ReadOutcome::Event(event) => {
                    if let Some((gtid, _)) = event.gtid()? {
                        if !persisted.is_covered(&gtid) {
                            cut = Some(pos);
                            break;
                        }
                    }
                    pos += event.len() as u64;
                }
                ReadOutcome::Incomplete => {
                    cut = Some(pos);
                    break;
                }
                ReadOutcome::End => break,
            }
        }

        if let Some(cut) = cut {
            let len = file.metadata()?.len();
            warn!(
                "Truncating {} from {} to {} (not covered by {})",
                path.display(),
                len,
                cut,
                persisted
            );
            file.set_len(cut)
                .and_then(|_| file.sync_all())
                .map_err(|e| {
                    RelayError::StorageError(format!("Failed to truncate {}: {}", path.display(), e))
                })?;
            pos = cut;
        }

        Ok(WritePosition {
            name: path.to_path_buf(),
            file,
            write_pos: pos,
        })
    }

    fn storage_error(&self, what: &str, e: std::io::Error) -> RelayError {
        RelayError::StorageError(format!(
            "Failed to {} {}: {}",
            what,
            self.current.name.display(),
            e
        ))
    }
}

/// 마지막 세그먼트 번호 다음 이름 (binlog.000001 형식)
fn next_file_name(inventory: &Inventory, basename: &str) -> String {
    let next = inventory
        .active()
        .and_then(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .and_then(|ext| ext.parse::<u64>().ok())
        })
        .map(|seq| seq + 1)
        .unwrap_or(1);
    format!("{}.{:06}", basename, next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtid::Gtid;
    use crate::test_util::*;

    fn read_all(path: &Path) -> Vec<RplEvent> {
        let mut file = File::open(path).unwrap();
        binlog::verify_segment(&mut file).unwrap();
        let mut pos = BINLOG_MAGIC.len() as u64;
        let mut events = Vec::new();
        while let ReadOutcome::Event(event) = binlog::read_event_at(&mut file, pos).unwrap() {
            pos += event.len() as u64;
            events.push(event);
        }
        events
    }

    fn open_fresh(dir: &Path) -> (Arc<Inventory>, FileWriter) {
        let config = test_config(dir);
        let inventory = Arc::new(Inventory::open(&config).unwrap());
        let writer = FileWriter::open(inventory.clone(), &config, false, &GtidList::new()).unwrap();
        (inventory, writer)
    }

    #[test]
    fn test_fresh_start_creates_first_segment() {
        let dir = tempfile::tempdir().unwrap();
        let (inventory, writer) = open_fresh(dir.path());

        assert_eq!(inventory.file_names(), vec![dir.path().join("binlog.000001")]);
        assert_eq!(writer.position(), 4);
        assert_eq!(std::fs::read(writer.current_file()).unwrap(), BINLOG_MAGIC.to_vec());
    }

    #[test]
    fn test_add_event_patches_next_pos() {
        let dir = tempfile::tempdir().unwrap();
        let (_inventory, mut writer) = open_fresh(dir.path());

        for event in transaction(0, 1, 1) {
            writer.add_event(&event).unwrap();
        }
        writer.end_transaction().unwrap();

        let events = read_all(writer.current_file());
        assert_eq!(events.len(), 4);
        let mut pos = 4u64;
        for event in &events {
            pos += event.len() as u64;
            assert_eq!(event.header().next_pos as u64, pos);
        }
        assert_eq!(writer.position(), pos);
    }

    #[test]
    fn test_rotation_happens_at_transaction_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_segment_size = 64;
        let inventory = Arc::new(Inventory::open(&config).unwrap());
        let mut writer = FileWriter::open(inventory.clone(), &config, false, &GtidList::new()).unwrap();

        for seq in 1..=2 {
            for event in transaction(0, 1, seq) {
                writer.add_event(&event).unwrap();
            }
            writer.end_transaction().unwrap();
        }

        let files = inventory.file_names();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1], dir.path().join("binlog.000002"));

        let first = read_all(&files[0]);
        assert_eq!(first.len(), 5);
        assert_eq!(first[4].event_type(), EventType::RotateEvent);
        let rotate = binlog::BinlogParser::parse_rotate_event(first[4].body()).unwrap();
        assert_eq!(rotate.next_binlog_name, "binlog.000002");

        let second = read_all(&files[1]);
        assert_eq!(second.len(), 4);
        assert_eq!(second[0].gtid().unwrap().unwrap().0, Gtid::new(0, 1, 2));
    }

    #[test]
    fn test_artificial_rotate_and_heartbeat_are_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let (inventory, mut writer) = open_fresh(dir.path());

        let fake_rotate = RplEvent::from_raw(binlog::encode_event(
            EventType::RotateEvent as u8,
            1,
            0,
            0,
            binlog::LOG_EVENT_ARTIFICIAL_F,
            &binlog::rotate_event_body(4, "master-bin.000007"),
        ))
        .unwrap();
        writer.add_event(&fake_rotate).unwrap();
        writer.add_event(&RplEvent::heartbeat(1, "master-bin.000007", 4)).unwrap();

        assert_eq!(inventory.count(), 1);
        assert_eq!(writer.position(), 4);
    }

    #[test]
    fn test_upstream_rotate_starts_new_segment() {
        let dir = tempfile::tempdir().unwrap();
        let (inventory, mut writer) = open_fresh(dir.path());

        let rotate = RplEvent::from_raw(binlog::encode_event(
            EventType::RotateEvent as u8,
            1,
            1_600_000_000,
            0,
            0,
            &binlog::rotate_event_body(4, "master-bin.000008"),
        ))
        .unwrap();
        writer.add_event(&rotate).unwrap();

        assert_eq!(inventory.count(), 2);
        assert_eq!(writer.current_file(), dir.path().join("binlog.000002"));
    }

    #[test]
    fn test_rollback_discards_open_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let (_inventory, mut writer) = open_fresh(dir.path());

        for event in transaction(0, 1, 1) {
            writer.add_event(&event).unwrap();
        }
        writer.end_transaction().unwrap();
        let committed = writer.position();

        let partial = transaction(0, 1, 2);
        writer.add_event(&partial[0]).unwrap();
        writer.add_event(&partial[1]).unwrap();
        assert_eq!(std::fs::metadata(writer.current_file()).unwrap().len(), committed);
        writer.rollback_transaction().unwrap();

        assert!(!writer.in_transaction());
        assert_eq!(writer.position(), committed);
        assert_eq!(read_all(writer.current_file()).len(), 4);
    }

    #[test]
    fn test_tailing_reader_never_sees_rolled_back_events() {
        use crate::file_reader::FileReader;

        let dir = tempfile::tempdir().unwrap();
        let (inventory, mut writer) = open_fresh(dir.path());
        let mut reader = FileReader::new(&Gtid::default(), inventory).unwrap();

        let partial = transaction(0, 1, 2);
        writer.add_event(&partial[0]).unwrap();
        writer.add_event(&partial[1]).unwrap();
        assert!(reader.fetch_event().unwrap().is_none());

        writer.rollback_transaction().unwrap();
        for event in transaction(0, 1, 3) {
            writer.add_event(&event).unwrap();
        }
        writer.end_transaction().unwrap();

        let mut seen = Vec::new();
        while let Some(event) = reader.fetch_event().unwrap() {
            seen.push(event);
        }
        let types: Vec<EventType> = seen.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, transaction(0, 1, 3).iter().map(|e| e.event_type()).collect::<Vec<_>>());
        assert_eq!(seen[0].gtid().unwrap().unwrap().0, Gtid::new(0, 1, 3));
        assert_eq!(seen, read_all(writer.current_file()));
    }

    #[test]
    fn test_position_past_32_bits_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_inventory, mut writer) = open_fresh(dir.path());
        writer.current.write_pos = u32::MAX as u64 - 8;

        let err = writer.add_event(&xid_event(1, 1)).unwrap_err();
        assert!(matches!(err, RelayError::StorageError(_)));

        let events = transaction(0, 1, 1);
        let err = writer.add_event(&events[0]).unwrap_err();
        assert!(matches!(err, RelayError::StorageError(_)));
        assert_eq!(std::fs::read(writer.current_file()).unwrap(), BINLOG_MAGIC.to_vec());
    }

    #[test]
    fn test_recover_truncates_uncovered_transaction_and_partial_tail() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let inventory = Arc::new(Inventory::open(&config).unwrap());
        let path;
        {
            let mut writer = FileWriter::open(inventory.clone(), &config, false, &GtidList::new()).unwrap();
            for seq in 1..=3 {
                for event in transaction(0, 1, seq) {
                    writer.add_event(&event).unwrap();
                }
                writer.end_transaction().unwrap();
            }
            path = writer.current_file().to_path_buf();
        }
        // 잘린 이벤트 조각
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let persisted = GtidList::from_string("0-1-2");
        let writer = FileWriter::open(inventory.clone(), &config, true, &persisted).unwrap();

        let events = read_all(&path);
        assert_eq!(events.len(), 8);
        assert_eq!(writer.position(), std::fs::metadata(&path).unwrap().len());
        assert_eq!(inventory.count(), 1);
    }
}
