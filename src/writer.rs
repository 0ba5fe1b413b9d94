//! 업스트림 수신 오케스트레이터
//!
//! 업스트림 연결에서 받은 이벤트를 FileWriter로 넘기고, 트랜잭션 경계마다 GTID 목록을
//! 상태 파일에 남긴다. 재시작하면 그 목록에서 이어 받는다.
//!
//! 상태 전이:
//! `Bootstrapping -> Streaming -> (Reconnecting <-> Streaming) -> Aborted | Stopped`

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{RelayError, Result};
use crate::events::{EventType, RplEvent};
use crate::binlog::BinlogParser;
use crate::file_writer::FileWriter;
use crate::gtid::{Gtid, GtidList};
use crate::inventory::Inventory;
use crate::offset::{GtidStateFile, WriterState};
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Writer 종료 요청. 복제해도 같은 신호를 가리킨다
#[derive(Clone)]
pub struct ShutdownSignal(Arc<watch::Sender<bool>>);

impl ShutdownSignal {
    pub fn new() -> Self {
        ShutdownSignal(Arc::new(watch::channel(false).0))
    }

    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// 종료 요청이 올 때까지 대기
    pub async fn wait(&self) {
        let mut rx = self.0.subscribe();
        // 송신자는 self가 쥐고 있으므로 닫히지 않는다
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        ShutdownSignal::new()
    }
}

/// 기록 중인 트랜잭션
#[derive(Debug, Clone, Copy)]
struct Transaction {
    gtid: Gtid,
    /// DDL처럼 쿼리 하나로 끝나는 트랜잭션
    standalone: bool,
    /// 이미 기록된 트랜잭션이라 버리는 중
    skip: bool,
}

pub struct Writer<C: Connection> {
    config: Config,
    connection: C,
    file: FileWriter,
    state_file: GtidStateFile,
    /// 기록이 끝난 트랜잭션 목록
    current: GtidList,
    /// 상태 파일에 마지막으로 저장한 목록
    persisted: GtidList,
    transaction: Option<Transaction>,
    state: watch::Sender<WriterState>,
    shared_gtids: Arc<RwLock<GtidList>>,
    shutdown: ShutdownSignal,
}

impl<C: Connection> Writer<C> {
    /// 상태 파일을 읽고 활성 세그먼트를 연다. 상태 파일이 손상되었으면 실패
    pub fn new(config: Config, inventory: Arc<Inventory>, connection: C) -> Result<Self> {
        let state_file = GtidStateFile::new(config.gtid_file_path());

        let (current, initial_state) = match state_file.load()? {
            Some(list) => {
                info!("Resuming replication from '{}'", list);
                (list, WriterState::Reconnecting)
            }
            None => {
                let list = config.bootstrap_gtid_list();
                if !list.is_valid() {
                    return Err(RelayError::ConfigError(format!(
                        "Invalid bootstrap GTID list '{}'",
                        config.bootstrap_gtid_list
                    )));
                }
                info!("No replication state found, bootstrapping from '{}'", list);
                (list, WriterState::Bootstrapping)
            }
        };

        let continuation = initial_state != WriterState::Bootstrapping;
        let file = FileWriter::open(inventory, &config, continuation, &current)?;

        let persisted = if continuation { current.clone() } else { GtidList::new() };
        let shared_gtids = Arc::new(RwLock::new(current.clone()));

        Ok(Writer {
            config,
            connection,
            file,
            state_file,
            current,
            persisted,
            transaction: None,
            state: watch::channel(initial_state).0,
            shared_gtids,
            shutdown: ShutdownSignal::new(),
        })
    }

    /// 외부에서 만든 종료 신호를 사용
    pub fn with_shutdown_signal(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn state(&self) -> WriterState {
        *self.state.borrow()
    }

    pub fn gtid_list(&self) -> GtidList {
        self.current.clone()
    }

    /// 종료 요청이나 치명적 에러가 있을 때까지 복제
    pub async fn run(mut self) -> Result<()> {
        let mut backoff = self.config.reconnect_initial_backoff;

        while !self.shutdown.is_triggered() {
            let result = match self.start().await {
                Ok(()) => {
                    backoff = self.config.reconnect_initial_backoff;
                    self.stream().await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => break,
                Err(e) if e.is_transient() => {
                    warn!(
                        "Lost upstream connection: {} ({}), retrying in {:?}",
                        e,
                        self.connection.error_string(),
                        backoff
                    );
                    self.set_state(WriterState::Reconnecting);
                    if let Err(e) = self.discard_transaction() {
                        return self.abort(e);
                    }

                    tokio::select! {
                        _ = self.shutdown.wait() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff, self.config.reconnect_max_backoff);
                }
                Err(e) => return self.abort(e),
            }
        }

        if let Err(e) = self.discard_transaction() {
            return self.abort(e);
        }
        info!("Writer stopped at '{}'", self.current);
        self.set_state(WriterState::Stopped);
        Ok(())
    }

    /// 전용 스레드와 current-thread 런타임에서 실행
    pub fn spawn(self) -> Result<WriterHandle>
    where
        C: Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let state = self.state.subscribe();
        let gtids = self.shared_gtids.clone();

        let thread = std::thread::Builder::new()
            .name("binlog-writer".to_string())
            .spawn(move || -> Result<()> {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(self.run())
            })?;

        Ok(WriterHandle {
            thread,
            shutdown,
            state,
            gtids,
        })
    }

    async fn start(&mut self) -> Result<()> {
        self.connection
            .start_replication(self.config.server_id, &self.current)
            .await?;
        self.set_state(WriterState::Streaming);
        Ok(())
    }

    async fn stream(&mut self) -> Result<()> {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.wait() => return Ok(()),
                event = self.connection.get_rpl_msg() => event?,
            };
            self.process_event(&event)?;
        }
    }

    fn process_event(&mut self, event: &RplEvent) -> Result<()> {
        if event.event_type() == EventType::GtidEvent {
            return self.begin_transaction(event);
        }

        let Some(transaction) = self.transaction else {
            return self.file.add_event(event);
        };

        if !transaction.skip {
            self.file.add_event(event)?;
        }
        if self.ends_transaction(event, &transaction)? {
            self.commit(transaction)?;
        }
        Ok(())
    }

    fn begin_transaction(&mut self, event: &RplEvent) -> Result<()> {
        let (gtid, data) = event
            .gtid()
            .map_err(|e| RelayError::ProtocolError(format!("Malformed GTID event: {}", e)))?
            .ok_or_else(|| RelayError::ProtocolError("Expected a GTID event".to_string()))?;

        if let Some(open) = self.transaction.take() {
            warn!("Transaction {} did not finish before {}", open.gtid, gtid);
            self.file.rollback_transaction()?;
        }

        let skip = self.current.is_covered(&gtid);
        self.transaction = Some(Transaction {
            gtid,
            standalone: data.is_standalone(),
            skip,
        });
        if skip {
            debug!("Skipping already stored transaction {}", gtid);
            return Ok(());
        }

        // 앞선 트랜잭션은 모두 끝났다
        self.persist()?;
        self.file.add_event(event)
    }

    fn ends_transaction(&self, event: &RplEvent, transaction: &Transaction) -> Result<bool> {
        match event.event_type() {
            EventType::XidEvent => Ok(true),
            EventType::QueryEvent => {
                if transaction.standalone {
                    return Ok(true);
                }
                let query = BinlogParser::parse_query_event(event.body())
                    .map_err(|e| RelayError::ProtocolError(format!("Malformed query event: {}", e)))?;
                Ok(query.is_commit())
            }
            _ => Ok(false),
        }
    }

    fn commit(&mut self, transaction: Transaction) -> Result<()> {
        self.transaction = None;
        if transaction.skip {
            return Ok(());
        }

        self.current.replace(transaction.gtid);
        self.file.end_transaction()?;
        self.persist()
    }

    fn persist(&mut self) -> Result<()> {
        if !self.current.is_valid() || self.current.is_empty() || self.current == self.persisted {
            return Ok(());
        }
        self.state_file.save(&self.current)?;
        self.persisted = self.current.clone();
        *self.shared_gtids.write() = self.current.clone();
        debug!("Replication state saved: {}", self.current);
        Ok(())
    }

    /// 끝나지 않은 트랜잭션을 버린다
    fn discard_transaction(&mut self) -> Result<()> {
        self.transaction = None;
        self.file.rollback_transaction()
    }

    fn abort(&mut self, e: RelayError) -> Result<()> {
        error!("Writer aborted: {}", e);
        self.set_state(WriterState::Aborted);
        Err(e)
    }

    fn set_state(&self, state: WriterState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Writer state: {} -> {}", previous, state);
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// 별도 스레드에서 도는 Writer 제어 핸들
pub struct WriterHandle {
    thread: JoinHandle<Result<()>>,
    shutdown: ShutdownSignal,
    state: watch::Receiver<WriterState>,
    gtids: Arc<RwLock<GtidList>>,
}

impl WriterHandle {
    pub fn state(&self) -> WriterState {
        *self.state.borrow()
    }

    /// 상태 변화 구독
    pub fn subscribe_state(&self) -> watch::Receiver<WriterState> {
        self.state.clone()
    }

    /// 상태 파일에 저장된 마지막 목록
    pub fn gtid_list(&self) -> GtidList {
        self.gtids.read().clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// 종료를 요청하고 스레드가 끝날 때까지 기다린다
    pub fn stop(self) -> Result<()> {
        self.shutdown.trigger();
        self.join()
    }

    pub fn join(self) -> Result<()> {
        self.thread
            .join()
            .map_err(|_| RelayError::StorageError("Writer thread panicked".to_string()))?
    }
}
