//! 구독자 세션 어댑터
//!
//! FileReader 하나를 세션 워커 위에서 협력적으로 구동한다. 콜백이 false를 돌려주면
//! (소비자가 준비되지 않음) 그 이벤트를 보관하고 `resume()`이 호출될 때까지 더 이상
//! 전달하지 않는다. 유휴 상태가 하트비트 주기를 넘으면 같은 콜백으로 하트비트를 보낸다.
//!
//! 워커 작업들은 약한 참조만 가지므로, Reader가 해제되며 작업을 취소하고 나면
//! 콜백은 다시 호출되지 않는다. 콜백 안에서 자기 Reader를 해제해서는 안 된다.

use crate::error::{RelayError, Result};
use crate::events::RplEvent;
use crate::file_reader::FileReader;
use crate::gtid::Gtid;
use crate::inventory::Inventory;
use crate::worker::{CallId, Worker};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error};

/// 이벤트 전달 콜백. 소비자가 받을 수 없으면 false
pub type Callback = Box<dyn FnMut(&RplEvent) -> bool>;

pub type ErrorHandler = Box<dyn FnMut(&RelayError)>;

const MAX_HEARTBEAT_TICK: Duration = Duration::from_secs(1);

struct ReaderInner {
    callback: RefCell<Callback>,
    file_reader: RefCell<FileReader>,
    /// 소비자가 아직 받지 않은 이벤트
    pending: RefCell<Option<RplEvent>>,
    stalled: Cell<bool>,
    failed: Cell<bool>,
    last_event: Cell<Instant>,
    error_handler: RefCell<Option<ErrorHandler>>,
}

impl ReaderInner {
    fn handle_messages(&self) -> Result<()> {
        while !self.stalled.get() && !self.failed.get() {
            let pending = self.pending.borrow_mut().take();
            let event = match pending {
                Some(event) => event,
                None => match self.file_reader.borrow_mut().fetch_event()? {
                    Some(event) => event,
                    None => break,
                },
            };

            if (self.callback.borrow_mut())(&event) {
                self.last_event.set(Instant::now());
            } else {
                debug!("Consumer not ready, holding event until resumed");
                *self.pending.borrow_mut() = Some(event);
                self.stalled.set(true);
            }
        }
        Ok(())
    }

    fn drive(&self) {
        if let Err(err) = self.handle_messages() {
            self.fail(err);
        }
    }

    fn fail(&self, err: RelayError) {
        error!("Reader stopped: {}", err);
        self.failed.set(true);
        if let Some(handler) = self.error_handler.borrow_mut().as_mut() {
            handler(&err);
        }
    }

    fn generate_heartbeat(&self, interval: Duration) {
        // 실제 이벤트가 있으면 먼저 보낸다
        self.drive();

        if self.stalled.get() || self.failed.get() || self.pending.borrow().is_some() {
            return;
        }
        if self.last_event.get().elapsed() < interval {
            return;
        }

        let heartbeat = {
            let file_reader = self.file_reader.borrow();
            RplEvent::heartbeat(
                file_reader.server_id(),
                &file_name_of(&file_reader),
                file_reader.position(),
            )
        };
        debug!("Sending heartbeat");
        if !(self.callback.borrow_mut())(&heartbeat) {
            debug!("Consumer not ready for heartbeat, dropping it");
        }
        self.last_event.set(Instant::now());
    }
}

fn file_name_of(file_reader: &FileReader) -> String {
    file_reader
        .current_file()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub struct Reader {
    inner: Rc<ReaderInner>,
    worker: Worker,
    wait_id: Option<CallId>,
    heartbeat_id: Option<CallId>,
    resume_id: Cell<Option<CallId>>,
}

impl Reader {
    /// 구독 시작. 이미 읽을 이벤트가 있으면 생성 중에 바로 전달한다
    pub fn new<F>(
        callback: F,
        inventory: Arc<Inventory>,
        worker: &Worker,
        gtid: &Gtid,
        heartbeat_interval: Duration,
    ) -> Result<Self>
    where
        F: FnMut(&RplEvent) -> bool + 'static,
    {
        let file_reader = FileReader::new(gtid, inventory)?;
        let wait_handle = file_reader.wait_handle();

        let inner = Rc::new(ReaderInner {
            callback: RefCell::new(Box::new(callback)),
            file_reader: RefCell::new(file_reader),
            pending: RefCell::new(None),
            stalled: Cell::new(false),
            failed: Cell::new(false),
            last_event: Cell::new(Instant::now()),
            error_handler: RefCell::new(None),
        });

        let mut reader = Reader {
            inner: inner.clone(),
            worker: worker.clone(),
            wait_id: None,
            heartbeat_id: None,
            resume_id: Cell::new(None),
        };

        let weak = Rc::downgrade(&inner);
        reader.wait_id = Some(worker.add_wait_handle(wait_handle, move |events| {
            if let Some(inner) = weak.upgrade() {
                inner.file_reader.borrow_mut().fd_notify(events);
                inner.drive();
            }
        }));

        if !heartbeat_interval.is_zero() {
            let weak: Weak<ReaderInner> = Rc::downgrade(&inner);
            let tick = heartbeat_interval.min(MAX_HEARTBEAT_TICK);
            reader.heartbeat_id = Some(worker.delayed_call(tick, move || match weak.upgrade() {
                Some(inner) => {
                    inner.generate_heartbeat(heartbeat_interval);
                    true
                }
                None => false,
            }));
        }

        // 실패하면 reader가 해제되며 등록한 작업도 취소된다
        inner.handle_messages()?;
        Ok(reader)
    }

    /// 이후 발생하는 에러를 받을 핸들러
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: FnMut(&RelayError) + 'static,
    {
        *self.inner.error_handler.borrow_mut() = Some(Box::new(handler));
    }

    /// 소비자가 다시 받을 수 있게 되었을 때 호출. 전달은 다음 차례에 재개된다
    pub fn resume(&self) {
        if !self.inner.stalled.replace(false) {
            return;
        }

        let weak = Rc::downgrade(&self.inner);
        let id = self.worker.execute(move || {
            if let Some(inner) = weak.upgrade() {
                inner.drive();
            }
        });
        if let Some(previous) = self.resume_id.replace(Some(id)) {
            self.worker.cancel(previous);
        }
    }

    pub fn is_stalled(&self) -> bool {
        self.inner.stalled.get()
    }

    pub fn is_failed(&self) -> bool {
        self.inner.failed.get()
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        // 작업을 먼저 취소한 다음 FileReader가 해제된다
        for id in [self.wait_id.take(), self.heartbeat_id.take(), self.resume_id.take()]
            .into_iter()
            .flatten()
        {
            self.worker.cancel(id);
        }
    }
}
