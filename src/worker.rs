//! 구독자 세션용 단일 스레드 워커
//!
//! `tokio::task::LocalSet` 안에서 돌아가는 협력형 이벤트 루프 위에 지연 호출과
//! 대기 핸들 등록을 얹는다. 모든 작업은 `CallId`로 취소할 수 있고, 취소된 작업의
//! 콜백은 다시 호출되지 않는다. 반드시 `LocalSet` 문맥 안에서 사용해야 한다.

use crate::notify::WaitHandle;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(u64);

#[derive(Default)]
struct WorkerInner {
    next_id: Cell<u64>,
    tasks: RefCell<HashMap<CallId, AbortHandle>>,
}

impl WorkerInner {
    fn allocate(&self) -> CallId {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        CallId(id)
    }

    fn finished(weak: &Weak<WorkerInner>, id: CallId) {
        if let Some(inner) = weak.upgrade() {
            inner.tasks.borrow_mut().remove(&id);
        }
    }
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.get_mut().drain() {
            handle.abort();
        }
    }
}

/// 세션 워커 핸들. 복제해도 같은 워커를 가리킨다
#[derive(Clone, Default)]
pub struct Worker {
    inner: Rc<WorkerInner>,
}

impl Worker {
    pub fn new() -> Self {
        Worker::default()
    }

    /// 다음 차례에 한 번 실행
    pub fn execute<F>(&self, f: F) -> CallId
    where
        F: FnOnce() + 'static,
    {
        let id = self.inner.allocate();
        let weak = Rc::downgrade(&self.inner);
        let handle = tokio::task::spawn_local(async move {
            tokio::task::yield_now().await;
            f();
            WorkerInner::finished(&weak, id);
        });
        self.register(id, handle.abort_handle());
        id
    }

    /// `interval`마다 `f`를 호출한다. `f`가 false를 돌려주면 멈춘다
    pub fn delayed_call<F>(&self, interval: Duration, mut f: F) -> CallId
    where
        F: FnMut() -> bool + 'static,
    {
        let id = self.inner.allocate();
        let weak = Rc::downgrade(&self.inner);
        let handle = tokio::task::spawn_local(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !f() {
                    break;
                }
            }
            WorkerInner::finished(&weak, id);
        });
        self.register(id, handle.abort_handle());
        id
    }

    /// 대기 핸들이 깨어날 때마다 이벤트 비트와 함께 `f`를 호출
    pub fn add_wait_handle<F>(&self, mut handle: WaitHandle, mut f: F) -> CallId
    where
        F: FnMut(u32) + 'static,
    {
        let id = self.inner.allocate();
        let join = tokio::task::spawn_local(async move {
            loop {
                let events = handle.wait().await;
                f(events);
            }
        });
        self.register(id, join.abort_handle());
        id
    }

    /// 작업 취소. 아직 남아 있던 작업이면 true
    pub fn cancel(&self, id: CallId) -> bool {
        match self.inner.tasks.borrow_mut().remove(&id) {
            Some(handle) => {
                handle.abort();
                debug!("Cancelled worker call {:?}", id);
                true
            }
            None => false,
        }
    }

    /// 아직 끝나지 않은 작업 수
    pub fn pending(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    fn register(&self, id: CallId, handle: AbortHandle) {
        self.inner.tasks.borrow_mut().insert(id, handle);
    }
}
