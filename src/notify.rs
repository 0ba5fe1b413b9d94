//! 활성 세그먼트 변경 알림
//!
//! 쓰기 쪽은 이벤트를 덧붙이거나 세그먼트를 회전할 때마다 세대 번호를 올린다.
//! 알림은 참고용일 뿐이라 받는 쪽은 깨어날 때마다 실제 파일 상태를 다시 확인해야 한다.
//! 외부 프로세스가 파일을 바꾸는 경우를 위해 주기적으로도 깨어난다.

use std::time::Duration;
use tokio::sync::watch;

/// 세대 번호가 바뀌어서 깨어남
pub const EVENT_MODIFIED: u32 = 0x1;
/// 재확인 주기가 지나서 깨어남
pub const EVENT_POLL: u32 = 0x2;

/// 쓰기 쪽 알림 발신자
#[derive(Debug)]
pub struct ChangeNotifier {
    tx: watch::Sender<u64>,
    poll_interval: Duration,
}

impl ChangeNotifier {
    pub fn new(poll_interval: Duration) -> Self {
        let (tx, _) = watch::channel(0);
        ChangeNotifier { tx, poll_interval }
    }

    /// 구독자가 없어도 실패하지 않는다
    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> WaitHandle {
        WaitHandle {
            rx: self.tx.subscribe(),
            poll_interval: self.poll_interval,
        }
    }
}

/// 읽는 쪽이 기다리는 핸들
#[derive(Debug, Clone)]
pub struct WaitHandle {
    rx: watch::Receiver<u64>,
    poll_interval: Duration,
}

impl WaitHandle {
    /// 변경이 있거나 재확인 주기가 지나면 깨어나 이벤트 비트를 돌려준다
    pub async fn wait(&mut self) -> u32 {
        tokio::select! {
            changed = self.rx.changed() => match changed {
                Ok(()) => {
                    self.rx.borrow_and_update();
                    EVENT_MODIFIED
                }
                Err(_) => {
                    // 발신자가 사라지면 주기적 확인만 남는다
                    tokio::time::sleep(self.poll_interval).await;
                    EVENT_POLL
                }
            },
            _ = tokio::time::sleep(self.poll_interval) => EVENT_POLL,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
