//! The shared work queue of outstanding pieces.

use crate::piece::PieceRequest;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// What a worker gets back from [`WorkQueue::next_for`].
#[derive(Debug, PartialEq, Eq)]
pub enum NextWork {
    /// A piece the caller's peer has. The caller now owns it.
    Piece(PieceRequest),
    /// Nothing the peer has showed up within the idle limit.
    Idle,
    /// The download is over.
    Closed,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PieceRequest>,
    closed: bool,
}

/// Multi-producer multi-consumer queue of [`PieceRequest`]s.
///
/// Workers take only requests their peer can serve, so a piece nobody has
/// stays parked here instead of bouncing between workers.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(requests: impl IntoIterator<Item = PieceRequest>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: requests.into_iter().collect(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Puts a request (back) on the queue and wakes waiting workers.
    pub fn push(&self, request: PieceRequest) {
        self.lock().pending.push_back(request);
        self.notify.notify_waiters();
    }

    /// Ends the run: every current and future `next_for` returns `Closed`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes the first queued request for which `has_piece` is true,
    /// waiting for pushes until `idle_limit` elapses.
    pub async fn next_for<F>(&self, has_piece: F, idle_limit: Duration) -> NextWork
    where
        F: Fn(u32) -> bool,
    {
        let deadline = Instant::now() + idle_limit;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting so a push between the check and the
            // await is not lost.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return NextWork::Closed;
                }
                let found = state.pending.iter().position(|r| has_piece(r.index));
                if let Some(request) = found.and_then(|pos| state.pending.remove(pos)) {
                    return NextWork::Piece(request);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return NextWork::Idle;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // The state stays consistent even if a holder panicked mid-push.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(index: u32) -> PieceRequest {
        PieceRequest {
            index,
            hash: [0; 20],
            length: 10,
        }
    }

    #[tokio::test]
    async fn test_takes_first_available_piece() {
        let queue = WorkQueue::new([request(0), request(1), request(2)]);
        let got = queue
            .next_for(|i| i == 1 || i == 2, Duration::from_millis(10))
            .await;
        assert_eq!(got, NextWork::Piece(request(1)));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_piece_stays_queued() {
        let queue = WorkQueue::new([request(5)]);
        let got = queue.next_for(|_| false, Duration::from_millis(20)).await;
        assert_eq!(got, NextWork::Idle);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_push() {
        let queue = Arc::new(WorkQueue::new([]));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next_for(|_| true, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(request(3));
        assert_eq!(waiter.await.unwrap(), NextWork::Piece(request(3)));
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let queue = Arc::new(WorkQueue::new([request(0)]));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next_for(|_| false, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert_eq!(waiter.await.unwrap(), NextWork::Closed);
        assert_eq!(
            queue.next_for(|_| true, Duration::from_secs(1)).await,
            NextWork::Closed
        );
    }
}
