use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use ems_wire::Handshake;

#[derive(Debug, Error)]
#[error("session queue is closed")]
pub struct QueueClosed;

/// Bounded FIFO of pending session handshakes between the listener and the
/// worker pool. `push` blocks while the queue is full, `pop` while it is
/// empty; neither side ever touches a lock or condition variable directly.
/// Closing the queue is the shutdown sentinel: a closed queue rejects
/// pushes and hands out `None` once drained.
pub struct SessionQueue {
    tx: mpsc::Sender<Handshake>,
    rx: Mutex<mpsc::Receiver<Handshake>>,
}

impl SessionQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Enqueue a handshake, waiting for room when the wait list is full.
    pub async fn push(&self, handshake: Handshake) -> Result<(), QueueClosed> {
        self.tx.send(handshake).await.map_err(|_| QueueClosed)
    }

    /// Dequeue the oldest pending handshake, waiting while the queue is
    /// empty. Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Handshake> {
        self.rx.lock().await.recv().await
    }

    /// Conservative emptiness probe; the queue may gain entries the moment
    /// this returns.
    pub fn is_empty(&self) -> bool {
        self.tx.capacity() == self.tx.max_capacity()
    }

    /// Close the queue: pending handshakes remain poppable, new pushes fail.
    pub async fn close(&self) {
        self.rx.lock().await.close();
    }
}
