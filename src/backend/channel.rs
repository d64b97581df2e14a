//! Push-to-pull bridge between process reader tasks and a consumer.
//!
//! Reader tasks push through [`EventSender`]; the consumer pulls from
//! [`EventChannel`], either with [`EventChannel::recv`] or as a `Stream`.
//! At most one terminal message (`complete`/`error`) is ever delivered, and
//! it is always the last one.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::AgentMessage;

#[derive(Debug)]
struct Shared {
    depth: AtomicUsize,
    warned: AtomicBool,
    terminal_sent: AtomicBool,
    queue_warn: usize,
    /// Held across the terminal check and the enqueue, so nothing lands behind the terminal.
    send_lock: Mutex<()>,
}

/// Create a linked sender/channel pair.
///
/// `queue_warn` is the queued-message count above which a single warning is
/// logged (re-armed once the backlog halves). Zero disables the warning.
pub fn event_channel(queue_warn: usize) -> (EventSender, EventChannel) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        depth: AtomicUsize::new(0),
        warned: AtomicBool::new(false),
        terminal_sent: AtomicBool::new(false),
        queue_warn,
        send_lock: Mutex::new(()),
    });
    let cancel = CancellationToken::new();

    (
        EventSender {
            tx,
            shared: Arc::clone(&shared),
        },
        EventChannel {
            rx,
            shared,
            cancel,
            finished: false,
        },
    )
}

/// Producer half. Cheap to clone; one clone per reader task.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<AgentMessage>,
    shared: Arc<Shared>,
}

impl EventSender {
    /// Queue a message. Returns `false` if it was dropped: anything after the
    /// first terminal message, or any message once the consumer is gone.
    ///
    /// A `true` return means the consumer will see the message.
    pub fn send(&self, message: AgentMessage) -> bool {
        let _guard = self.shared.send_lock.lock().unwrap_or_else(|e| e.into_inner());
        if message.is_terminal() {
            if self.shared.terminal_sent.swap(true, Ordering::SeqCst) {
                debug!(kind = message.kind(), "Dropping second terminal message");
                return false;
            }
        } else if self.shared.terminal_sent.load(Ordering::SeqCst) {
            debug!(kind = message.kind(), "Dropping message after terminal");
            return false;
        }

        let depth = self.shared.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tx.send(message).is_err() {
            self.shared.depth.fetch_sub(1, Ordering::SeqCst);
            return false;
        }

        let threshold = self.shared.queue_warn;
        if threshold > 0 && depth >= threshold && !self.shared.warned.swap(true, Ordering::SeqCst) {
            warn!(
                depth,
                threshold, "Event queue is growing; consumer is not keeping up"
            );
        }
        true
    }

    pub fn terminal_sent(&self) -> bool {
        self.shared.terminal_sent.load(Ordering::SeqCst)
    }

    /// Whether the consumer half has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct EventChannel {
    rx: mpsc::UnboundedReceiver<AgentMessage>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    finished: bool,
}

impl EventChannel {
    /// Next message, or `None` once the terminal message has been delivered.
    ///
    /// If every sender goes away without a terminal message, a synthetic
    /// `error` is returned so the consumer never waits forever.
    pub async fn recv(&mut self) -> Option<AgentMessage> {
        if self.finished {
            return None;
        }

        match self.rx.recv().await {
            Some(message) => {
                let depth = self.shared.depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                if depth <= self.shared.queue_warn / 2 {
                    self.shared.warned.store(false, Ordering::SeqCst);
                }
                if message.is_terminal() {
                    self.finished = true;
                }
                Some(message)
            }
            None => {
                self.finished = true;
                if self.shared.terminal_sent.swap(true, Ordering::SeqCst) {
                    None
                } else {
                    Some(AgentMessage::error(
                        "Agent stream closed without a final result",
                    ))
                }
            }
        }
    }

    /// Ask the producer side to stop. The process is killed and a terminal
    /// message follows, so a pending `recv` returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token observed by the producer side.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Messages queued but not yet received.
    pub fn depth(&self) -> usize {
        self.shared.depth.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consume the channel as an async `Stream` that ends after the terminal message.
    pub fn into_stream(mut self) -> impl Stream<Item = AgentMessage> {
        async_stream::stream! {
            while let Some(message) = self.recv().await {
                yield message;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_in_order_and_stops_after_terminal() {
        let (tx, mut rx) = event_channel(0);
        assert!(tx.send(AgentMessage::text("one")));
        assert!(tx.send(AgentMessage::text("two")));
        assert!(tx.send(AgentMessage::complete("done")));
        assert!(!tx.send(AgentMessage::text("late")));
        assert!(!tx.send(AgentMessage::error("second terminal")));

        assert_eq!(rx.recv().await, Some(AgentMessage::text("one")));
        assert_eq!(rx.recv().await, Some(AgentMessage::text("two")));
        assert_eq!(rx.recv().await, Some(AgentMessage::complete("done")));
        assert_eq!(rx.recv().await, None);
        assert!(rx.is_finished());
    }

    #[tokio::test]
    async fn closed_without_terminal_synthesises_error() {
        let (tx, mut rx) = event_channel(0);
        tx.send(AgentMessage::text("partial"));
        drop(tx);

        assert_eq!(rx.recv().await, Some(AgentMessage::text("partial")));
        let last = rx.recv().await.expect("synthetic terminal");
        assert!(matches!(last, AgentMessage::Error { .. }));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn cancel_unblocks_a_waiting_consumer() {
        let (tx, mut rx) = event_channel(0);
        let token = rx.cancellation_token();

        let producer = tokio::spawn(async move {
            token.cancelled().await;
            tx.send(AgentMessage::error("Process was cancelled"));
        });

        rx.cancel();
        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("recv should not hang");
        assert_eq!(message, Some(AgentMessage::error("Process was cancelled")));
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn stream_yields_until_terminal() {
        let (tx, rx) = event_channel(0);
        tx.send(AgentMessage::system("init"));
        tx.send(AgentMessage::error("boom"));

        let messages: Vec<AgentMessage> = rx.into_stream().collect().await;
        assert_eq!(
            messages,
            vec![AgentMessage::system("init"), AgentMessage::error("boom")]
        );
    }

    #[tokio::test]
    async fn depth_tracks_backlog() {
        let (tx, mut rx) = event_channel(2);
        for i in 0..4 {
            tx.send(AgentMessage::text(format!("m{}", i)));
        }
        assert_eq!(rx.depth(), 4);
        rx.recv().await;
        assert_eq!(rx.depth(), 3);
    }

    #[tokio::test]
    async fn accepted_messages_never_trail_a_racing_terminal() {
        for _ in 0..20 {
            let (tx, mut rx) = event_channel(0);
            let accepted: usize = std::thread::scope(|scope| {
                let producers: Vec<_> = (0..4)
                    .map(|_| {
                        let tx = tx.clone();
                        scope.spawn(move || {
                            (0..500)
                                .filter(|i| tx.send(AgentMessage::text(format!("m{}", i))))
                                .count()
                        })
                    })
                    .collect();
                tx.send(AgentMessage::complete("done"));
                producers.into_iter().map(|p| p.join().unwrap()).sum()
            });
            drop(tx);

            let mut delivered = 0;
            let mut last = None;
            while let Some(message) = rx.recv().await {
                if !message.is_terminal() {
                    delivered += 1;
                }
                last = Some(message);
            }
            assert_eq!(delivered, accepted);
            assert_eq!(last, Some(AgentMessage::complete("done")));
        }
    }

    #[test]
    fn send_after_consumer_dropped_is_rejected() {
        let (tx, rx) = event_channel(0);
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.send(AgentMessage::text("nobody listening")));
    }
}
