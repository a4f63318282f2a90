//! Reply correlation for a single socket client.
//!
//! Every command written to a peer is tracked here until exactly one of three
//! things happens: its reply arrives, its deadline passes, or the owning client
//! is disposed. A handover moves the tracking (and the obligation to resolve)
//! to another connection instead.

use crate::error::{MosError, Result};
use crate::message::{MessageId, MosMessage, ParsedMosMessage};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Outcome delivered to whoever queued a command.
pub type Reply = Result<ParsedMosMessage>;

/// Consume-once completion handle for a queued command.
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<Reply>,
}

impl Responder {
    /// Create a responder and the future that receives its outcome.
    pub fn channel() -> (Responder, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        (Responder { tx }, ReplyReceiver { rx })
    }

    /// Deliver the outcome. Returns `false` if the receiver is gone.
    pub fn resolve(self, reply: Reply) -> bool {
        self.tx.send(reply).is_ok()
    }

    pub fn reject(self, error: MosError) -> bool {
        self.resolve(Err(error))
    }
}

/// Future resolving to the reply of a queued command.
#[derive(Debug)]
pub struct ReplyReceiver {
    rx: oneshot::Receiver<Reply>,
}

impl Future for ReplyReceiver {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(reply)) => Poll::Ready(reply),
            // Responder dropped without resolving.
            Poll::Ready(Err(_)) => Poll::Ready(Err(MosError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A command awaiting its reply.
#[derive(Debug)]
pub struct QueuedCommand {
    id: MessageId,
    pub message: MosMessage,
    pub queued_at: Instant,
    pub sent_at: Option<Instant>,
    pub deadline: Instant,
    responder: Responder,
}

impl QueuedCommand {
    /// Track `message`, assigning it a message ID if it has none.
    pub fn new(mut message: MosMessage, timeout: Duration, responder: Responder) -> Self {
        let id = message.ensure_message_id();
        let queued_at = Instant::now();
        Self {
            id,
            message,
            queued_at,
            sent_at: None,
            deadline: queued_at + timeout,
            responder,
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.id
    }

    pub fn resolve(self, reply: Reply) -> bool {
        self.responder.resolve(reply)
    }

    pub fn reject(self, error: MosError) -> bool {
        self.responder.reject(error)
    }

    /// Reject with a timeout error describing this command.
    pub fn expire(self) -> bool {
        let error = MosError::Timeout {
            message_id: self.id,
            port: self.message.port,
            timeout: self.deadline - self.queued_at,
        };
        self.reject(error)
    }

    fn into_handed_over(self) -> HandedOverCommand {
        HandedOverCommand {
            message: self.message,
            responder: self.responder,
        }
    }
}

/// A pending command moved out of one queue, still unresolved.
#[derive(Debug)]
pub struct HandedOverCommand {
    /// The original message, message ID included.
    pub message: MosMessage,
    /// The original caller's completion handle.
    pub responder: Responder,
}

/// Snapshot of a client's pending commands, in submission order.
#[derive(Debug, Default)]
pub struct HandedOverQueue {
    pub commands: Vec<HandedOverCommand>,
}

impl HandedOverQueue {
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// The handed-over messages, in submission order.
    pub fn messages(&self) -> impl Iterator<Item = &MosMessage> {
        self.commands.iter().map(|c| &c.message)
    }

    /// Reject every command in the snapshot.
    pub fn reject_all(self, error: impl Fn() -> MosError) {
        for command in self.commands {
            command.responder.reject(error());
        }
    }
}

impl IntoIterator for HandedOverQueue {
    type Item = HandedOverCommand;
    type IntoIter = std::vec::IntoIter<HandedOverCommand>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.into_iter()
    }
}

/// Pending commands of one socket client, in submission order.
#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: VecDeque<QueuedCommand>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a command. A command whose message ID is already pending is
    /// handed back untouched.
    pub fn push(&mut self, command: QueuedCommand) -> std::result::Result<(), QueuedCommand> {
        if self.contains(command.id) {
            return Err(command);
        }
        self.pending.push_back(command);
        Ok(())
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.pending.iter().any(|c| c.id == id)
    }

    /// Remove the command a reply with `id` belongs to.
    pub fn take(&mut self, id: MessageId) -> Option<QueuedCommand> {
        let index = self.pending.iter().position(|c| c.id == id)?;
        self.pending.remove(index)
    }

    /// Record that the command was written. Returns `false` if it is no longer
    /// pending, in which case it must not be written.
    pub fn mark_sent(&mut self, id: MessageId, now: Instant) -> bool {
        match self.pending.iter_mut().find(|c| c.id == id) {
            Some(command) => {
                command.sent_at = Some(now);
                true
            }
            None => false,
        }
    }

    /// Remove every command whose deadline is at or before `now`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<QueuedCommand> {
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for command in self.pending.drain(..) {
            if command.deadline <= now {
                expired.push(command);
            } else {
                kept.push_back(command);
            }
        }
        self.pending = kept;
        expired
    }

    /// The earliest deadline among pending commands.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|c| c.deadline).min()
    }

    /// Move every pending command into a snapshot without resolving any.
    pub fn hand_over(&mut self) -> HandedOverQueue {
        HandedOverQueue {
            commands: self
                .pending
                .drain(..)
                .map(QueuedCommand::into_handed_over)
                .collect(),
        }
    }

    /// Remove every pending command.
    pub fn drain(&mut self) -> Vec<QueuedCommand> {
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MosBody, PortType};

    const TIMEOUT: Duration = Duration::from_millis(5000);

    fn command(id: u64) -> (QueuedCommand, ReplyReceiver) {
        let (responder, rx) = Responder::channel();
        let message = MosMessage::new(PortType::Lower, MosBody::empty("heartbeat"))
            .with_message_id(MessageId::new(id));
        (QueuedCommand::new(message, TIMEOUT, responder), rx)
    }

    #[tokio::test]
    async fn test_take_resolves_only_matching_command() {
        let mut queue = CommandQueue::new();
        let (a, _rx_a) = command(7);
        let (b, _rx_b) = command(8);
        queue.push(a).unwrap();
        queue.push(b).unwrap();

        assert!(queue.take(MessageId::new(9)).is_none());
        let taken = queue.take(MessageId::new(7)).unwrap();
        assert_eq!(taken.message_id(), MessageId::new(7));
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(MessageId::new(8)));
    }

    #[tokio::test]
    async fn test_duplicate_message_id_is_refused() {
        let mut queue = CommandQueue::new();
        let (a, _rx_a) = command(1);
        let (b, _rx_b) = command(1);
        queue.push(a).unwrap();
        let refused = queue.push(b).unwrap_err();
        assert_eq!(refused.message_id(), MessageId::new(1));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_expiry_is_per_command() {
        let mut queue = CommandQueue::new();
        let (a, rx_a) = command(1);
        let (mut b, _rx_b) = command(2);
        b.deadline += Duration::from_millis(1000);
        let first_deadline = a.deadline;
        queue.push(a).unwrap();
        queue.push(b).unwrap();

        assert_eq!(queue.next_deadline(), Some(first_deadline));
        assert!(queue.take_expired(first_deadline - Duration::from_millis(1)).is_empty());

        let expired = queue.take_expired(first_deadline);
        assert_eq!(expired.len(), 1);
        for command in expired {
            assert!(command.expire());
        }
        assert!(rx_a.await.unwrap_err().is_timeout());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_sent_only_pending() {
        let mut queue = CommandQueue::new();
        let (a, _rx) = command(3);
        queue.push(a).unwrap();
        let now = Instant::now();
        assert!(queue.mark_sent(MessageId::new(3), now));
        assert!(!queue.mark_sent(MessageId::new(4), now));
        assert_eq!(queue.take(MessageId::new(3)).unwrap().sent_at, Some(now));
    }

    #[tokio::test]
    async fn test_hand_over_keeps_order_and_responders() {
        let mut queue = CommandQueue::new();
        let mut receivers = Vec::new();
        for id in [5, 6, 7] {
            let (c, rx) = command(id);
            queue.push(c).unwrap();
            receivers.push(rx);
        }

        let snapshot = queue.hand_over();
        assert!(queue.is_empty());
        let ids: Vec<_> = snapshot.messages().map(|m| m.message_id).collect();
        assert_eq!(
            ids,
            vec![Some(MessageId::new(5)), Some(MessageId::new(6)), Some(MessageId::new(7))]
        );

        snapshot.reject_all(|| MosError::Disposed);
        for rx in receivers {
            assert!(rx.await.unwrap_err().is_disposed());
        }
    }

    #[tokio::test]
    async fn test_dropped_responder_reads_as_closed() {
        let (responder, rx) = Responder::channel();
        drop(responder);
        assert!(matches!(rx.await, Err(MosError::ConnectionClosed)));
    }
}
