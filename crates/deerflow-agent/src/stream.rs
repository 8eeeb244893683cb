//! Single-producer event and chunk streams.
//!
//! Both ends are plain unbounded mpsc channels: the producer never waits on
//! the consumer, and dropping the producer closes the stream. A spawned
//! producer task therefore closes its stream on every exit path.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use deerflow_core::types::{Message, concat_messages};

use crate::event::{AgentEvent, EventKind};

/// Ordered events of one agent run.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<AgentEvent>,
}

/// Producer half of an [`EventStream`], bound to one agent name.
#[derive(Debug, Clone)]
pub struct EventSender {
    agent: String,
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl EventSender {
    /// Emit an event under this sender's agent name. Returns false once the consumer is gone.
    pub fn send(&self, kind: EventKind) -> bool {
        self.forward(AgentEvent::new(self.agent.clone(), kind))
    }

    /// Pass through an event produced by another agent, keeping its name.
    pub fn forward(&self, event: AgentEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl EventStream {
    pub fn channel(agent: impl Into<String>) -> (EventSender, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EventSender {
                agent: agent.into(),
                tx,
            },
            EventStream { rx },
        )
    }

    /// Run `producer` on its own task.
    ///
    /// The stream closes when the producer returns, panics, or `cancel` fires;
    /// a cancelled producer is dropped at its next suspension point.
    pub fn spawn<F, Fut>(
        agent: impl Into<String>,
        cancel: CancellationToken,
        producer: F,
    ) -> EventStream
    where
        F: FnOnce(EventSender) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, stream) = Self::channel(agent);
        let agent = tx.agent.clone();
        let work = producer(tx);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!(agent = %agent, "Agent run cancelled"),
                _ = work => {}
            }
        });
        stream
    }

    /// Next event, or `None` once the producer has closed the stream.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }

    /// Drain every remaining event.
    pub async fn collect_all(mut self) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }
}

impl Stream for EventStream {
    type Item = AgentEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Producer half of a [`MessageStream`].
pub type ChunkSender = mpsc::UnboundedSender<anyhow::Result<Message>>;

/// Live chunks of one assistant message. An `Err` item ends the message early.
#[derive(Debug)]
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<anyhow::Result<Message>>,
}

impl MessageStream {
    pub fn channel() -> (ChunkSender, MessageStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, MessageStream { rx })
    }

    /// A closed stream holding the given chunks.
    pub fn from_chunks(chunks: impl IntoIterator<Item = anyhow::Result<Message>>) -> Self {
        let (tx, stream) = Self::channel();
        for chunk in chunks {
            let _ = tx.send(chunk);
        }
        stream
    }

    pub async fn recv(&mut self) -> Option<anyhow::Result<Message>> {
        self.rx.recv().await
    }
}

impl Stream for MessageStream {
    type Item = anyhow::Result<Message>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Forward every chunk of `source` into `sink` while collecting them.
///
/// Returns the concatenated message, or the stream's error after forwarding it.
/// A closed `sink` does not stop the relay.
pub async fn relay<S>(mut source: S, sink: &ChunkSender) -> anyhow::Result<Message>
where
    S: Stream<Item = anyhow::Result<Message>> + Unpin,
{
    let mut chunks = Vec::new();
    while let Some(item) = source.next().await {
        match item {
            Ok(chunk) => {
                chunks.push(chunk.clone());
                let _ = sink.send(Ok(chunk));
            }
            Err(e) => {
                let message = e.to_string();
                let _ = sink.send(Err(e));
                return Err(anyhow::anyhow!(message));
            }
        }
    }
    Ok(concat_messages(&chunks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use deerflow_core::types::ToolCall;
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawned_stream_closes_after_producer_returns() {
        let stream = EventStream::spawn("a", CancellationToken::new(), |tx| async move {
            tx.send(EventKind::Error("one".into()));
            tx.send(EventKind::Error("two".into()));
        });
        let events = stream.collect_all().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].agent_name, "a");
    }

    #[tokio::test]
    async fn test_cancel_closes_stream() {
        let cancel = CancellationToken::new();
        let mut stream = EventStream::spawn("slow", cancel.clone(), |tx| async move {
            tx.send(EventKind::Error("before".into()));
            tokio::time::sleep(Duration::from_secs(3600)).await;
            tx.send(EventKind::Error("never".into()));
        });
        assert!(stream.next_event().await.is_some());
        cancel.cancel();
        let next = tokio::time::timeout(Duration::from_secs(5), stream.next_event())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_panicking_producer_still_closes() {
        let stream = EventStream::spawn("p", CancellationToken::new(), |_tx| async move {
            panic!("producer failure");
        });
        assert!(stream.collect_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_relay_forwards_and_concatenates() {
        let source = MessageStream::from_chunks(vec![
            Ok(Message::assistant("Hel")),
            Ok(Message::assistant_tool_calls("lo", vec![ToolCall::delta(0, "c1", "run", "{}")])),
        ]);
        let (tx, mut copy) = MessageStream::channel();
        let merged = relay(source, &tx).await.unwrap();
        drop(tx);

        assert_eq!(merged.content, "Hello");
        assert_eq!(merged.tool_calls[0].id, "c1");
        let mut forwarded = 0;
        while let Some(chunk) = copy.recv().await {
            chunk.unwrap();
            forwarded += 1;
        }
        assert_eq!(forwarded, 2);
    }

    #[tokio::test]
    async fn test_relay_forwards_error() {
        let source = MessageStream::from_chunks(vec![
            Ok(Message::assistant("partial")),
            Err(anyhow::anyhow!("connection reset")),
        ]);
        let (tx, mut copy) = MessageStream::channel();
        let err = relay(source, &tx).await.unwrap_err();
        assert_eq!(err.to_string(), "connection reset");
        assert!(copy.recv().await.unwrap().is_ok());
        assert!(copy.recv().await.unwrap().is_err());
    }
}
