//! Loopback MOS peer for integration tests.

#![allow(dead_code)]

use mos_transport::protocol::{decode_message, encode, MosParser};
use mos_transport::{MessageId, ParsedMosMessage, WireEncoding};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

/// How long a test waits for the peer before failing.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Build a MOS document.
pub fn mos_xml(message_id: Option<MessageId>, body: &str) -> String {
    let id = message_id
        .map(|id| format!("<messageID>{}</messageID>", id))
        .unwrap_or_default();
    format!("<mos><mosID>MOS</mosID><ncsID>NCS</ncsID>{}{}</mos>", id, body)
}

/// Answer heartbeats with a heartbeat and everything else with an `roAck`.
pub fn ack(message: &ParsedMosMessage) -> Option<String> {
    let body = if message.message_type() == "heartbeat" {
        "<heartbeat><time>2024-01-01T00:00:00,000Z</time></heartbeat>"
    } else {
        "<roAck><roStatus>OK</roStatus></roAck>"
    };
    Some(mos_xml(message.message_id, body))
}

type ReplyFn = Arc<dyn Fn(&ParsedMosMessage) -> Option<String> + Send + Sync>;

/// A scripted NCS listening on a loopback port. Every accepted connection is
/// served by the same reply function.
pub struct MockNcs {
    pub port: u16,
    received: mpsc::UnboundedReceiver<ParsedMosMessage>,
    task: JoinHandle<()>,
}

impl MockNcs {
    pub async fn start<F>(reply: F) -> Self
    where
        F: Fn(&ParsedMosMessage) -> Option<String> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, received) = mpsc::unbounded_channel();
        let reply: ReplyFn = Arc::new(reply);

        let task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            while let Ok((stream, _)) = listener.accept().await {
                connections.spawn(serve(stream, tx.clone(), Arc::clone(&reply)));
            }
        });

        Self { port, received, task }
    }

    /// A peer that acknowledges everything.
    pub async fn acking() -> Self {
        Self::start(ack).await
    }

    /// A peer that reads everything and answers nothing.
    pub async fn silent() -> Self {
        Self::start(|_| None).await
    }

    /// Next message the peer received.
    pub async fn next_received(&mut self) -> ParsedMosMessage {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("peer received nothing")
            .expect("peer stopped")
    }

    /// A message already received, if any.
    pub fn try_next(&mut self) -> Option<ParsedMosMessage> {
        self.received.try_recv().ok()
    }

    /// Next received message of the given type, skipping others.
    pub async fn next_of_type(&mut self, message_type: &str) -> ParsedMosMessage {
        loop {
            let message = self.next_received().await;
            if message.message_type() == message_type {
                return message;
            }
        }
    }
}

impl Drop for MockNcs {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, tx: mpsc::UnboundedSender<ParsedMosMessage>, reply: ReplyFn) {
    let mut parser = MosParser::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        parser.push(&buf[..n]).unwrap();
        while let Some(document) = parser.next_document() {
            let message = decode_message(&document).unwrap();
            let answer = reply(&message);
            let _ = tx.send(message);
            if let Some(xml) = answer {
                if stream.write_all(&encode(&xml, WireEncoding::Utf16be)).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// A single hand-driven peer connection, for tests that need to control
/// exactly what goes over the wire.
pub struct PeerConnection {
    stream: TcpStream,
    parser: MosParser,
}

impl PeerConnection {
    pub async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        Self {
            stream,
            parser: MosParser::new(),
        }
    }

    pub async fn recv(&mut self) -> ParsedMosMessage {
        loop {
            if let Some(document) = self.parser.next_document() {
                return decode_message(&document).unwrap();
            }
            let mut buf = vec![0u8; 4096];
            let n = tokio::time::timeout(WAIT, self.stream.read(&mut buf))
                .await
                .expect("client sent nothing")
                .unwrap();
            assert!(n > 0, "client closed the connection");
            self.parser.push(&buf[..n]).unwrap();
        }
    }

    /// Wait until the client closes the connection.
    pub async fn closed(&mut self) {
        let mut buf = [0u8; 1024];
        loop {
            let read = tokio::time::timeout(WAIT, self.stream.read(&mut buf))
                .await
                .expect("connection stayed open");
            if matches!(read, Ok(0) | Err(_)) {
                return;
            }
        }
    }

    pub async fn send(&mut self, xml: &str) {
        self.send_raw(&encode(xml, WireEncoding::Utf16be)).await;
    }

    pub async fn send_raw(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.unwrap();
        self.stream.flush().await.unwrap();
    }
}

pub async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}
