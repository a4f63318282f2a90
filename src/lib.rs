//! # mos-transport
//!
//! Connection and message-exchange core for the MOS (Media Object Server)
//! protocol, the XML-over-TCP protocol newsroom systems (NCS) and media devices
//! use to exchange running orders and status.
//!
//! ## Overview
//!
//! A MOS peer listens on three ports, one per role:
//! - `lower` (10540): general purpose and push messages
//! - `upper` (10541): running-order and workflow messages
//! - `query` (10542): read-only queries
//!
//! This crate provides:
//! - Framing of the delimiter-less XML stream, in UTF-16 or UTF-8
//! - Request/reply correlation by `messageID`, with a per-command timeout
//! - A reconnecting socket client per port
//! - A logical server connection grouping the clients for one NCS, with
//!   heartbeat-based liveness and handover of pending commands to a sibling
//!   connection during failover
//!
//! Building the individual MOS message bodies is left to the caller.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mos_transport::{
//!     ConnectionEvent, ConnectionOptions, MosBody, MosMessage, NcsServerConnection, PortType,
//!     Result,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let conn = NcsServerConnection::new(
//!         "NCS.EXAMPLE",
//!         "192.168.1.100",
//!         "MOS.EXAMPLE",
//!         ConnectionOptions::default(),
//!     )?;
//!     conn.create_client("lower", 10540, PortType::Lower, true).await?;
//!     conn.create_client("upper", 10541, PortType::Upper, true).await?;
//!
//!     let mut events = conn.subscribe();
//!     conn.connect().await?;
//!
//!     // Send a request and wait for the matching reply
//!     let reply = conn
//!         .execute_command(MosMessage::new(PortType::Lower, MosBody::empty("reqMachInfo")))
//!         .await?;
//!     println!("Reply: {}", reply.message_type());
//!
//!     // Unsolicited messages and status changes arrive as events
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             ConnectionEvent::RawMessage { message_type, .. } => println!("Got {}", message_type),
//!             ConnectionEvent::ConnectionChanged => {
//!                 println!("Status: {}", conn.get_connected_status().await.status)
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     conn.dispose().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Low-Level API
//!
//! The framer and envelope decoder can be used on their own:
//!
//! ```rust
//! use mos_transport::protocol::{decode_message, MosParser};
//!
//! let mut parser = MosParser::new();
//! let data = b"<mos><mosID>A</mosID><ncsID>B</ncsID><messageID>7</messageID><heartbeat/></mos>";
//!
//! // Documents may arrive in any number of pieces
//! assert!(parser.parse(&data[..20]).unwrap().is_none());
//! let document = parser.parse(&data[20..]).unwrap().unwrap();
//!
//! let message = decode_message(&document).unwrap();
//! assert_eq!(message.message_type(), "heartbeat");
//! assert_eq!(message.message_id.map(|id| id.get()), Some(7));
//! ```
//!
//! ## Wire Format
//!
//! ```text
//! <mos>
//!   <mosID>MOS.EXAMPLE</mosID>
//!   <ncsID>NCS.EXAMPLE</ncsID>
//!   <messageID>42</messageID>
//!   <heartbeat><time>2024-01-01T12:00:00,000Z</time></heartbeat>
//! </mos>
//! ```
//!
//! Outbound documents are written as UTF-16BE by default; see
//! [`ConnectionOptions::wire_encoding`].

pub mod command_queue;
pub mod config;
pub mod error;
mod heartbeat;
pub mod message;
pub mod protocol;
pub mod registry;
pub mod server_connection;
pub mod socket_client;
pub(crate) mod transport;

// Re-export main types for convenience
pub use command_queue::{HandedOverCommand, HandedOverQueue, ReplyReceiver, Responder};
pub use config::ConnectionOptions;
pub use error::{MosError, ParseError, Result};
pub use message::{MessageId, MosBody, MosMessage, ParsedMosMessage, PortType};
pub use protocol::{MosParser, WireEncoding};
pub use registry::ClientHandle;
pub use server_connection::{ConnectionEvent, ConnectionStatus, NcsServerConnection};
pub use socket_client::{ClientEvent, MosSocketClient, SocketState};
