//! droidlink client - drive a device-resident scripting agent over RPC
//!
//! This crate provides the host side of an agent session:
//! - `transport` - Line-framed TCP transport and `adb` port forwarding
//! - `rpc` - Correlated request/response calls over one transport
//! - `dispatcher` - Background `eventWait` polling into per-name event queues
//! - `session` - Install, launch, handshake and teardown orchestration
//! - `bridge` - The `adb` commands a session runs against the device
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Session                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐          ┌─────────────────────────┐   │
//! │  │   RpcClient     │          │    EventDispatcher      │   │
//! │  │ (primary conn)  │          │ poll task + queue actor │   │
//! │  └────────┬────────┘          └────────────┬────────────┘   │
//! │           │ initiate                       │ continue       │
//! │           ▼                                ▼                │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │        PortForward  host:H ──adb──▶ device:D        │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod rpc;
pub mod session;
pub mod transport;

pub use bridge::{AdbBridge, DeviceBridge};
pub use config::{AgentCommands, ConnectPolicy, SessionConfig};
pub use dispatcher::{DispatcherConfig, DispatcherState, EventDispatcher, EventQueueHandle, PollOutcome};
pub use error::{ClientError, Result};
pub use rpc::RpcClient;
pub use session::Session;
pub use transport::{LineTransport, PortForward, TcpTransport};
