//! # hopgate - Bastion-Host Connection Broker Core
//!
//! `hopgate` establishes, authenticates, pools, and tears down interactive
//! sessions to downstream hosts on behalf of many concurrent terminal users.
//! Transports are deduplicated per reuse key, dials can be chained through
//! gateway hosts, Telnet targets get a from-scratch option-negotiation state
//! machine, and privilege escalation (`su`/`sudo`/`enable`/`super`) is
//! driven interactively over the open shell stream.
//!
//! ## Features
//!
//! - **Connection Pooling**: One actor task owns the reuse-key map; callers
//!   fetch, store, and release transports through message passing
//! - **Gateway Chaining**: Targets unreachable directly are dialed through
//!   the first answering gateway of a candidate list
//! - **Telnet Negotiation**: Byte-level option state machine with optional
//!   automated login
//! - **Privilege Escalation**: Dialect-aware prompt scraping for Linux,
//!   Cisco, and Huawei/H3C targets
//! - **Async/Await**: Built on Tokio throughout
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hopgate::pool::{reuse_key, POOL};
//! use hopgate::transport::{
//!     AuthCredential, DialOptions, TargetEndpoint, TerminalOptions, TransportClient,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = reuse_key("end-user-7", "edge-sw-1", "acct-3", "admin");
//!
//!     let client = match POOL.fetch(&key).await? {
//!         Some(client) => client,
//!         None => {
//!             let endpoint = TargetEndpoint::new("192.168.1.1", 22, "admin");
//!             let auth = AuthCredential::Password("password".to_string());
//!             let client =
//!                 TransportClient::dial(endpoint, auth, &DialOptions::default(), &[]).await?;
//!             POOL.store(&key, client.clone()).await?;
//!             client
//!         }
//!     };
//!
//!     let session = client.open_session(&TerminalOptions::default()).await?;
//!     // ... bridge the session to the end user's terminal ...
//!     drop(session);
//!
//!     POOL.release(&key, client).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`pool::ConnectionPool`] - Single-owner actor over pooled transports
//! - [`transport::TransportClient`] - One authenticated connection, shared
//!   by many sessions
//! - [`telnet::TelnetConnection`] - Telnet option negotiation and auto-login
//! - [`escalate::InteractiveAuthDriver`] - Interactive switch-user driver
//! - [`error::BrokerError`] - Error types across all of the above

pub mod config;
pub mod error;
pub mod escalate;
pub mod pool;
pub mod telnet;
pub mod transport;

pub use error::BrokerError;
