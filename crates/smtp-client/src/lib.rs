//! SMTP client, connection pool, and RCPT prober for address
//! verification. The client speaks just enough RFC 5321 for probing:
//! EHLO/HELO, MAIL, RCPT, NOOP, RSET and QUIT. DATA is deliberately
//! absent; this crate never sends mail.
pub mod client;
pub mod pool;
pub mod probe;
#[cfg(any(test, feature = "test-support"))]
pub mod test_server;
mod types;

pub use client::{ClientError, SmtpClient};
pub use pool::{PoolError, PoolParams, PooledConnection, SmtpConnectionPool};
pub use probe::{ProbeOutcome, ProbeParams, ProbeResult, SmtpProber};
pub use types::{Command, EnhancedStatusCode, Response, SmtpClientTimeouts};
