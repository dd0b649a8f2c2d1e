//! A scripted in-process SMTP listener for pool and prober tests.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[derive(Default)]
pub struct Behavior {
    /// RCPT reply per address; anything else gets `default_rcpt`.
    pub rcpt_replies: HashMap<String, String>,
    pub default_rcpt: Option<String>,
    pub mail_reply: Option<String>,
    /// Reject EHLO with 502, forcing the HELO fallback.
    pub helo_only: bool,
    /// When set, NOOP answers 421 and the connection closes.
    pub fail_noop: Arc<AtomicBool>,
}

pub struct TestSmtpServer {
    addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    pub active: Arc<AtomicUsize>,
    pub peak_active: Arc<AtomicUsize>,
    pub fail_noop: Arc<AtomicBool>,
}

impl TestSmtpServer {
    pub async fn spawn(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let peak_active = Arc::new(AtomicUsize::new(0));
        let fail_noop = behavior.fail_noop.clone();
        let behavior = Arc::new(behavior);

        {
            let accepted = accepted.clone();
            let active = active.clone();
            let peak_active = peak_active.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak_active.fetch_max(now_active, Ordering::SeqCst);

                    let behavior = behavior.clone();
                    let active = active.clone();
                    tokio::spawn(async move {
                        let _ = serve_session(stream, &behavior).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            });
        }

        Self {
            addr,
            accepted,
            active,
            peak_active,
            fail_noop,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

async fn serve_session(stream: TcpStream, behavior: &Behavior) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half.write_all(b"220 test.local ESMTP\r\n").await?;

    while let Some(line) = lines.next_line().await? {
        let upper = line.to_ascii_uppercase();
        if upper.starts_with("EHLO") {
            if behavior.helo_only {
                write_half
                    .write_all(b"502 5.5.1 command not implemented\r\n")
                    .await?;
            } else {
                write_half
                    .write_all(b"250-test.local\r\n250 PIPELINING\r\n")
                    .await?;
            }
        } else if upper.starts_with("HELO") {
            write_half.write_all(b"250 test.local\r\n").await?;
        } else if upper.starts_with("MAIL") {
            let reply = behavior
                .mail_reply
                .clone()
                .unwrap_or_else(|| "250 2.1.0 Ok".to_string());
            write_half
                .write_all(format!("{reply}\r\n").as_bytes())
                .await?;
        } else if upper.starts_with("RCPT") {
            let address = line
                .split_once('<')
                .and_then(|(_, rest)| rest.split_once('>'))
                .map(|(addr, _)| addr.to_string())
                .unwrap_or_default();
            let reply = behavior
                .rcpt_replies
                .get(&address)
                .cloned()
                .or_else(|| behavior.default_rcpt.clone())
                .unwrap_or_else(|| "250 2.1.5 Ok".to_string());
            write_half
                .write_all(format!("{reply}\r\n").as_bytes())
                .await?;
            if reply.starts_with("421") {
                break;
            }
        } else if upper.starts_with("NOOP") {
            if behavior.fail_noop.load(Ordering::SeqCst) {
                write_half
                    .write_all(b"421 4.3.2 going away\r\n")
                    .await?;
                break;
            }
            write_half.write_all(b"250 2.0.0 Ok\r\n").await?;
        } else if upper.starts_with("RSET") {
            write_half.write_all(b"250 2.0.0 Ok\r\n").await?;
        } else if upper.starts_with("QUIT") {
            write_half.write_all(b"221 2.0.0 Bye\r\n").await?;
            break;
        } else {
            write_half
                .write_all(b"500 5.5.2 unrecognized\r\n")
                .await?;
        }
    }
    Ok(())
}
