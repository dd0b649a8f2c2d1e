use crate::types::{parse_response_line, Command, Response, ResponseBuilder, SmtpClientTimeouts};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const MAX_LINE_LEN: usize = 4096;

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("Malformed Response: {0}")]
    MalformedResponseLine(String),
    #[error("Response line is too long")]
    ResponseTooLong,
    #[error("Not connected")]
    NotConnected,
    #[error("Command rejected {0:?}")]
    Rejected(Response),
    #[error("Timed Out waiting {duration:?} for response to {command:?}")]
    TimeOutResponse {
        command: Option<Command>,
        duration: Duration,
    },
    #[error("Timed Out writing {command:?} after {duration:?}")]
    TimeOutRequest {
        command: Command,
        duration: Duration,
    },
    #[error("Error {error} reading response to {command:?}")]
    ReadError {
        command: Option<Command>,
        error: String,
    },
    #[error("Error {error} writing {command:?}")]
    WriteError { command: Command, error: String },
}

impl ClientError {
    /// True for errors worth another connection attempt: transport
    /// issues and transient (4xx) rejections.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Rejected(response) => response.is_transient(),
            Self::TimeOutResponse { .. }
            | Self::TimeOutRequest { .. }
            | Self::ReadError { .. }
            | Self::WriteError { .. }
            | Self::NotConnected => true,
            _ => false,
        }
    }
}

/// Just the hostname, without any :port or surrounding brackets.
fn extract_hostname(hostname: &str) -> &str {
    let fields: Vec<&str> = hostname.rsplitn(2, ':').collect();
    let hostname = if fields.len() == 2 {
        fields[1]
    } else {
        hostname
    };

    let hostname = if hostname.starts_with('[') && hostname.ends_with(']') {
        &hostname[1..hostname.len() - 1]
    } else {
        hostname
    };

    hostname.strip_suffix('.').unwrap_or(hostname)
}

/// A plain-text SMTP client session, one per TCP connection.
#[derive(Debug)]
pub struct SmtpClient {
    socket: Option<TcpStream>,
    hostname: String,
    read_buffer: Vec<u8>,
    timeouts: SmtpClientTimeouts,
}

impl SmtpClient {
    /// Connect and wait for the 220 banner.
    pub async fn connect(
        addr: SocketAddr,
        hostname: &str,
        timeouts: SmtpClientTimeouts,
    ) -> Result<Self, ClientError> {
        let stream = timeout(timeouts.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::TimeOutResponse {
                command: None,
                duration: timeouts.connect_timeout,
            })?
            .map_err(|err| ClientError::ReadError {
                command: None,
                error: format!("connecting to {addr}: {err}"),
            })?;
        // No need for Nagle with SMTP request/response
        stream.set_nodelay(true).ok();

        let mut client = Self::with_stream(stream, hostname, timeouts);
        let banner = client.read_response(None, timeouts.banner_timeout).await?;
        if banner.code != 220 {
            return Err(ClientError::Rejected(banner));
        }
        Ok(client)
    }

    pub fn with_stream<H: AsRef<str>>(
        stream: TcpStream,
        peer_hostname: H,
        timeouts: SmtpClientTimeouts,
    ) -> Self {
        Self {
            socket: Some(stream),
            hostname: extract_hostname(peer_hostname.as_ref()).to_string(),
            read_buffer: Vec::with_capacity(1024),
            timeouts,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn timeouts(&self) -> &SmtpClientTimeouts {
        &self.timeouts
    }

    async fn read_line(
        &mut self,
        timeout_duration: Duration,
        cmd: Option<&Command>,
    ) -> Result<String, ClientError> {
        let mut too_long = false;
        loop {
            // Look for a complete CRLF-terminated line in the buffer
            let mut search_from = 0;
            while let Some(idx) = memchr::memchr(b'\r', &self.read_buffer[search_from..]) {
                let i = search_from + idx;
                if self.read_buffer.get(i + 1) == Some(&b'\n') {
                    if too_long {
                        self.read_buffer.drain(0..i + 2);
                        return Err(ClientError::ResponseTooLong);
                    }
                    let line = String::from_utf8(self.read_buffer[0..i].to_vec());
                    self.read_buffer.drain(0..i + 2);
                    return Ok(line?);
                }
                search_from = i + 1;
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.socket.as_mut() {
                Some(s) => match timeout(timeout_duration, s.read(&mut data)).await {
                    Ok(Ok(size)) => size,
                    Ok(Err(err)) => {
                        self.socket.take();
                        return Err(ClientError::ReadError {
                            command: cmd.cloned(),
                            error: format!("{err:#}"),
                        });
                    }
                    Err(_) => {
                        self.socket.take();
                        return Err(ClientError::TimeOutResponse {
                            command: cmd.cloned(),
                            duration: timeout_duration,
                        });
                    }
                },
                None => {
                    return Err(ClientError::NotConnected);
                }
            };
            if size == 0 {
                self.socket.take();
                return Err(ClientError::ReadError {
                    command: cmd.cloned(),
                    error: "Connection closed by peer".to_string(),
                });
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    pub async fn read_response(
        &mut self,
        command: Option<&Command>,
        timeout_duration: Duration,
    ) -> Result<Response, ClientError> {
        let mut line = self.read_line(timeout_duration, command).await?;
        tracing::trace!("recv<-{}: {line}", self.hostname);
        let mut parsed =
            parse_response_line(&line).map_err(ClientError::MalformedResponseLine)?;
        let mut builder = ResponseBuilder::new(&parsed);

        let subsequent_timeout = Duration::from_secs(60).min(timeout_duration);
        while !parsed.is_final {
            line = self.read_line(subsequent_timeout, command).await?;
            parsed = parse_response_line(&line).map_err(ClientError::MalformedResponseLine)?;
            builder
                .add_line(&parsed)
                .map_err(ClientError::MalformedResponseLine)?;
        }

        let response = builder.build(command.map(|cmd| cmd.encode()));
        tracing::trace!("{}: {response:?}", self.hostname);
        Ok(response)
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<Response, ClientError> {
        let line = command.encode();
        tracing::trace!("send->{}: {line}", self.hostname);
        let timeout_duration = command.client_timeout(&self.timeouts);

        match self.socket.as_mut() {
            Some(socket) => {
                match timeout(timeout_duration, socket.write_all(line.as_bytes())).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        self.socket.take();
                        return Err(ClientError::WriteError {
                            command: command.clone(),
                            error: format!("{err:#}"),
                        });
                    }
                    Err(_) => {
                        self.socket.take();
                        return Err(ClientError::TimeOutRequest {
                            command: command.clone(),
                            duration: timeout_duration,
                        });
                    }
                }
            }
            None => return Err(ClientError::NotConnected),
        }

        self.read_response(Some(command), timeout_duration).await
    }

    /// Say EHLO; fall back to HELO when the peer rejects it.
    pub async fn ehlo(&mut self, ehlo_name: &str) -> Result<Response, ClientError> {
        match self
            .send_command(&Command::Ehlo(ehlo_name.to_string()))
            .await
        {
            Ok(response) if response.code == 250 => Ok(response),
            Ok(_) | Err(ClientError::Rejected(_)) => {
                let response = self
                    .send_command(&Command::Helo(ehlo_name.to_string()))
                    .await?;
                if response.code != 250 {
                    return Err(ClientError::Rejected(response));
                }
                Ok(response)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn noop(&mut self) -> Result<(), ClientError> {
        let response = self.send_command(&Command::Noop).await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }
        Ok(())
    }

    pub async fn rset(&mut self) -> Result<(), ClientError> {
        let response = self.send_command(&Command::Rset).await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }
        Ok(())
    }

    /// Politely close the session; the connection is unusable afterwards.
    pub async fn quit(&mut self) -> Result<(), ClientError> {
        let result = self.send_command(&Command::Quit).await;
        self.socket.take();
        result.map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use super::extract_hostname;

    #[test]
    fn hostname_extraction() {
        assert_eq!(extract_hostname("mx1.example.com"), "mx1.example.com");
        assert_eq!(extract_hostname("mx1.example.com:2525"), "mx1.example.com");
        assert_eq!(extract_hostname("mx1.example.com."), "mx1.example.com");
        assert_eq!(extract_hostname("[192.0.2.1]:25"), "192.0.2.1");
    }
}
