use crate::client_types::*;
use crate::tls::TlsOptions;
use crate::traits::{AsyncReadAndWrite, BoxedAsyncReadAndWrite};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;

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
    #[error("STARTTLS: {0} is not a valid DNS name")]
    InvalidDnsName(String),
    #[error("TLS handshake with {hostname} failed: {error}")]
    TlsHandshake { hostname: String, error: String },
    #[error("Timed Out connecting to {address} after {duration:?}")]
    TimeOutConnect {
        address: SocketAddr,
        duration: Duration,
    },
    #[error("Error connecting to {address}: {error}")]
    ConnectError { address: SocketAddr, error: String },
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
        partial: String,
    },
    #[error("Error {error} writing {command:?}")]
    WriteError { command: Command, error: String },
    #[error("Error {error} flushing send buffer")]
    FlushError { error: String },
}

impl ClientError {
    /// True when the failure concerns the transport rather than a reply
    /// from the peer. Transport failures are candidates for trying the
    /// next MX host.
    pub fn is_transport(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpCapability {
    pub name: String,
    pub param: Option<String>,
}

#[derive(Debug)]
pub struct SmtpClient {
    socket: Option<BoxedAsyncReadAndWrite>,
    hostname: String,
    capabilities: HashMap<String, EsmtpCapability>,
    read_buffer: Vec<u8>,
    timeouts: SmtpClientTimeouts,
}

/// Reduce a peer label of the forms `host`, `host:port`, `[host]:port`
/// or `host.` to the bare hostname used for TLS validation.
fn peer_host_label(peer: &str) -> &str {
    let mut label = peer;

    // Peel a trailing :port. The port must be all digits and the
    // remainder must not itself end in a colon, which keeps a bare
    // IPv6 literal like ::1 intact.
    if let Some((head, port)) = peer.rsplit_once(':') {
        if !head.is_empty()
            && !head.ends_with(':')
            && !port.is_empty()
            && port.bytes().all(|b| b.is_ascii_digit())
        {
            label = head;
        }
    }

    let label = label
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(label);

    label.strip_suffix('.').unwrap_or(label)
}

impl SmtpClient {
    /// Connect to the given address, with the hostname retained for
    /// STARTTLS certificate validation and diagnostics.
    pub async fn connect(
        address: SocketAddr,
        peer_hostname: &str,
        timeouts: SmtpClientTimeouts,
    ) -> Result<Self, ClientError> {
        let stream = match timeout(timeouts.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(ClientError::ConnectError {
                    address,
                    error: format!("{err:#}"),
                })
            }
            Err(_) => {
                return Err(ClientError::TimeOutConnect {
                    address,
                    duration: timeouts.connect_timeout,
                })
            }
        };
        // No need for Nagle with SMTP request/response
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed for {address}: {err:#}");
        }
        Ok(Self::with_stream(stream, peer_hostname, timeouts))
    }

    pub fn with_stream<S: AsyncReadAndWrite + 'static, H: AsRef<str>>(
        stream: S,
        peer_hostname: H,
        timeouts: SmtpClientTimeouts,
    ) -> Self {
        let hostname = peer_host_label(peer_hostname.as_ref()).to_string();

        Self {
            socket: Some(Box::new(stream)),
            hostname,
            capabilities: HashMap::new(),
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

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    async fn read_line(
        &mut self,
        timeout_duration: Duration,
        cmd: Option<&Command>,
    ) -> Result<String, ClientError> {
        let mut too_long = false;
        loop {
            let mut iter = self.read_buffer.iter().enumerate();
            while let Some((i, &b)) = iter.next() {
                if b != b'\r' {
                    continue;
                }
                if let Some((_, b'\n')) = iter.next() {
                    if too_long {
                        self.read_buffer.drain(0..i + 2);
                        return Err(ClientError::ResponseTooLong);
                    }

                    let line = String::from_utf8(self.read_buffer[0..i].to_vec());
                    self.read_buffer.drain(0..i + 2);
                    return Ok(line?);
                }
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            // Didn't find a complete line; fill up the rest of the buffer
            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.socket.as_mut() {
                Some(s) => match timeout(timeout_duration, s.read(&mut data)).await {
                    Ok(Ok(size)) => size,
                    Ok(Err(err)) => {
                        self.socket.take();
                        return Err(ClientError::ReadError {
                            command: cmd.cloned(),
                            error: format!("{err:#}"),
                            partial: String::from_utf8_lossy(&self.read_buffer).to_string(),
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
                    return Err(ClientError::ReadError {
                        command: cmd.cloned(),
                        error: "the socket was closed in response to an earlier issue".to_string(),
                        partial: String::from_utf8_lossy(&self.read_buffer).to_string(),
                    });
                }
            };
            if size == 0 {
                self.socket.take();
                return Err(ClientError::ReadError {
                    command: cmd.cloned(),
                    error: "Connection closed by peer".to_string(),
                    partial: String::from_utf8_lossy(&self.read_buffer).to_string(),
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
        if let Some(sock) = self.socket.as_mut() {
            if let Err(err) = sock.flush().await {
                self.socket.take();
                return Err(ClientError::FlushError {
                    error: format!("{err:#}"),
                });
            }
        }

        let mut line = self.read_line(timeout_duration, command).await?;
        tracing::trace!("recv<-{}: {line}", self.hostname);
        let mut parsed =
            parse_response_line(&line).map_err(ClientError::MalformedResponseLine)?;
        let mut response_builder = ResponseBuilder::new(&parsed);

        while !parsed.is_final {
            line = self.read_line(timeout_duration, command).await?;
            tracing::trace!("recv<-{}: {line}", self.hostname);
            parsed = parse_response_line(&line).map_err(ClientError::MalformedResponseLine)?;
            response_builder
                .add_line(&parsed)
                .map_err(ClientError::MalformedResponseLine)?;
        }

        let response = response_builder.build(command.map(|cmd| cmd.encode()));
        tracing::trace!("{}: {response:?}", self.hostname);

        Ok(response)
    }

    async fn write_command_request(&mut self, command: &Command) -> Result<(), ClientError> {
        let line = command.encode();
        tracing::trace!("send->{}: {line}", self.hostname);

        let timeout_duration = command.client_timeout(&self.timeouts);
        match self.socket.as_mut() {
            Some(socket) => match timeout(timeout_duration, socket.write_all(line.as_bytes())).await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    self.socket.take();
                    Err(ClientError::WriteError {
                        command: command.clone(),
                        error: format!("{err:#}"),
                    })
                }
                Err(_) => {
                    self.socket.take();
                    Err(ClientError::TimeOutRequest {
                        command: command.clone(),
                        duration: timeout_duration,
                    })
                }
            },
            None => Err(ClientError::NotConnected),
        }
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<Response, ClientError> {
        self.write_command_request(command).await?;
        self.read_response(Some(command), command.client_timeout(&self.timeouts))
            .await
    }

    /// Read the 220 greeting that the server sends on connect
    pub async fn read_banner(&mut self) -> Result<Response, ClientError> {
        let banner = self.read_response(None, self.timeouts.banner_timeout).await?;
        if banner.code != 220 {
            return Err(ClientError::Rejected(banner));
        }
        Ok(banner)
    }

    pub async fn ehlo(
        &mut self,
        ehlo_name: &str,
    ) -> Result<&HashMap<String, EsmtpCapability>, ClientError> {
        let response = self
            .send_command(&Command::Ehlo(ehlo_name.to_string()))
            .await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }

        let mut capabilities = HashMap::new();

        for line in response.content.lines().skip(1) {
            let mut fields = line.splitn(2, ' ');
            if let Some(name) = fields.next() {
                let param = fields.next().map(|s| s.to_string());
                let cap = EsmtpCapability {
                    name: name.to_string(),
                    param,
                };
                capabilities.insert(name.to_ascii_uppercase(), cap);
            }
        }

        self.capabilities = capabilities;
        Ok(&self.capabilities)
    }

    /// Attempt the STARTTLS upgrade.
    /// A non-220 reply to the command leaves the plaintext session usable
    /// and is reported as `Refused`; a failed handshake after a 220 poisons
    /// the session and is an error.
    pub async fn starttls(&mut self, options: &TlsOptions) -> Result<TlsStatus, ClientError> {
        let resp = self.send_command(&Command::StartTls).await?;
        if resp.code != 220 {
            return Ok(TlsStatus::Refused(resp));
        }

        let connector = options.build_tls_connector();
        let server_name = match IpAddr::from_str(self.hostname.as_str()) {
            Ok(ip) => ServerName::IpAddress(ip.into()),
            Err(_) => ServerName::try_from(self.hostname.clone())
                .map_err(|_| ClientError::InvalidDnsName(self.hostname.clone()))?,
        };

        let stream = match self.socket.take() {
            Some(s) => s,
            None => return Err(ClientError::NotConnected),
        };

        match timeout(
            self.timeouts.starttls_timeout,
            connector.connect(server_name, stream),
        )
        .await
        {
            Ok(Ok(stream)) => {
                let info = {
                    let (_, conn) = stream.get_ref();
                    TlsInformation {
                        cipher: conn
                            .negotiated_cipher_suite()
                            .and_then(|suite| suite.suite().as_str())
                            .unwrap_or("UNKNOWN")
                            .to_string(),
                        protocol_version: conn
                            .protocol_version()
                            .and_then(|version| version.as_str())
                            .unwrap_or("UNKNOWN")
                            .to_string(),
                    }
                };
                self.socket.replace(Box::new(stream));
                Ok(TlsStatus::Info(info))
            }
            Ok(Err(err)) => Err(ClientError::TlsHandshake {
                hostname: self.hostname.clone(),
                error: format!("{err:#}"),
            }),
            Err(_) => Err(ClientError::TlsHandshake {
                hostname: self.hostname.clone(),
                error: format!(
                    "timed out after {:?}",
                    self.timeouts.starttls_timeout
                ),
            }),
        }
    }

    pub async fn mail_from(&mut self, address: &str) -> Result<Response, ClientError> {
        let response = self
            .send_command(&Command::MailFrom {
                address: address.to_string(),
            })
            .await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }
        Ok(response)
    }

    /// Issue RCPT TO and return the reply whatever its code; the caller
    /// interprets acceptance versus rejection.
    pub async fn rcpt_to(&mut self, address: &str) -> Result<Response, ClientError> {
        self.send_command(&Command::RcptTo {
            address: address.to_string(),
        })
        .await
    }

    /// Send QUIT and drop the connection. Failures are irrelevant at this
    /// point and are swallowed.
    pub async fn quit(&mut self) {
        if self.socket.is_some() {
            let _ = self.send_command(&Command::Quit).await;
        }
        self.socket.take();
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum TlsStatus {
    /// The server answered STARTTLS with something other than 220;
    /// the plaintext session remains usable
    Refused(Response),
    Info(TlsInformation),
}

#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct TlsInformation {
    pub cipher: String,
    pub protocol_version: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn peer_host_labels() {
        k9::assert_equal!(peer_host_label("foo"), "foo");
        k9::assert_equal!(peer_host_label("foo."), "foo");
        k9::assert_equal!(peer_host_label("foo:25"), "foo");
        k9::assert_equal!(peer_host_label("foo.:25"), "foo");
        k9::assert_equal!(peer_host_label("[foo]:25"), "foo");
        k9::assert_equal!(peer_host_label("[foo.]:25"), "foo");
        k9::assert_equal!(peer_host_label("[::1]:25"), "::1");
        k9::assert_equal!(peer_host_label("::1:25"), "::1");
        k9::assert_equal!(peer_host_label("::1"), "::1");
    }
}
