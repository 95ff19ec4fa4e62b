use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use log::{debug, trace};
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::BrokerError;
use crate::transport::{ServerConnection, TargetEndpoint, TerminalOptions};

use super::*;

const FAILURE_PATTERN: &str =
    r"(?i)login incorrect|authentication fail|access denied|bad password|incorrect password|认证失败|密码错误";
const USERNAME_PATTERN: &str = r"(?i)(login|user\s?name|用户名)\s*[::]";
const PASSWORD_PATTERN: &str = r"(?i)(password|密码)\s*[::]";
const SUCCESS_PATTERN: &str = r"[$#>%\]]\s*$";

const READ_CHUNK: usize = 4096;

/// Login-dialogue classifiers, checked in the order failure, username,
/// password, success. Tolerant of English and Chinese prompt labels.
struct LoginMatchers {
    failure: Regex,
    username: Regex,
    password: Regex,
    success: Regex,
}

impl LoginMatchers {
    fn new(custom_success: Option<&str>) -> Result<Self, BrokerError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| BrokerError::InvalidPolicy(e.to_string()))
        };
        Ok(Self {
            failure: compile(FAILURE_PATTERN)?,
            username: compile(USERNAME_PATTERN)?,
            password: compile(PASSWORD_PATTERN)?,
            success: compile(custom_success.unwrap_or(SUCCESS_PATTERN))?,
        })
    }
}

/// A Telnet connection that negotiates options up front and then exposes the
/// raw stream.
///
/// Reads performed after the handshake first drain any plain bytes that
/// arrived interleaved with the final negotiation exchange, so nothing the
/// server printed is lost.
pub struct TelnetConnection<S> {
    stream: S,
    state: TelnetState,
    term: TerminalOptions,
    username: String,
    naws_enabled: bool,
    leftover: Vec<u8>,
    leftover_pos: usize,
}

impl TelnetConnection<TcpStream> {
    /// Dial `endpoint` over TCP and negotiate. When `password` is given and
    /// the endpoint carries a username, the login dialogue is answered
    /// automatically before the connection is handed back.
    pub async fn connect(
        endpoint: &TargetEndpoint,
        password: Option<&str>,
        settings: &TelnetSettings,
    ) -> Result<Self, BrokerError> {
        let stream = timeout(settings.timeout(), TcpStream::connect(endpoint.addr()))
            .await
            .map_err(|_| BrokerError::DialTimeout(settings.timeout().as_secs()))??;
        debug!("telnet connected to {}", endpoint.addr());
        Self::establish(stream, &endpoint.username, password, settings).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> TelnetConnection<S> {
    /// Run the negotiation handshake over an already-open stream. The whole
    /// handshake races a supervisory timer; on expiry or on any handshake
    /// error the stream is shut down before returning.
    pub async fn establish(
        stream: S,
        username: &str,
        password: Option<&str>,
        settings: &TelnetSettings,
    ) -> Result<Self, BrokerError> {
        let mut conn = Self {
            stream,
            state: TelnetState::Negotiating,
            term: settings.term.clone(),
            username: username.to_string(),
            naws_enabled: false,
            leftover: Vec::new(),
            leftover_pos: 0,
        };
        let auto_login = match password {
            Some(pw) if !username.is_empty() => {
                Some((LoginMatchers::new(settings.success_pattern.as_deref())?, pw))
            }
            _ => None,
        };
        match timeout(settings.timeout(), conn.handshake(auto_login)).await {
            Ok(Ok(())) => Ok(conn),
            Ok(Err(e)) => {
                let _ = conn.stream.shutdown().await;
                conn.state = TelnetState::Closed;
                Err(e)
            }
            Err(_) => {
                let _ = conn.stream.shutdown().await;
                conn.state = TelnetState::Closed;
                Err(BrokerError::DialTimeout(settings.timeout().as_secs()))
            }
        }
    }

    pub fn state(&self) -> TelnetState {
        self.state
    }

    async fn handshake(
        &mut self,
        auto_login: Option<(LoginMatchers, &str)>,
    ) -> Result<(), BrokerError> {
        // Open by asking the server to echo and to suppress go-ahead.
        self.stream
            .write_all(&[IAC, DO, OPT_SGA, IAC, DO, OPT_ECHO])
            .await?;

        let mut pending: Vec<u8> = Vec::new();
        let mut dialogue: Vec<u8> = Vec::new();
        let mut transcript = String::new();
        let mut username_sent = false;
        let mut password_sent = false;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let plain = self.drain_negotiation(&mut pending).await?;

            if !plain.is_empty() && self.state == TelnetState::Negotiating {
                self.state = if auto_login.is_some() {
                    TelnetState::AutoLoggingIn
                } else {
                    TelnetState::Ready
                };
            }

            match self.state {
                TelnetState::Ready => {
                    self.leftover = plain;
                    self.leftover.extend_from_slice(&pending);
                    return Ok(());
                }
                TelnetState::AutoLoggingIn => {
                    dialogue.extend_from_slice(&plain);
                    let (matchers, password) = auto_login
                        .as_ref()
                        .ok_or_else(|| BrokerError::ConnectionClosed)?;
                    let text = String::from_utf8_lossy(&dialogue).replace("\r\n", "\n");
                    transcript.push_str(&String::from_utf8_lossy(&plain));

                    if matchers.failure.is_match(&text) {
                        return Err(BrokerError::AuthFailed {
                            transcript: transcript.clone(),
                        });
                    } else if matchers.username.is_match(&text) && !username_sent {
                        trace!("login prompt answered");
                        self.stream.write_all(self.username.as_bytes()).await?;
                        self.stream.write_all(b"\r\n").await?;
                        username_sent = true;
                        dialogue.clear();
                    } else if matchers.password.is_match(&text) && !password_sent {
                        self.stream.write_all(password.as_bytes()).await?;
                        self.stream.write_all(b"\r\n").await?;
                        password_sent = true;
                        dialogue.clear();
                    } else if matchers.success.is_match(&text) {
                        debug!("telnet auto-login finished");
                        self.state = TelnetState::Ready;
                        self.leftover = dialogue;
                        self.leftover.extend_from_slice(&pending);
                        return Ok(());
                    }
                }
                TelnetState::Negotiating => {}
                TelnetState::Closed => return Err(BrokerError::ConnectionClosed),
            }

            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(BrokerError::HandshakeFailed(
                    "stream closed during negotiation".to_string(),
                ));
            }
            pending.extend_from_slice(&chunk[..n]);
        }
    }

    /// Consume complete negotiation units at the head of `pending`, replying
    /// to each, and return the plain bytes seen between them. Incomplete
    /// trailing units stay in `pending`.
    async fn drain_negotiation(&mut self, pending: &mut Vec<u8>) -> Result<Vec<u8>, BrokerError> {
        let mut plain = Vec::new();
        let mut i = 0;
        while i < pending.len() {
            if pending[i] != IAC {
                plain.push(pending[i]);
                i += 1;
                continue;
            }
            if pending.get(i + 1) == Some(&IAC) {
                plain.push(IAC);
                i += 2;
                continue;
            }
            match OptionPacket::parse(&pending[i..]) {
                Some((packet, used)) => {
                    self.react(&packet).await?;
                    i += used;
                }
                None => break,
            }
        }
        pending.drain(..i);
        Ok(plain)
    }

    /// The fixed reply table. The remote keeps the echo role; we offer
    /// terminal type, environment and window size when asked, and refuse
    /// everything else.
    async fn react(&mut self, packet: &OptionPacket) -> Result<(), BrokerError> {
        trace!(
            "telnet option: cmd={} opt={} payload={}B",
            packet.command,
            packet.option,
            packet.payload.len()
        );
        let reply: Vec<u8> = match packet.command {
            DO => match packet.option {
                OPT_ECHO => OptionPacket::simple(WONT, OPT_ECHO).encode(),
                OPT_TTYPE | OPT_NEW_ENVIRON | OPT_OLD_ENVIRON => {
                    OptionPacket::simple(WILL, packet.option).encode()
                }
                OPT_NAWS => {
                    self.naws_enabled = true;
                    let mut out = OptionPacket::simple(WILL, OPT_NAWS).encode();
                    out.extend_from_slice(&self.naws_packet().encode());
                    out
                }
                other => OptionPacket::simple(WONT, other).encode(),
            },
            WILL => match packet.option {
                OPT_ECHO | OPT_SGA => OptionPacket::simple(DO, packet.option).encode(),
                other => OptionPacket::simple(DONT, other).encode(),
            },
            DONT => OptionPacket::simple(WONT, packet.option).encode(),
            WONT => OptionPacket::simple(DONT, packet.option).encode(),
            SB => match packet.option {
                OPT_TTYPE if packet.payload.first() == Some(&SUB_SEND) => {
                    let mut payload = vec![SUB_IS];
                    payload.extend_from_slice(self.term.term_type.as_bytes());
                    OptionPacket::sub(OPT_TTYPE, payload).encode()
                }
                OPT_NEW_ENVIRON | OPT_OLD_ENVIRON
                    if packet.payload.first() == Some(&SUB_SEND) =>
                {
                    let mut payload = vec![SUB_IS, ENV_VAR];
                    payload.extend_from_slice(b"USER");
                    payload.push(ENV_VALUE);
                    payload.extend_from_slice(self.username.as_bytes());
                    OptionPacket::sub(packet.option, payload).encode()
                }
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        if !reply.is_empty() {
            self.stream.write_all(&reply).await?;
        }
        Ok(())
    }

    fn naws_packet(&self) -> OptionPacket {
        let cols = self.term.cols.min(u16::MAX as u32) as u16;
        let rows = self.term.rows.min(u16::MAX as u32) as u16;
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&cols.to_be_bytes());
        payload.extend_from_slice(&rows.to_be_bytes());
        OptionPacket::sub(OPT_NAWS, payload)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> ServerConnection for TelnetConnection<S> {
    /// NAWS update, sent only when the remote asked for window-size
    /// reporting during the handshake.
    async fn set_win_size(&mut self, width: u32, height: u32) -> Result<(), BrokerError> {
        if !self.naws_enabled {
            return Ok(());
        }
        self.term.cols = width;
        self.term.rows = height;
        let packet = self.naws_packet().encode();
        self.stream.write_all(&packet).await?;
        Ok(())
    }

    async fn keep_alive(&mut self) -> Result<(), BrokerError> {
        self.stream.write_all(&[IAC, NOP]).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.state == TelnetState::Closed {
            return Ok(());
        }
        self.state = TelnetState::Closed;
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TelnetConnection<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.leftover_pos < this.leftover.len() {
            let n = (this.leftover.len() - this.leftover_pos).min(buf.remaining());
            buf.put_slice(&this.leftover[this.leftover_pos..this.leftover_pos + n]);
            this.leftover_pos += n;
            if this.leftover_pos == this.leftover.len() {
                this.leftover.clear();
                this.leftover_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TelnetConnection<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn read_exact_vec(server: &mut (impl AsyncRead + Unpin), n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        server.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn refuses_local_echo_and_accepts_remote_echo() {
        let (client_side, mut server) = duplex(1024);
        let settings = TelnetSettings::default();

        let handshake = tokio::spawn(async move {
            TelnetConnection::establish(client_side, "ops", None, &settings).await
        });

        // The engine opens with DO SGA, DO ECHO.
        assert_eq!(read_exact_vec(&mut server, 6).await, [IAC, DO, OPT_SGA, IAC, DO, OPT_ECHO]);

        server.write_all(&[IAC, DO, OPT_ECHO]).await.unwrap();
        server.write_all(&[IAC, WILL, OPT_ECHO]).await.unwrap();
        server.write_all(b"$ ").await.unwrap();

        assert_eq!(read_exact_vec(&mut server, 3).await, [IAC, WONT, OPT_ECHO]);
        assert_eq!(read_exact_vec(&mut server, 3).await, [IAC, DO, OPT_ECHO]);

        let mut conn = handshake.await.unwrap().unwrap();
        assert_eq!(conn.state(), TelnetState::Ready);

        // The prompt that ended negotiation is still readable.
        let mut prompt = [0u8; 2];
        conn.read_exact(&mut prompt).await.unwrap();
        assert_eq!(&prompt, b"$ ");
    }

    #[tokio::test]
    async fn answers_ttype_send_with_the_configured_terminal() {
        let (client_side, mut server) = duplex(1024);
        let settings = TelnetSettings::default();

        let handshake = tokio::spawn(async move {
            TelnetConnection::establish(client_side, "ops", None, &settings).await
        });

        read_exact_vec(&mut server, 6).await;
        server.write_all(&[IAC, DO, OPT_TTYPE]).await.unwrap();
        server
            .write_all(&[IAC, SB, OPT_TTYPE, SUB_SEND, IAC, SE])
            .await
            .unwrap();
        server.write_all(b"> ").await.unwrap();

        assert_eq!(read_exact_vec(&mut server, 3).await, [IAC, WILL, OPT_TTYPE]);
        let mut expected = vec![IAC, SB, OPT_TTYPE, SUB_IS];
        expected.extend_from_slice(b"xterm");
        expected.extend_from_slice(&[IAC, SE]);
        assert_eq!(read_exact_vec(&mut server, expected.len()).await, expected);

        handshake.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn window_change_is_gated_on_naws() {
        let (client_side, mut server) = duplex(1024);
        let settings = TelnetSettings::default();

        let handshake = tokio::spawn(async move {
            TelnetConnection::establish(client_side, "ops", None, &settings).await
        });

        read_exact_vec(&mut server, 6).await;
        server.write_all(b"% ").await.unwrap();
        let mut conn = handshake.await.unwrap().unwrap();

        // NAWS never negotiated: resize must not write anything.
        conn.set_win_size(132, 43).await.unwrap();
        conn.keep_alive().await.unwrap();
        assert_eq!(read_exact_vec(&mut server, 2).await, [IAC, NOP]);
    }

    #[tokio::test]
    async fn unknown_options_are_refused() {
        let (client_side, mut server) = duplex(1024);
        let settings = TelnetSettings::default();

        let handshake = tokio::spawn(async move {
            TelnetConnection::establish(client_side, "ops", None, &settings).await
        });

        read_exact_vec(&mut server, 6).await;
        // Option 42 is nothing we support, in either direction.
        server.write_all(&[IAC, DO, 42, IAC, WILL, 42]).await.unwrap();
        server.write_all(b"# ").await.unwrap();

        assert_eq!(read_exact_vec(&mut server, 3).await, [IAC, WONT, 42]);
        assert_eq!(read_exact_vec(&mut server, 3).await, [IAC, DONT, 42]);
        handshake.await.unwrap().unwrap();
    }
}
