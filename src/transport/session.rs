use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use russh::{Channel, ChannelMsg};
use tokio::io::ReadBuf;
use tokio::sync::mpsc;

use super::*;

/// Releases the owning transport's external ref even when the session is
/// dropped without an explicit close.
pub(crate) struct SessionGuard {
    counts: Arc<RefCounts>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.counts.release_external();
    }
}

enum SessionCommand {
    Data(Vec<u8>),
    Resize(u32, u32),
    Eof,
    Close,
}

enum ShellChannel {
    /// Endpoints of the bridge task that owns the russh channel.
    Ssh {
        cmd_tx: mpsc::UnboundedSender<SessionCommand>,
        read_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    },
    #[cfg(test)]
    Stub,
}

/// One logical terminal session over a shared transport.
///
/// The russh channel is owned by a dedicated bridge task; the session talks
/// to it over in-process queues. Each outbound chunk is awaited to
/// completion inside the task, so a write suspended on window exhaustion is
/// resumed rather than restarted, and nothing is ever sent twice. Inbound
/// `Data` and `ExtendedData` are buffered so reads smaller than a channel
/// message never lose bytes.
pub struct Session {
    channel: ShellChannel,
    _guard: SessionGuard,
    read_buffer: Vec<u8>,
    read_pos: usize,
    resizable: bool,
    closed: bool,
}

impl Session {
    pub(crate) fn new(channel: Channel<Msg>, counts: Arc<RefCounts>, resizable: bool) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_bridge(channel, cmd_rx, read_tx));
        Self {
            channel: ShellChannel::Ssh { cmd_tx, read_rx },
            _guard: SessionGuard { counts },
            read_buffer: Vec::new(),
            read_pos: 0,
            resizable,
            closed: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn stub(counts: Arc<RefCounts>) -> Self {
        Self {
            channel: ShellChannel::Stub,
            _guard: SessionGuard { counts },
            read_buffer: Vec::new(),
            read_pos: 0,
            resizable: false,
            closed: false,
        }
    }

    fn send_command(&self, command: SessionCommand) -> Result<(), BrokerError> {
        match &self.channel {
            ShellChannel::Ssh { cmd_tx, .. } => cmd_tx
                .send(command)
                .map_err(|_| BrokerError::ConnectionClosed),
            #[cfg(test)]
            ShellChannel::Stub => Ok(()),
        }
    }
}

/// Owns the channel for the session's lifetime. Ends when the remote closes
/// the channel or when every sender handle is gone, at which point the
/// channel is closed politely.
async fn run_bridge(
    mut channel: Channel<Msg>,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    read_tx: mpsc::UnboundedSender<Vec<u8>>,
) {
    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(SessionCommand::Data(data)) => {
                    if channel.data(&data[..]).await.is_err() {
                        break;
                    }
                }
                Some(SessionCommand::Resize(width, height)) => {
                    if channel.window_change(width, height, 0, 0).await.is_ok() {
                        trace!("window change sent: {}x{}", width, height);
                    }
                }
                Some(SessionCommand::Eof) => {
                    let _ = channel.eof().await;
                }
                Some(SessionCommand::Close) | None => break,
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data })
                | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if read_tx.send(data.to_vec()).is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::Eof | ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }
    let _ = channel.eof().await;
    let _ = channel.close().await;
}

impl ServerConnection for Session {
    async fn set_win_size(&mut self, width: u32, height: u32) -> Result<(), BrokerError> {
        if !self.resizable {
            return Ok(());
        }
        self.send_command(SessionCommand::Resize(width, height))
    }

    /// Transport-level keepalives are configured when the connection is
    /// dialed, so there is nothing to send per session.
    async fn keep_alive(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.send_command(SessionCommand::Close);
        Ok(())
    }
}

impl AsyncRead for Session {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.read_pos < this.read_buffer.len() {
            let n = (this.read_buffer.len() - this.read_pos).min(buf.remaining());
            buf.put_slice(&this.read_buffer[this.read_pos..this.read_pos + n]);
            this.read_pos += n;
            if this.read_pos == this.read_buffer.len() {
                this.read_buffer.clear();
                this.read_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        match &mut this.channel {
            ShellChannel::Ssh { read_rx, .. } => match read_rx.poll_recv(cx) {
                Poll::Ready(Some(data)) => {
                    let n = data.len().min(buf.remaining());
                    buf.put_slice(&data[..n]);
                    if n < data.len() {
                        this.read_buffer.extend_from_slice(&data[n..]);
                    }
                    Poll::Ready(Ok(()))
                }
                Poll::Ready(None) => Poll::Ready(Ok(())),
                Poll::Pending => Poll::Pending,
            },
            #[cfg(test)]
            ShellChannel::Stub => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for Session {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self
            .get_mut()
            .send_command(SessionCommand::Data(buf.to_vec()))
        {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session bridge closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().send_command(SessionCommand::Eof) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session bridge closed",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn bridged(
        resizable: bool,
    ) -> (
        Session,
        mpsc::UnboundedReceiver<SessionCommand>,
        mpsc::UnboundedSender<Vec<u8>>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let counts = Arc::new(RefCounts::default());
        counts.acquire_external();
        let session = Session {
            channel: ShellChannel::Ssh { cmd_tx, read_rx },
            _guard: SessionGuard { counts },
            read_buffer: Vec::new(),
            read_pos: 0,
            resizable,
            closed: false,
        };
        (session, cmd_rx, read_tx)
    }

    #[tokio::test]
    async fn dropping_a_session_releases_the_external_ref() {
        let counts = Arc::new(RefCounts::default());
        counts.acquire_external();
        let session = Session::stub(counts.clone());
        assert_eq!(counts.external(), 1);
        drop(session);
        assert_eq!(counts.external(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let counts = Arc::new(RefCounts::default());
        counts.acquire_external();
        let mut session = Session::stub(counts);
        session.close().await.unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn writes_reach_the_bridge_whole_and_exactly_once() {
        let (mut session, mut cmd_rx, _read_tx) = bridged(true);

        // Big enough that a windowed transport would split it.
        let payload = vec![0x5au8; 64 * 1024];
        session.write_all(&payload).await.unwrap();
        session.write_all(b"tail").await.unwrap();
        session.set_win_size(120, 40).await.unwrap();
        session.shutdown().await.unwrap();

        let mut sent = Vec::new();
        let mut resized = None;
        let mut eof_sent = false;
        while let Ok(command) = cmd_rx.try_recv() {
            match command {
                SessionCommand::Data(data) => sent.extend_from_slice(&data),
                SessionCommand::Resize(w, h) => resized = Some((w, h)),
                SessionCommand::Eof => eof_sent = true,
                SessionCommand::Close => {}
            }
        }
        assert_eq!(sent.len(), payload.len() + 4);
        assert_eq!(&sent[..payload.len()], &payload[..]);
        assert_eq!(&sent[payload.len()..], b"tail");
        assert_eq!(resized, Some((120, 40)));
        assert!(eof_sent);
    }

    #[tokio::test]
    async fn resize_is_gated_on_pty_support() {
        let (mut session, mut cmd_rx, _read_tx) = bridged(false);
        session.set_win_size(132, 43).await.unwrap();
        assert!(matches!(
            cmd_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn small_reads_drain_bridge_chunks_in_order() {
        let (mut session, _cmd_rx, read_tx) = bridged(false);
        read_tx.send(b"hello ".to_vec()).unwrap();
        read_tx.send(b"world".to_vec()).unwrap();
        drop(read_tx);

        let mut out = Vec::new();
        let mut small = [0u8; 4];
        loop {
            let n = session.read(&mut small).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&small[..n]);
        }
        assert_eq!(out, b"hello world");
    }
}
