//! Port-forward stream multiplexing over the `v4/v5.channel.k8s.io` WebSocket subprotocols.
//!
//! Every frame starts with one channel byte. The port at index `i` of a
//! [`PortForwardSession`] owns data channel `2i` and error channel `2i + 1`, in both
//! directions. The first frame the server sends on every channel carries the port number
//! as a little-endian `u16` and is consumed here rather than delivered.
use std::collections::HashSet;

use crate::{error::ConfigError, Error};

/// The most ports one session can carry, as channel ids must fit in one byte.
pub const MAX_PORTS: usize = 128;

/// The role of a channel within a port's pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    /// Raw stream bytes (even channel)
    Data,
    /// UTF-8 error messages (odd channel)
    Error,
}

/// An ordered list of forwarded ports and the channel mapping derived from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortForwardSession {
    ports: Vec<u16>,
}

impl PortForwardSession {
    /// Validate a port list.
    ///
    /// The list must be non-empty, free of duplicates and at most [`MAX_PORTS`] long.
    pub fn new(ports: impl Into<Vec<u16>>) -> Result<Self, ConfigError> {
        let ports = ports.into();
        if ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }
        if ports.len() > MAX_PORTS {
            return Err(ConfigError::TooManyPorts {
                max: MAX_PORTS,
                count: ports.len(),
            });
        }
        let mut seen = HashSet::with_capacity(ports.len());
        if let Some(dup) = ports.iter().find(|p| !seen.insert(**p)) {
            return Err(ConfigError::DuplicatePort(*dup));
        }
        Ok(Self { ports })
    }

    /// The forwarded ports in channel order.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Number of channels in use, two per port.
    pub fn channel_count(&self) -> usize {
        self.ports.len() * 2
    }

    fn index_of(&self, port: u16) -> Option<u8> {
        // bounded by MAX_PORTS
        self.ports.iter().position(|p| *p == port).map(|i| i as u8)
    }

    /// The data channel carrying `port`.
    pub fn data_channel(&self, port: u16) -> Option<u8> {
        self.index_of(port).map(|i| 2 * i)
    }

    /// The error channel for `port`.
    pub fn error_channel(&self, port: u16) -> Option<u8> {
        self.index_of(port).map(|i| 2 * i + 1)
    }

    /// The port and role of `channel`, or `None` for channels outside the session.
    pub fn channel_target(&self, channel: u8) -> Option<(u16, ChannelKind)> {
        let port = *self.ports.get(usize::from(channel / 2))?;
        let kind = if channel % 2 == 0 {
            ChannelKind::Data
        } else {
            ChannelKind::Error
        };
        Some((port, kind))
    }

    /// The `ports=` query parameter of a port-forward request.
    pub fn query(&self) -> String {
        let ports = self.ports.iter().map(u16::to_string).collect::<Vec<_>>();
        format!("ports={}", ports.join(","))
    }

    /// Frame `payload` for the data channel of `port`.
    pub fn frame_for(&self, port: u16, payload: &[u8]) -> Option<Vec<u8>> {
        self.data_channel(port).map(|ch| encode_frame(ch, payload))
    }
}

/// Prefix `payload` with its channel byte.
pub fn encode_frame(channel: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(channel);
    frame.extend_from_slice(payload);
    frame
}

/// Receives the events of a port-forward session.
///
/// Calls are made one at a time from the task reading the connection.
pub trait PortForwardHandler: Send + 'static {
    /// Bytes arrived from the pod on `port`.
    fn on_data(&mut self, port: u16, data: &[u8]);

    /// The server reported an error for `port`.
    fn on_error(&mut self, port: u16, message: &str);

    /// The connection closed with a WebSocket close code.
    ///
    /// `1005` means the close frame carried no code, `1006` that the connection ended
    /// without one.
    fn on_close(&mut self, code: u16, reason: &str) {
        let _ = (code, reason);
    }

    /// The connection failed.
    fn on_failure(&mut self, error: Error) {
        tracing::warn!("port-forward failed: {}", error);
    }
}

/// Routes incoming frames to a [`PortForwardHandler`].
#[derive(Debug)]
pub struct Demultiplexer {
    session: PortForwardSession,
    // Tracks whether each channel has received its port header.
    initialized: Vec<bool>,
}

impl Demultiplexer {
    /// A demultiplexer for `session` with no channel initialized.
    pub fn new(session: PortForwardSession) -> Self {
        let initialized = vec![false; session.channel_count()];
        Self { session, initialized }
    }

    /// The session this demultiplexer routes for.
    pub fn session(&self) -> &PortForwardSession {
        &self.session
    }

    /// Route one frame.
    ///
    /// Empty frames, frames for unknown channels and port headers are not delivered. The
    /// first frame of a channel is only taken as its port header when it names the
    /// channel's port.
    pub fn dispatch<H: PortForwardHandler + ?Sized>(&mut self, frame: &[u8], handler: &mut H) {
        let Some((&channel, payload)) = frame.split_first() else {
            tracing::trace!("dropping empty frame");
            return;
        };
        let Some((port, kind)) = self.session.channel_target(channel) else {
            tracing::warn!(channel, "dropping frame for unknown channel");
            return;
        };

        let initialized = &mut self.initialized[usize::from(channel)];
        if !*initialized {
            *initialized = true;
            match payload {
                &[lo, hi] if u16::from_le_bytes([lo, hi]) == port => return,
                &[lo, hi] => {
                    let announced = u16::from_le_bytes([lo, hi]);
                    tracing::warn!(channel, announced, expected = port, "port header mismatch, delivering as data");
                }
                _ => tracing::debug!(channel, "channel started without a port header"),
            }
        }

        if payload.is_empty() {
            return;
        }
        match kind {
            ChannelKind::Data => handler.on_data(port, payload),
            ChannelKind::Error => handler.on_error(port, &String::from_utf8_lossy(payload)),
        }
    }
}

#[cfg(feature = "ws")] pub use running::{PortforwardSender, Portforwarder};

#[cfg(feature = "ws")]
mod running {
    use std::sync::Arc;

    use futures::{SinkExt, StreamExt};
    use tokio::{
        io::{AsyncRead, AsyncWrite},
        sync::mpsc,
        task::JoinHandle,
    };
    use tokio_tungstenite::{tungstenite as ws, WebSocketStream};

    use super::{Demultiplexer, PortForwardHandler, PortForwardSession};
    use crate::{error::ConfigError, Error};

    const NO_STATUS_RECEIVED: u16 = 1005;
    const ABNORMAL_CLOSURE: u16 = 1006;

    enum Outgoing {
        Frame(Vec<u8>),
        Close,
    }

    /// A running port-forward session.
    ///
    /// One task reads the connection and delivers events to the handler; dropping the
    /// [`Portforwarder`] does not stop it, use [`PortforwardSender::close`] or
    /// [`Portforwarder::abort`].
    pub struct Portforwarder {
        sender: PortforwardSender,
        task: JoinHandle<()>,
    }

    /// Sends data to the pod through a running [`Portforwarder`].
    #[derive(Clone)]
    pub struct PortforwardSender {
        session: Arc<PortForwardSession>,
        tx: mpsc::UnboundedSender<Outgoing>,
    }

    impl std::fmt::Debug for Portforwarder {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Portforwarder")
                .field("ports", &self.sender.session.ports())
                .field("finished", &self.task.is_finished())
                .finish()
        }
    }

    impl std::fmt::Debug for PortforwardSender {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("PortforwardSender")
                .field("ports", &self.session.ports())
                .field("closed", &self.tx.is_closed())
                .finish()
        }
    }

    impl Portforwarder {
        /// Start multiplexing `session` over `stream`, delivering events to `handler`.
        pub fn start<S, H>(stream: WebSocketStream<S>, session: PortForwardSession, handler: H) -> Self
        where
            S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
            H: PortForwardHandler,
        {
            let (tx, rx) = mpsc::unbounded_channel();
            let session = Arc::new(session);
            let demux = Demultiplexer::new(session.as_ref().clone());
            let task = tokio::spawn(message_loop(stream, demux, handler, rx));
            Self {
                sender: PortforwardSender { session, tx },
                task,
            }
        }

        /// A handle for sending data to the pod.
        pub fn sender(&self) -> PortforwardSender {
            self.sender.clone()
        }

        /// The forwarded ports.
        pub fn session(&self) -> &PortForwardSession {
            &self.sender.session
        }

        /// Wait for the session to end.
        pub async fn join(self) {
            if let Err(err) = self.task.await {
                tracing::warn!("port-forward task failed: {}", err);
            }
        }

        /// Stop reading without closing the connection cleanly.
        pub fn abort(&self) {
            self.task.abort();
        }
    }

    impl PortforwardSender {
        /// Send `data` to `port` on the pod.
        pub fn send(&self, port: u16, data: impl AsRef<[u8]>) -> Result<(), Error> {
            let frame = self.session.frame_for(port, data.as_ref()).ok_or_else(|| {
                Error::Configuration(ConfigError::InvalidValue {
                    field: "port",
                    reason: format!("port {port} is not forwarded by this session"),
                })
            })?;
            self.tx
                .send(Outgoing::Frame(frame))
                .map_err(|_| Error::PortforwardClosed)
        }

        /// Close the connection with a WebSocket close frame.
        pub fn close(&self) -> Result<(), Error> {
            self.tx.send(Outgoing::Close).map_err(|_| Error::PortforwardClosed)
        }
    }

    async fn message_loop<S, H>(
        mut stream: WebSocketStream<S>,
        mut demux: Demultiplexer,
        mut handler: H,
        mut rx: mpsc::UnboundedReceiver<Outgoing>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        H: PortForwardHandler,
    {
        let mut outgoing_open = true;
        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(ws::Message::Binary(bin))) => demux.dispatch(&bin, &mut handler),
                    Some(Ok(ws::Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                            .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                        // Send the close reply queued by the protocol.
                        match stream.flush().await {
                            Ok(()) | Err(ws::Error::ConnectionClosed | ws::Error::AlreadyClosed) => {}
                            Err(err) => {
                                handler.on_failure(Error::WebSocket(err));
                                return;
                            }
                        }
                        tracing::debug!(code, "port-forward connection closed");
                        handler.on_close(code, &reason);
                        return;
                    }
                    Some(Ok(ws::Message::Text(_))) => tracing::warn!("ignoring text message"),
                    // ping and pong are answered by the protocol
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        handler.on_failure(Error::WebSocket(err));
                        return;
                    }
                    None => {
                        handler.on_close(ABNORMAL_CLOSURE, "");
                        return;
                    }
                },
                outgoing = rx.recv(), if outgoing_open => match outgoing {
                    Some(Outgoing::Frame(frame)) => {
                        if let Err(err) = stream.send(ws::Message::binary(frame)).await {
                            handler.on_failure(Error::WebSocket(err));
                            return;
                        }
                    }
                    Some(Outgoing::Close) => {
                        // Keep reading until the server answers the close.
                        outgoing_open = false;
                        if let Err(err) = stream.close(None).await {
                            handler.on_failure(Error::WebSocket(err));
                            return;
                        }
                    }
                    None => outgoing_open = false,
                },
            }
        }
    }
}
