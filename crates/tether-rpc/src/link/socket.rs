use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::Result;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{CodecError, FrameBuffer, FrameCodec};
use crate::envelope::Message;
use crate::error::TransportError;
use crate::server::{self, ProcedureRegistry};
use crate::transport::{EventHub, ReconnectFuture, Transport, TransportEvent};

struct Connection {
    generation: u64,
    outgoing: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct SocketState {
    connection: Option<Connection>,
    generation: u64,
}

/// Persistent channel over a Unix domain socket, framed with [`FrameCodec`]
pub struct SocketTransport {
    this: Weak<Self>,
    hub: EventHub,
    codec: FrameCodec,
    /// Set on the connecting side; used to reconnect
    path: Option<PathBuf>,
    state: Mutex<SocketState>,
}

impl SocketTransport {
    fn detached(codec: FrameCodec, path: Option<PathBuf>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            hub: EventHub::new(),
            codec,
            path,
            state: Mutex::new(SocketState::default()),
        })
    }

    /// Connect to a listening [`SocketServer`]
    pub async fn connect(
        path: impl AsRef<Path>,
        codec: FrameCodec,
    ) -> Result<Arc<Self>, TransportError> {
        let path = path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&path).await?;
        log::info!("Connected to {}", path.display());

        let transport = Self::detached(codec, Some(path));
        transport.attach_stream(stream);
        Ok(transport)
    }

    fn state(&self) -> MutexGuard<'_, SocketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach_stream(&self, stream: UnixStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.generation += 1;
        let generation = state.generation;

        let task = tokio::spawn(Self::run_connection(
            self.this.clone(),
            generation,
            stream,
            rx,
            self.codec,
        ));
        let previous = state.connection.replace(Connection {
            generation,
            outgoing: tx,
            task,
        });
        if let Some(previous) = previous {
            previous.task.abort();
        }
    }

    async fn run_connection(
        transport: Weak<Self>,
        generation: u64,
        mut stream: UnixStream,
        mut outgoing: mpsc::UnboundedReceiver<Message>,
        codec: FrameCodec,
    ) {
        let mut buffer = FrameBuffer::new(codec);
        let mut read_buf = vec![0u8; 4096];

        'connection: loop {
            tokio::select! {
                result = stream.read(&mut read_buf) => {
                    match result {
                        Ok(0) => {
                            log::info!("Peer disconnected");
                            break;
                        }
                        Ok(n) => {
                            buffer.push(&read_buf[..n]);

                            let Some(transport) = transport.upgrade() else {
                                break;
                            };
                            // try to decode messages
                            loop {
                                match buffer.try_decode() {
                                    Ok(Some(message)) => {
                                        transport.hub.publish(TransportEvent::Message(message));
                                    }
                                    Ok(None) => break,
                                    Err(CodecError::FrameTooLarge) => {
                                        // the rest of the stream cannot be re-synchronised
                                        log::error!("Peer announced an oversized frame, disconnecting");
                                        break 'connection;
                                    }
                                    Err(e) => {
                                        log::error!("Dropping undecodable frame data: {e}");
                                        buffer.clear();
                                        break;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            log::error!("Failed to read from socket: {e}");
                            break;
                        }
                    }
                }

                message = outgoing.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    let frame = match codec.encode(&message) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::error!("Failed to encode outgoing message: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = stream.write_all(&frame).await {
                        log::error!("Failed to write to socket: {e}");
                        break;
                    }
                }
            }
        }

        if let Some(transport) = transport.upgrade() {
            transport.connection_lost(generation);
        }
    }

    fn connection_lost(&self, generation: u64) {
        let lost = {
            let mut state = self.state();
            let current = state
                .connection
                .as_ref()
                .is_some_and(|conn| conn.generation == generation);
            if current {
                state.connection = None;
            }
            current
        };
        if lost {
            self.hub.publish(TransportEvent::Closed);
        }
    }
}

impl Transport for SocketTransport {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        let state = self.state();
        let connection = state
            .connection
            .as_ref()
            .ok_or(TransportError::Disconnected)?;
        connection
            .outgoing
            .send(message)
            .map_err(|_| TransportError::Disconnected)
    }

    fn is_connected(&self) -> bool {
        self.state().connection.is_some()
    }

    fn close(&self) {
        let connection = self.state().connection.take();
        if let Some(connection) = connection {
            connection.task.abort();
            log::debug!("Socket transport closed");
            self.hub.publish(TransportEvent::Closed);
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.hub.subscribe()
    }

    fn reconnect(&self) -> ReconnectFuture<'_> {
        Box::pin(async move {
            let Some(path) = &self.path else {
                return Err(TransportError::Unsupported("reconnect on accepted sockets"));
            };
            if self.is_connected() {
                return Ok(());
            }

            let stream = UnixStream::connect(path).await?;
            self.attach_stream(stream);
            log::info!("Reconnected to {}", path.display());
            self.hub.publish(TransportEvent::Opened);
            Ok(())
        })
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(connection) = state.connection.take() {
            connection.task.abort();
        }
    }
}

/// Accepts socket connections and serves a procedure registry on each
pub struct SocketServer {
    socket_path: PathBuf,
    codec: FrameCodec,
    listener: UnixListener,
}

impl SocketServer {
    /// Bind `path`, replacing a stale socket file left by an earlier run
    pub fn bind(path: impl AsRef<Path>, codec: FrameCodec) -> Result<Self> {
        let socket_path = path.as_ref().to_path_buf();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        log::info!("RPC server listening on {}", socket_path.display());

        Ok(Self {
            socket_path,
            codec,
            listener,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until the returned task is aborted. Every
    /// connection gets its own server runtime with a clone of `ctx`.
    pub fn serve<C>(self, registry: Arc<dyn ProcedureRegistry<C>>, ctx: C) -> JoinHandle<()>
    where
        C: Clone + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            loop {
                match self.listener.accept().await {
                    Ok((stream, _)) => {
                        log::info!("New client connected");
                        self.handle_client(stream, registry.clone(), ctx.clone());
                    }
                    Err(e) => {
                        log::error!("Failed to accept connection: {e}");
                        break;
                    }
                }
            }
        })
    }

    fn handle_client<C>(&self, stream: UnixStream, registry: Arc<dyn ProcedureRegistry<C>>, ctx: C)
    where
        C: Clone + Send + Sync + 'static,
    {
        let transport = SocketTransport::detached(self.codec, None);
        let mut events = transport.subscribe();
        let runtime = server::attach(registry, transport.clone(), ctx);
        transport.attach_stream(stream);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event == TransportEvent::Closed {
                    break;
                }
            }
            runtime.abort();
            log::info!("Client handler finished");
        });
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                log::error!("Failed to cleanup socket file: {e}");
            }
        }
    }
}
