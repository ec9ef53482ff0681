use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use medialb_common::protocol::error::{MedialbError, Result};
use medialb_common::protocol::{Code, Handler, Message, Protocol, Request, Responder};
use medialb_common::sync::Signal;
use medialb_common::transport::UdpTransport;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type HandlerMap<M> = HashMap<Code, Arc<dyn Handler<M>>>;
type StopHandler = Box<dyn FnOnce() + Send>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Capacity of the error queue; errors beyond it are logged and dropped
    pub error_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            error_queue_capacity: 64,
        }
    }
}

/// Builds a [`Server`]: handlers contributed by the protocol's fragments are
/// installed first, explicit handlers override them.
pub struct ServerBuilder<M> {
    protocol: Arc<Protocol<M>>,
    handlers: HandlerMap<M>,
    stop_handlers: Vec<StopHandler>,
    config: ServerConfig,
}

impl<M: Message> ServerBuilder<M> {
    pub fn new(protocol: Arc<Protocol<M>>) -> Self {
        let handlers = protocol
            .fragment_handlers()
            .iter()
            .map(|(code, handler)| (*code, handler.clone()))
            .collect();

        Self {
            protocol,
            handlers,
            stop_handlers: Vec::new(),
            config: ServerConfig::default(),
        }
    }

    pub fn handle(mut self, code: Code, handler: impl Handler<M>) -> Self {
        self.handlers.insert(code, Arc::new(handler));
        self
    }

    /// Registers cleanup to run once when the server stops
    pub fn on_stop(mut self, stop: impl FnOnce() + Send + 'static) -> Self {
        self.stop_handlers.push(Box::new(stop));
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Binds to `addr` and starts the receive loop.
    ///
    /// # Errors
    ///
    /// Fails if a handler is registered for a code no fragment of the
    /// protocol claims, or if binding fails.
    pub async fn bind(self, addr: &str) -> Result<Server<M>> {
        for code in self.handlers.keys() {
            if self.protocol.owner(*code).is_none() {
                return Err(MedialbError::UnregisteredCode {
                    protocol: self.protocol.name().to_string(),
                    code: *code,
                });
            }
        }

        let socket = Arc::new(UdpTransport::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (tx, rx) = mpsc::channel(self.config.error_queue_capacity.max(1));
        let errors = ErrorReporter { tx };
        let stopped = Signal::new();

        let task = tokio::spawn(receive_loop(
            socket,
            self.protocol.clone(),
            Arc::new(self.handlers),
            errors.clone(),
            stopped.clone(),
        ));

        info!("{} server listening on {}", self.protocol.name(), local_addr);

        Ok(Server {
            protocol: self.protocol,
            local_addr,
            stop_handlers: StdMutex::new(self.stop_handlers),
            errors,
            error_queue: Mutex::new(rx),
            stopped,
            task: Mutex::new(Some(task)),
        })
    }
}

/// A UDP server dispatching decoded packets to handlers by code.
///
/// Each inbound datagram is decoded and handed to the handler registered for
/// its code on a task of its own. Undecodable datagrams and unhandled codes
/// are logged and skipped; a bad packet never stops the loop. Handler errors
/// go to a bounded queue drained with [`Server::next_error`] or
/// [`Server::drain_errors`].
pub struct Server<M> {
    protocol: Arc<Protocol<M>>,
    local_addr: SocketAddr,
    stop_handlers: StdMutex<Vec<StopHandler>>,
    errors: ErrorReporter,
    error_queue: Mutex<mpsc::Receiver<MedialbError>>,
    stopped: Signal,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<M: Message> Server<M> {
    pub fn builder(protocol: Arc<Protocol<M>>) -> ServerBuilder<M> {
        ServerBuilder::new(protocol)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn protocol(&self) -> &Arc<Protocol<M>> {
        &self.protocol
    }

    /// Pushes an error onto the error queue, dropping it if the queue is full
    pub fn report_error(&self, err: MedialbError) {
        self.errors.report(err);
    }

    /// Waits for the next reported error.
    pub async fn next_error(&self) -> Option<MedialbError> {
        self.error_queue.lock().await.recv().await
    }

    /// Takes every error currently queued without waiting.
    pub async fn drain_errors(&self) -> Vec<MedialbError> {
        let mut queue = self.error_queue.lock().await;
        let mut errors = Vec::new();
        while let Ok(err) = queue.try_recv() {
            errors.push(err);
        }
        errors
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_enabled()
    }

    /// Stops the server: closes the endpoint, runs stop handlers and waits
    /// for the receive loop to exit. Only the first call has any effect.
    pub async fn stop(&self) {
        if !self.stopped.enable() {
            return;
        }

        let stop_handlers = match self.stop_handlers.lock() {
            Ok(mut handlers) => std::mem::take(&mut *handlers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for stop in stop_handlers {
            stop();
        }

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!("{} server receive loop failed: {}", self.protocol.name(), e);
            }
        }
        info!("{} server on {} stopped", self.protocol.name(), self.local_addr);
    }
}

impl<M> Drop for Server<M> {
    fn drop(&mut self) {
        // Ends the receive loop even if stop() was never called
        self.stopped.enable();
    }
}

#[derive(Clone)]
struct ErrorReporter {
    tx: mpsc::Sender<MedialbError>,
}

impl ErrorReporter {
    fn report(&self, err: MedialbError) {
        match self.tx.try_send(err) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(err)) => {
                warn!("Error queue full, dropping error: {}", err);
            }
            Err(mpsc::error::TrySendError::Closed(err)) => {
                debug!("Error queue closed, dropping error: {}", err);
            }
        }
    }
}

async fn receive_loop<M: Message>(
    socket: Arc<UdpSocket>,
    protocol: Arc<Protocol<M>>,
    handlers: Arc<HandlerMap<M>>,
    errors: ErrorReporter,
    stopped: Signal,
) {
    let mut buf = vec![0u8; protocol.buffer_size()];

    loop {
        let received = tokio::select! {
            _ = stopped.wait() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, peer) = match received {
            Ok(received) => received,
            Err(e) => {
                warn!("{} server receive error: {}", protocol.name(), e);
                continue;
            }
        };

        let packet = match protocol.decode_packet(&buf[..len], Some(peer)) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(
                    "{} server failed to decode packet from {}: {}",
                    protocol.name(),
                    peer,
                    e
                );
                continue;
            }
        };

        let code = packet.code();
        let Some(handler) = handlers.get(&code) else {
            error!(
                "{} server: unhandled code {} from {}",
                protocol.name(),
                code,
                peer
            );
            continue;
        };

        let request = Request {
            packet,
            responder: Responder::new(socket.clone(), peer, protocol.clone()),
        };
        let handling = handler.handle(request);
        let errors = errors.clone();
        tokio::spawn(async move {
            if let Err(e) = handling.await {
                errors.report(e);
            }
        });
    }
}
