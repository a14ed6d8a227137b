//! Unix domain socket server for IPC
//!
//! Turns client requests into events for the dispatcher and pushes mic
//! transition notifications to subscribed clients.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::arbiter::{MicArbiter, AUDIOVM_PROPERTY};
use crate::device::MIC_CLASS;
use crate::domain::MemoryRegistry;
use crate::events::{collect_attached, collect_devices, Dispatcher, Event, MicEvent};

use super::protocol::{AttachedDevice, DaemonStatus, Request, Response, MAX_FRAME_LEN};

/// What request handling needs
pub struct ServerContext {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<MemoryRegistry>,
    pub arbiter: MicArbiter,
    pub admin_domain: String,
    pub start_time: Instant,
}

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: UnixListener,
    context: Arc<ServerContext>,
    shutdown_tx: broadcast::Sender<()>,
    event_tx: broadcast::Sender<MicEvent>,
}

impl Server {
    /// Bind the socket
    pub fn new(
        socket_path: &Path,
        context: ServerContext,
        event_tx: broadcast::Sender<MicEvent>,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
                .context("failed to restrict socket permissions")?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener,
            context: Arc::new(context),
            shutdown_tx,
            event_tx,
        })
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let context = Arc::clone(&self.context);
                    let events = self.event_tx.clone();
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, context, events) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    async fn handle_client(
        stream: UnixStream,
        context: Arc<ServerContext>,
        events: broadcast::Sender<MicEvent>,
    ) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));
        let mut forwarder = None;

        let result = Self::serve(&mut reader, &writer, &context, &events, &mut forwarder).await;

        if let Some(task) = forwarder {
            task.abort();
        }
        result
    }

    async fn serve(
        reader: &mut OwnedReadHalf,
        writer: &Arc<Mutex<OwnedWriteHalf>>,
        context: &ServerContext,
        events: &broadcast::Sender<MicEvent>,
        forwarder: &mut Option<JoinHandle<()>>,
    ) -> Result<()> {
        while let Some(request) = read_frame::<_, Request>(reader).await? {
            debug!(?request, "received request");

            // subscribe before answering so nothing emitted after the reply is missed
            let receiver = match request {
                Request::Subscribe if forwarder.is_none() => Some(events.subscribe()),
                _ => None,
            };
            let response = Self::process_request(request, context).await;
            send_message(&mut *writer.lock().await, &response).await?;

            if let Some(receiver) = receiver {
                debug!("client subscribed to notifications");
                *forwarder = Some(Self::forward_events(receiver, Arc::clone(writer)));
            }
        }
        debug!("client disconnected");
        Ok(())
    }

    /// Push mic events to a subscribed client until it goes away
    fn forward_events(
        mut events: broadcast::Receiver<MicEvent>,
        writer: Arc<Mutex<OwnedWriteHalf>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let notification = Response::Notification { event };
                        if let Err(e) = send_message(&mut *writer.lock().await, &notification).await {
                            debug!(?e, "subscriber gone");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Process a request and return a response
    async fn process_request(request: Request, context: &ServerContext) -> Response {
        let registry = &context.registry;
        let class = || MIC_CLASS.to_string();

        match request {
            Request::Ping => Response::Pong,

            Request::GetStatus => Response::Status(DaemonStatus {
                admin_domain: context.admin_domain.clone(),
                domains: registry.snapshot().len(),
                guests: context.arbiter.transitions().snapshot(),
                uptime_secs: context.start_time.elapsed().as_secs(),
                ..DaemonStatus::default()
            }),

            Request::Subscribe => Response::Subscribed,

            Request::ListDevices { vm } => {
                let event = Event::DeviceList { vm, devclass: class() };
                match context.dispatcher.fire(&event).await {
                    Ok(outcomes) => Response::Devices {
                        devices: collect_devices(outcomes),
                    },
                    Err(e) => e.into(),
                }
            }

            Request::GetDevice { vm, ident } => {
                let event = Event::DeviceGet {
                    vm,
                    devclass: class(),
                    ident,
                };
                match context.dispatcher.fire(&event).await {
                    Ok(outcomes) => Response::Devices {
                        devices: collect_devices(outcomes),
                    },
                    Err(e) => e.into(),
                }
            }

            Request::ListAttached { vm, persistent } => {
                let event = Event::DeviceListAttached {
                    vm,
                    devclass: class(),
                    persistent,
                };
                match context.dispatcher.fire(&event).await {
                    Ok(outcomes) => Response::Attached {
                        devices: collect_attached(outcomes)
                            .into_iter()
                            .map(|(device, options)| AttachedDevice { device, options })
                            .collect(),
                    },
                    Err(e) => e.into(),
                }
            }

            Request::Attach { vm, options } => {
                if !registry.contains(&vm) {
                    return Response::unknown_domain(&vm);
                }
                let event = Event::DevicePreAttach {
                    vm,
                    devclass: class(),
                    device: context.arbiter.device(),
                    options,
                };
                Self::fire_unit(context, &event).await
            }

            Request::Detach { vm } => {
                if !registry.contains(&vm) {
                    return Response::unknown_domain(&vm);
                }
                let event = Event::DevicePreDetach {
                    vm,
                    devclass: class(),
                    port: context.arbiter.device().ident,
                };
                Self::fire_unit(context, &event).await
            }

            Request::Assign { assignment } => {
                if !registry.contains(&assignment.guest) {
                    return Response::unknown_domain(&assignment.guest);
                }
                let event = Event::DevicePreAssign {
                    vm: assignment.guest.clone(),
                    devclass: assignment.devclass.clone(),
                    assignment: assignment.clone(),
                };
                match context.dispatcher.fire(&event).await {
                    Ok(_) => {
                        registry.add_assignment(assignment);
                        Response::Ok
                    }
                    Err(e) => e.into(),
                }
            }

            Request::SetAudiovm { vm, audiovm } => {
                let Some(old) = registry.set_audiovm(&vm, audiovm.clone()) else {
                    return Response::unknown_domain(&vm);
                };
                let event = Event::PropertySet {
                    vm: vm.clone(),
                    name: AUDIOVM_PROPERTY.to_string(),
                    new: audiovm.clone(),
                    old: old.clone(),
                };
                let response = Self::fire_unit(context, &event).await;
                if matches!(response, Response::Error { .. })
                    && !registry.restore_audiovm(&vm, audiovm.as_deref(), old)
                {
                    warn!(guest = %vm, "rebinding failed but relay changed meanwhile, not reverting");
                }
                response
            }

            Request::QdbCreated { vm } => {
                if !registry.contains(&vm) {
                    return Response::unknown_domain(&vm);
                }
                Self::fire_unit(context, &Event::DomainQdbCreate { vm }).await
            }

            Request::DomainStarted { vm } => {
                if !registry.set_running(&vm, true) {
                    return Response::unknown_domain(&vm);
                }
                Self::fire_unit(context, &Event::DomainStart { vm }).await
            }

            Request::DomainShutdown { vm } => {
                if !registry.set_running(&vm, false) {
                    return Response::unknown_domain(&vm);
                }
                Self::fire_unit(context, &Event::DomainShutdown { vm }).await
            }
        }
    }

    async fn fire_unit(context: &ServerContext, event: &Event) -> Response {
        match context.dispatcher.fire(event).await {
            Ok(_) => Response::Ok,
            Err(e) => e.into(),
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

/// Read one length-prefixed JSON message, `None` on clean disconnect
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("message too large ({len} bytes)");
    }

    let mut msg_buf = vec![0u8; len];
    reader.read_exact(&mut msg_buf).await?;
    let msg = serde_json::from_slice(&msg_buf).context("failed to parse message")?;
    Ok(Some(msg))
}

/// Send a length-prefixed JSON message
pub async fn send_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let msg_bytes = serde_json::to_vec(msg)?;
    let msg_len = (msg_bytes.len() as u32).to_le_bytes();

    writer.write_all(&msg_len).await?;
    writer.write_all(&msg_bytes).await?;

    Ok(())
}
