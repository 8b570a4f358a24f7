//! Child-process units.
//!
//! Each unit gets its own listener. The child learns where to connect from
//! the bootstrap descriptor in its environment; once it connects, frames
//! flow over that stream while stdout and stderr stay free for user output.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, instrument, warn};
use uuid::Uuid;
use workfarm_protocol::{frame, ChildMessage, Endpoint, ParentMessage, WorkerBootstrap, WorkerId};

use super::{SpawnContext, UnitEvents, WorkerBackend, WorkerUnit};
use crate::config::ForkOptions;
use crate::dispatcher::UnitEvent;
use crate::error::FarmError;
use crate::output::{OutputHub, OutputStream};

/// How long a spawned child has to connect back.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to keep reading frames after the child exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct ProcessBackend {
    farm_id: Uuid,
    program: PathBuf,
    options: ForkOptions,
    #[cfg(unix)]
    socket_dir: PathBuf,
    connect_timeout: Duration,
}

impl ProcessBackend {
    /// `module_path` is the executable to run unless `options.program` is set.
    pub fn new(farm_id: Uuid, module_path: &str, options: ForkOptions) -> Result<Self, FarmError> {
        let program = options
            .program
            .clone()
            .unwrap_or_else(|| PathBuf::from(module_path));

        #[cfg(unix)]
        let socket_dir = {
            // Socket paths are length-limited, so only a prefix of the id is used.
            let short_id = farm_id.simple().to_string();
            let dir = options
                .socket_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir)
                .join(format!("workfarm-{}", &short_id[..12]));
            std::fs::create_dir_all(&dir).map_err(|e| {
                FarmError::Config(format!(
                    "cannot create socket directory {}: {e}",
                    dir.display()
                ))
            })?;
            dir
        };

        Ok(Self {
            farm_id,
            program,
            options,
            #[cfg(unix)]
            socket_dir,
            connect_timeout: CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[cfg(unix)]
    fn bind(&self, worker_id: WorkerId, generation: u64) -> std::io::Result<(Listener, Endpoint)> {
        let path = self
            .socket_dir
            .join(format!("worker-{worker_id}-{generation}.sock"));
        let endpoint = Endpoint::ipc(&path);
        endpoint.remove_stale_socket()?;
        let listener = tokio::net::UnixListener::bind(&path)?;
        Ok((Listener::Unix { listener, path }, endpoint))
    }

    #[cfg(not(unix))]
    fn bind(&self, _worker_id: WorkerId, _generation: u64) -> std::io::Result<(Listener, Endpoint)> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        let listener = tokio::net::TcpListener::from_std(listener)?;
        Ok((Listener::Tcp(listener), Endpoint::tcp("127.0.0.1", port)))
    }
}

impl WorkerBackend for ProcessBackend {
    #[instrument(skip_all, fields(worker_id = ctx.worker_id, generation = ctx.generation))]
    fn spawn(&mut self, ctx: SpawnContext) -> Result<Box<dyn WorkerUnit>, FarmError> {
        let worker_id = ctx.worker_id;
        let spawn_err = move |message: String| FarmError::Spawn { worker_id, message };

        let (listener, endpoint) = self
            .bind(worker_id, ctx.generation)
            .map_err(|e| spawn_err(format!("failed to bind worker endpoint: {e}")))?;

        let bootstrap = WorkerBootstrap {
            farm_id: self.farm_id,
            worker_id,
            generation: ctx.generation,
            endpoint: endpoint.clone(),
        };
        let (key, value) = bootstrap.to_env().map_err(|e| spawn_err(e.to_string()))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.options.args)
            .envs(&self.options.env)
            .env(key, value)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.options.cwd {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                listener.remove_socket();
                return Err(spawn_err(format!("{}: {e}", self.program.display())));
            }
        };

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            pump_output(stdout, worker_id, OutputStream::Stdout, ctx.output.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump_output(stderr, worker_id, OutputStream::Stderr, ctx.output);
        }

        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(child, listener, rx, ctx.events, self.connect_timeout));
        debug!(?pid, %endpoint, "worker process spawned");

        Ok(Box::new(ProcessUnit { commands, pid }))
    }

    fn cleanup(&mut self) {
        #[cfg(unix)]
        match std::fs::remove_dir_all(&self.socket_dir) {
            Ok(()) => debug!(dir = %self.socket_dir.display(), "removed socket directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.socket_dir.display(), error = %e, "failed to remove socket directory"),
        }
    }
}

// ── Unit handle ──────────────────────────────────────────────────────

enum UnitCommand {
    Post(ChildMessage),
    Kill,
}

struct ProcessUnit {
    commands: mpsc::UnboundedSender<UnitCommand>,
    pid: Option<u32>,
}

impl WorkerUnit for ProcessUnit {
    fn post(&mut self, message: ChildMessage) {
        let _ = self.commands.send(UnitCommand::Post(message));
    }

    fn kill(&mut self) -> bool {
        self.commands.send(UnitCommand::Kill).is_ok()
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

// ── Listener ─────────────────────────────────────────────────────────

enum Listener {
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
    #[cfg_attr(unix, allow(dead_code))]
    Tcp(tokio::net::TcpListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<(BoxedReader, BoxedWriter)> {
        match self {
            #[cfg(unix)]
            Self::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
        }
    }

    /// The socket file is only needed until the child connected.
    fn remove_socket(&self) {
        #[cfg(unix)]
        if let Self::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

// ── Driver ───────────────────────────────────────────────────────────

enum Accepted {
    Connected(BoxedReader, BoxedWriter),
    Failed(String),
    Exited(Option<i32>),
    Killed,
}

enum Step {
    Exited(Option<i32>),
    Command(Option<UnitCommand>),
    Frame(Option<std::io::Result<bytes::BytesMut>>),
}

/// Owns the child for its whole life and reports exactly one `Exited`.
async fn drive(
    mut child: Child,
    listener: Listener,
    mut commands: mpsc::UnboundedReceiver<UnitCommand>,
    events: UnitEvents,
    connect_timeout: Duration,
) {
    let worker_id = events.worker_id();

    // Messages posted before the child connects are written once it does.
    let mut backlog = Vec::new();
    let accepted = {
        let deadline = tokio::time::sleep(connect_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                result = listener.accept() => break match result {
                    Ok((reader, writer)) => Accepted::Connected(reader, writer),
                    Err(e) => Accepted::Failed(format!("accept failed: {e}")),
                },
                status = child.wait() => break Accepted::Exited(exit_code(status)),
                command = commands.recv() => match command {
                    Some(UnitCommand::Post(message)) => backlog.push(message),
                    Some(UnitCommand::Kill) | None => break Accepted::Killed,
                },
                _ = &mut deadline => break Accepted::Failed(
                    format!("worker did not connect within {connect_timeout:?}"),
                ),
            }
        }
    };
    listener.remove_socket();
    drop(listener);

    let (reader, writer) = match accepted {
        Accepted::Connected(reader, writer) => (reader, writer),
        Accepted::Exited(code) => {
            debug!(worker_id, ?code, "worker exited before connecting");
            events.send(UnitEvent::Exited { code });
            return;
        }
        Accepted::Failed(reason) => {
            warn!(worker_id, %reason, "worker failed to connect");
            let code = terminate(&mut child).await;
            events.send(UnitEvent::Exited { code });
            return;
        }
        Accepted::Killed => {
            let code = terminate(&mut child).await;
            events.send(UnitEvent::Exited { code });
            return;
        }
    };

    events.send(UnitEvent::Started { pid: child.id() });
    let mut inbound = FramedRead::new(reader, frame::codec());
    let mut outbound = FramedWrite::new(writer, frame::codec());
    for message in backlog {
        write_message(&mut outbound, &message, worker_id).await;
    }

    let mut commands_open = true;
    let mut reading = true;
    let code = loop {
        let step = tokio::select! {
            status = child.wait() => Step::Exited(exit_code(status)),
            command = commands.recv(), if commands_open => Step::Command(command),
            frame = inbound.next(), if reading => Step::Frame(frame),
        };

        match step {
            Step::Exited(code) => {
                if reading {
                    drain(&mut inbound, &events).await;
                }
                break code;
            }
            Step::Command(Some(UnitCommand::Post(message))) => {
                write_message(&mut outbound, &message, worker_id).await;
            }
            Step::Command(Some(UnitCommand::Kill)) => {
                debug!(worker_id, "killing worker process");
                let _ = child.start_kill();
            }
            Step::Command(None) => {
                commands_open = false;
                let _ = child.start_kill();
            }
            Step::Frame(Some(Ok(bytes))) => {
                if !forward(&bytes, &events) {
                    reading = false;
                    let _ = child.start_kill();
                }
            }
            Step::Frame(Some(Err(e))) => {
                reading = false;
                if e.kind() == std::io::ErrorKind::InvalidData {
                    events.send(UnitEvent::ProtocolViolation(format!("bad frame: {e}")));
                    let _ = child.start_kill();
                } else {
                    debug!(worker_id, error = %e, "worker connection failed");
                }
            }
            Step::Frame(None) => reading = false,
        }
    };

    debug!(worker_id, ?code, "worker process exited");
    events.send(UnitEvent::Exited { code });
}

/// Decode one frame and pass it on. Returns false on a protocol violation.
fn forward(bytes: &[u8], events: &UnitEvents) -> bool {
    match ParentMessage::from_bytes(bytes) {
        Ok(message) => {
            events.send(UnitEvent::Message(message));
            true
        }
        Err(e) => {
            events.send(UnitEvent::ProtocolViolation(format!(
                "worker {} sent an unrecognized message: {e}",
                events.worker_id()
            )));
            false
        }
    }
}

/// Deliver frames the child wrote before exiting.
async fn drain(inbound: &mut FramedRead<BoxedReader, LengthDelimitedCodec>, events: &UnitEvents) {
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Some(Ok(bytes)) = inbound.next().await {
            if !forward(&bytes, events) {
                break;
            }
        }
    })
    .await;
}

async fn write_message(
    outbound: &mut FramedWrite<BoxedWriter, LengthDelimitedCodec>,
    message: &ChildMessage,
    worker_id: WorkerId,
) {
    let bytes = match message.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(worker_id, error = %e, "failed to encode message");
            return;
        }
    };
    if let Err(e) = outbound.send(Bytes::from(bytes)).await {
        // The exit event reports the failure.
        debug!(worker_id, tag = message.tag(), error = %e, "failed to write to worker");
    }
}

async fn terminate(child: &mut Child) -> Option<i32> {
    let _ = child.start_kill();
    exit_code(child.wait().await)
}

fn exit_code(status: std::io::Result<ExitStatus>) -> Option<i32> {
    status.ok().and_then(|s| s.code())
}

fn pump_output<R>(reader: R, worker_id: WorkerId, stream: OutputStream, hub: OutputHub)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut chunks = FramedRead::new(reader, BytesCodec::new());
        while let Some(Ok(chunk)) = chunks.next().await {
            hub.publish(worker_id, stream, chunk.freeze());
        }
    });
}
