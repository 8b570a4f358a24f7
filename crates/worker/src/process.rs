//! Entry point for worker executables spawned by the process backend.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::process::ExitCode;

use tracing::{debug, error, info, warn};
use workfarm_protocol::frame::{read_frame, write_frame, MAX_FRAME_LEN};
use workfarm_protocol::{
    ChildMessage, Endpoint, ParentMessage, ProtocolError, RemoteError, WorkerBootstrap,
};

use crate::context::MessageSink;
use crate::error::HarnessError;
use crate::harness::{Flow, Harness, HarnessIo};
use crate::registry::ModuleRegistry;

/// Writes each parent message as one frame on the farm connection.
///
/// A reply too large for one frame is replaced by a `FrameTooLarge` error
/// so the farm still gets an answer for the call.
struct FrameSink<W: Write> {
    writer: W,
    max_len: usize,
}

impl<W: Write> FrameSink<W> {
    fn new(writer: W) -> Self {
        Self {
            writer,
            max_len: MAX_FRAME_LEN,
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), HarnessError> {
        write_frame(&mut self.writer, bytes).map_err(|e| match e {
            ProtocolError::Io(io) if io.kind() == io::ErrorKind::BrokenPipe => {
                HarnessError::ChannelClosed
            }
            other => HarnessError::Protocol(other),
        })
    }
}

impl<W: Write> MessageSink for FrameSink<W> {
    fn emit(&mut self, message: ParentMessage) -> Result<(), HarnessError> {
        let bytes = message.to_bytes()?;
        if bytes.len() <= self.max_len {
            return self.write(&bytes);
        }

        let tag = message.tag();
        let too_large = RemoteError::new(
            "FrameTooLarge",
            format!(
                "{tag} of {} bytes exceeds the {} byte frame limit",
                bytes.len(),
                self.max_len
            ),
        );
        let replacement = match message {
            ParentMessage::Ok { .. } | ParentMessage::ClientError(_) => {
                ParentMessage::ClientError(too_large)
            }
            ParentMessage::SetupError(_) => ParentMessage::SetupError(too_large),
            ParentMessage::CustomMessage { .. } => {
                warn!(size = bytes.len(), "dropping oversized custom message");
                return Ok(());
            }
        };
        warn!(tag, size = bytes.len(), "reply too large for one frame, sending an error instead");
        self.write(&replacement.to_bytes()?)
    }
}

type Connection = (Box<dyn Read + Send>, Box<dyn Write + Send>);

fn connect(endpoint: &Endpoint) -> Result<Connection, HarnessError> {
    let connect_err = |source: io::Error| HarnessError::Connect {
        endpoint: endpoint.address(),
        source,
    };

    match endpoint {
        #[cfg(unix)]
        Endpoint::Ipc(path) => {
            let stream = std::os::unix::net::UnixStream::connect(path).map_err(connect_err)?;
            let reader = stream.try_clone().map_err(connect_err)?;
            Ok((Box::new(reader), Box::new(stream)))
        }
        #[cfg(not(unix))]
        Endpoint::Ipc(_) => Err(HarnessError::UnsupportedEndpoint(endpoint.address())),
        Endpoint::Tcp { host, port } => {
            let stream =
                std::net::TcpStream::connect((host.as_str(), *port)).map_err(connect_err)?;
            stream.set_nodelay(true).map_err(connect_err)?;
            let reader = stream.try_clone().map_err(connect_err)?;
            Ok((Box::new(reader), Box::new(stream)))
        }
    }
}

/// Run the worker side of the protocol until END or until the farm goes away.
///
/// Reads the [`WorkerBootstrap`] from the environment, connects back to the
/// farm and serves messages with the modules in `registry`. Module output
/// goes to this process's stdout and stderr, which the farm captures.
pub fn run_process(registry: ModuleRegistry) -> Result<(), HarnessError> {
    let bootstrap = WorkerBootstrap::from_env()?;
    let worker_id = bootstrap.worker_id;
    debug!(
        worker_id,
        generation = bootstrap.generation,
        endpoint = %bootstrap.endpoint,
        "connecting to farm"
    );

    let (reader, writer) = connect(&bootstrap.endpoint)?;
    let mut reader = BufReader::new(reader);
    let mut sink = FrameSink::new(BufWriter::new(writer));
    let mut harness = Harness::new(registry, worker_id);
    let stdout = io::stdout();
    let stderr = io::stderr();

    loop {
        let Some(frame) = read_frame(&mut reader)? else {
            // Farm closed the connection without END.
            debug!(worker_id, "farm connection closed");
            return Ok(());
        };
        let message = ChildMessage::from_bytes(&frame)?;

        let mut out = stdout.lock();
        let mut err = stderr.lock();
        let mut io = HarnessIo {
            sink: &mut sink,
            stdout: &mut out,
            stderr: &mut err,
        };
        match harness.handle(message, &mut io)? {
            Flow::Continue => {}
            Flow::End => {
                info!(worker_id, "received END, exiting");
                return Ok(());
            }
            Flow::SetupFailed(err) => return Err(HarnessError::Setup(err)),
        }
    }
}

/// Map the outcome of [`run_process`] to the process exit status.
pub fn exit_code(result: Result<(), HarnessError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "worker harness stopped");
            ExitCode::from(e.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sink_writes_decodable_frames() {
        let mut sink = FrameSink::new(Vec::new());
        sink.emit(ParentMessage::Ok {
            result: serde_json::json!([1, 2]),
        })
        .unwrap();

        let mut cursor = io::Cursor::new(sink.writer);
        let frame = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(
            ParentMessage::from_bytes(&frame).unwrap(),
            ParentMessage::Ok {
                result: serde_json::json!([1, 2])
            }
        );
    }

    fn only_frame(sink: FrameSink<Vec<u8>>) -> Option<ParentMessage> {
        let mut cursor = io::Cursor::new(sink.writer);
        let frame = read_frame(&mut cursor).unwrap()?;
        assert!(read_frame(&mut cursor).unwrap().is_none());
        Some(ParentMessage::from_bytes(&frame).unwrap())
    }

    #[test]
    fn oversized_result_becomes_a_client_error() {
        let mut sink = FrameSink {
            writer: Vec::new(),
            max_len: 256,
        };
        sink.emit(ParentMessage::Ok {
            result: serde_json::json!("x".repeat(1024)),
        })
        .unwrap();

        match only_frame(sink) {
            Some(ParentMessage::ClientError(err)) => {
                assert_eq!(err.kind, "FrameTooLarge");
                assert!(err.message.starts_with("OK of "));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn oversized_custom_message_is_dropped() {
        let mut sink = FrameSink {
            writer: Vec::new(),
            max_len: 256,
        };
        sink.emit(ParentMessage::CustomMessage {
            payload: serde_json::json!("x".repeat(1024)),
        })
        .unwrap();
        assert_eq!(only_frame(sink), None);
    }

    #[test]
    fn exit_codes_distinguish_failures() {
        let setup = HarnessError::Setup(workfarm_protocol::RemoteError::error("x"));
        assert_eq!(setup.exit_code(), 1);
        assert_eq!(HarnessError::ChannelClosed.exit_code(), 4);
        assert_eq!(
            HarnessError::UnsupportedEndpoint("ipc://x".into()).exit_code(),
            3
        );
    }
}
