//! Worker stdout/stderr aggregation.

use std::borrow::Cow;
use std::io::{self, Write};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::broadcast;
use workfarm_protocol::WorkerId;

/// Chunks buffered per subscriber before it starts lagging.
const OUTPUT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Bytes written by one worker, in arrival order per worker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    pub worker_id: WorkerId,
    pub stream: OutputStream,
    pub data: Bytes,
}

impl OutputChunk {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    /// Every line prefixed with the worker tag.
    pub fn tagged(&self) -> String {
        let mut out = String::new();
        for line in self.text().lines() {
            out.push_str(&format!("worker-{} │ {line}\n", self.worker_id));
        }
        out
    }
}

/// Fan-out point for all worker output of one farm.
///
/// Subscribers only see chunks published after they subscribed.
#[derive(Debug, Clone)]
pub struct OutputHub {
    stdout: broadcast::Sender<OutputChunk>,
    stderr: broadcast::Sender<OutputChunk>,
    silent: bool,
}

impl OutputHub {
    pub fn new(silent: bool) -> Self {
        let (stdout, _) = broadcast::channel(OUTPUT_CAPACITY);
        let (stderr, _) = broadcast::channel(OUTPUT_CAPACITY);
        Self {
            stdout,
            stderr,
            silent,
        }
    }

    pub fn publish(&self, worker_id: WorkerId, stream: OutputStream, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let chunk = OutputChunk {
            worker_id,
            stream,
            data,
        };
        if !self.silent {
            mirror(&chunk);
        }
        // No subscribers is fine.
        let _ = self.sender(stream).send(chunk);
    }

    pub fn subscribe(&self, stream: OutputStream) -> OutputReceiver {
        OutputReceiver {
            rx: self.sender(stream).subscribe(),
            worker: None,
        }
    }

    pub fn subscribe_worker(&self, stream: OutputStream, worker_id: WorkerId) -> OutputReceiver {
        OutputReceiver {
            rx: self.sender(stream).subscribe(),
            worker: Some(worker_id),
        }
    }

    /// A blocking writer publishing to this hub, for in-thread harnesses.
    pub fn writer(&self, worker_id: WorkerId, stream: OutputStream) -> OutputWriter {
        OutputWriter {
            hub: self.clone(),
            worker_id,
            stream,
        }
    }

    fn sender(&self, stream: OutputStream) -> &broadcast::Sender<OutputChunk> {
        match stream {
            OutputStream::Stdout => &self.stdout,
            OutputStream::Stderr => &self.stderr,
        }
    }
}

fn mirror(chunk: &OutputChunk) {
    let tagged = chunk.tagged();
    let _ = match chunk.stream {
        OutputStream::Stdout => io::stdout().lock().write_all(tagged.as_bytes()),
        OutputStream::Stderr => io::stderr().lock().write_all(tagged.as_bytes()),
    };
}

/// Subscription to merged (or single-worker) output.
#[derive(Debug)]
pub struct OutputReceiver {
    rx: broadcast::Receiver<OutputChunk>,
    worker: Option<WorkerId>,
}

impl OutputReceiver {
    /// Next chunk, or `None` once the farm and its workers are gone.
    ///
    /// A lagging receiver skips the chunks it missed.
    pub async fn recv(&mut self) -> Option<OutputChunk> {
        loop {
            match self.rx.recv().await {
                Ok(chunk) => {
                    if self.worker.map_or(true, |id| id == chunk.worker_id) {
                        return Some(chunk);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "output receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = OutputChunk> {
        futures::stream::unfold(self, |mut rx| async move {
            let chunk = rx.recv().await?;
            Some((chunk, rx))
        })
    }
}

/// `io::Write` adapter publishing each write as one chunk.
pub struct OutputWriter {
    hub: OutputHub,
    worker_id: WorkerId,
    stream: OutputStream,
}

impl Write for OutputWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hub
            .publish(self.worker_id, self.stream, Bytes::copy_from_slice(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
