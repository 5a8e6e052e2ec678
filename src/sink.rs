use std::io::Write;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::Error;

/// Downstream of the coordinator. Records arrive in ingestion order per
/// source; exceptions may arrive from any task.
pub trait Sink<R>: Send + Sync + 'static {
    fn on_record(&self, key: &str, filename: &str, record: R);

    /// `filename` is `None` for errors which are not about a single file.
    fn on_exception(&self, err: &Error, filename: Option<&str>, key: &str);
}

#[derive(Debug, PartialEq)]
pub enum Event<R> {
    Record {
        key: String,
        filename: String,
        record: R,
    },
    Exception {
        key: String,
        filename: Option<String>,
        kind: &'static str,
        message: String,
    },
}

/// Forwards everything into an unbounded channel.
pub struct ChannelSink<R> {
    tx: mpsc::UnboundedSender<Event<R>>,
}

impl<R: Send + 'static> ChannelSink<R> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event<R>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }
}

impl<R: Send + 'static> Sink<R> for ChannelSink<R> {
    fn on_record(&self, key: &str, filename: &str, record: R) {
        let event = Event::Record {
            key: key.to_string(),
            filename: filename.to_string(),
            record,
        };

        if self.tx.send(event).is_err() {
            warn!(message = "Record dropped, receiver is gone", key, filename);
        }
    }

    fn on_exception(&self, err: &Error, filename: Option<&str>, key: &str) {
        let event = Event::Exception {
            key: key.to_string(),
            filename: filename.map(ToString::to_string),
            kind: err.kind(),
            message: err.to_string(),
        };

        if self.tx.send(event).is_err() {
            warn!(message = "Exception dropped, receiver is gone", key, %err);
        }
    }
}

#[derive(Serialize)]
struct RecordLine<'a, R> {
    key: &'a str,
    filename: &'a str,
    record: &'a R,
}

#[derive(Serialize)]
struct ExceptionLine<'a> {
    key: &'a str,
    filename: Option<&'a str>,
    kind: &'static str,
    error: String,
}

/// Writes JSON lines, one per record or exception.
pub struct WriterSink<W> {
    writer: Mutex<W>,
}

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        WriterSink {
            writer: Mutex::new(writer),
        }
    }

    fn write_line<T: Serialize>(&self, value: &T) {
        let mut writer = self.writer.lock();

        let result = serde_json::to_writer(&mut *writer, value)
            .map_err(std::io::Error::from)
            .and_then(|()| {
                writer.write_all(b"\n")?;
                writer.flush()
            });
        if let Err(err) = result {
            error!(message = "Write output failed", %err);
        }
    }
}

impl<W, R> Sink<R> for WriterSink<W>
where
    W: Write + Send + 'static,
    R: Serialize,
{
    fn on_record(&self, key: &str, filename: &str, record: R) {
        self.write_line(&RecordLine {
            key,
            filename,
            record: &record,
        });
    }

    fn on_exception(&self, err: &Error, filename: Option<&str>, key: &str) {
        self.write_line(&ExceptionLine {
            key,
            filename,
            kind: err.kind(),
            error: err.to_string(),
        });
    }
}
