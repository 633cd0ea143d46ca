//! Query logging.
//!
//! Each completed client request is classified by its first byte, the
//! PostgreSQL frontend message tag. Recognised messages are appended to the
//! query log as one line. The 5-byte frame header (tag + length) is skipped
//! and the rest is written as text.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::proxy::CompletedRequest;

/// Length of the frame header preceding the payload.
pub const FRAME_HEADER_LEN: usize = 5;

/// Consumer of completed client requests.
pub trait MessageLogger {
    /// Log one request. Unrecognised requests are skipped silently.
    fn log(&mut self, request: &CompletedRequest<'_>) -> io::Result<()>;
}

/// Frontend message kinds worth logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    SimpleQuery,
    Bind,
    Parse,
    Describe,
    Execute,
    Close,
    FunctionCall,
}

impl MessageKind {
    /// Classify a request by its leading byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'Q' => Some(MessageKind::SimpleQuery),
            b'B' => Some(MessageKind::Bind),
            b'P' => Some(MessageKind::Parse),
            b'D' => Some(MessageKind::Describe),
            b'E' => Some(MessageKind::Execute),
            b'C' => Some(MessageKind::Close),
            b'F' => Some(MessageKind::FunctionCall),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MessageKind::SimpleQuery => "simple query",
            MessageKind::Bind => "extended query bind",
            MessageKind::Parse => "extended query parse",
            MessageKind::Describe => "extended query describe",
            MessageKind::Execute => "extended query execute",
            MessageKind::Close => "extended query close",
            MessageKind::FunctionCall => "extended function call",
        }
    }
}

/// Render one log line (with trailing newline), or `None` if the request is
/// empty or its tag is not logged.
pub fn format_line(now: DateTime<Local>, request: &CompletedRequest<'_>) -> Option<String> {
    let tag = *request.payload.first()?;
    let kind = MessageKind::from_tag(tag)?;

    let body = request.payload.get(FRAME_HEADER_LEN..).unwrap_or_default();
    let end = body.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    let text = String::from_utf8_lossy(&body[..end]);

    Some(format!(
        "{}\t\t-\tIP: {}\t-\tclient {}: ({})\t\t{}\n",
        now.format("%Y-%m-%d\t%X"),
        request.peer_ip,
        request.connection_id,
        kind.label(),
        text
    ))
}

/// Query log writing to any sink, by default a file.
#[derive(Debug)]
pub struct QueryLogger<W = File> {
    sink: W,
    path: Option<PathBuf>,
}

impl QueryLogger<File> {
    /// Open the log file, appending to it or truncating it.
    pub fn open(path: impl AsRef<Path>, append: bool) -> io::Result<Self> {
        let path = path.as_ref();
        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let file = options.open(path)?;

        Ok(Self {
            sink: file,
            path: Some(path.to_path_buf()),
        })
    }
}

impl<W: Write> QueryLogger<W> {
    pub fn new(sink: W) -> Self {
        Self { sink, path: None }
    }

    /// Path of the log file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

impl<W: Write> MessageLogger for QueryLogger<W> {
    fn log(&mut self, request: &CompletedRequest<'_>) -> io::Result<()> {
        let Some(line) = format_line(Local::now(), request) else {
            return Ok(());
        };
        self.sink.write_all(line.as_bytes())?;
        self.sink.flush()
    }
}
