//! Streaming `multipart/form-data` uploads with manual flow control.
//!
//! [`UploadStreamer`] frames each [`UploadPart`] (boundary, headers, payload)
//! straight into an [`UploadSink`]. File contents are read lazily in
//! fixed-size chunks and are never buffered whole. When the sink reports
//! backpressure the streamer suspends until it is ready again; when the sink
//! reports that the receiver went away (for example the server rejected the
//! request and closed the connection) the streamer stops writing and returns.
//!
//! The HTTP request is started before the first body byte is produced, and
//! its response is awaited concurrently with body transmission.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pkgguard_core::error::ApiError;
use pkgguard_core::transport::{ByteStream, RequestExecutor, StreamingResponse};

const CRLF: &[u8] = b"\r\n";

/// Where the bytes of a file part come from.
pub enum PartSource {
    /// Opened when the part is written, dropped right after.
    Path(PathBuf),
    Bytes(Bytes),
    /// Any async reader; `name` identifies it in errors and logs.
    Reader {
        name: String,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    },
}

impl PartSource {
    /// Human-readable name used in errors.
    pub fn name(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Bytes(bytes) => format!("<{} bytes in memory>", bytes.len()),
            Self::Reader { name, .. } => name.clone(),
        }
    }
}

impl std::fmt::Debug for PartSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Reader { name, .. } => f.debug_struct("Reader").field("name", name).finish_non_exhaustive(),
        }
    }
}

/// Payload of one multipart part.
#[derive(Debug)]
pub enum PartBody {
    Text(String),
    Source(PartSource),
}

/// One multipart part: headers plus payload.
#[derive(Debug)]
pub struct UploadPart {
    /// Form field name.
    pub name: String,
    pub filename: Option<String>,
    pub content_type: String,
    pub body: PartBody,
}

impl UploadPart {
    /// A plain text field.
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: None,
            content_type: "text/plain; charset=utf-8".into(),
            body: PartBody::Text(value.into()),
        }
    }

    /// A JSON document sent as a file part.
    pub fn json(name: impl Into<String>, value: &serde_json::Value) -> Self {
        let name = name.into();
        Self {
            filename: Some(name.clone()),
            name,
            content_type: "application/json".into(),
            body: PartBody::Text(value.to_string()),
        }
    }

    /// A file on disk, streamed when the part is written.
    ///
    /// Field name and filename are both `filename`, typically the path
    /// relative to the project root.
    pub fn file(path: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        let filename = filename.into();
        Self {
            name: filename.clone(),
            filename: Some(filename),
            content_type: "application/octet-stream".into(),
            body: PartBody::Source(PartSource::Path(path.into())),
        }
    }

    pub fn bytes(name: impl Into<String>, filename: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: "application/octet-stream".into(),
            body: PartBody::Source(PartSource::Bytes(data.into())),
        }
    }

    pub fn reader(
        name: impl Into<String>,
        filename: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        let filename = filename.into();
        Self {
            name: name.into(),
            filename: Some(filename.clone()),
            content_type: "application/octet-stream".into(),
            body: PartBody::Source(PartSource::Reader {
                name: filename,
                reader: Box::new(reader),
            }),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    fn validate(&self) -> Result<(), ApiError> {
        let bad = |s: &str| s.contains(['\r', '\n', '"']);
        if self.name.is_empty() {
            return Err(ApiError::InvalidPart("part has an empty field name".into()));
        }
        if bad(&self.name) || self.filename.as_deref().is_some_and(bad) {
            return Err(ApiError::InvalidPart(format!(
                "field '{}' contains a quote or line break",
                self.name.escape_debug()
            )));
        }
        if self.content_type.contains(['\r', '\n']) {
            return Err(ApiError::InvalidPart(format!(
                "content type of field '{}' contains a line break",
                self.name
            )));
        }
        Ok(())
    }

    fn header(&self, boundary: &str) -> String {
        let mut header = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"",
            self.name
        );
        if let Some(filename) = &self.filename {
            header.push_str(&format!("; filename=\"{filename}\""));
        }
        header.push_str(&format!("\r\nContent-Type: {}\r\n\r\n", self.content_type));
        header
    }
}

/// Destination of the framed body.
///
/// Mirrors a writable transport: `write` always takes the chunk but returns
/// `false` once the receiver's buffer is full, after which the writer should
/// wait for [`ready`](UploadSink::ready) before writing more.
#[async_trait]
pub trait UploadSink: Send {
    /// Queue `chunk`. Returns `false` on backpressure or abort.
    fn write(&mut self, chunk: Bytes) -> bool;

    /// Wait until queued chunks are accepted. Returns `false` if the receiver
    /// went away.
    async fn ready(&mut self) -> bool;

    /// The receiver closed or errored; no further writes will be delivered.
    fn is_aborted(&self) -> bool;

    /// Flush and end the body.
    async fn finish(&mut self);

    /// Terminate the body with an error.
    async fn fail(&mut self, err: ApiError);
}

/// [`UploadSink`] over a bounded channel; the receiving half becomes the
/// request body.
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Result<Bytes, ApiError>>>,
    backlog: VecDeque<Bytes>,
    aborted: bool,
}

impl ChannelSink {
    /// Create a sink whose channel holds at most `capacity` chunks, together
    /// with the body stream it feeds.
    pub fn new(capacity: usize) -> (Self, ByteStream) {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let body = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
        let sink = Self {
            tx: Some(tx),
            backlog: VecDeque::new(),
            aborted: false,
        };
        (sink, Box::pin(body))
    }
}

#[async_trait]
impl UploadSink for ChannelSink {
    fn write(&mut self, chunk: Bytes) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        if !self.backlog.is_empty() {
            self.backlog.push_back(chunk);
            return false;
        }
        match tx.try_send(Ok(chunk)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(Ok(chunk))) => {
                self.backlog.push_back(chunk);
                false
            }
            Err(_) => {
                self.aborted = true;
                false
            }
        }
    }

    async fn ready(&mut self) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        while let Some(chunk) = self.backlog.pop_front() {
            if tx.send(Ok(chunk)).await.is_err() {
                self.aborted = true;
                self.backlog.clear();
                return false;
            }
        }
        !self.aborted
    }

    fn is_aborted(&self) -> bool {
        self.aborted || self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }

    async fn finish(&mut self) {
        self.ready().await;
        self.tx = None;
    }

    async fn fail(&mut self, err: ApiError) {
        self.backlog.clear();
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err)).await;
        }
    }
}

/// How body transmission ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyOutcome {
    /// Every part and the closing boundary were written.
    Completed,
    /// The sink aborted; writing stopped early.
    Aborted,
}

type SourceStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Multipart framer and sender.
#[derive(Debug, Clone)]
pub struct UploadStreamer {
    boundary: String,
    read_chunk: usize,
    queue: usize,
}

impl Default for UploadStreamer {
    fn default() -> Self {
        Self::new(64 * 1024, 16)
    }
}

impl UploadStreamer {
    /// A streamer with a fresh random boundary.
    pub fn new(read_chunk: usize, queue: usize) -> Self {
        Self {
            boundary: format!("----pkgguard{}", Uuid::new_v4().simple()),
            read_chunk: read_chunk.max(1),
            queue: queue.max(1),
        }
    }

    /// Use a fixed boundary instead of a random one.
    pub fn with_boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = boundary.into();
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Upload `parts` to `path` and return the server's response.
    ///
    /// All parts are validated before the request is started.
    pub async fn send(
        &self,
        executor: Arc<dyn RequestExecutor>,
        path: &str,
        parts: Vec<UploadPart>,
    ) -> Result<StreamingResponse, ApiError> {
        for part in &parts {
            part.validate()?;
        }

        let (mut sink, body) = ChannelSink::new(self.queue);
        let content_type = self.content_type();
        let target = path.to_string();
        info!(path, parts = parts.len(), "starting multipart upload");

        // Headers go out now; the server may answer before the body is done.
        let response = tokio::spawn(async move { executor.upload(&target, &content_type, body).await });

        match self.write_body(parts, &mut sink).await {
            Ok(BodyOutcome::Completed) => debug!(path, "upload body complete"),
            Ok(BodyOutcome::Aborted) => warn!(path, "server closed the upload before the body was complete"),
            Err(e) => {
                response.abort();
                return Err(e);
            }
        }

        response
            .await
            .map_err(|e| ApiError::Http(format!("upload task failed: {e}")))?
    }

    /// Frame `parts` into `sink`.
    ///
    /// Writes exactly one closing boundary on completion and nothing at all
    /// once the sink has aborted. Every part is validated before the first
    /// byte goes out; on any error the sink is failed so the body never ends
    /// cleanly.
    pub async fn write_body<S>(&self, parts: Vec<UploadPart>, sink: &mut S) -> Result<BodyOutcome, ApiError>
    where
        S: UploadSink + ?Sized,
    {
        let result = match parts.iter().try_for_each(UploadPart::validate) {
            Ok(()) => self.write_parts(parts, sink).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            // The body must not end cleanly after a partial write.
            let reason = ApiError::StreamTransport(format!("upload body aborted: {e}"));
            sink.fail(reason).await;
        }
        result
    }

    async fn write_parts<S>(&self, parts: Vec<UploadPart>, sink: &mut S) -> Result<BodyOutcome, ApiError>
    where
        S: UploadSink + ?Sized,
    {
        for part in parts {
            let header = Bytes::from(part.header(&self.boundary));

            match part.body {
                PartBody::Text(text) => {
                    if !emit(sink, header).await || !emit(sink, Bytes::from(text)).await {
                        return Ok(BodyOutcome::Aborted);
                    }
                }
                PartBody::Source(source) => {
                    let name = source.name();
                    // Open before the header goes out so a missing source
                    // leaves no dangling part behind.
                    let mut chunks = self.open(source).await.map_err(|e| ApiError::UploadIo {
                        source_name: name.clone(),
                        source: e,
                    })?;
                    if !emit(sink, header).await {
                        return Ok(BodyOutcome::Aborted);
                    }
                    let mut sent = 0u64;
                    while let Some(chunk) = chunks.next().await {
                        let chunk = chunk.map_err(|e| {
                            warn!(source = %name, sent, error = %e, "upload source failed mid-read");
                            ApiError::UploadIo {
                                source_name: name.clone(),
                                source: e,
                            }
                        })?;
                        sent += chunk.len() as u64;
                        if !emit(sink, chunk).await {
                            return Ok(BodyOutcome::Aborted);
                        }
                    }
                    // release the source before moving on
                    drop(chunks);
                    debug!(source = %name, bytes = sent, "upload source sent");
                }
            }

            if !emit(sink, Bytes::from_static(CRLF)).await {
                return Ok(BodyOutcome::Aborted);
            }
        }

        let closing = format!("--{}--\r\n", self.boundary);
        if !emit(sink, Bytes::from(closing)).await {
            return Ok(BodyOutcome::Aborted);
        }
        sink.finish().await;
        Ok(BodyOutcome::Completed)
    }

    async fn open(&self, source: PartSource) -> io::Result<SourceStream> {
        let read_chunk = self.read_chunk;
        Ok(match source {
            PartSource::Path(path) => {
                let file = tokio::fs::File::open(&path).await?;
                Box::pin(ReaderStream::with_capacity(file, read_chunk))
            }
            PartSource::Reader { reader, .. } => Box::pin(ReaderStream::with_capacity(reader, read_chunk)),
            PartSource::Bytes(bytes) => {
                let pieces: Vec<io::Result<Bytes>> = (0..bytes.len())
                    .step_by(read_chunk)
                    .map(|start| Ok(bytes.slice(start..(start + read_chunk).min(bytes.len()))))
                    .collect();
                Box::pin(futures::stream::iter(pieces))
            }
        })
    }
}

/// Write one chunk, waiting out backpressure. Returns `false` once aborted.
async fn emit<S: UploadSink + ?Sized>(sink: &mut S, chunk: Bytes) -> bool {
    if sink.is_aborted() {
        return false;
    }
    if sink.write(chunk) {
        return true;
    }
    sink.ready().await
}

#[cfg(test)]
mod tests {
    use std::task::{Context, Poll};

    use serde_json::json;

    use super::*;

    /// Records everything written; reports backpressure every `every` writes
    /// and can abort after `abort_after` writes.
    #[derive(Default)]
    struct RecordingSink {
        data: Vec<u8>,
        writes: usize,
        every: usize,
        abort_after: Option<usize>,
        waits: usize,
        finished: bool,
        failed: bool,
    }

    #[async_trait]
    impl UploadSink for RecordingSink {
        fn write(&mut self, chunk: Bytes) -> bool {
            assert!(!self.is_aborted(), "write after abort");
            self.data.extend_from_slice(&chunk);
            self.writes += 1;
            self.every == 0 || self.writes % self.every != 0
        }

        async fn ready(&mut self) -> bool {
            self.waits += 1;
            tokio::task::yield_now().await;
            !self.is_aborted()
        }

        fn is_aborted(&self) -> bool {
            self.abort_after.is_some_and(|n| self.writes >= n)
        }

        async fn finish(&mut self) {
            self.finished = true;
        }

        async fn fail(&mut self, _err: ApiError) {
            self.failed = true;
        }
    }

    struct FailingReader {
        served: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.served {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk went away")))
            } else {
                self.served = true;
                buf.put_slice(b"first bytes");
                Poll::Ready(Ok(()))
            }
        }
    }

    fn streamer(read_chunk: usize) -> UploadStreamer {
        UploadStreamer::new(read_chunk, 4).with_boundary("XBOUNDARY")
    }

    fn payload(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn body_is_byte_exact() {
        let data = payload(10_000);
        let part = UploadPart::bytes("manifest", "package.json", data.clone());
        let header = part.header("XBOUNDARY");
        let mut sink = RecordingSink::default();

        let outcome = streamer(1_024).write_body(vec![part], &mut sink).await.unwrap();

        let mut expected = header.into_bytes();
        expected.extend_from_slice(&data);
        expected.extend_from_slice(b"\r\n--XBOUNDARY--\r\n");
        assert_eq!(outcome, BodyOutcome::Completed);
        assert_eq!(sink.data, expected);
        assert!(sink.finished);
    }

    #[tokio::test]
    async fn backpressure_loses_nothing() {
        let data = payload(5_000);
        let part = UploadPart::bytes("lock", "yarn.lock", data.clone());
        let header = part.header("XBOUNDARY");
        let mut sink = RecordingSink {
            every: 2,
            ..RecordingSink::default()
        };

        streamer(333).write_body(vec![part], &mut sink).await.unwrap();

        let mut expected = header.into_bytes();
        expected.extend_from_slice(&data);
        expected.extend_from_slice(b"\r\n--XBOUNDARY--\r\n");
        assert_eq!(sink.data, expected);
        assert!(sink.waits > 0);
    }

    #[tokio::test]
    async fn header_framing() {
        let part = UploadPart::json("socket.json", &json!({"a": 1}));
        assert_eq!(
            part.header("B"),
            "--B\r\nContent-Disposition: form-data; name=\"socket.json\"; filename=\"socket.json\"\r\nContent-Type: application/json\r\n\r\n"
        );
        let text = UploadPart::text("branch", "main");
        assert_eq!(
            text.header("B"),
            "--B\r\nContent-Disposition: form-data; name=\"branch\"\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn abort_stops_writing_without_error() {
        let mut sink = RecordingSink {
            abort_after: Some(3),
            ..RecordingSink::default()
        };
        let parts = vec![
            UploadPart::bytes("a", "a.txt", payload(4_096)),
            UploadPart::bytes("b", "b.txt", payload(4_096)),
        ];
        let outcome = streamer(512).write_body(parts, &mut sink).await.unwrap();
        assert_eq!(outcome, BodyOutcome::Aborted);
        assert_eq!(sink.writes, 3);
        assert!(!sink.finished);
        assert!(!String::from_utf8_lossy(&sink.data).contains("--XBOUNDARY--"));
    }

    #[tokio::test]
    async fn read_failure_names_the_source() {
        let mut sink = RecordingSink::default();
        let part = UploadPart::reader("file", "broken.lock", FailingReader { served: false });
        let err = streamer(64).write_body(vec![part], &mut sink).await.unwrap_err();
        match err {
            ApiError::UploadIo { source_name, .. } => assert_eq!(source_name, "broken.lock"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(sink.failed);
        assert!(!sink.finished);
    }

    #[tokio::test]
    async fn missing_file_is_an_upload_error() {
        let mut sink = RecordingSink::default();
        let part = UploadPart::file("/definitely/not/here/package.json", "package.json");
        let err = streamer(64).write_body(vec![part], &mut sink).await.unwrap_err();
        assert!(matches!(err, ApiError::UploadIo { ref source_name, .. } if source_name.ends_with("package.json")));
        assert!(sink.failed);
        assert!(sink.data.is_empty(), "no header for a source that cannot be opened");
    }

    #[tokio::test]
    async fn missing_file_fails_the_channel_body() {
        let (mut sink, mut body) = ChannelSink::new(16);
        let parts = vec![
            UploadPart::bytes("a.txt", "a.txt", "alpha"),
            UploadPart::file("/definitely/missing/file.lock", "file.lock"),
        ];
        let err = streamer(64).write_body(parts, &mut sink).await.unwrap_err();
        assert!(matches!(err, ApiError::UploadIo { .. }));
        drop(sink);

        let mut received = Vec::new();
        let mut body_err = None;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => received.extend_from_slice(&chunk),
                Err(e) => body_err = Some(e),
            }
        }
        let received = String::from_utf8(received).unwrap();
        assert!(matches!(body_err, Some(ApiError::StreamTransport(_))));
        assert!(!received.contains("file.lock"));
        assert!(!received.contains("--XBOUNDARY--"));
    }

    #[tokio::test]
    async fn invalid_later_part_writes_nothing() {
        let mut sink = RecordingSink::default();
        let parts = vec![
            UploadPart::bytes("good", "good.txt", "fine"),
            UploadPart::bytes("bad\nname", "bad.txt", "nope"),
        ];
        let err = streamer(64).write_body(parts, &mut sink).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidPart(_)));
        assert_eq!(sink.writes, 0);
        assert!(sink.failed);
        assert!(!sink.finished);
    }

    #[tokio::test]
    async fn streams_file_from_disk() {
        let dir = std::env::temp_dir().join(format!("pkgguard-upload-{}", Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("requirements.txt");
        let data = payload(70_000);
        tokio::fs::write(&path, &data).await.unwrap();

        let part = UploadPart::file(&path, "requirements.txt");
        let header = part.header("XBOUNDARY");
        let mut sink = RecordingSink {
            every: 3,
            ..RecordingSink::default()
        };
        streamer(8_192).write_body(vec![part], &mut sink).await.unwrap();

        let mut expected = header.into_bytes();
        expected.extend_from_slice(&data);
        expected.extend_from_slice(b"\r\n--XBOUNDARY--\r\n");
        assert_eq!(sink.data, expected);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[test]
    fn invalid_parts_are_rejected() {
        assert!(matches!(
            UploadPart::text("", "x").validate(),
            Err(ApiError::InvalidPart(_))
        ));
        assert!(UploadPart::bytes("a\r\nX-Injected: 1", "f", Bytes::new()).validate().is_err());
        assert!(UploadPart::bytes("a", "f\"oo", Bytes::new()).validate().is_err());
        assert!(UploadPart::text("ok", "value").validate().is_ok());
    }

    #[tokio::test]
    async fn channel_sink_delivers_in_order_under_backpressure() {
        let (mut sink, mut body) = ChannelSink::new(1);
        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            while let Some(chunk) = body.next().await {
                out.extend_from_slice(&chunk.unwrap());
                tokio::task::yield_now().await;
            }
            out
        });

        let mut expected = Vec::new();
        for i in 0..50u8 {
            let chunk = Bytes::from(vec![i; 10]);
            expected.extend_from_slice(&chunk);
            if !sink.write(chunk) {
                assert!(sink.ready().await);
            }
        }
        sink.finish().await;
        assert_eq!(reader.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn channel_sink_reports_abort() {
        let (mut sink, body) = ChannelSink::new(1);
        drop(body);
        assert!(sink.is_aborted());
        assert!(!sink.write(Bytes::from_static(b"x")));
        assert!(!sink.ready().await);
    }
}
