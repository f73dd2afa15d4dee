/*!
Unix socket client for the skald daemon

One message per connection: the client writes a single JSON line and, for
queries, reads the answer until the daemon closes the stream.
The framing helpers are shared with the daemon side.
*/

use crate::messages::{
    decode_line, encode_line, ContractError, CpuSnapshot, GpuSnapshot, JobRegistration, MetricKind,
    QueryRequest, MAX_ANSWER_BYTES, MAX_MESSAGE_BYTES,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot reach daemon at {path}: {source}")]
    Connect { path: PathBuf, source: io::Error },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("daemon answered with error: {0}")]
    Daemon(String),
}

/// Read one newline-terminated frame, capped at `MAX_MESSAGE_BYTES`
pub async fn read_frame<R: AsyncRead + Unpin>(reader: R) -> io::Result<Vec<u8>> {
    let mut reader = BufReader::new(reader.take(MAX_MESSAGE_BYTES));
    let mut buf = Vec::new();
    reader.read_until(b'\n', &mut buf).await?;
    Ok(buf)
}

/// Read a query answer up to EOF, capped at `MAX_ANSWER_BYTES`
pub async fn read_answer<R: AsyncRead + Unpin>(reader: R) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.take(MAX_ANSWER_BYTES).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Write one message as a newline-terminated frame and flush it
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ClientError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode_line(message)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn connect(path: &Path) -> Result<UnixStream, ClientError> {
    UnixStream::connect(path).await.map_err(|source| ClientError::Connect {
        path: path.to_path_buf(),
        source,
    })
}

/// Register a freshly launched job with the daemon
pub async fn notify(path: impl AsRef<Path>, registration: &JobRegistration) -> Result<(), ClientError> {
    let path = path.as_ref();
    let mut stream = connect(path).await?;
    write_frame(&mut stream, registration).await?;
    stream.shutdown().await?;
    debug!(pgid = registration.pgid, socket = %path.display(), "registration sent");
    Ok(())
}

/// Send a query with an arbitrary kind string and return the raw answer
pub async fn query_raw(path: impl AsRef<Path>, kind: &str) -> Result<Value, ClientError> {
    let mut stream = connect(path.as_ref()).await?;
    write_frame(&mut stream, &QueryRequest { kind: kind.to_string() }).await?;
    let answer = read_answer(&mut stream).await?;
    Ok(decode_line(&answer)?)
}

async fn query_kind<T: DeserializeOwned>(path: &Path, kind: MetricKind) -> Result<T, ClientError> {
    let value = query_raw(path, kind.as_str()).await?;
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Err(ClientError::Daemon(error.to_string()));
    }
    serde_json::from_value(value).map_err(|e| ClientError::Contract(e.into()))
}

pub async fn query_cpu(path: impl AsRef<Path>) -> Result<CpuSnapshot, ClientError> {
    query_kind(path.as_ref(), MetricKind::Cpu).await
}

pub async fn query_gpu(path: impl AsRef<Path>) -> Result<GpuSnapshot, ClientError> {
    query_kind(path.as_ref(), MetricKind::Gpu).await
}
