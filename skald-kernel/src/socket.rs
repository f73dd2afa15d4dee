//! Unix socket endpoints of the daemon
//!
//! - registration socket: one `JobRegistration` line per connection, fanned
//!   out to the store (summary seed) and the tree resolver (new root)
//! - query socket: one `{"type": ...}` line in, one JSON answer out
//!
//! Malformed payloads are logged and the connection dropped; listeners keep
//! running until cancellation, then remove their socket file.

use crate::store::StoreReader;
use skald_contracts::client::{read_frame, write_frame};
use skald_contracts::messages::decode_line;
use skald_contracts::{ClientError, JobRegistration, Pgid, QueryRequest};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Clients get this long to send their message
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Binds a listener, replacing a stale socket file left by a previous run
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        debug!("removing stale socket {}", path.display());
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;
    info!("listening on {}", path.display());
    Ok(listener)
}

fn release(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("failed to remove socket {}: {e}", path.display());
        }
    }
}

async fn read_message(stream: &mut UnixStream) -> Result<Vec<u8>, ClientError> {
    match tokio::time::timeout(READ_TIMEOUT, read_frame(stream)).await {
        Ok(frame) => Ok(frame?),
        Err(_) => Err(ClientError::Io(io::Error::new(io::ErrorKind::TimedOut, "client too slow"))),
    }
}

/// Where a decoded registration is forwarded
#[derive(Clone)]
pub struct RegistrationSinks {
    pub jobs: mpsc::Sender<JobRegistration>,
    pub roots: mpsc::Sender<Pgid>,
}

pub async fn serve_registrations(
    listener: UnixListener,
    path: PathBuf,
    sinks: RegistrationSinks,
    cancel: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("registration accept failed: {e}");
                    continue;
                }
            },
        };
        let sinks = sinks.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_registration(stream, sinks).await {
                warn!("registration dropped: {e}");
            }
        });
    }
    release(&path);
    debug!("registration listener stopped");
}

async fn handle_registration(mut stream: UnixStream, sinks: RegistrationSinks) -> Result<(), ClientError> {
    let frame = read_message(&mut stream).await?;
    let job: JobRegistration = decode_line(&frame)?;
    let pgid = job.pgid;
    // the store is seeded before the resolver can attribute samples to the root
    if sinks.jobs.send(job).await.is_err() || sinks.roots.send(pgid).await.is_err() {
        debug!(pgid, "daemon shutting down, registration ignored");
    }
    Ok(())
}

pub async fn serve_queries(
    listener: UnixListener,
    path: PathBuf,
    reader: StoreReader,
    cancel: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("query accept failed: {e}");
                    continue;
                }
            },
        };
        let reader = reader.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_query(stream, reader).await {
                warn!("query dropped: {e}");
            }
        });
    }
    release(&path);
    debug!("query listener stopped");
}

async fn handle_query(mut stream: UnixStream, reader: StoreReader) -> Result<(), ClientError> {
    let frame = read_message(&mut stream).await?;
    let request: QueryRequest = decode_line(&frame)?;
    let answer = reader.answer(&request).map_err(skald_contracts::ContractError::from)?;
    debug!(kind = %request.kind, "query answered");
    write_frame(&mut stream, &answer).await
}
