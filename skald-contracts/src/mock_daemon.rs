/*!
Mock daemon for developing clients without a running skald-kernel

Binds both sockets inside a caller-provided directory, records every
registration it receives and answers queries with canned snapshots.
*/

use crate::client::{read_frame, write_frame};
use crate::messages::{
    decode_line, CpuSnapshot, GpuSnapshot, JobRegistration, MetricKind, QueryError, QueryRequest,
};
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Default)]
struct Canned {
    registrations: Vec<JobRegistration>,
    cpu: CpuSnapshot,
    gpu: GpuSnapshot,
}

/// In-process stand-in for the daemon's two sockets
pub struct MockDaemon {
    registration_path: PathBuf,
    query_path: PathBuf,
    state: Arc<Mutex<Canned>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockDaemon {
    pub async fn start(dir: &Path) -> io::Result<Self> {
        let registration_path = dir.join("skald.socket");
        let query_path = dir.join("skald_serve.socket");
        let registrations = UnixListener::bind(&registration_path)?;
        let queries = UnixListener::bind(&query_path)?;
        let state = Arc::new(Mutex::new(Canned::default()));

        let tasks = vec![
            tokio::spawn(accept_registrations(registrations, state.clone())),
            tokio::spawn(accept_queries(queries, state.clone())),
        ];

        Ok(Self { registration_path, query_path, state, tasks })
    }

    pub fn registration_path(&self) -> &Path {
        &self.registration_path
    }

    pub fn query_path(&self) -> &Path {
        &self.query_path
    }

    pub fn set_cpu(&self, snapshot: CpuSnapshot) {
        self.state.lock().cpu = snapshot;
    }

    pub fn set_gpu(&self, snapshot: GpuSnapshot) {
        self.state.lock().gpu = snapshot;
    }

    pub fn registrations(&self) -> Vec<JobRegistration> {
        self.state.lock().registrations.clone()
    }

    /// Poll until at least `count` registrations arrived (gives up after 5s)
    pub async fn wait_for_registrations(&self, count: usize) -> Vec<JobRegistration> {
        for _ in 0..500 {
            let received = self.registrations();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.registrations()
    }
}

impl Drop for MockDaemon {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn accept_registrations(listener: UnixListener, state: Arc<Mutex<Canned>>) {
    while let Ok((stream, _)) = listener.accept().await {
        let frame = match read_frame(stream).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[mock] registration read failed: {e}");
                continue;
            }
        };
        match decode_line::<JobRegistration>(&frame) {
            Ok(job) => {
                debug!("[mock] registered pgid {}", job.pgid);
                state.lock().registrations.push(job);
            }
            Err(e) => warn!("[mock] malformed registration: {e}"),
        }
    }
}

async fn accept_queries(listener: UnixListener, state: Arc<Mutex<Canned>>) {
    while let Ok((stream, _)) = listener.accept().await {
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = answer_query(stream, state).await {
                warn!("[mock] query failed: {e}");
            }
        });
    }
}

async fn answer_query(mut stream: UnixStream, state: Arc<Mutex<Canned>>) -> Result<(), crate::ClientError> {
    let frame = read_frame(&mut stream).await?;
    let request: QueryRequest = decode_line(&frame)?;
    let answer = {
        let canned = state.lock();
        let value = match request.metric_kind() {
            Some(MetricKind::Cpu) => serde_json::to_value(&canned.cpu),
            Some(MetricKind::Gpu) => serde_json::to_value(&canned.gpu),
            None => serde_json::to_value(QueryError::unknown_type()),
        };
        value.map_err(crate::ContractError::from)?
    };
    write_frame(&mut stream, &answer).await
}
