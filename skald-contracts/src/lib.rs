/*!
# Skald Contracts - Shared wire format and socket client

Library shared by the daemon (`skald-kernel`) and the CLI (`skald-agent`):
- JSON messages for registration and queries
- Newline framing helpers and an async Unix socket client
- A mock daemon for testing clients without the real kernel
*/

pub mod messages;
pub mod client;
pub mod mock_daemon;

pub use client::{notify, query_cpu, query_gpu, query_raw, ClientError};
pub use messages::{
    ContractError, CpuSnapshot, CpuSummary, GpuSnapshot, GpuSummary, JobRegistration, MetricKind,
    Pgid, Pid, QueryError, QueryRequest,
};
pub use mock_daemon::MockDaemon;
