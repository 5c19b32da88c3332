use std::time::Duration;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The namespace reconciled when none is configured.
pub const DEFAULT_NAMESPACE: &str = "default";

/// The container image used when neither spec nor template names one.
pub const DEFAULT_IMAGE: &str = "python:3.12-slim";

/// Minutes until a sandbox is unconditionally terminated, absent an override.
pub const DEFAULT_TTL_MINUTES: u32 = 120;

/// Interval between reconcile sweeps for each resource kind.
///
/// This is the documented staleness bound of the controller: phase promotions,
/// TTL expiry and pool replenishment converge within one interval.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Total budget for a blocking wait-until-running call.
pub const DEFAULT_READY_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Poll interval inside a wait-until-running call.
pub const DEFAULT_READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Total budget for a single remote command execution.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(300);

/// How long in-flight reconciliations get to drain after a shutdown signal.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

/// Attempts a claim makes before surfacing a conflict.
pub const DEFAULT_CLAIM_ATTEMPTS: u32 = 3;

/// Attempts for transient store failures under bounded backoff.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for bounded-backoff retries; doubles per attempt.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Default CPU limit for a sandbox container.
pub const DEFAULT_CPU_LIMIT: &str = "1";

/// Default memory limit for a sandbox container.
pub const DEFAULT_MEMORY_LIMIT: &str = "2Gi";

/// Default CPU request for a sandbox container.
pub const DEFAULT_CPU_REQUEST: &str = "100m";

/// Default memory request for a sandbox container.
pub const DEFAULT_MEMORY_REQUEST: &str = "256Mi";

/// Page size used when listing resources with pagination tokens.
pub const LIST_PAGE_SIZE: u32 = 500;

/// Length of the random hex suffix on pool member names.
pub const POOL_SUFFIX_LEN: usize = 8;

/// Length of the random hex suffix on generated sandbox names.
pub const SANDBOX_SUFFIX_LEN: usize = 12;
