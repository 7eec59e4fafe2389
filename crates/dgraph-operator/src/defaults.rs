//! Well-known names, ports and timings shared across the operator

use std::time::Duration;

/// Name used for the `app.kubernetes.io/managed-by` label and field manager
pub const OPERATOR_NAME: &str = "dgraph-operator";

pub const ZERO_MEMBER_NAME: &str = "zero";
pub const ALPHA_MEMBER_NAME: &str = "alpha";
pub const RATEL_MEMBER_NAME: &str = "ratel";

/// Suffix appended to a member name for its headless service
pub const HEADLESS_SERVICE_SUFFIX: &str = "headless";

/// Delimiter used when building Kubernetes object names
pub const K8S_DELIMITER: &str = "-";

pub const ZERO_GRPC_PORT_NAME: &str = "zero-grpc";
pub const ZERO_GRPC_PORT: i32 = 5080;
pub const ZERO_HTTP_PORT_NAME: &str = "zero-http";
pub const ZERO_HTTP_PORT: i32 = 6080;

pub const ALPHA_INTERNAL_PORT_NAME: &str = "alpha-grpc-int";
pub const ALPHA_INTERNAL_PORT: i32 = 7080;
pub const ALPHA_HTTP_PORT_NAME: &str = "alpha-http";
pub const ALPHA_HTTP_PORT: i32 = 8080;
pub const ALPHA_GRPC_PORT_NAME: &str = "alpha-grpc";
pub const ALPHA_GRPC_PORT: i32 = 9080;

pub const RATEL_PORT_NAME: &str = "ratel-http";
pub const RATEL_PORT: i32 = 8000;

/// Mount path of the zero data volume
pub const ZERO_VOLUME_MOUNT_PATH: &str = "/dgraph";
/// Mount path of the alpha data volume
pub const ALPHA_VOLUME_MOUNT_PATH: &str = "/dgraph";

/// Default `--lru_mb` passed to alpha
pub const LRU_MB_VALUE: i32 = 2048;
/// Smallest `--lru_mb` alpha accepts
pub const MIN_LRU_MB_VALUE: i32 = 1024;

pub const DEFAULT_BASE_IMAGE: &str = "dgraph/dgraph";

pub const POD_ANTI_AFFINITY_WEIGHT: i32 = 100;
pub const POD_ANTI_AFFINITY_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Interval between readiness polls of the custom resource definition
pub const CRD_WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Overall bound on the custom resource definition readiness wait
pub const CRD_WAIT_TIMEOUT: Duration = Duration::from_secs(20);
/// Period after which every cached cluster is reconciled again
pub const RESYNC_PERIOD: Duration = Duration::from_secs(30);
/// Requeue delay after the first failed reconciliation of a cluster
pub const ERROR_REQUEUE_BASE: Duration = Duration::from_millis(5);
/// Upper bound of the failure requeue delay
pub const ERROR_REQUEUE_MAX: Duration = Duration::from_secs(1000);

pub const LEASE_LOCK_NAME: &str = "dgraph-io-controller-manager";
pub const LEASE_DURATION: Duration = Duration::from_secs(15);
pub const RENEW_DEADLINE: Duration = Duration::from_secs(5);
pub const RETRY_PERIOD: Duration = Duration::from_secs(3);

pub const OPERATOR_HOST: &str = "0.0.0.0";
pub const OPERATOR_PORT: u16 = 7777;

pub const DEFAULT_WORKERS: usize = 2;
