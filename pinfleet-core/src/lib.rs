//! Pinfleet Core - Fleet coordination and integrity for a marketplace of
//! independent storage provider nodes.

pub mod config;
pub mod error;
pub mod failover;
pub mod integrity;
pub mod jobs;
pub mod link;
pub mod merkle;
pub mod node;
pub mod persistence;
pub mod probe;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod storage;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{
    FleetConfig, HealthMonitorConfig, IntegrityConfig, JobQueueConfig, ProviderConfig,
    RouterConfig,
};
pub use error::{FleetError, Result};
pub use failover::{
    FailoverEvent, FailoverManager, FailoverStatus, RecoveryEvent, RepinResult, SweepReport,
};
pub use integrity::{
    required_replicas, AlertEvent, AlertSeverity, IntegrityVerifier, MonitorSummary, NodePresence,
    RedundancyIssue, RedundancyReport, RepairEvent, RepairOutcome, ReplicationAudit,
};
pub use jobs::{
    CompletionBoard, CompletionResult, Job, JobExecutor, JobQueue, JobSpec, JobStatus, JobType,
};
pub use link::{LinkChannel, LinkEvent, LinkHandle, LinkTransport, ProviderLink};
pub use merkle::{merkle_root, merkle_root_hex, MERKLE_CHUNK_SIZE};
pub use node::{NodeRecord, NodeStatus, NodeTarget};
pub use persistence::{FleetEvent, FleetStore, SqliteFleetStore, RECORD_SCHEMA_VERSION};
pub use probe::{HealthProbe, ProbeReport};
pub use protocol::{
    CapacityPayload, CapacityRequestPayload, ContractAckPayload, ContractFailedPayload,
    GoingOfflinePayload, Heartbeat, PaymentReceivedPayload, PinAckPayload, PinFailedPayload,
    PinRequestPayload, RegisterPayload, StorageJobPayload, WelcomePayload, WireMessage,
    CLOSE_POLICY_VIOLATION,
};
pub use registry::{
    ContractRecord, PingRoundReport, ProviderRegistry, ProviderSink, ProviderStatus,
    ProviderSummary, RoutedWork,
};
pub use router::ClusterRequestRouter;
pub use storage::{HttpStorageNodeClient, StorageNodeClient};
