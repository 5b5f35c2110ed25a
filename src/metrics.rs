//! Metric names emitted by the engine. Recorded through the `metrics`
//! facade; the binary installs an exporter, tests run without one.

pub const METRIC_PRIVATE_TX_RECEIVED: &str = "ptx_private_transactions_received_total";
pub const METRIC_PRIVATE_TX_DISPATCHED: &str = "ptx_private_transactions_dispatched_total";
pub const METRIC_PRIVATE_TX_REVERTED: &str = "ptx_private_transactions_reverted_total";
pub const METRIC_PRIVATE_TX_DELEGATED: &str = "ptx_private_transactions_delegated_total";
pub const METRIC_SEQUENCERS_ACTIVE: &str = "ptx_sequencers_active";
pub const METRIC_ASSEMBLY_SECONDS: &str = "ptx_assembly_duration_seconds";
pub const METRIC_ENDORSEMENT_REQUESTS: &str = "ptx_endorsement_requests_total";
pub const METRIC_ENDORSEMENT_TIMEOUTS: &str = "ptx_endorsement_timeouts_total";
pub const METRIC_PUBLIC_TX_SUBMITTED: &str = "ptx_public_transactions_submitted_total";
pub const METRIC_PUBLIC_TX_RESUBMITTED: &str = "ptx_public_transactions_resubmitted_total";
pub const METRIC_PUBLIC_TX_CONFIRMED: &str = "ptx_public_transactions_confirmed_total";
pub const METRIC_PUBLIC_TX_REJECTED: &str = "ptx_public_transactions_rejected_total";
pub const METRIC_ORCHESTRATORS_ACTIVE: &str = "ptx_orchestrators_active";
pub const METRIC_NONCE_ROLLBACKS: &str = "ptx_nonce_rollbacks_total";
pub const METRIC_CONTENTION_RESOLUTIONS: &str = "ptx_contention_resolutions_total";
pub const METRIC_TRANSPORT_FRAMES_SENT: &str = "ptx_transport_frames_sent_total";
pub const METRIC_TRANSPORT_FRAMES_RECEIVED: &str = "ptx_transport_frames_received_total";
