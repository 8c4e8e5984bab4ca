pub mod accounting;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod correlation;
pub mod error;
pub mod persist;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod thresholds;

pub use accounting::{TokenAccountant, TokenStats};
pub use config::ScanConfig;
pub use control::OperationController;
pub use coordinator::{ScanCoordinator, ScanProgress, ScanStatus, Snapshot};
pub use correlation::{
    Correlation, CorrelationAnalyzer, CorrelationProgress, CorrelationStatus, CorrelationType,
};
pub use error::{
    HearthscanError, Result, StorageError, TransportError, ValidationError,
};
pub use persist::{
    MemoryMonitoring, MemoryStorage, MonitorFilter, MonitorStatus, MonitoringBackend,
    ResultsEnvelope, RunSummary, StorageBackend,
};
pub use store::{
    CategoryFilter, EntityCategory, EntityRecord, ManagementType, OverrideRecord, ResultStore,
};
pub use stream::{
    CorrelationSeed, Envelope, OutboundRequest, ProgressStream, ScanMode, ScanTransport,
    StreamEvent, StreamHandle,
};
pub use thresholds::{
    AlertLevel, AlertThresholdManager, ResolvedThreshold, Severity, Threshold, ThresholdOperator,
    ThresholdValue,
};
