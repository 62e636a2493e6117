pub mod logger;
pub mod config;
pub mod clock;
pub mod error;
pub mod hardware;
pub mod edid;
pub mod identity;
pub mod availability;
pub mod observable;
pub mod outbox;
pub mod store;
pub mod locks;
pub mod directory;
pub mod persist;
pub mod debug_report;

pub use availability::AvailabilityTracker;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, StoreSettings, SyncConfig};
pub use debug_report::DebugReport;
pub use directory::{MonitorDirectory, MonitorInfo};
pub use error::{DirectoryError, ErrorEvent, ErrorKind, HardwareError};
pub use hardware::{
    CorrelationData, DisplayBackend, FeatureValue, HandleToken, OrdinalMapping, OsCorrelation,
    PhysicalDisplayHandle, RegistryEdidEntry, VcpFeature,
};
pub use identity::{IdentityResolver, ResolvedMonitor, TestedMonitor};
pub use locks::LockRegistry;
pub use observable::{EventBus, Watch};
pub use outbox::{WriteOutbox, WriteRequest};
pub use persist::KnownMonitorStore;
pub use store::ReconciliationStore;
