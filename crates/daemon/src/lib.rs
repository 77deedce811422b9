pub mod lock;
pub mod search;
pub mod supervisor;

pub use lock::{InstanceLock, LockError};
pub use search::{GroupedResult, SearchError, SearchService};
pub use supervisor::{Daemon, Stage, StartupReport, Stats, SupervisorError};
