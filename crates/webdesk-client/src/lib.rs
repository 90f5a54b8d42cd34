pub mod channel;
pub mod config;
pub mod desktop;
pub mod error;
pub mod gateway;
pub mod monitor;
pub mod store;
pub mod sync;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use channel::{Channel, ChannelError, ChannelState, ChannelStatus, ReconnectPolicy};
pub use config::{ClientConfig, ConfigError};
pub use desktop::{Desktop, DesktopError, SessionEnd, SessionPhase};
pub use error::{ErrorClass, GatewayError};
pub use gateway::{HttpGateway, MemoryGateway, RecordGateway};
pub use monitor::{MonitorDriver, ProcessMonitor};
pub use store::{NewWindow, StoreSnapshot, Viewport, WindowStore};
pub use sync::{SessionSynchronizer, TaskQueue};

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
