//! Bridge to the native communication daemon.
//!
//! [`SignalHub`] owns the daemon's single handler registration and fans
//! signals out to subscribers. [`DaemonBridge`] turns fire-and-forget native
//! actions into awaitable requests on top of it.

pub mod correlator;
pub mod daemon;
pub mod demux;
pub mod error;
pub mod loopback;

pub use correlator::{BridgeConfig, DaemonBridge, NameLookup};
pub use daemon::{AccountDetails, HandlerTable, NativeDaemon, RawArgs};
pub use demux::{SignalHub, SignalStream, Subscription};
pub use error::{BridgeError, DaemonError};
pub use loopback::LoopbackDaemon;
