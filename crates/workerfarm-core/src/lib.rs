mod error;
mod ids;
mod log;

pub use error::{FarmError, RemoteError, RemoteErrorKind, Result};
pub use ids::{CallId, Generation, IdAllocator, WorkerId};
pub use log::{LogBus, LogEvent, LogLevel, LogSource, StdStream, Subscription};
