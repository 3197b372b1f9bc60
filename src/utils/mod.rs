pub mod error;
pub mod scheduled_executor;

pub use error::{BadRequestError, TransportError};
pub use scheduled_executor::{ScheduledExecutor, ScheduledTask};
