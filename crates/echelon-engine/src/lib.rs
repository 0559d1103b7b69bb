//! Run orchestration: hierarchy execution, event fan-out, and run
//! lifecycle control.

pub mod bus;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod invoker;
pub mod prompt;
pub mod tracker;

pub use bus::{spawn_retention_sweeper, EventBus, EVENT_CAP, EVENT_RETENTION};
pub use controller::RunController;
pub use dispatch::{Dispatcher, RunContext};
pub use error::EngineError;
pub use invoker::{DispatchSink, Invoker, SupervisorCall};
pub use tracker::{CallOutcome, ExecutionTracker, Reservation};
