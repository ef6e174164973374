pub mod action;
pub mod claim;
pub mod clock;
pub mod config;
pub mod cron;
pub mod error;
pub mod handler;
pub mod io;
pub mod paths;
pub mod retry;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod types;

pub use action::{Action, ActionError, CancelOutcome, NewAction, RunTransition};
pub use claim::{Claim, ClaimManager, ClaimRequest};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{HookqError, Result};
pub use handler::{CancelFlag, Handler, HandlerContext, HandlerError, HandlerRegistry, ShellHandler};
pub use retry::RetryPolicy;
pub use runner::{ActionResult, InFlight, RunOutcome, Runner};
pub use schedule::Schedule;
pub use scheduler::{Scheduler, SchedulerOptions, TickReport};
pub use status::{StatusService, StatusSummary};
pub use store::{
    ActionFilter, ActionQuery, ActionStore, MemoryStore, RedbStore, SortColumn, SortOrder,
    StatusCounts,
};
pub use types::{ActionStatus, FailureKind};
