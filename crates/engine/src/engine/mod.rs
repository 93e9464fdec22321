//! Execution core: scheduling, routing and token bookkeeping
//!
//! ```text
//!   start / resume / signal / timer
//!              │
//!              ▼
//!   ┌─────────────────────┐     ┌──────────────────┐
//!   │ Scheduler::run_step │────▶│ ActivityExecutor │
//!   │  (instance lock)    │◀────│  Completed /     │
//!   └──────────┬──────────┘     │  Suspended /     │
//!              │                │  Faulted         │
//!              ▼                └──────────────────┘
//!   routing ─▶ tokens (fork / join / end)
//!              │
//!              ▼
//!   InstanceStore::save (revision check)
//! ```

mod locks;
mod routing;
mod scheduler;
mod tokens;

pub use locks::{InstanceGuard, InstanceLocks};
pub use scheduler::{
    Scheduler, StepOutcome, StepReport, COMPENSATION_ERROR, LAST_ERROR_VARIABLE,
    POTENTIAL_INFINITE_LOOP,
};

pub(crate) use scheduler::resume_bookmark;
