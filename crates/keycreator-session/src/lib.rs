//! Provisioning session and maintenance routines.
//!
//! [`SessionCoordinator`] runs the place, detect, write, verify, register
//! loop for one transponder configuration. [`Maintenance`] formats and
//! inspects keys on the same reader; the two meet at a shared
//! [`Coordination`], which parks the loop while a maintenance routine holds
//! the reader.
//!
//! ```text
//!  SessionCoordinator ──┐                      ┌── Maintenance::format
//!        (loop)         ├── Coordination ──────┤
//!                       │  Idle|Formatting|    └── Maintenance::inspect
//!                       │  Reading
//!                       └── SessionHandle: cancel, stop, forget(uid)
//! ```

pub mod allocator;
pub mod context;
pub mod coordination;
pub mod coordinator;
pub mod maintenance;
pub mod state_machine;

pub use allocator::{NUMBER_RANGES, NumberAllocator, NumberRange, NumberWindow};
pub use context::{JudgedTag, SessionContext, Verdict};
pub use coordination::{Activity, Coordination, MaintenanceGuard};
pub use coordinator::{SessionCoordinator, SessionHandle, TokenOutcome};
pub use maintenance::{FormatReport, Maintenance, Reading, TagInspection};
pub use state_machine::{SessionState, StateMachine, StateTransition};
