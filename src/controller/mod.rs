pub mod bootstrap;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod membership;
pub mod reconciler;
pub mod retry;
pub mod state_machine;
pub mod status;
pub mod users;

pub use context::{Collaborators, Context};
pub use dispatch::{Event, dispatch, run_dispatcher};
pub use error::{Error, Handled, Result, Retry};
pub use membership::{MembershipError, UnitId, desired_hosts, resolve};
pub use reconciler::{ReconcileOutcome, ReconcilePlan, Trigger, reconcile};
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
pub use state_machine::{MemberEvent, MemberState, MemberStateMachine};
pub use status::{UnitStatus, project};
