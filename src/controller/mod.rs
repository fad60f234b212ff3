pub mod apply;
pub mod breaking;
pub mod context;
pub mod error;
pub mod manifest;
pub mod reconciler;
pub mod status;
pub mod validation;

pub use apply::FIELD_MANAGER;
pub use context::Context;
pub use error::{Backoff, Error, Result, RetryLedger};
pub use reconciler::{error_policy, reconcile, FINALIZER};
