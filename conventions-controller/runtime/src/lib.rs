#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admission;
mod args;
mod catalog;
mod lease;
mod metrics;
mod reconciler;
mod tracker;
mod validation;

pub use self::admission::Admission;
pub use self::args::Args;
pub use self::reconciler::{error_policy, reconcile, Context, Error};
pub use self::tracker::Tracker;
