//! Container lifecycle tracking and log capture.

mod cgroups;
mod dispatcher;
mod env;
mod follow;
mod lines;

pub use cgroups::{CgroupOverride, SETTLE_DELAY};
pub use dispatcher::Dispatcher;
pub use env::EnvStore;
pub use follow::{FollowSettings, Followers};
