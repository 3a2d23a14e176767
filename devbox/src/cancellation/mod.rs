//! Cancellation and supervised background tasks.
//!
//! The pipeline checks a [`CancellationToken`] between stages. Bring-up
//! registers its daemons and the network watcher with a [`Supervisor`] so
//! teardown can stop them and wait for them at one point.

mod supervisor;
mod token;

pub use supervisor::{ShutdownReport, Supervisor};
pub use token::CancellationToken;
