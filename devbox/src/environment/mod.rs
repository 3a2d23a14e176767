//! The environment descriptor stages append to.
//!
//! Stages contribute [`EnvFragment`]s. The descriptor keeps them in append
//! order and resolves them into a single map where a later definition of a
//! key shadows an earlier one. It is persisted as a shell-sourceable file of
//! `export` lines so processes outside devbox can use it too.

mod descriptor;
mod file;
mod fragment;

pub use descriptor::{EnvironmentDescriptor, ResolvedEnv};
pub use file::{parse as parse_descriptor, DescriptorFile};
pub use fragment::{is_valid_key, EnvFragment};
