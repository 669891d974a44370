//! Reusable build tasks for Cargo, Docker, Helm and Python projects, plus distribution archives.
//!
//! A [`task::Project`] holds tasks registered by factory functions such as
//! [`cargo::cargo_build`] or [`docker::build_docker_image`]. Tasks expose typed
//! [`property::Property`] values; reading another task's property makes the reader depend on it.
//! [`execution::TaskRunner`] runs a selection of tasks in dependency order.

pub mod cargo;
pub mod cli;
pub mod dist;
pub mod docker;
pub mod error;
pub mod execution;
pub mod fs;
pub mod generic;
pub mod git;
pub mod helm;
pub mod output;
pub mod property;
pub mod python;
pub mod task;
pub mod util;
