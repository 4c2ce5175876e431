//! Firebox CLI - build container images into microVM artifacts and boot them.

pub mod commands;
pub mod output;
