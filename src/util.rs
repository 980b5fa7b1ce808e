//! Shared utility modules used across shard components.

pub mod close;
pub mod shutdown;
pub mod wait_group;
