//! Data layer module
//!
//! Storage collaborators used by the inbox:
//! - Follower store
//! - Received content store (volatile)

mod content;
mod followers;

pub use content::{ContentStore, InMemoryContentStore, ReceivedContent};
pub use followers::{Follower, FollowerStore, InMemoryFollowerStore};

#[cfg(test)]
pub use content::MockContentStore;
