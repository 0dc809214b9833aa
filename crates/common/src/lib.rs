//! Common types shared across the meeting signaling workspace.

#![warn(clippy::pedantic)]

/// Meeting, user, role and media vocabulary
pub mod types;

/// Secret types that prevent accidental logging
pub mod secret;
