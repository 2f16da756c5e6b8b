//! # Skiff – SSH
//!
//! Pooled, reference-counted SSH transports and interactive pty sessions.

pub mod ssh;
