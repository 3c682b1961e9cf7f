//! Core types and wire protocol for ghostly-session.
//!
//! This crate holds everything shared between the session daemon and the
//! attach client: the framed socket protocol, session-name validation,
//! and the session record surfaced by `list`.

pub mod error;
pub mod protocol;
pub mod session;
