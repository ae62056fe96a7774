//! Core authentication-and-dispatch engine for the Secure Shell Bot.
//!
//! This crate is intentionally transport-agnostic. Telegram lives behind the
//! `ReplySink` port implemented in the adapter crate; the engine only sees
//! inbound `{identity, chat, text}` envelopes and pushes text chunks back out.

pub mod audit;
pub mod auth;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod executor;
pub mod formatting;
pub mod logging;
pub mod messaging;
pub mod policy;
pub mod session;

pub use errors::{Error, Result};
