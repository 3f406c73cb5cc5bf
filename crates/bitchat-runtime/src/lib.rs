//! BitChat runtime engine.
//!
//! `bitchat-core` defines the protocol's wire formats, cryptography, and
//! state machines as pure, transport-agnostic types. This crate wires them
//! together into a running mesh node: the [`dispatcher::Dispatcher`] task
//! pumps packets between the application and any number of [`Link`]s,
//! [`builder::RuntimeBuilder`] assembles one, and [`events`] carries the
//! command/event contract the application speaks to it over.

pub mod dispatcher;
pub mod events;
pub mod builder;
pub mod logger;

pub use builder::{RuntimeBuilder, RuntimeHandle};
pub use dispatcher::Dispatcher;
pub use events::{AppEvent, ChannelInfo, Command};
pub use logger::{ConsoleLogger, LogLevel, LoggerWrapper, NoOpLogger, TaskId, TaskLogger};

pub use bitchat_core::link::Link;
