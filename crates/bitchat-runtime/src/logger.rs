//! Task-to-task tracing for the dispatcher loop.
//!
//! Every command/event/effect that crosses the dispatcher is logged through
//! a `LoggerWrapper` so a CLI binding can wire up console output while tests
//! stay silent. Kept as an enum rather than `Box<dyn Trait>` for object
//! safety across the `'static` bound tokio tasks need.

use std::fmt::Debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskId {
    Dispatcher,
    Link,
    Application,
}

pub trait TaskLogger: Debug {
    fn log_message(&self, from: TaskId, to: TaskId, label: &str);
    fn log_task_event(&self, task_id: TaskId, level: LogLevel, message: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleLogger;

impl TaskLogger for ConsoleLogger {
    fn log_message(&self, from: TaskId, to: TaskId, label: &str) {
        tracing::debug!(?from, ?to, label, "dispatcher message");
    }

    fn log_task_event(&self, task_id: TaskId, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(?task_id, message),
            LogLevel::Info => tracing::info!(?task_id, message),
            LogLevel::Warn => tracing::warn!(?task_id, message),
            LogLevel::Error => tracing::error!(?task_id, message),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpLogger;

impl TaskLogger for NoOpLogger {
    fn log_message(&self, _from: TaskId, _to: TaskId, _label: &str) {}
    fn log_task_event(&self, _task_id: TaskId, _level: LogLevel, _message: &str) {}
}

#[derive(Debug, Clone, Copy)]
pub enum LoggerWrapper {
    Console(ConsoleLogger),
    NoOp(NoOpLogger),
}

impl LoggerWrapper {
    pub fn log_message(&self, from: TaskId, to: TaskId, label: &str) {
        match self {
            LoggerWrapper::Console(logger) => logger.log_message(from, to, label),
            LoggerWrapper::NoOp(logger) => logger.log_message(from, to, label),
        }
    }

    pub fn log_task_event(&self, task_id: TaskId, level: LogLevel, message: &str) {
        match self {
            LoggerWrapper::Console(logger) => logger.log_task_event(task_id, level, message),
            LoggerWrapper::NoOp(logger) => logger.log_task_event(task_id, level, message),
        }
    }
}
