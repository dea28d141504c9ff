pub mod access;
pub mod batcher;
pub mod commands;
pub mod executor;

pub use access::{AccessChecker, Visitor};
pub use batcher::{ChatEventProcessor, EventBatcher, ProcessorDeps};
pub use commands::{
    ActionProcessor, ChatCommandDispatcher, DefaultActionProcessor, DefaultCommandDispatcher,
    ScreenshotProvider,
};
pub use executor::ChatBatchExecutor;
