pub mod error;
pub mod messenger;
pub mod mock;

pub use error::MessengerError;
pub use messenger::{EditOutcome, Messenger};
pub use mock::MockMessenger;
