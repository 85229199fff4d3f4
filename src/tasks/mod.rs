pub mod controller;
pub mod error;
pub mod polling;
pub mod scheduler;
pub mod store;

pub use controller::QueueController;
pub use error::QueueError;
pub use store::QueueStore;
