pub mod directories;
pub mod logging;
pub mod notifier;
pub mod trigger;
