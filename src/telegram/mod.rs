mod handler;
mod types;
mod utils;

pub use handler::TelegramService;
