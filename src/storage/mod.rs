//! Дисковое хранилище

pub mod history;

pub use history::{HistoryInfo, HistoryMessage, HistoryStore};
