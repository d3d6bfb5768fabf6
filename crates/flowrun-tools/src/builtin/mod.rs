pub mod data;
pub mod time;
pub mod web_fetch;
