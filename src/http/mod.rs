// HTTP 传输模块

pub mod client;

pub use client::{file_name_from_url, HttpClient, MAX_TEXT_SIZE};
