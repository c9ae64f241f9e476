pub mod cargo;
pub mod config;
pub mod db;
pub mod docker;
pub mod error;
pub mod http_server;
pub mod installer;
pub mod lifecycle;
pub mod logs;
pub mod models;
pub mod panel;
pub mod template;
pub mod websocket_models;
pub mod ws;
