pub mod server_service;

pub use server_service::*;
