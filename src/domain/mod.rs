pub mod characteristic;
pub mod context;
mod discovery;
pub mod models;
pub mod peripheral;
pub mod service;
pub mod settings;
