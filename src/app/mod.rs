pub mod adb;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod error;
pub mod history;
pub mod logging;
pub mod models;
pub mod observable;
pub mod output;
pub mod pairing;
pub mod session;
pub mod store;
pub mod transport;
