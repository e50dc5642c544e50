pub mod adb;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod discovery;
pub mod download;
pub mod error;
pub mod logging;
pub mod matching;
pub mod models;
pub mod platform;
pub mod remote_command;
pub mod state;
pub mod wireless;
