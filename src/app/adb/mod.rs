pub mod apk;
pub mod apps;
pub mod bridge;
pub mod broadcast;
pub mod connection;
pub mod install;
pub mod locator;
pub mod parse;
pub mod platform_tools;
pub mod runner;
