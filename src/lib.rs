pub mod config;
pub mod demo;
pub mod interrupt;
pub mod s3;

pub use config::Config;
pub use demo::{DemoOptions, Walkthrough, WalkthroughReport};
