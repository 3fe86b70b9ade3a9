pub mod config;
pub mod controller;

pub use config::{CampaignConfig, find_config_file};
pub use controller::Courier;
