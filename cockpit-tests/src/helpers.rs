pub mod config_builder;
pub mod fake_health;
pub mod scripted_probe;
pub mod wait_utils;
