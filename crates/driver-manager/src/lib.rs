pub mod app;
pub mod config;
pub mod driver;
pub mod host;
pub mod k8s;
pub mod labels;
