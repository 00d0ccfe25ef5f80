pub mod allocator;
pub mod cloud;
pub mod config;
pub mod controller;
pub mod error;
pub mod http_api;
pub mod models;
pub mod reconciler;
pub mod registry;
pub mod worker;
