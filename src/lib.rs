pub mod api;
pub mod config;
pub mod debounce;
pub mod error;
pub mod history;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod relay;
pub mod retry;
pub mod router;
pub mod tracker;
pub mod worker;
