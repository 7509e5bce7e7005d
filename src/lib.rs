//! Session-scoped security layer: session lifecycle, per-session field
//! encryption and partitioned brute-force throttling over a shared cache.

pub mod app;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod state;
pub mod throttling;

pub mod crypto {
    pub mod aes;
    pub mod compare;
    pub mod envelope;
    pub mod keys;
}

pub mod models {
    pub mod session;
    pub mod throttle;
}

pub mod sessions {
    pub mod service;
    pub mod store;
}

pub mod services {
    pub mod auth;
    pub mod credentials;
}

pub mod handlers {
    pub mod session;
}

pub mod middleware_layer {
    pub mod auth;
}

pub use config::Config;
pub use error::{AppError, Result};
pub use state::AppState;
