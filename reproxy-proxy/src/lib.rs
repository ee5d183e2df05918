pub mod basic_auth;
pub mod connection;
pub mod dispatch;
pub mod error_reporter;
pub mod gzip;
pub mod headers;
pub mod health_endpoint;
pub mod ip_allow;
pub mod lb;
pub mod limiter;
pub mod proxy;
pub mod static_files;
pub mod tls_listener;
pub mod worker;
