//! HTTP API Module
//!
//! JSON façade over the text protocol, proxied to the effective
//! leader's client port.

mod http;

pub use http::HttpServer;
