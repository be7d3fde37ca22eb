//! Streaming chat orchestration for a local Ollama server.
//!
//! [`service::ChatSession`] is the entry point for embedding: it keeps an
//! ordered conversation, streams each reply from the model chunk by chunk,
//! and lets the caller cancel a reply mid-flight. [`routes::router`] exposes
//! a registry of sessions over HTTP and WebSocket.

pub mod agent;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod routes;
pub mod service;
