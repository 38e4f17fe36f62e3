//! HTTP API: service wiring, queue dashboard and health.

pub mod app;
