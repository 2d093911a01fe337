//! Proxy auto-config generation and serving.

mod handler;
mod render;

pub use handler::PacHandler;
pub use render::{PLACEHOLDER_HOST, default_template, render, rewrite_placeholder};
