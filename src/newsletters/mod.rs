//! Newsletter reader surface: entity tables, their filter schemas, and the
//! cached client the CLI drives.

mod client;
pub mod schema;

pub use client::{ClientOptions, NewsletterClient, QUEUE_ID};
