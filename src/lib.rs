//! # Sitewise
//!
//! An auto-training retrieval engine. Point it at a website and it builds a
//! per-user knowledge corpus (crawl → clean → chunk → embed → index), then
//! serves answers grounded in that corpus with source citations. When
//! retrieval is disabled or empty it falls back to plain conversational mode.
//!
//! The [`engine::Engine`] facade is the main entry point; external
//! capabilities (text fetch, embedding, generation, persistent store) are
//! trait objects so callers can supply their own providers.

pub mod chunker;
pub mod collection;
pub mod config;
pub mod coordinator;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod generation;
pub mod models;
pub mod orchestrator;
pub mod session;
pub mod store;
