//! Channel relay - watches source channels and forwards new, non-duplicate
//! media posts to destination channels.
//!
//! This library provides the ingestion, deduplication, and forwarding
//! pipeline; the platform client, caption pipeline, and moderation sink plug
//! in through the traits in [`transport`].

pub mod assembler;
pub mod config;
pub mod dedup;
pub mod forwarder;
pub mod persistence;
pub mod poller;
pub mod processor;
pub mod queue;
pub mod relay;
pub mod retry;
pub mod transport;
pub mod types;
pub mod worker;
