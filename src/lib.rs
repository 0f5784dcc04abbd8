#![doc = "docfeed: adaptive-concurrency document feeding for document-store HTTP APIs."]

//! A feeding session streams document operations (put, update, remove,
//! get) from a JSON array or JSONL input, dispatches them concurrently
//! against the store's document API, and reports a summary. Concurrency
//! is not a fixed worker count: an AIMD throttler grows the in-flight
//! window while the store keeps up and shrinks it sharply on errors or
//! rising latency.
//!
//! # Usage
//! Decode with [`decode::Decoder`], enqueue into a [`dispatch::Dispatcher`]
//! built over a [`client::FeedClient`] and a [`throttle::Throttler`], then
//! `close()` and render [`stats::StatsSnapshot::summary`].

pub mod cli;
pub mod client;
pub mod decode;
pub mod dispatch;
pub mod document;
pub mod feed;
pub mod stats;
pub mod throttle;

pub use client::{ClientOptions, Compression, FeedClient, FeedResult, ReqwestTransport, Transport};
pub use decode::{DecodeError, Decoder};
pub use dispatch::{DispatchError, Dispatcher, DispatcherOptions};
pub use document::{Document, DocumentId, Operation};
pub use feed::{feed, FeedReport};
pub use stats::{Stats, StatsSnapshot};
pub use throttle::{Outcome, Throttler, ThrottlerOptions};
