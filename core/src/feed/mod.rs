//! Catalog feed: query staging, pagination, and merge rules.

pub mod controller;

pub use controller::{
    DEFAULT_DEBOUNCE, FeedConfig, FeedController, FeedError, FeedIntent, FeedState, FetchTicket,
    MergeOutcome,
};
