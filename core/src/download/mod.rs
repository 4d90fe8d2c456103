//! Background downloads of full-resolution wallpapers.

pub mod manager;
pub mod retry;

pub use manager::{
    DownloadConfig, DownloadEvent, DownloadManager, EnqueueError, EventSink, TaskHandle, TaskId,
    TaskState, TaskStatus,
};
pub use retry::{RetryPolicy, Sleeper, ThreadSleeper};
