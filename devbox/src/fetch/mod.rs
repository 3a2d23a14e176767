//! Resilient downloads and archive extraction.
//!
//! A [`ResilientFetcher`] holds an ordered chain of [`FetchStrategy`]s. The
//! first strategy whose tool is installed performs the whole download; its
//! failure is the fetch's failure unless `fall_through` is enabled. A run
//! that reports success but leaves no file is treated as a failure, and no
//! partial file is left behind when a fetch fails.

mod archive;
mod fetcher;
mod strategy;

pub use archive::{default_extract_dir, extract_archive, ArchiveKind};
pub use fetcher::{sha256_file, FetchTask, ResilientFetcher};
pub use strategy::{FallbackStrategy, FetchStrategy, ResumingStrategy, SegmentedStrategy};
