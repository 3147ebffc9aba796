//! Monitoring Module
//!
//! Per-instance transition timelines for reports and charts.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Instance and step transitions with timestamps

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent, INSTANCE_SUBJECT};
