//! Execution Timeline
//!
//! Records instance and step transitions with clock timestamps for
//! per-instance reports and Gantt-style charts.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::state::{ExecutionStatus, InstanceStatus, WorkflowExecution, WorkflowInstance};

/// Subject name used for instance-level events.
pub const INSTANCE_SUBJECT: &str = "instance";

/// Type of timeline event.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Created,
    Started,
    WaitingApproval,
    Completed,
    Failed,
    Skipped,
    Retried,
    Cancelled,
    TimedOut,
}

impl EventType {
    /// Whether the event closes a step's active period.
    fn ends_step(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled | Self::TimedOut
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::WaitingApproval => "waiting for approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Retried => "retried",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed out",
        };
        write!(f, "{}", name)
    }
}

/// A single event in the execution timeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TimelineEvent {
    /// Step name, or [`INSTANCE_SUBJECT`]
    pub subject: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Transition log of one workflow instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionTimeline {
    pub instance_id: Uuid,
    events: Vec<TimelineEvent>,
}

impl ExecutionTimeline {
    pub fn new(instance_id: Uuid) -> Self {
        Self {
            instance_id,
            events: Vec::new(),
        }
    }

    /// Reconstructs a coarse timeline from stored timestamps.
    ///
    /// Used for instances whose live events were not recorded by this
    /// process, e.g. after loading a state file.
    pub fn from_records(instance: &WorkflowInstance, executions: &[WorkflowExecution]) -> Self {
        let mut timeline = Self::new(instance.id);
        timeline.add_event(INSTANCE_SUBJECT, EventType::Created, instance.created_at, None);
        if let Some(at) = instance.started_at {
            timeline.add_event(INSTANCE_SUBJECT, EventType::Started, at, None);
        }

        for execution in executions {
            if let Some(at) = execution.started_at {
                timeline.add_event(&execution.step_name, EventType::Started, at, None);
            }
            let closing = match execution.status {
                ExecutionStatus::Completed => Some(EventType::Completed),
                ExecutionStatus::Failed => Some(EventType::Failed),
                ExecutionStatus::Skipped => Some(EventType::Skipped),
                _ => None,
            };
            match (closing, execution.completed_at) {
                (Some(event), Some(at)) => {
                    timeline.add_event(&execution.step_name, event, at, execution.error_message.clone())
                }
                _ if execution.status == ExecutionStatus::WaitingApproval => timeline.add_event(
                    &execution.step_name,
                    EventType::WaitingApproval,
                    execution.updated_at,
                    None,
                ),
                _ => {}
            }
        }

        if let Some(at) = instance.completed_at {
            let event = match instance.status {
                InstanceStatus::Completed => EventType::Completed,
                InstanceStatus::Cancelled => EventType::Cancelled,
                InstanceStatus::Timeout => EventType::TimedOut,
                _ => EventType::Failed,
            };
            timeline.add_event(INSTANCE_SUBJECT, event, at, instance.error_message.clone());
        }

        timeline.events.sort_by_key(|e| e.timestamp);
        timeline
    }

    /// Records an event.
    pub fn add_event(
        &mut self,
        subject: &str,
        event_type: EventType,
        timestamp: DateTime<Utc>,
        detail: Option<String>,
    ) {
        self.events.push(TimelineEvent {
            subject: subject.to_string(),
            event_type,
            timestamp,
            detail,
        });
    }

    /// Returns all recorded events.
    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Time between the first and last event.
    pub fn elapsed(&self) -> Duration {
        match (self.events.first(), self.events.last()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => Duration::zero(),
        }
    }

    /// Step durations from first start to last closing event.
    pub fn durations(&self) -> BTreeMap<String, Duration> {
        self.spans()
            .into_iter()
            .filter_map(|(step, (start, end))| end.map(|end| (step, end - start)))
            .collect()
    }

    fn spans(&self) -> BTreeMap<String, (DateTime<Utc>, Option<DateTime<Utc>>)> {
        let mut spans: BTreeMap<String, (DateTime<Utc>, Option<DateTime<Utc>>)> = BTreeMap::new();
        for event in self.events.iter().filter(|e| e.subject != INSTANCE_SUBJECT) {
            if event.event_type == EventType::Started {
                spans.entry(event.subject.clone()).or_insert((event.timestamp, None));
            } else if event.event_type.ends_step() {
                spans
                    .entry(event.subject.clone())
                    .or_insert((event.timestamp, None))
                    .1 = Some(event.timestamp);
            }
        }
        spans
    }

    /// Renders the event log followed by an ASCII chart of step spans.
    pub fn summary(&self) -> String {
        let mut output = format!("Timeline for instance {}\n\n", self.instance_id);

        for event in &self.events {
            output.push_str(&format!(
                "  {}  {:24} {}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                truncate(&event.subject, 24),
                event.event_type
            ));
            if let Some(detail) = &event.detail {
                output.push_str(&format!(" ({})", detail));
            }
            output.push('\n');
        }

        let Some(origin) = self.events.first().map(|e| e.timestamp) else {
            return output;
        };
        let total_ms = self.elapsed().num_milliseconds();
        output.push('\n');

        // Scale to 40 characters width
        let scale = if total_ms > 0 { 40.0 / total_ms as f64 } else { 0.0 };

        let mut spans: Vec<_> = self.spans().into_iter().collect();
        spans.sort_by_key(|(_, (start, _))| *start);

        for (step, (start, end)) in spans {
            let offset = ((start - origin).num_milliseconds() as f64 * scale) as usize;
            let (width, label) = match end {
                Some(end) => {
                    let span = end - start;
                    (
                        ((span.num_milliseconds() as f64 * scale) as usize).max(1),
                        format_duration(span),
                    )
                }
                None => (1, "in progress".to_string()),
            };

            output.push_str(&format!(
                "{:24} |{}{}| {}\n",
                truncate(&step, 24),
                " ".repeat(offset),
                "#".repeat(width),
                label
            ));
        }

        output.push_str(&format!("\nTotal: {}\n", format_duration(self.elapsed())));
        output
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{} ms", duration.num_milliseconds())
    }
}

/// Pads or truncates a string to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{StepType, WorkflowDefinition, WorkflowStepDefinition};
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap()
    }

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::new(Uuid::new_v4());
        assert!(timeline.events().is_empty());
        assert_eq!(timeline.elapsed(), Duration::zero());
    }

    #[test]
    fn test_durations() {
        let mut timeline = ExecutionTimeline::new(Uuid::new_v4());
        timeline.add_event("validate", EventType::Started, at(0), None);
        timeline.add_event("validate", EventType::Completed, at(2), None);
        timeline.add_event("review", EventType::Started, at(2), None);
        timeline.add_event("review", EventType::WaitingApproval, at(2), None);

        let durations = timeline.durations();
        assert_eq!(durations["validate"], Duration::minutes(2));
        // Still waiting, no closing event yet
        assert!(!durations.contains_key("review"));
    }

    #[test]
    fn test_instance_events_excluded_from_durations() {
        let mut timeline = ExecutionTimeline::new(Uuid::new_v4());
        timeline.add_event(INSTANCE_SUBJECT, EventType::Started, at(0), None);
        timeline.add_event(INSTANCE_SUBJECT, EventType::Completed, at(5), None);
        assert!(timeline.durations().is_empty());
        assert_eq!(timeline.elapsed(), Duration::minutes(5));
    }

    #[test]
    fn test_summary_rendering() {
        let mut timeline = ExecutionTimeline::new(Uuid::new_v4());
        timeline.add_event("validate", EventType::Started, at(0), None);
        timeline.add_event("validate", EventType::Completed, at(1), None);
        timeline.add_event("provision", EventType::Started, at(1), None);
        timeline.add_event("provision", EventType::Failed, at(3), Some("502".to_string()));

        let summary = timeline.summary();
        assert!(summary.contains("validate"));
        assert!(summary.contains("failed (502)"));
        assert!(summary.contains("2m 0s"));
        assert!(summary.contains("Total: 3m 0s"));
    }

    #[test]
    fn test_from_records() {
        let step = WorkflowStepDefinition::new("validate", 1, StepType::Automatic);
        let def = WorkflowDefinition::new("onboarding", 1).with_step(step.clone());

        let mut instance = WorkflowInstance::new(&def, "Staff", "42", at(0));
        instance.started_at = Some(at(0));
        instance.transition(InstanceStatus::Running, at(0)).unwrap();
        instance.transition(InstanceStatus::Completed, at(4)).unwrap();

        let mut exec = WorkflowExecution::new(instance.id, &step, at(0));
        exec.transition(ExecutionStatus::Running, at(1)).unwrap();
        exec.started_at = Some(at(1));
        exec.transition(ExecutionStatus::Completed, at(3)).unwrap();

        let timeline = ExecutionTimeline::from_records(&instance, &[exec]);
        assert_eq!(timeline.events().len(), 5);
        assert_eq!(timeline.durations()["validate"], Duration::minutes(2));
        assert_eq!(timeline.events().last().unwrap().event_type, EventType::Completed);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc  ");
        assert_eq!(truncate("clinic-admin-review", 10), "clinic-...");
    }
}
