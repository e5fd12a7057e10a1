use cadence_core::Node;
use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::schedule::{IntervalUnit, Repetition};

/// Name of the child node holding a job's script body.
pub const SCRIPT_NODE: &str = ".lambda";

/// A named, repeating unit of scheduled work.
///
/// `due` is the only field that changes during a job's life. It is unset
/// until the owning scheduler arms the job, and is recomputed from the
/// repetition policy after every run.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    name: String,
    description: Option<String>,
    script: Node,
    repetition: Repetition,
    due: Option<DateTime<Utc>>,
}

/// Read-only snapshot of a job, returned by `TaskScheduler::list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Human-readable repetition, e.g. `every 5 minutes`.
    pub repetition: String,
    pub due: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a job. `script` is the body to execute; its own name is
    /// irrelevant, only its children are kept.
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        script: Node,
        repetition: Repetition,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SchedulerError::InvalidArgument(
                "job name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            name,
            description: description.filter(|d| !d.is_empty()),
            script: Node::new(SCRIPT_NODE).with_children(script.children),
            repetition,
            due: None,
        })
    }

    /// Job repeating every `count` seconds/minutes/hours/days.
    pub fn every(
        name: impl Into<String>,
        description: Option<String>,
        script: Node,
        unit: IntervalUnit,
        count: i64,
    ) -> Result<Self> {
        Self::new(name, description, script, Repetition::every(unit, count)?)
    }

    /// Job repeating weekly on `day` at `hour:minute` UTC.
    pub fn weekly(
        name: impl Into<String>,
        description: Option<String>,
        script: Node,
        day: Weekday,
        hour: u32,
        minute: u32,
    ) -> Result<Self> {
        Self::new(
            name,
            description,
            script,
            Repetition::weekly(day, hour, minute)?,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn script(&self) -> &Node {
        &self.script
    }

    pub fn repetition(&self) -> &Repetition {
        &self.repetition
    }

    pub fn due(&self) -> Option<DateTime<Utc>> {
        self.due
    }

    /// A job without a due date has not been armed and is never eligible.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due.is_some_and(|due| due <= now)
    }

    pub(crate) fn calculate_next_due(&mut self) {
        self.calculate_next_due_from(Utc::now());
    }

    pub fn calculate_next_due_from(&mut self, now: DateTime<Utc>) {
        self.due = Some(self.repetition.next_due(now));
    }

    /// Node representation as written to storage. The script body is deep
    /// copied, so later edits to either side never leak into the other.
    pub fn to_node(&self) -> Node {
        let mut node = Node::new(self.name.clone());
        if let Some(description) = &self.description {
            node.push(Node::new("description").with_value(description.clone()));
        }
        node.push(self.repetition.to_node());
        node.push(self.script.clone());
        node
    }

    /// Rebuild a job from the node produced by [`Job::to_node`]. The result is
    /// unarmed; the scheduler computes its due date on admission.
    pub fn from_node(node: &Node) -> Result<Self> {
        let name = node.name.as_str();
        let repeat = node
            .child("repeat")
            .ok_or_else(|| SchedulerError::malformed(name, "missing repeat node"))?;
        let repetition = Repetition::from_node(repeat, name)?;
        let script = node
            .child(SCRIPT_NODE)
            .cloned()
            .ok_or_else(|| SchedulerError::malformed(name, "missing script body"))?;
        let description = match node.child("description") {
            Some(d) => Some(
                d.text()
                    .ok_or_else(|| SchedulerError::malformed(name, "description is not text"))?
                    .to_string(),
            ),
            None => None,
        };

        Self::new(name, description, script, repetition)
            .map_err(|e| SchedulerError::malformed(name, e.to_string()))
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            name: self.name.clone(),
            description: self.description.clone(),
            repetition: self.repetition.to_string(),
            due: self.due,
        }
    }
}
