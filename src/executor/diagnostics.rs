use std::collections::VecDeque;
use std::fmt::Write;
use std::time::Duration;

use crate::core::TaskId;

/// Execution metrics of one completed task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub label: String,
    pub inputs: Vec<TaskId>,
    /// Time spent in the element's own logic, over every invocation.
    pub elapsed: Duration,
    pub executions: u32,
    pub cache_hit: bool,
}

/// Metrics of the most recently completed tasks, up to a fixed capacity.
#[derive(Debug)]
pub struct Diagnostics {
    records: VecDeque<TaskRecord>,
    capacity: usize,
}

impl Diagnostics {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity,
        }
    }

    /// Records in completion order, oldest first.
    pub fn records(&self) -> &VecDeque<TaskRecord> {
        &self.records
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    pub fn cache_hits(&self) -> usize {
        self.records.iter().filter(|record| record.cache_hit).count()
    }

    pub fn total_elapsed(&self) -> Duration {
        self.records.iter().map(|record| record.elapsed).sum()
    }

    pub(crate) fn push(&mut self, record: TaskRecord) {
        if self.capacity == 0 {
            return;
        }

        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub(crate) fn forget(&mut self, id: TaskId) {
        self.records.retain(|record| record.id != id);
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }

    /// Renders the completed tasks as a Mermaid diagram, color-coded by
    /// execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Cache hit
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        writeln!(f, "graph LR").unwrap();

        let (min_time, max_time) = self
            .records
            .iter()
            .filter(|record| !record.cache_hit)
            .map(|record| record.elapsed.as_secs_f64())
            .fold(None, |range: Option<(f64, f64)>, secs| match range {
                Some((min, max)) => Some((min.min(secs), max.max(secs))),
                None => Some((secs, secs)),
            })
            .unwrap_or((0.0, 0.0));

        // Avoid divide by zero if all tasks took same time
        let spread = if (max_time - min_time).abs() < f64::EPSILON {
            1.0
        } else {
            max_time - min_time
        };

        for record in &self.records {
            let name = record.label.replace('"', "#quot;");
            let id = record.id.raw();

            let (label_extra, color_code) = if record.cache_hit {
                ("Cached".to_string(), "#ADD8E6".to_string()) // Light Blue
            } else {
                let t = (record.elapsed.as_secs_f64() - min_time) / spread;

                // 0.0 (Green) -> 0.5 (Yellow) -> 1.0 (Red)
                let (r, g) = if t < 0.5 {
                    ((255.0 * t * 2.0) as u8, 255)
                } else {
                    (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
                };

                (
                    format!("{:.2?} x{}", record.elapsed, record.executions),
                    format!("#{r:02X}{g:02X}00"),
                )
            };

            writeln!(f, "    {id}[\"{name}\\n{label_extra}\"]").unwrap();
            writeln!(f, "    style {id} fill:{color_code}").unwrap();
        }

        for record in &self.records {
            for input in &record.inputs {
                if self.get(*input).is_some() {
                    writeln!(f, "    {} --> {}", input.raw(), record.id.raw()).unwrap();
                }
            }
        }

        f
    }
}

/// Liveness report of an executor.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Audit {
    /// Tasks whose element returned an error or panicked, with the message.
    pub failed: Vec<(TaskId, String)>,
    /// Pending tasks that can never run: a dependency failed, is unknown, or
    /// is stalled itself.
    pub stalled: Vec<TaskId>,
    /// Active tasks waiting to be woken up.
    pub paused: Vec<TaskId>,
}

impl Audit {
    pub fn is_healthy(&self) -> bool {
        self.failed.is_empty() && self.stalled.is_empty()
    }
}
