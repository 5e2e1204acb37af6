use std::fmt;
use std::ops::BitOr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type ThreadId = u64;

/// Lifecycle state of a task. The numeric codes are persisted and can be
/// combined into a [`StateMask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum TaskState {
    Maybe = 1,
    Likely = 2,
    Future = 4,
    Waiting = 8,
    Ready = 16,
    Started = 32,
    Completed = 64,
    Error = 128,
    Cancelled = 256,
}

impl TaskState {
    pub const ALL: [TaskState; 9] = [
        TaskState::Maybe,
        TaskState::Likely,
        TaskState::Future,
        TaskState::Waiting,
        TaskState::Ready,
        TaskState::Started,
        TaskState::Completed,
        TaskState::Error,
        TaskState::Cancelled,
    ];

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn is_finished(self) -> bool {
        StateMask::FINISHED.contains(self)
    }

    pub fn is_predicted(self) -> bool {
        StateMask::PREDICTED.contains(self)
    }

    pub fn name(self) -> &'static str {
        match self {
            TaskState::Maybe => "MAYBE",
            TaskState::Likely => "LIKELY",
            TaskState::Future => "FUTURE",
            TaskState::Waiting => "WAITING",
            TaskState::Ready => "READY",
            TaskState::Started => "STARTED",
            TaskState::Completed => "COMPLETED",
            TaskState::Error => "ERROR",
            TaskState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<TaskState> for u16 {
    fn from(state: TaskState) -> u16 {
        state.code()
    }
}

impl TryFrom<u16> for TaskState {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, String> {
        TaskState::from_code(code).ok_or_else(|| format!("invalid task state code {}", code))
    }
}

/// A set of task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateMask(u16);

impl StateMask {
    pub const NONE: StateMask = StateMask(0);
    pub const PREDICTED: StateMask = StateMask(1 | 2);
    pub const DEFINITE: StateMask = StateMask(4 | 8 | 16 | 32);
    pub const FINISHED: StateMask = StateMask(64 | 128 | 256);
    pub const NOT_FINISHED: StateMask = StateMask(1 | 2 | 4 | 8 | 16 | 32);
    /// Tasks that keep a workflow from being idle.
    pub const LIVE: StateMask = StateMask(8 | 16 | 32);
    pub const ANY: StateMask = StateMask(511);

    pub fn contains(self, state: TaskState) -> bool {
        self.0 & state.code() != 0
    }
}

impl From<TaskState> for StateMask {
    fn from(state: TaskState) -> Self {
        StateMask(state.code())
    }
}

impl BitOr for StateMask {
    type Output = StateMask;

    fn bitor(self, rhs: StateMask) -> StateMask {
        StateMask(self.0 | rhs.0)
    }
}

impl BitOr for TaskState {
    type Output = StateMask;

    fn bitor(self, rhs: TaskState) -> StateMask {
        StateMask(self.code() | rhs.code())
    }
}

impl BitOr<TaskState> for StateMask {
    type Output = StateMask;

    fn bitor(self, rhs: TaskState) -> StateMask {
        StateMask(self.0 | rhs.code())
    }
}

/// One occurrence of a task spec within a running tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub parent: Option<Uuid>,
    pub children: Vec<Uuid>,
    #[serde(rename = "task_spec")]
    pub spec: String,
    pub state: TaskState,
    pub thread_id: ThreadId,
    pub data: Map<String, Value>,
    pub internal_data: Map<String, Value>,
    pub last_state_change: DateTime<Utc>,
}

impl Task {
    pub fn new(spec: &str, parent: Option<Uuid>, state: TaskState, thread_id: ThreadId) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent,
            children: Vec::new(),
            spec: spec.to_string(),
            state,
            thread_id,
            data: Map::new(),
            internal_data: Map::new(),
            last_state_change: Utc::now(),
        }
    }

    pub fn set_state(&mut self, state: TaskState) {
        if self.state != state {
            self.state = state;
            self.last_state_change = Utc::now();
        }
    }

    pub fn has_state(&self, mask: impl Into<StateMask>) -> bool {
        mask.into().contains(self.state)
    }
}

/// Selects tasks by state, spec name and thread.
#[derive(Debug, Clone, Copy)]
pub struct TaskFilter<'a> {
    pub states: StateMask,
    pub spec: Option<&'a str>,
    pub thread_id: Option<ThreadId>,
}

impl<'a> TaskFilter<'a> {
    pub fn new() -> Self {
        Self { states: StateMask::ANY, spec: None, thread_id: None }
    }

    pub fn state(mut self, states: impl Into<StateMask>) -> Self {
        self.states = states.into();
        self
    }

    pub fn spec(mut self, name: &'a str) -> Self {
        self.spec = Some(name);
        self
    }

    pub fn thread(mut self, thread_id: ThreadId) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.states.contains(task.state)
            && self.spec.is_none_or(|s| s == task.spec)
            && self.thread_id.is_none_or(|t| t == task.thread_id)
    }
}

impl Default for TaskFilter<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl From<TaskState> for TaskFilter<'_> {
    fn from(state: TaskState) -> Self {
        TaskFilter::new().state(state)
    }
}

impl From<StateMask> for TaskFilter<'_> {
    fn from(states: StateMask) -> Self {
        TaskFilter::new().state(states)
    }
}
