use std::collections::HashMap;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::tasks::{Task, TaskEvent};

#[derive(Debug, Default)]
struct Records {
    tasks: HashMap<Uuid, Task>,
    events: Vec<TaskEvent>,
}

/// Worker-local task records plus the append-only history of committed transitions.
///
/// Reads are open to anyone; writes only come from the worker's commit step.
#[derive(Debug, Default)]
pub struct TaskStore {
    records: RwLock<Records>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Uuid) -> Option<Task> {
        self.records.read().tasks.get(id).cloned()
    }

    pub fn list(&self) -> Vec<Task> {
        self.records.read().tasks.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().tasks.is_empty()
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.records.read().events.clone()
    }

    pub fn events_for(&self, id: &Uuid) -> Vec<TaskEvent> {
        self.records
            .read()
            .events
            .iter()
            .filter(|event| event.task.id == *id)
            .cloned()
            .collect()
    }

    /// Returns the stored record, storing `task` as the record on first sighting.
    pub(crate) fn get_or_insert(&self, task: &Task) -> Task {
        self.records
            .write()
            .tasks
            .entry(task.id)
            .or_insert_with(|| task.clone())
            .clone()
    }

    /// Replaces the record and logs the transition.
    pub(crate) fn commit(&self, task: Task) -> TaskEvent {
        let event = TaskEvent::new(task.clone());
        let mut records = self.records.write();
        records.tasks.insert(task.id, task);
        records.events.push(event.clone());
        event
    }
}
