//! Catalog of known scheduled tasks.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::schedule::{ScheduleError, TaskSchedule};
use crate::task::ScheduledTask;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub name: String,
    pub description: String,
    pub schedule_expression: String,
}

impl TaskDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schedule_expression: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schedule_expression: schedule_expression.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("task '{task}' has an invalid schedule: {source}")]
    InvalidSchedule {
        task: String,
        #[source]
        source: ScheduleError,
    },

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("task registry lock poisoned")]
    Poisoned,
}

struct Registration {
    descriptor: TaskDescriptor,
    schedule: TaskSchedule,
    task: Option<Arc<dyn ScheduledTask>>,
}

/// Registered once at startup, read-mostly afterwards.
#[derive(Default)]
pub struct TaskRegistry {
    entries: RwLock<BTreeMap<String, Registration>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor without an implementation (catalog only).
    pub fn register(&self, descriptor: TaskDescriptor) -> Result<(), RegistryError> {
        self.insert(descriptor, None)
    }

    /// Register a runnable task under `schedule_expression`.
    pub fn register_task(
        &self,
        task: Arc<dyn ScheduledTask>,
        schedule_expression: &str,
    ) -> Result<TaskDescriptor, RegistryError> {
        let descriptor =
            TaskDescriptor::new(task.name(), task.description(), schedule_expression);
        self.insert(descriptor.clone(), Some(task))?;
        Ok(descriptor)
    }

    fn insert(
        &self,
        descriptor: TaskDescriptor,
        task: Option<Arc<dyn ScheduledTask>>,
    ) -> Result<(), RegistryError> {
        let schedule = TaskSchedule::parse(&descriptor.schedule_expression).map_err(|source| {
            RegistryError::InvalidSchedule {
                task: descriptor.name.clone(),
                source,
            }
        })?;

        let mut entries = self.entries.write().map_err(|_| RegistryError::Poisoned)?;
        if entries.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateTask(descriptor.name));
        }
        info!(
            task = %descriptor.name,
            schedule = %descriptor.schedule_expression,
            runnable = task.is_some(),
            "task registered"
        );
        entries.insert(
            descriptor.name.clone(),
            Registration {
                descriptor,
                schedule,
                task,
            },
        );
        Ok(())
    }

    /// All descriptors, ordered by name.
    pub fn all(&self) -> Vec<TaskDescriptor> {
        self.read(|entries| entries.values().map(|r| r.descriptor.clone()).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<TaskDescriptor> {
        self.read(|entries| entries.get(name).map(|r| r.descriptor.clone()))
            .flatten()
    }

    pub fn task(&self, name: &str) -> Option<Arc<dyn ScheduledTask>> {
        self.read(|entries| entries.get(name).and_then(|r| r.task.clone()))
            .flatten()
    }

    pub fn schedule(&self, name: &str) -> Result<TaskSchedule, RegistryError> {
        self.read(|entries| entries.get(name).map(|r| r.schedule.clone()))
            .ok_or(RegistryError::Poisoned)?
            .ok_or_else(|| RegistryError::UnknownTask(name.to_string()))
    }

    /// Tasks that have an implementation, with their parsed schedules.
    pub fn runnable(&self) -> Vec<(TaskSchedule, Arc<dyn ScheduledTask>)> {
        self.read(|entries| {
            entries
                .values()
                .filter_map(|r| r.task.clone().map(|t| (r.schedule.clone(), t)))
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.read(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read<T>(&self, f: impl FnOnce(&BTreeMap<String, Registration>) -> T) -> Option<T> {
        self.entries.read().ok().map(|guard| f(&guard))
    }
}
