//! Shared fixtures for resource-manager integration tests: a standard
//! pool hierarchy and gang/task builders.

use resman_api::{
    AttemptId, Gang, Resources, ResourcePoolConfig, SchedulingPolicy, TaskDesc, TaskId,
};

/// The standard test hierarchy:
///
/// ```text
/// root
/// ├── respool1
/// │   ├── respool11
/// │   └── respool12
/// ├── respool2
/// │   ├── respool21
/// │   └── respool22
/// └── respool3
/// ```
pub fn sample_pool_configs() -> Vec<ResourcePoolConfig> {
    let node = |name: &str, parent: Option<&str>| ResourcePoolConfig {
        name: name.to_owned(),
        parent: parent.map(str::to_owned),
        reservation: Resources::new(100.0, 100.0, 100.0, 2.0),
        limit: Resources::new(1000.0, 1000.0, 1000.0, 4.0),
        share: 1.0,
        policy: SchedulingPolicy::PriorityFifo,
    };
    vec![
        node("root", None),
        node("respool1", Some("root")),
        node("respool2", Some("root")),
        node("respool3", Some("root")),
        node("respool11", Some("respool1")),
        node("respool12", Some("respool1")),
        node("respool21", Some("respool2")),
        node("respool22", Some("respool2")),
    ]
}

/// Builder for a [`TaskDesc`] with the defaults most tests want.
pub struct TaskDescBuilder {
    desc: TaskDesc,
}

impl TaskDescBuilder {
    pub fn new(job_id: &str, instance_id: u32) -> Self {
        let id = TaskId::new(job_id, instance_id);
        let attempt_id = AttemptId::from(format!("{id}-attempt-0").as_str());
        Self {
            desc: TaskDesc {
                name: id.to_string(),
                id,
                attempt_id,
                resources: Resources::new(1.0, 100.0, 10.0, 0.0),
                priority: 0,
                preemptible: true,
                controller: false,
                revocable: false,
                min_instances: 1,
                placement_timeout_seconds: 60,
                placement_retry_limit: 3,
            },
        }
    }

    pub fn attempt(mut self, attempt: &str) -> Self {
        self.desc.attempt_id = AttemptId::from(attempt);
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.desc.priority = priority;
        self
    }

    pub fn resources(mut self, resources: Resources) -> Self {
        self.desc.resources = resources;
        self
    }

    pub fn cpu(mut self, cpu: f64) -> Self {
        self.desc.resources.cpu = cpu;
        self
    }

    pub fn preemptible(mut self, preemptible: bool) -> Self {
        self.desc.preemptible = preemptible;
        self
    }

    pub fn controller(mut self, controller: bool) -> Self {
        self.desc.controller = controller;
        self
    }

    pub fn revocable(mut self, revocable: bool) -> Self {
        self.desc.revocable = revocable;
        self
    }

    pub fn placement_timeout_seconds(mut self, seconds: u64) -> Self {
        self.desc.placement_timeout_seconds = seconds;
        self
    }

    pub fn placement_retry_limit(mut self, limit: u32) -> Self {
        self.desc.placement_retry_limit = limit;
        self
    }

    pub fn build(self) -> TaskDesc {
        self.desc
    }
}

/// A single-task gang with the given priority and cpu demand.
pub fn single_task_gang(job_id: &str, instance_id: u32, priority: u32, cpu: f64) -> Gang {
    Gang::new(vec![
        TaskDescBuilder::new(job_id, instance_id)
            .priority(priority)
            .cpu(cpu)
            .build(),
    ])
}

/// A gang of `members` tasks sharing priority and per-member cpu
/// demand.
pub fn gang_of(job_id: &str, members: u32, priority: u32, cpu_each: f64) -> Gang {
    let tasks = (0..members)
        .map(|instance| {
            let mut desc = TaskDescBuilder::new(job_id, instance)
                .priority(priority)
                .cpu(cpu_each)
                .build();
            desc.min_instances = members;
            desc
        })
        .collect();
    Gang::new(tasks)
}
