use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::assign::{assign_lights, ClusterLightList};
use super::frustum::FrustumGrid;
use super::lights::Light;
use crate::error::ClusterError;

/// Everything one assignment dispatch reads. Inputs are shared immutably, so the frustums
/// and lights seen by the dispatch cannot change after submission.
#[derive(Clone, Debug)]
pub struct AssignmentTask {
    pub frustums: Arc<FrustumGrid>,
    pub lights: Arc<Vec<Light>>,
    pub light_revision: u64,
    pub max_lights_per_cluster: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

impl TaskHandle {
    pub(crate) fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// Executes light assignment asynchronously with respect to the caller.
///
/// `submit` returns immediately; `wait` blocks until the list for that handle is complete
/// or `timeout` elapses. A timed-out handle stays valid and can be waited on again.
pub trait ComputeBackend {
    fn label(&self) -> &'static str;

    fn submit(&mut self, task: AssignmentTask) -> Result<TaskHandle, ClusterError>;

    fn wait(&mut self, handle: TaskHandle, timeout: Duration) -> Result<ClusterLightList, ClusterError>;
}

impl<B: ComputeBackend + ?Sized> ComputeBackend for Box<B> {
    fn label(&self) -> &'static str {
        (**self).label()
    }

    fn submit(&mut self, task: AssignmentTask) -> Result<TaskHandle, ClusterError> {
        (**self).submit(task)
    }

    fn wait(&mut self, handle: TaskHandle, timeout: Duration) -> Result<ClusterLightList, ClusterError> {
        (**self).wait(handle, timeout)
    }
}

type AssignmentResult = Result<ClusterLightList, ClusterError>;

/// Runs assignment on the rayon pool, parallel across clusters.
#[derive(Default)]
pub struct CpuBackend {
    next_task: u64,
    pending: HashMap<TaskHandle, Receiver<AssignmentResult>>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

impl ComputeBackend for CpuBackend {
    fn label(&self) -> &'static str {
        "cpu"
    }

    fn submit(&mut self, task: AssignmentTask) -> Result<TaskHandle, ClusterError> {
        if task.max_lights_per_cluster == 0 {
            return Err(ClusterError::ZeroCapacity { what: "max lights per cluster" });
        }
        self.next_task += 1;
        let handle = TaskHandle(self.next_task);
        let (sender, receiver) = mpsc::channel();
        rayon::spawn(move || {
            let result = assign_lights(&task.frustums, &task.lights, task.max_lights_per_cluster).map(
                |mut list| {
                    list.set_light_revision(task.light_revision);
                    list
                },
            );
            let _ = sender.send(result);
        });
        self.pending.insert(handle, receiver);
        Ok(handle)
    }

    fn wait(&mut self, handle: TaskHandle, timeout: Duration) -> Result<ClusterLightList, ClusterError> {
        let receiver = self.pending.get(&handle).ok_or(ClusterError::UnknownTask { task: handle.id() })?;
        let started = Instant::now();
        match receiver.recv_timeout(timeout) {
            Ok(result) => {
                self.pending.remove(&handle);
                result
            }
            Err(RecvTimeoutError::Timeout) => {
                Err(ClusterError::DispatchTimeout { task: handle.id(), waited_ms: started.elapsed().as_millis() })
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.pending.remove(&handle);
                Err(ClusterError::Device(format!("assignment task {} exited without a result", handle.id())))
            }
        }
    }
}
