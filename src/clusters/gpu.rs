use anyhow::{Context, Result};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::assign::ClusterLightList;
use super::backend::{AssignmentTask, ComputeBackend, TaskHandle};
use super::frustum::{ClusterFrustumGpu, ClusterSpaceGpu};
use super::grid::GridDims;
use super::lights::{Light, LightGpu};
use crate::error::ClusterError;

const WORKGROUP_SIZE: u32 = 64;
const POLL_INTERVAL: Duration = Duration::from_micros(250);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct AssignParamsGpu {
    cluster_count: u32,
    light_count: u32,
    max_lights_per_cluster: u32,
    _pad: u32,
}

struct AssignmentBuffers {
    cluster_count: usize,
    light_capacity: usize,
    max_lights_per_cluster: u32,
    params: wgpu::Buffer,
    frustums: wgpu::Buffer,
    lights: wgpu::Buffer,
    counts: wgpu::Buffer,
    slots: wgpu::Buffer,
    readback: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

/// Read-only copy of the last completed dispatch. Only written once its readback succeeded, so
/// a straggling dispatch never shows through the shading bindings.
struct ShadingBuffers {
    cluster_count: usize,
    light_capacity: usize,
    max_lights_per_cluster: u32,
    cluster_space: wgpu::Buffer,
    lights: wgpu::Buffer,
    counts: wgpu::Buffer,
    slots: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    task: TaskHandle,
}

impl AssignmentBuffers {
    fn fits(&self, cluster_count: usize, light_count: usize, max_lights_per_cluster: u32) -> bool {
        self.cluster_count == cluster_count
            && self.max_lights_per_cluster == max_lights_per_cluster
            && self.light_capacity >= light_count.max(1)
    }

    fn counts_bytes(&self) -> u64 {
        counts_bytes(self.cluster_count)
    }

    fn slots_bytes(&self) -> u64 {
        slots_bytes(self.cluster_count, self.max_lights_per_cluster)
    }
}

impl ShadingBuffers {
    fn fits(&self, cluster_count: usize, light_count: usize, max_lights_per_cluster: u32) -> bool {
        self.cluster_count == cluster_count
            && self.max_lights_per_cluster == max_lights_per_cluster
            && self.light_capacity >= light_count.max(1)
    }
}

fn counts_bytes(cluster_count: usize) -> u64 {
    (cluster_count * 2 * std::mem::size_of::<u32>()) as u64
}

fn slots_bytes(cluster_count: usize, max_lights_per_cluster: u32) -> u64 {
    cluster_count as u64 * max_lights_per_cluster as u64 * std::mem::size_of::<u32>() as u64
}

struct InFlightDispatch {
    handle: TaskHandle,
    receiver: Receiver<Result<(), wgpu::BufferAsyncError>>,
    dims: GridDims,
    max_lights_per_cluster: u32,
    light_count: u32,
    light_revision: u64,
    cluster_space: ClusterSpaceGpu,
    lights: Vec<LightGpu>,
}

enum MapOutcome {
    Mapped(Result<(), wgpu::BufferAsyncError>),
    TimedOut,
    Dropped,
}

/// Runs light assignment as a wgpu compute pass and reads the lists back.
///
/// One dispatch may be in flight at a time. The bindings exposed through
/// [`WgpuBackend::shading_bind_group`] hold the lists of the last dispatch that was read back,
/// so a timed-out dispatch leaves them on the previous lists.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    assign_layout: wgpu::BindGroupLayout,
    shading_layout: Arc<wgpu::BindGroupLayout>,
    buffers: Option<AssignmentBuffers>,
    shading: Option<ShadingBuffers>,
    next_task: u64,
    in_flight: Option<InFlightDispatch>,
}

impl WgpuBackend {
    pub async fn new_headless() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .context("No GPU adapter available for cluster assignment")?;
        let required_limits = wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits());
        let device_desc = wgpu::DeviceDescriptor {
            label: Some("Cluster Device"),
            required_features: wgpu::Features::empty(),
            required_limits,
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::default(),
        };
        let (device, queue) =
            adapter.request_device(&device_desc).await.context("Failed to create cluster device")?;
        let info = adapter.get_info();
        log::info!("Cluster assignment running on '{}' ({:?})", info.name, info.backend);
        Ok(Self::from_device(device, queue))
    }

    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Cluster Assign Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../assets/shaders/cluster_assign.wgsl").into()),
        });
        let compute = wgpu::ShaderStages::COMPUTE;
        let assign_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Cluster Assign BGL"),
            entries: &[
                uniform_entry(0, compute),
                storage_entry(1, true, compute),
                storage_entry(2, true, compute),
                storage_entry(3, false, compute),
                storage_entry(4, false, compute),
            ],
        });
        let shading = wgpu::ShaderStages::FRAGMENT | wgpu::ShaderStages::COMPUTE;
        let shading_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Cluster Shading BGL"),
            entries: &[
                uniform_entry(0, shading),
                storage_entry(1, true, shading),
                storage_entry(2, true, shading),
                storage_entry(3, true, shading),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Cluster Assign Pipeline Layout"),
            bind_group_layouts: &[&assign_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Cluster Assign Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("assign_lights"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        Self {
            device,
            queue,
            pipeline,
            assign_layout,
            shading_layout: Arc::new(shading_layout),
            buffers: None,
            shading: None,
            next_task: 0,
            in_flight: None,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Layout of the read-only shading bindings: cluster space uniform, lights, counts, slots.
    pub fn shading_layout(&self) -> Arc<wgpu::BindGroupLayout> {
        self.shading_layout.clone()
    }

    /// Shading bindings for the last completed dispatch; `None` until one has been read back.
    pub fn shading_bind_group(&self) -> Option<&wgpu::BindGroup> {
        self.shading.as_ref().map(|shading| &shading.bind_group)
    }

    /// The dispatch whose lists the shading bindings currently hold.
    pub fn shading_task(&self) -> Option<TaskHandle> {
        self.shading.as_ref().map(|shading| shading.task)
    }

    fn check_binding_sizes(&self, sizes: &[(&str, u64)]) -> Result<(), ClusterError> {
        let limits = self.device.limits();
        for &(label, bytes) in sizes {
            if bytes > limits.max_storage_buffer_binding_size as u64 || bytes > limits.max_buffer_size {
                return Err(ClusterError::ResourceExhausted(format!(
                    "{label} buffer needs {bytes} bytes, device allows {}",
                    limits.max_storage_buffer_binding_size
                )));
            }
        }
        Ok(())
    }

    fn ensure_buffers(
        &mut self,
        cluster_count: usize,
        light_count: usize,
        max_lights_per_cluster: u32,
    ) -> Result<(), ClusterError> {
        if self.buffers.as_ref().is_some_and(|buffers| buffers.fits(cluster_count, light_count, max_lights_per_cluster))
        {
            return Ok(());
        }
        let light_capacity = light_count.max(1).next_power_of_two();
        let frustum_bytes = (cluster_count * std::mem::size_of::<ClusterFrustumGpu>()) as u64;
        let light_bytes = (light_capacity * std::mem::size_of::<LightGpu>()) as u64;
        let counts_size = counts_bytes(cluster_count);
        let slots_size = slots_bytes(cluster_count, max_lights_per_cluster);
        self.check_binding_sizes(&[
            ("frustum", frustum_bytes),
            ("light", light_bytes),
            ("count", counts_size),
            ("slot", slots_size),
        ])?;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let storage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;
        let results = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC;
        let params =
            self.create_buffer("Cluster Assign Params", 16, wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST);
        let frustums = self.create_buffer("Cluster Frustum Buffer", frustum_bytes, storage);
        let lights = self.create_buffer("Cluster Light Buffer", light_bytes, storage);
        let counts = self.create_buffer("Cluster Count Buffer", counts_size, results);
        let slots = self.create_buffer("Cluster Slot Buffer", slots_size, results);
        let readback = self.create_buffer(
            "Cluster Readback Buffer",
            counts_size + slots_size,
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        );
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ClusterError::ResourceExhausted(err.to_string()));
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Cluster Assign Bind Group"),
            layout: &self.assign_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: params.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: frustums.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: lights.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: counts.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: slots.as_entire_binding() },
            ],
        });
        log::debug!(
            "Allocated cluster buffers for {cluster_count} clusters x {max_lights_per_cluster} slots, \
             {light_capacity} lights"
        );
        self.buffers = Some(AssignmentBuffers {
            cluster_count,
            light_capacity,
            max_lights_per_cluster,
            params,
            frustums,
            lights,
            counts,
            slots,
            readback,
            bind_group,
        });
        Ok(())
    }

    fn ensure_shading_buffers(
        &mut self,
        cluster_count: usize,
        light_count: usize,
        max_lights_per_cluster: u32,
        task: TaskHandle,
    ) -> Result<(), ClusterError> {
        if let Some(shading) = self.shading.as_mut() {
            if shading.fits(cluster_count, light_count, max_lights_per_cluster) {
                shading.task = task;
                return Ok(());
            }
        }
        let light_capacity = light_count.max(1).next_power_of_two();
        let light_bytes = (light_capacity * std::mem::size_of::<LightGpu>()) as u64;
        let counts_size = (cluster_count * std::mem::size_of::<u32>()) as u64;
        let slots_size = slots_bytes(cluster_count, max_lights_per_cluster);
        self.check_binding_sizes(&[("shading light", light_bytes), ("shading slot", slots_size)])?;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let storage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;
        let cluster_space = self.create_buffer(
            "Cluster Space Uniform",
            std::mem::size_of::<ClusterSpaceGpu>() as u64,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        );
        let lights = self.create_buffer("Cluster Shading Light Buffer", light_bytes, storage);
        let counts = self.create_buffer("Cluster Shading Count Buffer", counts_size, storage);
        let slots = self.create_buffer("Cluster Shading Slot Buffer", slots_size, storage);
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ClusterError::ResourceExhausted(err.to_string()));
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Cluster Shading Bind Group"),
            layout: self.shading_layout.as_ref(),
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: cluster_space.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: lights.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: counts.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: slots.as_entire_binding() },
            ],
        });
        self.shading = Some(ShadingBuffers {
            cluster_count,
            light_capacity,
            max_lights_per_cluster,
            cluster_space,
            lights,
            counts,
            slots,
            bind_group,
            task,
        });
        Ok(())
    }

    /// Copies a read-back list into the shading bindings.
    fn publish_shading(&mut self, in_flight: &InFlightDispatch, list: &ClusterLightList) -> Result<(), ClusterError> {
        self.ensure_shading_buffers(
            list.cluster_count(),
            in_flight.lights.len(),
            list.max_lights_per_cluster(),
            in_flight.handle,
        )?;
        let shading = self.shading.as_ref().ok_or_else(|| ClusterError::Device("shading buffers missing".into()))?;
        self.queue.write_buffer(&shading.cluster_space, 0, bytemuck::bytes_of(&in_flight.cluster_space));
        if !in_flight.lights.is_empty() {
            self.queue.write_buffer(&shading.lights, 0, bytemuck::cast_slice(&in_flight.lights));
        }
        self.queue.write_buffer(&shading.counts, 0, bytemuck::cast_slice(list.counts()));
        self.queue.write_buffer(&shading.slots, 0, bytemuck::cast_slice(list.slots()));
        Ok(())
    }

    fn create_buffer(&self, label: &str, size: u64, usage: wgpu::BufferUsages) -> wgpu::Buffer {
        let desc = wgpu::BufferDescriptor { label: Some(label), size, usage, mapped_at_creation: false };
        self.device.create_buffer(&desc)
    }
}

impl ComputeBackend for WgpuBackend {
    fn label(&self) -> &'static str {
        "gpu"
    }

    fn submit(&mut self, task: AssignmentTask) -> Result<TaskHandle, ClusterError> {
        if let Some(in_flight) = &self.in_flight {
            return Err(ClusterError::DispatchInFlight { task: in_flight.handle.id() });
        }
        if task.max_lights_per_cluster == 0 {
            return Err(ClusterError::ZeroCapacity { what: "max lights per cluster" });
        }
        let dims = task.frustums.dims();
        let cluster_count = dims.cluster_count();
        let workgroups = (cluster_count as u32).div_ceil(WORKGROUP_SIZE);
        let workgroup_limit = self.device.limits().max_compute_workgroups_per_dimension;
        if workgroups > workgroup_limit {
            return Err(ClusterError::Device(format!(
                "{cluster_count} clusters need {workgroups} workgroups, device allows {workgroup_limit}"
            )));
        }
        self.ensure_buffers(cluster_count, task.lights.len(), task.max_lights_per_cluster)?;
        let buffers = self.buffers.as_ref().ok_or_else(|| ClusterError::Device("cluster buffers missing".into()))?;

        let params = AssignParamsGpu {
            cluster_count: cluster_count as u32,
            light_count: task.lights.len() as u32,
            max_lights_per_cluster: task.max_lights_per_cluster,
            _pad: 0,
        };
        let cluster_space = task.frustums.projection().to_gpu(dims, task.max_lights_per_cluster);
        let light_records: Vec<LightGpu> = task.lights.iter().map(Light::to_gpu).collect();
        self.queue.write_buffer(&buffers.params, 0, bytemuck::bytes_of(&params));
        self.queue.write_buffer(&buffers.frustums, 0, bytemuck::cast_slice(&task.frustums.gpu_records()));
        if !light_records.is_empty() {
            self.queue.write_buffer(&buffers.lights, 0, bytemuck::cast_slice(&light_records));
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Cluster Assign Encoder") });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Cluster Assign Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &buffers.bind_group, &[]);
            pass.dispatch_workgroups(workgroups, 1, 1);
        }
        encoder.copy_buffer_to_buffer(&buffers.counts, 0, &buffers.readback, 0, buffers.counts_bytes());
        encoder.copy_buffer_to_buffer(
            &buffers.slots,
            0,
            &buffers.readback,
            buffers.counts_bytes(),
            buffers.slots_bytes(),
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let (sender, receiver) = mpsc::channel();
        buffers.readback.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });

        self.next_task += 1;
        let handle = TaskHandle::from_raw(self.next_task);
        self.in_flight = Some(InFlightDispatch {
            handle,
            receiver,
            dims,
            max_lights_per_cluster: task.max_lights_per_cluster,
            light_count: task.lights.len() as u32,
            light_revision: task.light_revision,
            cluster_space,
            lights: light_records,
        });
        Ok(handle)
    }

    fn wait(&mut self, handle: TaskHandle, timeout: Duration) -> Result<ClusterLightList, ClusterError> {
        let receiver = match &self.in_flight {
            Some(in_flight) if in_flight.handle == handle => &in_flight.receiver,
            _ => return Err(ClusterError::UnknownTask { task: handle.id() }),
        };
        let started = Instant::now();
        let outcome = loop {
            self.device.poll(wgpu::PollType::Poll).map_err(|err| ClusterError::Device(err.to_string()))?;
            match receiver.try_recv() {
                Ok(result) => break MapOutcome::Mapped(result),
                Err(TryRecvError::Empty) if started.elapsed() >= timeout => break MapOutcome::TimedOut,
                Err(TryRecvError::Empty) => std::thread::sleep(POLL_INTERVAL),
                Err(TryRecvError::Disconnected) => break MapOutcome::Dropped,
            }
        };
        let mapped = match outcome {
            MapOutcome::Mapped(result) => result,
            MapOutcome::TimedOut => {
                return Err(ClusterError::DispatchTimeout {
                    task: handle.id(),
                    waited_ms: started.elapsed().as_millis(),
                })
            }
            MapOutcome::Dropped => {
                self.in_flight = None;
                return Err(ClusterError::Device("cluster readback callback was dropped".into()));
            }
        };
        let in_flight =
            self.in_flight.take().ok_or(ClusterError::UnknownTask { task: handle.id() })?;
        mapped.map_err(|err| ClusterError::Device(format!("cluster readback mapping failed: {err}")))?;

        let buffers = self.buffers.as_ref().ok_or_else(|| ClusterError::Device("cluster buffers missing".into()))?;
        let words: Vec<u32> = {
            let view = buffers.readback.slice(..).get_mapped_range();
            bytemuck::pod_collect_to_vec(&view[..])
        };
        buffers.readback.unmap();

        let cluster_count = in_flight.dims.cluster_count();
        let expected = 2 * cluster_count + cluster_count * in_flight.max_lights_per_cluster as usize;
        if words.len() != expected {
            return Err(ClusterError::ReadbackSize { expected, actual: words.len() });
        }
        let hits = &words[cluster_count..2 * cluster_count];
        let slots = words[2 * cluster_count..].to_vec();
        let mut list = ClusterLightList::from_hits(
            in_flight.dims,
            in_flight.max_lights_per_cluster,
            hits,
            slots,
            in_flight.light_count,
        )?;
        list.set_light_revision(in_flight.light_revision);
        self.publish_shading(&in_flight, &list)?;
        Ok(list)
    }
}

fn uniform_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}
