//! In-memory backend that records every call.
//!
//! Resources are plain byte vectors, kernels do nothing unless a CPU hook is
//! installed for them. Used by the test suites and by dry runs without a GPU.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    rc::Rc,
};

use crate::interface::{
    BackendError, ComputeBackend, KernelDispatch, KernelId, ResourceDesc, ResourceId,
};

#[derive(Clone, Debug, PartialEq)]
pub enum BackendCall {
    Allocate { id: ResourceId, label: &'static str, size: u64 },
    Release(ResourceId),
    Upload { id: ResourceId, len: usize },
    UploadSlot { id: ResourceId, timestep: usize, len: usize },
    Dispatch { kernel: KernelId, resources: Vec<ResourceId>, workgroups: [u32; 3], params: Vec<u8> },
    ReadBack(ResourceId),
}

/// Resource contents visible to kernel hooks.
#[derive(Default, Debug)]
pub struct ResourceContents {
    data: BTreeMap<ResourceId, Vec<u8>>,
}

impl ResourceContents {
    pub fn get(&self, id: ResourceId) -> Option<&[u8]> {
        self.data.get(&id).map(Vec::as_slice)
    }

    pub fn get_mut(&mut self, id: ResourceId) -> Option<&mut Vec<u8>> {
        self.data.get_mut(&id)
    }
}

#[derive(Default, Debug)]
struct RecordingState {
    calls: Vec<BackendCall>,
    contents: ResourceContents,
    fail_allocations: usize,
    max_allocation: Option<u64>,
}

pub type KernelHook = Box<dyn FnMut(&KernelDispatch<'_>, &mut ResourceContents)>;

pub struct RecordingBackend {
    state: Rc<RefCell<RecordingState>>,
    hooks: HashMap<KernelId, KernelHook>,
    next_id: u64,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(RecordingState::default())),
            hooks: HashMap::new(),
            next_id: 1,
        }
    }

    /// Shared view of the call log; stays valid after the backend is moved
    /// into a device.
    pub fn handle(&self) -> RecordingHandle {
        RecordingHandle {
            state: Rc::clone(&self.state),
        }
    }

    pub fn with_hook(
        mut self,
        kernel: KernelId,
        hook: impl FnMut(&KernelDispatch<'_>, &mut ResourceContents) + 'static,
    ) -> Self {
        self.hooks.insert(kernel, Box::new(hook));
        self
    }
}

impl ComputeBackend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    fn allocate(&mut self, desc: &ResourceDesc) -> Result<ResourceId, BackendError> {
        let mut state = self.state.borrow_mut();
        let size = desc.byte_size()?;
        if state.fail_allocations > 0 {
            state.fail_allocations -= 1;
            return Err(BackendError::Allocation {
                label: desc.label,
                size,
                reason: "injected failure".into(),
            });
        }
        if let Some(limit) = state.max_allocation {
            if size > limit {
                return Err(BackendError::Allocation {
                    label: desc.label,
                    size,
                    reason: format!("exceeds limit of {limit} bytes"),
                });
            }
        }
        let id = ResourceId(self.next_id);
        self.next_id += 1;
        state.contents.data.insert(id, vec![0; size as usize]);
        state.calls.push(BackendCall::Allocate {
            id,
            label: desc.label,
            size,
        });
        Ok(id)
    }

    fn release(&mut self, id: ResourceId) {
        let mut state = self.state.borrow_mut();
        state.contents.data.remove(&id);
        state.calls.push(BackendCall::Release(id));
    }

    fn upload(&mut self, target: ResourceId, bytes: &[u8]) -> Result<(), BackendError> {
        let mut state = self.state.borrow_mut();
        write_contents(&mut state.contents, target, bytes)?;
        state.calls.push(BackendCall::Upload {
            id: target,
            len: bytes.len(),
        });
        Ok(())
    }

    fn upload_slot(
        &mut self,
        target: ResourceId,
        timestep: usize,
        bytes: &[u8],
    ) -> Result<(), BackendError> {
        let mut state = self.state.borrow_mut();
        write_contents(&mut state.contents, target, bytes)?;
        state.calls.push(BackendCall::UploadSlot {
            id: target,
            timestep,
            len: bytes.len(),
        });
        Ok(())
    }

    fn run_kernel(&mut self, dispatch: &KernelDispatch<'_>) -> Result<(), BackendError> {
        let mut state = self.state.borrow_mut();
        for id in dispatch.resources {
            if state.contents.get(*id).is_none() {
                return Err(BackendError::UnknownResource(*id));
            }
        }
        if let Some(hook) = self.hooks.get_mut(&dispatch.kernel) {
            hook(dispatch, &mut state.contents);
        }
        state.calls.push(BackendCall::Dispatch {
            kernel: dispatch.kernel,
            resources: dispatch.resources.to_vec(),
            workgroups: dispatch.workgroups,
            params: dispatch.params.to_vec(),
        });
        Ok(())
    }

    fn read_back(&mut self, resource: ResourceId) -> Result<Vec<u8>, BackendError> {
        let mut state = self.state.borrow_mut();
        let bytes = state
            .contents
            .get(resource)
            .map(<[u8]>::to_vec)
            .ok_or(BackendError::UnknownResource(resource))?;
        state.calls.push(BackendCall::ReadBack(resource));
        Ok(bytes)
    }
}

fn write_contents(
    contents: &mut ResourceContents,
    target: ResourceId,
    bytes: &[u8],
) -> Result<(), BackendError> {
    let buffer = contents
        .get_mut(target)
        .ok_or(BackendError::UnknownResource(target))?;
    if bytes.len() > buffer.len() {
        return Err(BackendError::UploadOverflow {
            id: target,
            len: bytes.len(),
            capacity: buffer.len() as u64,
        });
    }
    buffer[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Inspection and fault injection for a [`RecordingBackend`].
#[derive(Clone)]
pub struct RecordingHandle {
    state: Rc<RefCell<RecordingState>>,
}

impl RecordingHandle {
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// `(resource, timestep)` for every slot upload, in order.
    pub fn slot_uploads(&self) -> Vec<(ResourceId, usize)> {
        self.state
            .borrow()
            .calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::UploadSlot { id, timestep, .. } => Some((*id, *timestep)),
                _ => None,
            })
            .collect()
    }

    pub fn dispatch_count(&self, kernel: KernelId) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|call| matches!(call, BackendCall::Dispatch { kernel: k, .. } if *k == kernel))
            .count()
    }

    pub fn dispatches(&self) -> Vec<KernelId> {
        self.state
            .borrow()
            .calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::Dispatch { kernel, .. } => Some(*kernel),
                _ => None,
            })
            .collect()
    }

    pub fn last_params(&self, kernel: KernelId) -> Option<Vec<u8>> {
        self.state.borrow().calls.iter().rev().find_map(|call| match call {
            BackendCall::Dispatch { kernel: k, params, .. } if *k == kernel => Some(params.clone()),
            _ => None,
        })
    }

    pub fn released(&self) -> Vec<ResourceId> {
        self.state
            .borrow()
            .calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::Release(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn live_resources(&self) -> usize {
        self.state.borrow().contents.data.len()
    }

    pub fn contents(&self, id: ResourceId) -> Option<Vec<u8>> {
        self.state.borrow().contents.get(id).map(<[u8]>::to_vec)
    }

    pub fn fail_next_allocations(&self, count: usize) {
        self.state.borrow_mut().fail_allocations = count;
    }

    pub fn limit_allocation_size(&self, limit: Option<u64>) {
        self.state.borrow_mut().max_allocation = limit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::ComputeDevice;

    #[test]
    fn dropping_handle_releases_on_next_call() {
        let backend = RecordingBackend::new();
        let log = backend.handle();
        let device = ComputeDevice::new(backend);

        let a = device
            .allocate(ResourceDesc::buffer("a", 4, 4))
            .expect("alloc");
        let id = a.id();
        drop(a);
        assert!(log.released().is_empty());
        assert_eq!(device.flush_releases(), 1);
        assert_eq!(log.released(), vec![id]);
        assert_eq!(log.live_resources(), 0);
    }

    #[test]
    fn injected_failure_is_reported_once() {
        let backend = RecordingBackend::new();
        let log = backend.handle();
        let device = ComputeDevice::new(backend);
        log.fail_next_allocations(1);

        assert!(device.allocate(ResourceDesc::buffer("a", 1, 4)).is_err());
        assert!(device.allocate(ResourceDesc::buffer("a", 1, 4)).is_ok());
    }

    #[test]
    fn upload_past_capacity_fails() {
        let device = ComputeDevice::new(RecordingBackend::new());
        let small = device
            .allocate(ResourceDesc::buffer("small", 1, 4))
            .expect("alloc");
        assert!(matches!(
            device.upload(&small, &[0; 8]),
            Err(BackendError::UploadOverflow { .. })
        ));
    }

    #[test]
    fn hook_can_write_outputs() {
        let backend = RecordingBackend::new().with_hook(KernelId::MinMaxRows, |dispatch, contents| {
            if let Some(out) = contents.get_mut(dispatch.resources[0]) {
                out.fill(1);
            }
        });
        let device = ComputeDevice::new(backend);
        let out = device
            .allocate(ResourceDesc::buffer("out", 2, 4))
            .expect("alloc");
        device
            .dispatch(KernelId::MinMaxRows, &[], &[&out], [1, 1, 1])
            .expect("dispatch");
        assert_eq!(device.read_back(&out).expect("readback"), vec![1; 8]);
    }
}
