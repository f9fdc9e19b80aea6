//! Offload collaborator that records every request.

use std::sync::Mutex;

use mvirt_nexthop::group::HardwareHandles;
use mvirt_nexthop::offload::{GroupDescriptor, Offload};
use mvirt_nexthop::{AddressFamily, OffloadError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Program(GroupDescriptor),
    Update(GroupDescriptor, HardwareHandles),
    Remove(u32, HardwareHandles),
}

#[derive(Debug, Default)]
pub struct RecordingOffload {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingOffload {
    /// Drain everything recorded so far.
    pub fn take(&self) -> Vec<Recorded> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn push(&self, event: Recorded) {
        self.events.lock().unwrap().push(event);
    }
}

impl Offload for RecordingOffload {
    fn program(&self, group: GroupDescriptor) -> Result<(), OffloadError> {
        self.push(Recorded::Program(group));
        Ok(())
    }

    fn update(&self, group: GroupDescriptor, handles: &HardwareHandles) -> Result<(), OffloadError> {
        self.push(Recorded::Update(group, handles.clone()));
        Ok(())
    }

    fn remove(&self, _family: AddressFamily, index: u32, handles: HardwareHandles) {
        self.push(Recorded::Remove(index, handles));
    }
}
