// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Parked cli connections waiting for a mux to answer. Each
//! correlation gets its own typed slot rather than one untyped map:
//! exit-intent is a single global slot, float requests key on their
//! request uuid, popups key on the mux that is showing them.

use std::{collections::HashMap, os::unix::io::RawFd};

use hexe_protocol::Uuid;

use super::registry::ClientId;

#[derive(Default)]
pub struct ExitIntentSlot {
    fd: Option<RawFd>,
}

impl ExitIntentSlot {
    pub fn park(&mut self, fd: RawFd) -> Option<RawFd> {
        self.fd.replace(fd)
    }

    pub fn take(&mut self) -> Option<RawFd> {
        self.fd.take()
    }

    pub fn forget(&mut self, fd: RawFd) {
        if self.fd == Some(fd) {
            self.fd = None;
        }
    }
}

#[derive(Default)]
pub struct FloatSlots {
    by_request: HashMap<Uuid, RawFd>,
}

impl FloatSlots {
    pub fn park(&mut self, request_id: Uuid, fd: RawFd) {
        self.by_request.insert(request_id, fd);
    }

    pub fn take(&mut self, request_id: &Uuid) -> Option<RawFd> {
        self.by_request.remove(request_id)
    }

    pub fn forget_fd(&mut self, fd: RawFd) {
        self.by_request.retain(|_, parked| *parked != fd);
    }
}

#[derive(Default)]
pub struct PopSlots {
    by_mux: HashMap<ClientId, RawFd>,
}

impl PopSlots {
    pub fn park(&mut self, mux: ClientId, fd: RawFd) -> Option<RawFd> {
        self.by_mux.insert(mux, fd)
    }

    pub fn take(&mut self, mux: ClientId) -> Option<RawFd> {
        self.by_mux.remove(&mux)
    }

    pub fn forget_fd(&mut self, fd: RawFd) {
        self.by_mux.retain(|_, parked| *parked != fd);
    }
}

#[derive(Default)]
pub struct Slots {
    pub exit_intent: ExitIntentSlot,
    pub floats: FloatSlots,
    pub pops: PopSlots,
}

impl Slots {
    /// A parked cli fd hung up; make sure nothing routes to it later.
    pub fn forget_fd(&mut self, fd: RawFd) {
        self.exit_intent.forget(fd);
        self.floats.forget_fd(fd);
        self.pops.forget_fd(fd);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_intent_is_single_occupancy() {
        let mut slot = ExitIntentSlot::default();
        assert_eq!(slot.park(3), None);
        // a second intent displaces the first so the caller can fail it
        assert_eq!(slot.park(4), Some(3));
        assert_eq!(slot.take(), Some(4));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn hup_cleans_all_slots() {
        let mut slots = Slots::default();
        let req = Uuid([7; 16]);
        slots.exit_intent.park(5);
        slots.floats.park(req, 5);
        slots.pops.park(1, 5);

        slots.forget_fd(5);

        assert_eq!(slots.exit_intent.take(), None);
        assert_eq!(slots.floats.take(&req), None);
        assert_eq!(slots.pops.take(1), None);
    }

    #[test]
    fn floats_key_on_request_id() {
        let mut floats = FloatSlots::default();
        let a = Uuid([1; 16]);
        let b = Uuid([2; 16]);
        floats.park(a, 10);
        floats.park(b, 11);
        assert_eq!(floats.take(&a), Some(10));
        assert_eq!(floats.take(&a), None);
        assert_eq!(floats.take(&b), Some(11));
    }
}
