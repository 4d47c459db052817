/*
 *
 * Copyright 2026 lb-core authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use crate::load_balancing::{
    ChannelController, ConnectivityStateWatcher, LbState, PolicyEvent, PolicyObserver, Subchannel,
};
use crate::name_resolution::Address;
use crate::ConnectivityState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc;

// A test subchannel that records connect and backoff-reset calls on a channel
// and lets tests drive connectivity state transitions by hand.
pub(crate) struct TestSubchannel {
    address: Address,
    tx_events: mpsc::UnboundedSender<TestEvent>,
    state: Mutex<ConnectivityState>,
    watchers: Mutex<Vec<Arc<dyn ConnectivityStateWatcher>>>,
}

impl TestSubchannel {
    pub fn new(
        address: Address,
        tx_events: mpsc::UnboundedSender<TestEvent>,
        initial_state: ConnectivityState,
    ) -> Self {
        Self {
            address,
            tx_events,
            state: Mutex::new(initial_state),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Moves the subchannel to `state` and notifies every registered watcher.
    pub fn set_state(&self, state: ConnectivityState) {
        *self.state.lock() = state;
        // Watchers run without the state lock held so they may call back into
        // this subchannel.
        let watchers: Vec<_> = self.watchers.lock().clone();
        for watcher in watchers {
            watcher.on_state_change(state);
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().len()
    }
}

impl Subchannel for TestSubchannel {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn connectivity_state(&self) -> ConnectivityState {
        *self.state.lock()
    }

    fn register_connectivity_state_watcher(&self, watcher: Arc<dyn ConnectivityStateWatcher>) {
        self.watchers.lock().push(watcher);
    }

    fn unregister_connectivity_state_watcher(&self, watcher: Arc<dyn ConnectivityStateWatcher>) {
        self.watchers
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, &watcher));
    }

    fn connect(&self) {
        println!("connect called for subchannel {}", self.address);
        self.tx_events
            .send(TestEvent::Connect(self.address.clone()))
            .unwrap();
    }

    fn reset_backoff(&self) {
        self.tx_events
            .send(TestEvent::ResetBackoff(self.address.clone()))
            .unwrap();
    }
}

pub(crate) enum TestEvent {
    NewSubchannel(Arc<TestSubchannel>),
    UpdatePicker(LbState),
    RequestResolution,
    Connect(Address),
    ResetBackoff(Address),
}

impl Debug for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSubchannel(sc) => write!(f, "NewSubchannel({})", sc.address()),
            Self::UpdatePicker(state) => write!(f, "UpdatePicker({})", state.connectivity_state),
            Self::RequestResolution => write!(f, "RequestResolution"),
            Self::Connect(addr) => write!(f, "Connect({:?})", addr.address),
            Self::ResetBackoff(addr) => write!(f, "ResetBackoff({:?})", addr.address),
        }
    }
}

/// A test channel controller that forwards calls to a channel.  This allows
/// tests to verify when a policy asks for subchannels, pickers or
/// re-resolution.
pub(crate) struct TestChannelController {
    tx_events: mpsc::UnboundedSender<TestEvent>,
    initial_states: Mutex<HashMap<Address, ConnectivityState>>,
    unsupported_addresses: Mutex<Vec<Address>>,
}

impl TestChannelController {
    pub fn new(tx_events: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self {
            tx_events,
            initial_states: Mutex::new(HashMap::new()),
            unsupported_addresses: Mutex::new(Vec::new()),
        }
    }

    /// Makes subchannels for `address` start out in `state` instead of Idle.
    pub fn set_initial_state(&self, address: Address, state: ConnectivityState) {
        self.initial_states.lock().insert(address, state);
    }

    /// Makes `new_subchannel` refuse `address`.
    pub fn set_unsupported(&self, address: Address) {
        self.unsupported_addresses.lock().push(address);
    }
}

impl ChannelController for TestChannelController {
    fn new_subchannel(&self, address: &Address) -> Option<Arc<dyn Subchannel>> {
        println!("new_subchannel called for address {}", address);
        if self.unsupported_addresses.lock().contains(address) {
            return None;
        }
        let initial_state = self
            .initial_states
            .lock()
            .get(address)
            .copied()
            .unwrap_or(ConnectivityState::Idle);
        let subchannel = Arc::new(TestSubchannel::new(
            address.clone(),
            self.tx_events.clone(),
            initial_state,
        ));
        self.tx_events
            .send(TestEvent::NewSubchannel(subchannel.clone()))
            .unwrap();
        Some(subchannel)
    }

    fn update_picker(&self, update: LbState) {
        println!("update_picker called with {}", update.connectivity_state);
        self.tx_events
            .send(TestEvent::UpdatePicker(update))
            .unwrap();
    }

    fn request_resolution(&self) {
        self.tx_events.send(TestEvent::RequestResolution).unwrap();
    }
}

/// An observer that records every event it sees, in order, for later
/// inspection.
#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: Mutex<Vec<PolicyEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<PolicyEvent> {
        self.events.lock().clone()
    }
}

impl PolicyObserver for RecordingObserver {
    fn on_event(&self, event: &PolicyEvent) {
        self.events.lock().push(event.clone());
    }
}
