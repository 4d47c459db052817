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

use std::error::Error;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tonic::metadata::MetadataMap;
use tonic::Status;

use crate::load_balancing::registry::LbPolicyRegistry;
use crate::load_balancing::{
    ChannelController, ConnectivityStateWatcher, Counters, Failing, LbConfig, LbPolicy,
    LbPolicyBuilder, LbPolicyOptions, LbState, Pick, PickArgs, PickResult, Picker, PolicyEvent,
    PolicyObserver, QueuingPicker, Subchannel,
};
use crate::name_resolution::{Address, ResolverUpdate};
use crate::ConnectivityState;

pub static POLICY_NAME: &str = "round_robin";

struct RoundRobinBuilder {}

impl LbPolicyBuilder for RoundRobinBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RoundRobinPolicy::new(options))
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

/// Registers the round_robin LB policy with the given registry.
pub fn register(registry: &LbPolicyRegistry) {
    registry.add_builder(RoundRobinBuilder {});
}

/// An LB policy that creates one subchannel per resolved address and rotates
/// picks evenly across the Ready ones.
///
/// Each resolver update produces a fresh subchannel list.  The new list is
/// held as pending and swapped in only once it cannot make the channel worse
/// off than the list currently serving picks.
struct RoundRobinPolicy {
    inner: Arc<InnerPolicy>,
}

impl RoundRobinPolicy {
    fn new(options: LbPolicyOptions) -> Self {
        Self {
            inner: Arc::new_cyclic(|weak_self| InnerPolicy {
                weak_self: weak_self.clone(),
                channel_controller: options.channel_controller,
                observer: options.observer,
                next_generation: AtomicU64::new(1),
                state: Mutex::new(PolicyState {
                    current_list: None,
                    pending_list: None,
                    shutdown: false,
                }),
            }),
        }
    }
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(
        &self,
        update: ResolverUpdate,
        _config: Option<&LbConfig>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.inner.resolver_update(update)
    }

    fn reset_backoff(&self) {
        self.inner.reset_backoff();
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for RoundRobinPolicy {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

// Shared core of the policy.  Subchannel watchers hold a Weak to it so a
// notification racing policy destruction is dropped instead of resurrecting
// the policy.
struct InnerPolicy {
    weak_self: Weak<InnerPolicy>,
    channel_controller: Arc<dyn ChannelController>,
    observer: Option<Arc<dyn PolicyObserver>>,
    next_generation: AtomicU64,
    state: Mutex<PolicyState>,
}

// All mutable policy state, guarded by one mutex so every resolver update
// and watcher notification is applied atomically.
struct PolicyState {
    current_list: Option<SubchannelList>,
    pending_list: Option<SubchannelList>,
    shutdown: bool,
}

impl PolicyState {
    // Returns the list with the given generation if it is still installed.
    fn list_mut(&mut self, generation: u64) -> Option<&mut SubchannelList> {
        if let Some(list) = &mut self.current_list {
            if list.generation == generation {
                return Some(list);
            }
        }
        if let Some(list) = &mut self.pending_list {
            if list.generation == generation {
                return Some(list);
            }
        }
        None
    }
}

impl InnerPolicy {
    fn emit(&self, event: PolicyEvent) {
        if let Some(observer) = &self.observer {
            observer.on_event(&event);
        }
    }

    fn resolver_update(
        &self,
        update: ResolverUpdate,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Ok(());
        }
        let (addresses, status_for_tf) = match update.addresses {
            Ok(addresses) => {
                let note = update.resolution_note.unwrap_or_default();
                (
                    addresses,
                    Status::unavailable(format!("empty address list: {note}")),
                )
            }
            Err(status) => {
                // A resolver error arriving while a previous address list is
                // serving is ignored; the channel keeps using that list.
                if state.current_list.is_some() {
                    return Ok(());
                }
                (vec![], status)
            }
        };
        // Any earlier pending list never got promoted and is superseded now.
        if let Some(mut old_pending) = state.pending_list.take() {
            let generation = old_pending.generation;
            old_pending.shutdown();
            self.emit(PolicyEvent::ListDiscarded { generation });
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let empty = addresses.is_empty();
        let list = SubchannelList::new(generation, &addresses, self.channel_controller.as_ref());
        self.emit(PolicyEvent::ListCreated {
            generation,
            num_entries: list.entries.len(),
        });
        state.pending_list = Some(list);
        self.start_watching(&mut state, generation, status_for_tf.clone());
        if empty {
            return Err(status_for_tf.message().to_string().into());
        }
        Ok(())
    }

    // Folds in the current state of every subchannel in the list, registers
    // watchers, asks all subchannels to connect, and evaluates the list for
    // promotion once.
    fn start_watching(&self, state: &mut PolicyState, generation: u64, status_for_tf: Status) {
        {
            let Some(list) = state.list_mut(generation) else {
                return;
            };
            // Subchannels may be shared, so some can be past Idle before
            // this policy ever asks them to connect.
            for index in 0..list.entries.len() {
                let Some(subchannel) = list.entries[index].subchannel.clone() else {
                    continue;
                };
                let raw_state = subchannel.connectivity_state();
                let old_state = list.entries[index].logical_state;
                if list.update_logical_state(index, raw_state) {
                    let new_state = list.entries[index].logical_state;
                    let counters = list.counters();
                    self.emit(PolicyEvent::SubchannelStateChanged {
                        generation,
                        index,
                        old_state,
                        new_state,
                        counters,
                    });
                }
            }
            for index in 0..list.entries.len() {
                let Some(subchannel) = list.entries[index].subchannel.clone() else {
                    continue;
                };
                let watcher: Arc<dyn ConnectivityStateWatcher> = Arc::new(EntryWatcher {
                    policy: self.weak_self.clone(),
                    generation,
                    index,
                });
                subchannel.register_connectivity_state_watcher(watcher.clone());
                list.entries[index].watcher = Some(watcher);
                subchannel.connect();
            }
        }
        self.maybe_update_connectivity_state(state, generation, status_for_tf);
    }

    // Applies one raw connectivity notification for entry `index` of the
    // list with the given generation.
    fn subchannel_notification(&self, generation: u64, index: usize, raw_state: ConnectivityState) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        let changed = {
            let Some(list) = state.list_mut(generation) else {
                return;
            };
            // A subchannel that fails or drops back to Idle may mean the
            // backend set changed.  Re-resolve, and start the next
            // connection attempt right away.
            if raw_state == ConnectivityState::TransientFailure
                || raw_state == ConnectivityState::Idle
            {
                self.channel_controller.request_resolution();
                if let Some(subchannel) = &list.entries[index].subchannel {
                    subchannel.connect();
                }
                self.emit(PolicyEvent::ReresolutionRequested { generation, index });
            }
            let old_state = list.entries[index].logical_state;
            if list.update_logical_state(index, raw_state) {
                let new_state = list.entries[index].logical_state;
                let counters = list.counters();
                self.emit(PolicyEvent::SubchannelStateChanged {
                    generation,
                    index,
                    old_state,
                    new_state,
                    counters,
                });
                true
            } else {
                false
            }
        };
        if changed {
            self.maybe_update_connectivity_state(
                &mut state,
                generation,
                Status::unavailable("connections to all backends failing"),
            );
        }
    }

    // Promotes the pending list if it can do no worse than the current one,
    // then reports the aggregate state of the current list if the change
    // originated from it.
    fn maybe_update_connectivity_state(
        &self,
        state: &mut PolicyState,
        generation: u64,
        status_for_tf: Status,
    ) {
        let promote = match &state.pending_list {
            // Promote when the current list has no Ready connections, when
            // the pending list has one, or when every pending entry already
            // failed.  num_transient_failure and entries.len() may both be
            // zero here, in which case the empty pending list wins.
            Some(pending) if pending.generation == generation => match &state.current_list {
                None => true,
                Some(current) => {
                    current.num_ready == 0
                        || pending.num_ready > 0
                        || pending.num_transient_failure == pending.entries.len()
                }
            },
            _ => false,
        };
        if promote {
            if let Some(mut old_current) = state.current_list.take() {
                let old_generation = old_current.generation;
                old_current.shutdown();
                self.emit(PolicyEvent::ListDiscarded {
                    generation: old_generation,
                });
            }
            state.current_list = state.pending_list.take();
            self.emit(PolicyEvent::ListPromoted { generation });
        }
        // Only the list serving picks reports upward.  A pending list that
        // was not promoted stays silent until its own next event.
        let Some(current) = &state.current_list else {
            return;
        };
        if current.generation != generation {
            return;
        }
        let counters = current.counters();
        if current.num_ready > 0 {
            self.emit(PolicyEvent::StateReported {
                connectivity_state: ConnectivityState::Ready,
                counters,
            });
            self.channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::Ready,
                status: Status::ok(""),
                picker: Arc::new(RoundRobinPicker::new(current)),
            });
        } else if current.num_connecting > 0 {
            self.emit(PolicyEvent::StateReported {
                connectivity_state: ConnectivityState::Connecting,
                counters,
            });
            self.channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::Connecting,
                status: Status::ok(""),
                picker: Arc::new(QueuingPicker {}),
            });
        } else if current.num_transient_failure == current.entries.len() {
            self.emit(PolicyEvent::StateReported {
                connectivity_state: ConnectivityState::TransientFailure,
                counters,
            });
            self.channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::TransientFailure,
                status: status_for_tf.clone(),
                picker: Arc::new(Failing {
                    status: status_for_tf,
                }),
            });
        }
    }

    fn reset_backoff(&self) {
        let state = self.state.lock();
        if let Some(list) = &state.current_list {
            list.reset_backoff();
        }
        if let Some(list) = &state.pending_list {
            list.reset_backoff();
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        if let Some(mut list) = state.current_list.take() {
            let generation = list.generation;
            list.shutdown();
            self.emit(PolicyEvent::ListDiscarded { generation });
        }
        if let Some(mut list) = state.pending_list.take() {
            let generation = list.generation;
            list.shutdown();
            self.emit(PolicyEvent::ListDiscarded { generation });
        }
    }
}

// One slot in a subchannel list.  The subchannel handle is absent when the
// channel could not create one for the address; such a slot stays Connecting
// for aggregation purposes.
struct SubchannelEntry {
    subchannel: Option<Arc<dyn Subchannel>>,
    logical_state: ConnectivityState,
    watcher: Option<Arc<dyn ConnectivityStateWatcher>>,
}

// An immutable set of subchannels created from one resolver update, with
// per-state counts of its entries maintained incrementally.
struct SubchannelList {
    generation: u64,
    entries: Vec<SubchannelEntry>,
    num_ready: usize,
    num_connecting: usize,
    num_transient_failure: usize,
}

impl SubchannelList {
    fn new(
        generation: u64,
        addresses: &[Address],
        channel_controller: &dyn ChannelController,
    ) -> Self {
        let entries: Vec<SubchannelEntry> = addresses
            .iter()
            .map(|address| SubchannelEntry {
                subchannel: channel_controller.new_subchannel(address),
                logical_state: ConnectivityState::Connecting,
                watcher: None,
            })
            .collect();
        let num_connecting = entries.len();
        Self {
            generation,
            entries,
            num_ready: 0,
            num_connecting,
            num_transient_failure: 0,
        }
    }

    fn counters(&self) -> Counters {
        Counters {
            num_subchannels: self.entries.len(),
            num_ready: self.num_ready,
            num_connecting: self.num_connecting,
            num_transient_failure: self.num_transient_failure,
        }
    }

    // Applies a raw connectivity notification to the entry's logical state
    // and the list's counters.  Returns whether the logical state changed.
    fn update_logical_state(&mut self, index: usize, raw_state: ConnectivityState) -> bool {
        let old_state = self.entries[index].logical_state;
        // An entry in TransientFailure holds that state until its
        // subchannel reports Ready.  Intervening Idle and Connecting
        // reports are ignored.
        if old_state == ConnectivityState::TransientFailure
            && raw_state != ConnectivityState::Ready
        {
            return false;
        }
        // Idle is indistinguishable from Connecting here; entries are asked
        // to connect as soon as they are created or report Idle.
        let new_state = if raw_state == ConnectivityState::Idle {
            ConnectivityState::Connecting
        } else {
            raw_state
        };
        if new_state == old_state {
            return false;
        }
        self.update_state_counters(old_state, new_state);
        self.entries[index].logical_state = new_state;
        true
    }

    fn update_state_counters(&mut self, old_state: ConnectivityState, new_state: ConnectivityState) {
        match old_state {
            ConnectivityState::Ready => {
                assert!(self.num_ready > 0);
                self.num_ready -= 1;
            }
            ConnectivityState::Connecting => {
                assert!(self.num_connecting > 0);
                self.num_connecting -= 1;
            }
            ConnectivityState::TransientFailure => {
                assert!(self.num_transient_failure > 0);
                self.num_transient_failure -= 1;
            }
            other => panic!("unexpected logical state {other}"),
        }
        match new_state {
            ConnectivityState::Ready => self.num_ready += 1,
            ConnectivityState::Connecting => self.num_connecting += 1,
            ConnectivityState::TransientFailure => self.num_transient_failure += 1,
            other => panic!("unexpected logical state {other}"),
        }
    }

    fn reset_backoff(&self) {
        for entry in &self.entries {
            if let Some(subchannel) = &entry.subchannel {
                subchannel.reset_backoff();
            }
        }
    }

    // Cancels every watch and drops the subchannel handles.  Called exactly
    // once, when the list is discarded or the policy shuts down.
    fn shutdown(&mut self) {
        for entry in &mut self.entries {
            if let (Some(subchannel), Some(watcher)) = (&entry.subchannel, entry.watcher.take()) {
                subchannel.unregister_connectivity_state_watcher(watcher);
            }
            entry.subchannel = None;
        }
    }
}

// Forwards one entry's connectivity notifications back into the policy.
// Identified by list generation and entry index so stale notifications from
// a discarded list fall through harmlessly.
struct EntryWatcher {
    policy: Weak<InnerPolicy>,
    generation: u64,
    index: usize,
}

impl ConnectivityStateWatcher for EntryWatcher {
    fn on_state_change(&self, state: ConnectivityState) {
        if let Some(policy) = self.policy.upgrade() {
            policy.subchannel_notification(self.generation, self.index, state);
        }
    }
}

// A picker over the subchannels that were Ready when it was built.  Starts
// at a random subchannel and advances by one on every pick.
struct RoundRobinPicker {
    subchannels: Vec<Arc<dyn Subchannel>>,
    next: AtomicUsize,
}

impl RoundRobinPicker {
    fn new(list: &SubchannelList) -> Self {
        let subchannels: Vec<Arc<dyn Subchannel>> = list
            .entries
            .iter()
            .filter(|entry| entry.logical_state == ConnectivityState::Ready)
            .filter_map(|entry| entry.subchannel.clone())
            .collect();
        let random_index: usize = rand::random_range(..subchannels.len());
        Self {
            subchannels,
            next: AtomicUsize::new(random_index),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _args: &PickArgs) -> PickResult {
        let len = self.subchannels.len();
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % len;
        PickResult::Pick(Pick {
            subchannel: self.subchannels[idx].clone(),
            metadata: MetadataMap::new(),
        })
    }
}
