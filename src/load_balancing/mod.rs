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

//! Load balancing policy interfaces.
//!
//! A load balancing policy consumes resolver updates, manages subchannels,
//! and publishes pickers through a [`ChannelController`].  The channel and
//! its connection machinery stay behind traits so policies can be driven
//! deterministically in tests.

pub mod registry;
pub mod round_robin;

#[cfg(test)]
mod test_utils;

use std::{
    any::Any,
    error::Error,
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use serde::de::DeserializeOwned;
use tonic::{metadata::MetadataMap, Status};

use crate::{
    name_resolution::{Address, ResolverUpdate},
    ConnectivityState,
};

/// A collection of data configured on the channel that is constructing this
/// LbPolicy.
pub struct LbPolicyOptions {
    /// The channel facilities the policy uses to create subchannels and to
    /// publish pickers and re-resolution requests.
    pub channel_controller: Arc<dyn ChannelController>,

    /// An optional observer invoked with a structured event at each decision
    /// the policy makes.  Policy behavior is identical with or without one.
    pub observer: Option<Arc<dyn PolicyObserver>>,
}

/// An LB policy factory that produces LbPolicy instances used by the channel
/// to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Note that build must not fail.  Any optional configuration is delivered
    /// via the LbPolicy's resolver_update method.
    ///
    /// An LbPolicy instance is assumed to begin in a Connecting state that
    /// queues RPCs until its first update.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB Policy.
    fn name(&self) -> &'static str;

    /// Parses the JSON LB policy configuration into an internal representation.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(
        &self,
        _config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// An LB policy instance.
///
/// LB policies are responsible for creating connections (modeled as
/// Subchannels) and producing Picker instances for picking connections for
/// RPCs.
///
/// Implementations serialize their state internally: control calls and
/// connectivity watcher callbacks may arrive from arbitrary threads and are
/// applied one at a time, in arrival order.
pub trait LbPolicy: Send + Sync {
    /// Called by the channel when the name resolver produces a new set of
    /// resolved addresses.
    ///
    /// An Err return means the update was rejected; the channel may keep
    /// operating with the policy's previous configuration.
    fn resolver_update(
        &self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Clears the connection backoff of every subchannel held by the policy,
    /// typically in response to an application signal that connectivity was
    /// restored.
    fn reset_backoff(&self);

    /// Releases all subchannels and cancels their connectivity watches.  No
    /// further state is reported after this returns, and any later call into
    /// the policy is a no-op.
    fn shutdown(&self);
}

/// Controls channel behaviors.
///
/// Calls into the controller must not re-enter the policy synchronously;
/// their effects come back through later watcher or resolver notifications.
pub trait ChannelController: Send + Sync {
    /// Creates a new subchannel in Idle state, or returns None if the channel
    /// cannot connect to this address, e.g. because no transport exists for
    /// its network type.
    fn new_subchannel(&self, address: &Address) -> Option<Arc<dyn Subchannel>>;

    /// Provides a new snapshot of the LB policy's state to the channel.
    fn update_picker(&self, update: LbState);

    /// Signals the name resolver to attempt to re-resolve addresses.  Typically
    /// used when connections fail, indicating a possible change in the overall
    /// network configuration.
    fn request_resolution(&self);
}

/// A Subchannel represents a method of communicating with a server which may
/// be connected or disconnected many times across its lifetime.
///
/// - Subchannels start Idle.
///
/// - Idle transitions to Connecting when connect() is called.
///
/// - Connecting transitions to Ready on success or TransientFailure on error.
///
/// - Ready transitions to Idle when the connection is lost.
///
/// - TransientFailure transitions to Connecting when the reconnect backoff
///   timer has expired.  This timer scales exponentially and is reset when
///   the subchannel becomes Ready.
///
/// - Shutdown is reported once while the subchannel is being destroyed.
pub trait Subchannel: Send + Sync {
    /// Returns the address this subchannel was created for.
    fn address(&self) -> Address;

    /// Returns the current connectivity state without waiting.  A subchannel
    /// may be shared, so it can have advanced past Idle before any particular
    /// holder asked it to connect.
    fn connectivity_state(&self) -> ConnectivityState;

    /// Registers a watcher that is notified asynchronously of every state
    /// change until it is unregistered.  Registration delivers no callback
    /// for the current state; callers that need it poll connectivity_state()
    /// first.
    fn register_connectivity_state_watcher(&self, watcher: Arc<dyn ConnectivityStateWatcher>);

    /// Unregisters, by identity, a watcher previously passed to
    /// register_connectivity_state_watcher.  After this returns the watcher
    /// receives no further notifications.
    fn unregister_connectivity_state_watcher(&self, watcher: Arc<dyn ConnectivityStateWatcher>);

    /// Begins connecting.  A no-op unless the subchannel is Idle.
    fn connect(&self);

    /// Clears any backoff delay before the subchannel's next connection
    /// attempt.
    fn reset_backoff(&self);
}

/// Receives connectivity state changes for one subchannel.
///
/// Notifications for a given subchannel arrive in the order the subchannel
/// raised them, one at a time, possibly from arbitrary threads.
pub trait ConnectivityStateWatcher: Send + Sync {
    /// Called for every state change that occurs after registration.
    fn on_state_change(&self, state: ConnectivityState);
}

/// A convenience wrapper for an LB policy's configuration object.
pub struct LbConfig {
    config: Box<dyn Any>,
}

impl LbConfig {
    /// Create a new LbConfig wrapper containing the provided config.
    pub fn new(config: Box<dyn Any>) -> Self {
        LbConfig { config }
    }

    /// Returns the wrapped configuration as the type used by the LbPolicy.
    pub fn convert_to<T: 'static>(&self) -> Option<&T> {
        self.config.downcast_ref::<T>()
    }
}

/// Represents the JSON configuration of an LB policy before it has been
/// parsed into a policy-specific representation.
#[derive(Debug, Clone)]
pub struct ParsedJsonLbConfig {
    value: serde_json::Value,
}

impl ParsedJsonLbConfig {
    /// Creates a ParsedJsonLbConfig from the provided JSON text.
    pub fn new(json: &str) -> Result<Self, serde_json::Error> {
        Ok(ParsedJsonLbConfig {
            value: serde_json::from_str(json)?,
        })
    }

    /// Converts the wrapped JSON into the configuration type of an LB policy.
    pub fn convert_to<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.value.clone())
    }
}

/// A Picker is responsible for deciding what Subchannel to use for any given
/// request.  A Picker is only used once for any RPC.  If pick() returns Queue,
/// the channel will queue the RPC until a new Picker is produced by the
/// LbPolicy, and will call pick() on the new Picker for the request.
///
/// Pickers are always paired with a ConnectivityState which the channel will
/// expose to applications so they can predict what might happen when
/// performing RPCs:
///
/// If the ConnectivityState is Connecting, the Picker should return a Queue
/// result and continue to wait for pending connections.
///
/// If the ConnectivityState is Ready, the Picker should return a Ready
/// Subchannel.
///
/// If the ConnectivityState is TransientFailure, the Picker should return a
/// Fail result with a status that describes why connections are failing.
pub trait Picker: Send + Sync {
    /// Picks a connection to use for the request.
    ///
    /// This function should not block.  If the Picker needs to do blocking or
    /// time-consuming work to service this request, it should return Queue,
    /// and the Pick call will be repeated by the channel when a new Picker is
    /// produced by the LbPolicy.
    ///
    /// Many requests pick concurrently against one Picker while the policy
    /// may be installing a different Picker; implementations must be safe
    /// without any lock shared with the policy.
    fn pick(&self, args: &PickArgs) -> PickResult;
}

/// A collection of data about the request used by the channel for routing.
#[derive(Debug, Default)]
pub struct PickArgs {
    /// The method path of the request.
    pub path: String,
    /// The outgoing request metadata.
    pub metadata: MetadataMap,
}

pub enum PickResult {
    /// Indicates the Subchannel in the Pick should be used for the request.
    Pick(Pick),
    /// Indicates the LbPolicy is attempting to connect to a server to use for
    /// the request.
    Queue,
    /// Indicates that the request should fail with the included error status
    /// (with the code converted to UNAVAILABLE).  If the RPC is wait-for-ready,
    /// then it will not be terminated, but instead attempted on a new picker if
    /// one is produced before it is cancelled.
    Fail(Status),
}

impl Display for PickResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PickResult::Pick(pick) => write!(f, "Pick({})", pick.subchannel.address()),
            PickResult::Queue => write!(f, "Queue"),
            PickResult::Fail(status) => write!(f, "Fail({status})"),
        }
    }
}

/// A collection of data used by the channel for routing a request.
pub struct Pick {
    /// The Subchannel for the request.
    pub subchannel: Arc<dyn Subchannel>,
    // Metadata to be added to existing outgoing metadata.
    pub metadata: MetadataMap,
}

/// Data provided by the LB policy.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,

    /// The status associated with the state.  OK unless connectivity_state is
    /// TransientFailure, where it describes why connections are failing.
    pub status: Status,

    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// Returns a generic initial LbState which is Connecting and a picker which
    /// queues all picks.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            status: Status::ok(""),
            picker: Arc::new(QueuingPicker {}),
        }
    }
}

/// QueuingPicker always returns Queue.  LB policies that are not actively
/// Connecting should not use this picker.
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _args: &PickArgs) -> PickResult {
        PickResult::Queue
    }
}

/// Failing always returns Fail with its status.  Paired with the
/// TransientFailure connectivity state.
pub struct Failing {
    pub status: Status,
}

impl Picker for Failing {
    fn pick(&self, _args: &PickArgs) -> PickResult {
        PickResult::Fail(self.status.clone())
    }
}

/// Per-state entry counts for one subchannel list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Counters {
    /// Total number of entries in the list, regardless of state.
    pub num_subchannels: usize,
    pub num_ready: usize,
    pub num_connecting: usize,
    pub num_transient_failure: usize,
}

impl Display for Counters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "num_subchannels={} num_ready={} num_connecting={} num_transient_failure={}",
            self.num_subchannels, self.num_ready, self.num_connecting, self.num_transient_failure
        )
    }
}

/// A structured event describing a transition or decision inside an LB
/// policy.
///
/// Events exist for observability only; a policy behaves identically whether
/// or not an observer is installed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum PolicyEvent {
    /// A subchannel list was created from an address list.
    ListCreated { generation: u64, num_entries: usize },
    /// An entry's logical connectivity state changed.
    SubchannelStateChanged {
        generation: u64,
        index: usize,
        old_state: ConnectivityState,
        new_state: ConnectivityState,
        counters: Counters,
    },
    /// The pending list became the active list.
    ListPromoted { generation: u64 },
    /// A list was discarded and its watches cancelled.
    ListDiscarded { generation: u64 },
    /// The policy reported an aggregate state to the channel.
    StateReported {
        connectivity_state: ConnectivityState,
        counters: Counters,
    },
    /// A subchannel failure caused the policy to request re-resolution.
    ReresolutionRequested { generation: u64, index: usize },
}

/// Receives PolicyEvents from an LB policy.
///
/// Callbacks run inside the policy's serialized state handling and must not
/// block or call back into the policy.
pub trait PolicyObserver: Send + Sync {
    fn on_event(&self, event: &PolicyEvent);
}

/// A PolicyObserver that forwards every event to `tracing` at debug level.
#[derive(Default)]
pub struct TracingObserver {}

impl PolicyObserver for TracingObserver {
    fn on_event(&self, event: &PolicyEvent) {
        match event {
            PolicyEvent::ListCreated {
                generation,
                num_entries,
            } => {
                tracing::debug!(generation, num_entries, "created subchannel list");
            }
            PolicyEvent::SubchannelStateChanged {
                generation,
                index,
                old_state,
                new_state,
                counters,
            } => {
                tracing::debug!(
                    generation,
                    index,
                    old_state = %old_state,
                    new_state = %new_state,
                    counters = %counters,
                    "subchannel connectivity state changed"
                );
            }
            PolicyEvent::ListPromoted { generation } => {
                tracing::debug!(generation, "promoted pending subchannel list");
            }
            PolicyEvent::ListDiscarded { generation } => {
                tracing::debug!(generation, "discarded subchannel list");
            }
            PolicyEvent::StateReported {
                connectivity_state,
                counters,
            } => {
                tracing::debug!(
                    connectivity_state = %connectivity_state,
                    counters = %counters,
                    "reporting aggregate state"
                );
            }
            PolicyEvent::ReresolutionRequested { generation, index } => {
                tracing::debug!(generation, index, "requesting re-resolution");
            }
        }
    }
}
