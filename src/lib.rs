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

//! Client-side load balancing core.
//!
//! This crate contains the pieces of a channel's load balancing machinery
//! that sit between name resolution and connection management: the traits a
//! load balancing policy implements ([`load_balancing::LbPolicy`]) and
//! consumes ([`load_balancing::ChannelController`],
//! [`load_balancing::Subchannel`]), an explicitly constructed policy
//! registry, and a round robin policy built on those seams.
//!
//! The crate does not create connections and does not resolve names.  Both
//! are modeled as external collaborators behind traits so that the policy
//! logic can be driven and observed deterministically.

use std::fmt::Display;

pub mod load_balancing;
pub mod name_resolution;

/// A representation of the current state of a subchannel, also used for the
/// aggregate state of a load balancing policy.
///
/// A subchannel begins in the Idle state.  When asked to connect, it
/// transitions to Connecting.  If a connection attempt succeeds, the state
/// becomes Ready.  Otherwise, if connection attempts fail, the state becomes
/// TransientFailure and the subchannel continues attempting to reconnect.
///
/// Shutdown is reported while a subchannel is being destroyed.  It never
/// appears in a policy's aggregate state.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Idle => write!(f, "Idle"),
            ConnectivityState::Connecting => write!(f, "Connecting"),
            ConnectivityState::Ready => write!(f, "Ready"),
            ConnectivityState::TransientFailure => write!(f, "TransientFailure"),
            ConnectivityState::Shutdown => write!(f, "Shutdown"),
        }
    }
}
