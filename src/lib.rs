// Library for readiness multiplexing and asynchronous I/O completion ports.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Platform I/O multiplexing for UNIX systems, layered bottom-up:
//!
//! - [`sys`]: thin wrappers over the native readiness facilities (`epoll`, `kqueue`, `poll`)
//!   behind the [`sys::Facility`] and [`sys::SharedPoll`] traits;
//! - [`Multiplexer`]: one descriptor set over one facility, with a coalescing registration log
//!   and a wakeup channel;
//! - [`Selector`]: readiness selection with per-channel interest keys and portable
//!   ready-operation translation;
//! - [`Port`]: a completion port multiplexing one-shot readiness events and handler tasks over a
//!   worker pool (platforms with `epoll` or `kqueue` only);
//! - [`AsyncStream`] and [`AsyncListener`]: asynchronous TCP channels returning [`Completion`]
//!   handles resolved by the port, its timer service, or cancellation, whichever comes first.

#[macro_use]
extern crate amplify;

use std::io;

mod mux;
mod nonblock;
mod selector;
pub mod sys;
mod timeouts;
mod waker;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod channel;
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod port;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub use channel::{AsyncListener, AsyncStream, Completion};
pub use mux::{Multiplexer, UpdateLog};
pub use nonblock::{finish_connect, IoStatus, ReadNonblocking, WriteNonblocking};
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub use port::{Port, PortChannel, PortConfig};
pub use selector::{ChannelKind, InterestKey, Ready, Selector};
pub use timeouts::{TimerHandle, TimerWheel, Timestamp};
pub use waker::{WakeupChannel, WakeupReader, WakeupSender};

/// Errors of multiplexing and asynchronous channel operations.
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// the selector or port is closed
    Closed,

    /// the channel was closed while the operation was pending
    AsyncClosed,

    /// the operation did not complete within its deadline
    TimedOut,

    /// the operation was cancelled
    Cancelled,

    /// an operation of the same kind is already pending on the channel
    Conflict,

    /// the descriptor is already registered
    AlreadyRegistered,

    /// the descriptor is not registered
    NotRegistered,

    /// the direction was disabled by an earlier operation timeout
    Disabled,

    /// I/O error: {0}
    #[from]
    Io(io::Error),
}
