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

use std::collections::BTreeMap;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime};
use std::{io, thread};

/// UNIX timestamp in milliseconds; asynchronous operation deadlines are tens of milliseconds, so
/// second precision is not enough.
#[derive(Wrapper, WrapperMut, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug, From)]
#[wrapper(Display, Add, Sub)]
#[wrapper_mut(AddAssign, SubAssign)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates timestamp matching the current moment.
    pub fn now() -> Self {
        let duration =
            SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).expect("system time");
        Self(duration.as_millis() as u64)
    }

    /// Converts into number of milliseconds since UNIX epoch.
    pub fn into_millis(self) -> u64 { self.0 }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output { Timestamp(self.0 + rhs.as_millis() as u64) }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Self::Output { Timestamp(self.0 - rhs.as_millis() as u64) }
}

impl AddAssign<Duration> for Timestamp {
    fn add_assign(&mut self, rhs: Duration) { self.0 += rhs.as_millis() as u64 }
}

impl SubAssign<Duration> for Timestamp {
    fn sub_assign(&mut self, rhs: Duration) { self.0 -= rhs.as_millis() as u64 }
}

struct Scheduled {
    cancelled: Arc<AtomicBool>,
    task: Box<dyn FnOnce() + Send>,
}

#[derive(Default)]
struct WheelState {
    queue: BTreeMap<Timestamp, Vec<Scheduled>>,
    shutdown: bool,
}

impl WheelState {
    /// Removes and returns every entry which has fired by `time`.
    fn expire(&mut self, time: Timestamp) -> Vec<Scheduled> {
        // `split_off` returns everything *after* the given key, including the key itself, so an
        // entry scheduled for exactly `time` must land in the expired half; hence the `+ 1`.
        let unexpired = self.queue.split_off(&Timestamp(time.0 + 1));
        let fired = std::mem::replace(&mut self.queue, unexpired);
        fired.into_values().flatten().collect()
    }

    fn next_deadline(&self) -> Option<Timestamp> { self.queue.keys().next().copied() }
}

struct WheelShared {
    state: Mutex<WheelState>,
    cvar: Condvar,
}

/// Best-effort cancellation handle for a scheduled deadline task.
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Prevents the task from running if it has not fired yet. Never blocks.
    pub fn cancel(&self) { self.cancelled.store(true, Ordering::Release) }
}

/// The external timer service: a dedicated thread running scheduled deadline tasks.
///
/// Used by the completion port to fail pending operations which exceed their caller-supplied
/// deadline. Firing a task and a genuine completion racing is resolved by the pending result's
/// grab-and-clear handoff, not here; the wheel only guarantees the task runs at-most-once and not
/// before its deadline.
pub struct TimerWheel {
    shared: Arc<WheelShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimerWheel {
    /// Spawns the timer thread.
    pub fn new() -> io::Result<Self> {
        let shared = Arc::new(WheelShared {
            state: Mutex::new(WheelState::default()),
            cvar: Condvar::new(),
        });

        let runner = shared.clone();
        let thread = thread::Builder::new()
            .name(s!("mux-timer"))
            .spawn(move || Self::run(runner))?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn run(shared: Arc<WheelShared>) {
        let mut state = shared.state.lock().expect("timer lock poisoned");
        loop {
            if state.shutdown {
                return;
            }

            let now = Timestamp::now();
            let due = state.expire(now);
            if !due.is_empty() {
                drop(state);
                for scheduled in due {
                    if !scheduled.cancelled.load(Ordering::Acquire) {
                        (scheduled.task)();
                    }
                }
                state = shared.state.lock().expect("timer lock poisoned");
                continue;
            }

            state = match state.next_deadline() {
                None => shared.cvar.wait(state).expect("timer lock poisoned"),
                Some(next) => {
                    let wait = Duration::from_millis((next - now).into_millis());
                    shared
                        .cvar
                        .wait_timeout(state, wait)
                        .expect("timer lock poisoned")
                        .0
                }
            };
        }
    }

    /// Schedules `task` to run once `delay` from now has elapsed.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let scheduled = Scheduled {
            cancelled: cancelled.clone(),
            task: Box::new(task),
        };

        let deadline = Timestamp::now() + delay;
        let mut state = self.shared.state.lock().expect("timer lock poisoned");
        state.queue.entry(deadline).or_default().push(scheduled);
        drop(state);

        self.shared.cvar.notify_all();
        TimerHandle { cancelled }
    }

    /// Stops the timer thread; tasks which have not fired are dropped.
    pub fn shutdown(&self) {
        self.shared.state.lock().expect("timer lock poisoned").shutdown = true;
        self.shared.cvar.notify_all();
        if let Some(thread) = self.thread.lock().expect("timer thread poisoned").take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) { self.shutdown() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expire_exact() {
        let mut state = WheelState::default();
        let now = Timestamp::now();
        for delay in [8u64, 9, 10] {
            state.queue.entry(now + Duration::from_millis(delay)).or_default().push(Scheduled {
                cancelled: Arc::new(AtomicBool::new(false)),
                task: Box::new(|| {}),
            });
        }

        assert_eq!(state.expire(now + Duration::from_millis(9)).len(), 2);
        assert_eq!(state.queue.len(), 1);
    }

    #[test]
    fn fires_in_order() {
        let wheel = TimerWheel::new().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        let tx2 = tx.clone();
        wheel.schedule(Duration::from_millis(40), move || tx2.send(2u8).unwrap());
        wheel.schedule(Duration::from_millis(5), move || tx.send(1u8).unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
    }

    #[test]
    fn cancel_prevents_firing() {
        let wheel = TimerWheel::new().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        let handle = wheel.schedule(Duration::from_millis(20), move || tx.send(()).unwrap());
        handle.cancel();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
