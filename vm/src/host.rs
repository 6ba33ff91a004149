use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Seconds between the Smalltalk epoch (1901-01-01) and the Unix epoch.
pub const SMALLTALK_EPOCH_OFFSET: u64 = 2_177_452_800;

/// Milliseconds since the first call in this process.
pub fn monotonic_millis() -> u64 {
    let start = START_TIME.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

pub fn unix_time_seconds() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs(),
        Err(_) => 0,
    }
}

/// Number of integers in an event record handed to the image.
pub const EVENT_WORDS: usize = 8;

/// Event type codes understood by the image's event sensor.
pub mod event_type {
    pub const NONE: i64 = 0;
    pub const MOUSE: i64 = 1;
    pub const KEYBOARD: i64 = 2;
}

/// One input event as the image reads it: type, timestamp and six
/// type-specific fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent(pub [i64; EVENT_WORDS]);

impl InputEvent {
    pub fn mouse(x: i64, y: i64, buttons: i64, modifiers: i64) -> Self {
        let now = (monotonic_millis() & 0x3FFF_FFFF) as i64;
        Self([event_type::MOUSE, now, x, y, buttons, modifiers, 0, 0])
    }

    /// `action` is 0 for a character stroke, 1 for key down, 2 for key up.
    pub fn key(char_code: i64, action: i64, modifiers: i64) -> Self {
        let now = (monotonic_millis() & 0x3FFF_FFFF) as i64;
        Self([event_type::KEYBOARD, now, char_code, action, modifiers, 0, 0, 0])
    }

    pub const fn none() -> Self {
        Self([event_type::NONE, 0, 0, 0, 0, 0, 0, 0])
    }
}

#[derive(Debug, Default)]
struct HostQueue {
    /// 1-based indices into the ExternalObjects array.
    signals: VecDeque<usize>,
    events: VecDeque<InputEvent>,
    input_pending: bool,
}

#[derive(Debug, Default)]
struct HostShared {
    queue: Mutex<HostQueue>,
    wake: Condvar,
}

/// Cloneable handle through which other native threads feed the VM.
///
/// Signals and events are queued under a lock and picked up by the
/// interpreter at its next check point.
#[derive(Debug, Clone, Default)]
pub struct HostHandle {
    shared: Arc<HostShared>,
}

impl HostHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a signal of the semaphore at `index` (1-based) in the
    /// ExternalObjects array.
    pub fn signal_semaphore(&self, index: usize) {
        let mut queue = self.shared.queue.lock();
        queue.signals.push_back(index);
        self.shared.wake.notify_one();
    }

    pub fn post_event(&self, event: InputEvent) {
        let mut queue = self.shared.queue.lock();
        queue.events.push_back(event);
        queue.input_pending = true;
        self.shared.wake.notify_one();
    }

    pub(crate) fn next_event(&self) -> Option<InputEvent> {
        self.shared.queue.lock().events.pop_front()
    }

    /// Take every pending signal index and whether input arrived since
    /// the last drain.
    pub(crate) fn drain(&self) -> (Vec<usize>, bool) {
        let mut queue = self.shared.queue.lock();
        let signals = queue.signals.drain(..).collect();
        let input = std::mem::take(&mut queue.input_pending);
        (signals, input)
    }

    pub(crate) fn has_pending(&self) -> bool {
        let queue = self.shared.queue.lock();
        !queue.signals.is_empty() || queue.input_pending
    }

    /// Block until something is queued or `deadline` (in
    /// [`monotonic_millis`] time) passes. `None` waits indefinitely.
    pub(crate) fn wait_until(&self, deadline: Option<u64>) {
        let mut queue = self.shared.queue.lock();
        loop {
            if !queue.signals.is_empty() || queue.input_pending {
                return;
            }
            match deadline {
                Some(deadline) => {
                    let now = monotonic_millis();
                    if now >= deadline {
                        return;
                    }
                    let timeout = Duration::from_millis(deadline - now);
                    if self.shared.wake.wait_for(&mut queue, timeout).timed_out() {
                        return;
                    }
                }
                None => self.shared.wake.wait(&mut queue),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn signals_drain_in_order() {
        let host = HostHandle::new();
        host.signal_semaphore(3);
        host.signal_semaphore(1);
        assert!(host.has_pending());
        assert_eq!(host.drain(), (vec![3, 1], false));
        assert!(!host.has_pending());
    }

    #[test]
    fn events_mark_input_pending() {
        let host = HostHandle::new();
        host.post_event(InputEvent::mouse(10, 20, 4, 0));
        let (signals, input) = host.drain();
        assert!(signals.is_empty());
        assert!(input);
        let event = host.next_event().unwrap();
        assert_eq!(event.0[0], event_type::MOUSE);
        assert_eq!(&event.0[2..5], &[10, 20, 4]);
        assert_eq!(host.next_event(), None);
    }

    #[test]
    fn wait_wakes_on_signal_from_other_thread() {
        let host = HostHandle::new();
        let remote = host.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.signal_semaphore(2);
        });
        host.wait_until(None);
        assert_eq!(host.drain().0, vec![2]);
        t.join().unwrap();
    }

    #[test]
    fn wait_times_out_at_deadline() {
        let host = HostHandle::new();
        let deadline = monotonic_millis() + 5;
        host.wait_until(Some(deadline));
        assert!(monotonic_millis() >= deadline);
    }
}
