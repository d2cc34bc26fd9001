use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicU8, Ordering},
        Condvar, Mutex, MutexGuard,
    },
    time::Duration,
};

use crate::SpectrumFrame;

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;

/// Single-slot exchange between the spectrum producer and the consumer.
///
/// The producer may only fill an empty slot. The slot stays occupied from
/// the moment a frame is deposited until the consumer has finished
/// processing it, so frames offered in the meantime are dropped.
#[derive(Debug)]
pub struct FrameHandoff {
    state: AtomicU8,
    slot: Mutex<SpectrumFrame>,
    filled: Condvar,
}

impl FrameHandoff {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            slot: Mutex::new(SpectrumFrame::default()),
            filled: Condvar::new(),
        }
    }

    /// Deposits a frame if the slot is free. Returns `false` when the frame
    /// was dropped because the consumer still holds the previous one.
    pub fn offer(&self, frame: &SpectrumFrame) -> bool {
        if self
            .state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        {
            let mut slot = self.lock_slot();
            slot.clone_from(frame);
            self.state.store(READY, Ordering::Release);
        }
        self.filled.notify_one();
        true
    }

    /// Waits up to `timeout` for a frame. The returned guard keeps the slot
    /// occupied until it is dropped.
    pub fn wait(&self, timeout: Duration) -> Option<PendingFrame<'_>> {
        let slot = self.lock_slot();
        let (slot, _) = self
            .filled
            .wait_timeout_while(slot, timeout, |_| self.state.load(Ordering::Acquire) != READY)
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if self.state.load(Ordering::Acquire) != READY {
            return None;
        }

        Some(PendingFrame {
            handoff: self,
            frame: slot.clone(),
        })
    }

    /// Whether a deposited frame has not been released yet.
    pub fn is_occupied(&self) -> bool {
        self.state.load(Ordering::Acquire) != EMPTY
    }

    /// Wakes a waiting consumer without handing it a frame.
    pub fn wake(&self) {
        let _slot = self.lock_slot();
        self.filled.notify_all();
    }

    fn release(&self) {
        self.state.store(EMPTY, Ordering::Release);
    }

    fn lock_slot(&self) -> MutexGuard<'_, SpectrumFrame> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for FrameHandoff {
    fn default() -> Self {
        Self::new()
    }
}

/// A frame claimed by the consumer. Dropping it frees the slot.
#[derive(Debug)]
pub struct PendingFrame<'a> {
    handoff: &'a FrameHandoff,
    frame: SpectrumFrame,
}

impl Deref for PendingFrame<'_> {
    type Target = SpectrumFrame;

    fn deref(&self) -> &SpectrumFrame {
        &self.frame
    }
}

impl Drop for PendingFrame<'_> {
    fn drop(&mut self) {
        self.handoff.release();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize},
            Arc,
        },
        thread,
    };

    use super::*;

    fn frame(marker: i16) -> SpectrumFrame {
        let mut frame = SpectrumFrame::default();
        frame.set(0, marker);
        frame
    }

    #[test]
    fn second_offer_is_dropped_until_release() {
        let handoff = FrameHandoff::new();
        assert!(handoff.offer(&frame(1)));
        assert!(!handoff.offer(&frame(2)));

        let pending = handoff.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(pending.magnitudes()[0], 1);
        // still being processed
        assert!(!handoff.offer(&frame(3)));
        drop(pending);

        assert!(!handoff.is_occupied());
        assert!(handoff.offer(&frame(4)));
        assert_eq!(handoff.wait(Duration::from_millis(10)).unwrap().magnitudes()[0], 4);
    }

    #[test]
    fn wait_times_out_when_empty() {
        let handoff = FrameHandoff::new();
        assert!(handoff.wait(Duration::from_millis(5)).is_none());
        handoff.wake();
        assert!(handoff.wait(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn slow_consumer_sheds_frames() {
        let handoff = Arc::new(FrameHandoff::new());
        let done = Arc::new(AtomicBool::new(false));
        let processed = Arc::new(AtomicUsize::new(0));

        let consumer = {
            let handoff = handoff.clone();
            let done = done.clone();
            let processed = processed.clone();
            thread::spawn(move || loop {
                if let Some(pending) = handoff.wait(Duration::from_millis(5)) {
                    thread::sleep(Duration::from_millis(2));
                    processed.fetch_add(1, Ordering::SeqCst);
                    drop(pending);
                } else if done.load(Ordering::SeqCst) && !handoff.is_occupied() {
                    break;
                }
            })
        };

        let mut accepted = 0;
        let submitted = 500;
        for i in 0..submitted {
            if handoff.offer(&frame(i as i16)) {
                accepted += 1;
            }
            thread::sleep(Duration::from_micros(50));
        }
        done.store(true, Ordering::SeqCst);
        consumer.join().unwrap();

        let processed = processed.load(Ordering::SeqCst);
        assert_eq!(processed, accepted);
        assert!(processed <= submitted);
        assert!(accepted < submitted);
    }
}
