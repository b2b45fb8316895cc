//! Single-slot rendezvous for blocking host calls
//!
//! The sandbox thread clears the slot, posts a call request and then blocks
//! in [`SharedMailbox::wait`]. The host writes the encoded `[error, result]`
//! pair with [`SharedMailbox::write`], which wakes it. A length of zero means
//! the slot is empty.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::MailboxError;

/// Default payload capacity in bytes
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

struct Slot {
    len: usize,
    payload: Vec<u8>,
    invalidated: bool,
}

pub struct SharedMailbox {
    capacity: usize,
    slot: Mutex<Slot>,
    signal: Condvar,
}

impl SharedMailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slot: Mutex::new(Slot {
                len: 0,
                payload: vec![0; capacity],
                invalidated: false,
            }),
            signal: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear the length cell before posting a new request
    pub fn reset(&self) {
        self.slot().len = 0;
    }

    /// Store a response and wake the waiting sandbox thread. `bytes` must not
    /// be empty, an empty slot reads as "no response yet".
    pub fn write(&self, bytes: &[u8]) -> Result<(), MailboxError> {
        debug_assert!(!bytes.is_empty(), "empty mailbox payload");
        if bytes.len() > self.capacity {
            return Err(MailboxError::TooLarge {
                len: bytes.len(),
                capacity: self.capacity,
            });
        }

        let mut slot = self.slot();
        if slot.invalidated {
            return Err(MailboxError::Invalidated);
        }
        slot.payload[..bytes.len()].copy_from_slice(bytes);
        slot.len = bytes.len();
        drop(slot);

        self.signal.notify_all();
        Ok(())
    }

    /// Block the calling thread until a response is written, then copy it out
    pub fn wait(&self) -> Result<Vec<u8>, MailboxError> {
        let slot = self
            .signal
            .wait_while(self.slot(), |slot| slot.len == 0 && !slot.invalidated)
            .unwrap_or_else(PoisonError::into_inner);

        if slot.invalidated {
            return Err(MailboxError::Invalidated);
        }
        Ok(slot.payload[..slot.len].to_vec())
    }

    /// Release any waiter for good; later writes fail
    pub fn invalidate(&self) {
        self.slot().invalidated = true;
        self.signal.notify_all();
    }

    pub fn is_invalidated(&self) -> bool {
        self.slot().invalidated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_wait_returns_exactly_the_written_bytes() {
        let mailbox = Arc::new(SharedMailbox::new(64));
        mailbox.reset();

        let writer = {
            let mailbox = mailbox.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                mailbox.write(b"[null,42]").expect("write");
            })
        };

        assert_eq!(mailbox.wait().expect("wait"), b"[null,42]");
        writer.join().expect("writer thread");
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let mailbox = SharedMailbox::new(4);
        assert_eq!(
            mailbox.write(b"too long"),
            Err(MailboxError::TooLarge {
                len: 8,
                capacity: 4
            })
        );
    }

    #[test]
    fn test_invalidate_releases_waiter() {
        let mailbox = Arc::new(SharedMailbox::new(16));
        mailbox.reset();

        let waiter = {
            let mailbox = mailbox.clone();
            std::thread::spawn(move || mailbox.wait())
        };
        std::thread::sleep(Duration::from_millis(20));
        mailbox.invalidate();

        assert_eq!(
            waiter.join().expect("waiter thread"),
            Err(MailboxError::Invalidated)
        );
        assert_eq!(mailbox.write(b"1"), Err(MailboxError::Invalidated));
    }
}
