//! Cross-thread handoff with a pollable wakeup descriptor.
//!
//! Producers push items into a bounded queue and write one byte into a
//! socket pair; the consumer polls the other end of the pair alongside its
//! network sockets and drains the queue once it becomes readable.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

/// Producer side; cloneable across threads.
pub struct Notifier<T> {
    tx: Sender<T>,
    waker: Arc<UnixStream>,
}

impl<T> Clone for Notifier<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            waker: Arc::clone(&self.waker),
        }
    }
}

/// Consumer side, owned by the event loop.
pub struct Handoff<T> {
    rx: Receiver<T>,
    waker: UnixStream,
}

/// Creates a handoff queue holding at most `capacity` undelivered items.
pub fn handoff<T>(capacity: usize) -> io::Result<(Notifier<T>, Handoff<T>)> {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let (writer, reader) = UnixStream::pair()?;
    writer.set_nonblocking(true)?;
    reader.set_nonblocking(true)?;

    Ok((
        Notifier {
            tx,
            waker: Arc::new(writer),
        },
        Handoff { rx, waker: reader },
    ))
}

impl<T> Notifier<T> {
    /// Queues `item`, blocking while the queue is full.
    ///
    /// Returns the item back if the consumer is gone.
    pub fn send(&self, item: T) -> Result<(), T> {
        self.tx.send(item).map_err(|e| e.into_inner())?;
        self.wake();
        Ok(())
    }

    /// Queues `item` unless the queue is full or the consumer is gone.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        self.tx.try_send(item)?;
        self.wake();
        Ok(())
    }

    fn wake(&self) {
        // A full pipe already guarantees a pending wakeup.
        let _ = (&*self.waker).write(&[1]);
    }
}

impl<T> Handoff<T> {
    /// Takes every queued item and clears the wakeup signal.
    pub fn drain(&mut self) -> Vec<T> {
        let mut buf = [0u8; 64];
        loop {
            match self.waker.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        self.rx.try_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Descriptor that becomes readable when items are queued.
    pub fn file_descriptor(&self) -> RawFd {
        self.waker.as_raw_fd()
    }
}
