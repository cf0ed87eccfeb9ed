// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! event handling.
//!
//! Listeners are registered per tag and fired by the scheduler task as an
//! operation moves through its lifecycle. Callbacks run on the scheduler
//! thread and must not block: signal a condvar or post to a queue instead.

use crate::tag::TagId;
use crate::Status;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;

/// tag lifecycle events, in the order they can fire for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// the first operation on a new tag completed successfully
    Created,
    /// a read was issued toward the remote
    ReadStarted,
    /// a read finished, successfully or not
    ReadCompleted,
    /// a write was issued toward the remote
    WriteStarted,
    /// a write finished, successfully or not
    WriteCompleted,
    /// a pending operation was aborted
    Aborted,
    /// the tag is being torn down; last event it will ever fire
    Destroyed,
}

type Callback = Box<dyn FnMut(TagId, Event, Status) + Send>;

static LISTENERS: Lazy<Mutex<HashMap<TagId, Vec<(u64, Callback)>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static NEXT_TOKEN: Lazy<Mutex<u64>> = Lazy::new(|| Mutex::new(1));

/// removes its listener when dropped
#[derive(Debug)]
pub struct Handler {
    tag: TagId,
    token: u64,
}

impl Drop for Handler {
    fn drop(&mut self) {
        let mut map = LISTENERS.lock();
        if let Some(list) = map.get_mut(&self.tag) {
            list.retain(|(token, _)| *token != self.token);
            if list.is_empty() {
                map.remove(&self.tag);
            }
        }
    }
}

/// register a listener for a tag's events; drop the returned [`Handler`]
/// to unregister
pub fn listen<F>(tag: TagId, f: F) -> Handler
where
    F: FnMut(TagId, Event, Status) + Send + 'static,
{
    let token = {
        let mut next = NEXT_TOKEN.lock();
        let token = *next;
        *next += 1;
        token
    };
    LISTENERS
        .lock()
        .entry(tag)
        .or_default()
        .push((token, Box::new(f)));
    Handler { tag, token }
}

/// fire an event to every listener of a tag
pub(crate) fn emit(tag: TagId, event: Event, status: Status) {
    trace!("tag {tag:?} event {event:?} status {status}");
    let mut map = LISTENERS.lock();
    if let Some(list) = map.get_mut(&tag) {
        for (_, cb) in list.iter_mut() {
            cb(tag, event, status);
        }
    }
}

/// drop every listener of a tag; used during teardown after `Destroyed`
pub(crate) fn clear(tag: TagId) {
    LISTENERS.lock().remove(&tag);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_listen_emit_unregister() {
        let tag = TagId(90001);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let handler = listen(tag, move |_, event, status| {
            assert_eq!(event, Event::ReadCompleted);
            assert!(status.is_ok());
            count2.fetch_add(1, Ordering::SeqCst);
        });

        emit(tag, Event::ReadCompleted, Status::Ok);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(handler);
        emit(tag, Event::ReadCompleted, Status::Ok);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_multiple_listeners() {
        let tag = TagId(90002);
        let count = Arc::new(AtomicUsize::new(0));
        let handlers: Vec<_> = (0..3)
            .map(|_| {
                let count = Arc::clone(&count);
                listen(tag, move |_, _, _| {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        emit(tag, Event::WriteStarted, Status::Pending);
        assert_eq!(count.load(Ordering::SeqCst), 3);

        drop(handlers);
        clear(tag);
        emit(tag, Event::WriteStarted, Status::Pending);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
