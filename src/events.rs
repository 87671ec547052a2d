//! One-way notification of log lines and progress records to observers.

use std::panic::{catch_unwind, AssertUnwindSafe};

/// An event emitted by the engine during an update.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DfuEvent {
    Log {
        message: String,
    },
    Progress {
        /// `"init"` or `"firmware"`.
        object: &'static str,
        /// Never zero, so percent math is safe.
        total_bytes: usize,
        sent_bytes: usize,
        validated_bytes: usize,
    },
}

impl DfuEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DfuEvent::Log { .. } => EventKind::Log,
            DfuEvent::Progress { .. } => EventKind::Progress,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EventKind {
    Log,
    Progress,
}

/// Handle returned by [`EventSink::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ListenerId(u64);

struct Entry {
    id: ListenerId,
    kind: EventKind,
    callback: Box<dyn Fn(&DfuEvent) + Send>,
}

/// Dispatches events synchronously, in registration order.
///
/// A panicking listener is contained: later listeners still run, the
/// transfer continues, and the incident is reported to log listeners.
#[derive(Default)]
pub struct EventSink {
    listeners: Vec<Entry>,
    next_id: u64,
}

impl EventSink {
    pub fn subscribe(
        &mut self,
        kind: EventKind,
        callback: impl Fn(&DfuEvent) + Send + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push(Entry {
            id,
            kind,
            callback: Box::new(callback),
        });
        id
    }

    /// Remove a listener; returns whether it was registered.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|entry| entry.id != id);
        self.listeners.len() != before
    }

    pub fn dispatch(&self, event: &DfuEvent) {
        let kind = event.kind();
        for entry in self.listeners.iter().filter(|e| e.kind == kind) {
            if catch_unwind(AssertUnwindSafe(|| (entry.callback)(event))).is_err() {
                tracing::warn!("event listener panicked");
                self.report_listener_panic(entry.id);
            }
        }
    }

    fn report_listener_panic(&self, offender: ListenerId) {
        let note = DfuEvent::Log {
            message: "event listener panicked, continuing".into(),
        };
        for entry in self
            .listeners
            .iter()
            .filter(|e| e.kind == EventKind::Log && e.id != offender)
        {
            let _ = catch_unwind(AssertUnwindSafe(|| (entry.callback)(&note)));
        }
    }
}
