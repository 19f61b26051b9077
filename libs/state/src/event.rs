use talemu_resource::AnyResource;

/// Kind of a watch delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Destroyed,
    /// Boundary marker after the initial snapshot of a bootstrapped watch.
    Bootstrapped,
    /// The store failed underneath the watcher; the watch is dead and must
    /// be reopened.
    Errored,
    /// An apply that changed nothing; the resource version did not advance.
    Noop,
}

/// A single watch delivery. `sequence` is the per-(namespace, kind) delivery
/// counter; within one resource, deliveries are totally ordered by the
/// resource version.
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub sequence: u64,
    pub resource: Option<AnyResource>,
    pub old: Option<AnyResource>,
}

impl Event {
    pub(crate) fn marker(kind: EventKind) -> Self {
        Self {
            kind,
            sequence: 0,
            resource: None,
            old: None,
        }
    }

    /// The resource this event is about, for Created/Updated/Destroyed.
    pub fn subject(&self) -> Option<&AnyResource> {
        self.resource.as_ref()
    }
}
