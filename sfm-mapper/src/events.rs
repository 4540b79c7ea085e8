use crate::{ImageId, SharedReconstruction};
use parking_lot::RwLock;
use std::sync::Arc;

/// A transition of the mapper that observers may checkpoint on.
///
/// Events are delivered on the worker that owns the model, right after the transition and
/// while no lock on the model is held. The model is consistent when the handler runs.
#[derive(Debug, Clone)]
pub enum MapperEvent {
    ImageRegistered {
        /// The index of the model in the manager at the time of the event.
        model: usize,
        image: ImageId,
        reconstruction: SharedReconstruction,
    },
    ModelFinalized {
        model: usize,
        reconstruction: SharedReconstruction,
    },
    /// The model was removed from the manager because it was too small.
    ModelDiscarded {
        model: usize,
        num_registered_images: usize,
    },
}

impl MapperEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ImageRegistered { .. } => EventKind::ImageRegistered,
            Self::ModelFinalized { .. } => EventKind::ModelFinalized,
            Self::ModelDiscarded { .. } => EventKind::ModelDiscarded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ImageRegistered,
    ModelFinalized,
    ModelDiscarded,
}

pub type EventHandler = Arc<dyn Fn(&MapperEvent) + Send + Sync>;

/// Handlers subscribed by event kind.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<(EventKind, EventHandler)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, handler: impl Fn(&MapperEvent) + Send + Sync + 'static) {
        self.handlers.write().push((kind, Arc::new(handler)));
    }

    /// Call every handler of the event's kind in subscription order.
    pub fn emit(&self, event: &MapperEvent) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .iter()
            .filter(|(other, _)| *other == kind)
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn handlers_only_see_their_kind() {
        let bus = EventBus::new();
        let discarded = Arc::new(AtomicUsize::new(0));
        let counter = discarded.clone();
        bus.subscribe(EventKind::ModelDiscarded, move |event| {
            if let MapperEvent::ModelDiscarded {
                num_registered_images,
                ..
            } = event
            {
                counter.fetch_add(*num_registered_images, Ordering::SeqCst);
            }
        });
        bus.subscribe(EventKind::ModelFinalized, |_| panic!("wrong kind"));
        bus.emit(&MapperEvent::ModelDiscarded {
            model: 0,
            num_registered_images: 3,
        });
        assert_eq!(discarded.load(Ordering::SeqCst), 3);
    }
}
