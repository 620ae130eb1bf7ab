//! Ephemeral event sinks — fire-and-forget broadcast of transient signals
//! (streaming audio chunks, typing indicators) that observers care about but
//! the event log never records.

use std::sync::{Arc, Mutex};

use crate::types::Event;

/// Receives ephemeral events. Emission is fire-and-forget; implementations
/// should be non-blocking.
pub trait EphemeralSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Dispatches each ephemeral event to every attached sink.
#[derive(Clone, Default)]
pub struct EphemeralBroadcaster {
    sinks: Arc<Mutex<Vec<Arc<dyn EphemeralSink>>>>,
}

impl EphemeralBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&self, sink: Arc<dyn EphemeralSink>) {
        self.sinks.lock().unwrap().push(sink);
    }

    pub fn emit(&self, event: &Event) {
        let sinks = self.sinks.lock().unwrap().clone();
        for sink in sinks {
            sink.emit(event);
        }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }
}

/// Sink that collects events in memory (for testing / inspection).
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl EphemeralSink for MemorySink {
    fn emit(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Sink that forwards events to a callback (bridging into channels etc.).
pub struct CallbackSink {
    callback: Box<dyn Fn(&Event) + Send + Sync>,
}

impl CallbackSink {
    pub fn new(callback: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl EphemeralSink for CallbackSink {
    fn emit(&self, event: &Event) {
        (self.callback)(event);
    }
}
