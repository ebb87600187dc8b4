//! Synchronous server event hub.

use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::request::HttpVersion;

#[derive(Debug, Clone)]
pub enum ServerEvent {
    HttpServerStarted {
        started_at: SystemTime,
    },
    HttpServerStopped {
        stopped_at: SystemTime,
        started_at: SystemTime,
    },
    RequestHeadReceived {
        method: String,
        target: String,
        version: HttpVersion,
    },
    ResponseSent {
        status: u16,
        close_connection: bool,
    },
}

type Observer = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Observers are invoked in subscription order, on the dispatching thread.
#[derive(Default)]
pub struct EventHub {
    observers: RwLock<Vec<Observer>>,
}

impl EventHub {
    pub fn new() -> Self {
        EventHub::default()
    }

    pub fn subscribe(&self, observer: impl Fn(&ServerEvent) + Send + Sync + 'static) {
        self.observers.write().push(Arc::new(observer));
    }

    pub fn dispatch(&self, event: &ServerEvent) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer(event);
        }
    }
}
