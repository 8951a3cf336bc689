#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use bitzomax_bus::testing::MemoryBus;
use bitzomax_bus::{BusConfig, ConnectionManager};
use bitzomax_conversion::{ConversionTracker, TrackingCallbacks};

/// One callback invocation, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Progress(u8, String),
    Complete(String),
    Error(String),
}

/// Records every callback invocation of one tracking session.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callbacks(&self) -> TrackingCallbacks {
        let (p, c, e) = (self.calls.clone(), self.calls.clone(), self.calls.clone());
        TrackingCallbacks::new(
            move |percent, message| {
                p.lock()
                    .unwrap()
                    .push(Call::Progress(percent, message.to_string()))
            },
            move |file| c.lock().unwrap().push(Call::Complete(file.to_string())),
            move |error| e.lock().unwrap().push(Call::Error(error.to_string())),
        )
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn progress(&self) -> Vec<u8> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Progress(p, _) => Some(p),
                _ => None,
            })
            .collect()
    }
}

/// Manager wired to an in-memory bus with default settings.
pub fn manager_with(bus: &MemoryBus) -> Arc<ConnectionManager> {
    ConnectionManager::new(BusConfig::default(), Arc::new(bus.clone()))
}

pub fn tracker_with(bus: &MemoryBus) -> ConversionTracker {
    ConversionTracker::new(manager_with(bus))
}

/// Let the link reader task dispatch everything published so far.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

pub fn processing(percent: u8, message: &str) -> String {
    serde_json::json!({
        "percentComplete": percent,
        "status": "processing",
        "message": message,
    })
    .to_string()
}
