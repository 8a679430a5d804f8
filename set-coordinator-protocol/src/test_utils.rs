//! Test doubles shared by the unit tests

use crate::group::GroupId;
use crate::native::NativeInterface;
use crate::PeerAddress;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// A native command issued by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeCall {
    Connect(PeerAddress),
    Disconnect(PeerAddress),
    GroupLockSet(GroupId, bool),
}

/// Native interface that records every call and returns configurable results
pub struct RecordingNative {
    calls: Mutex<Vec<NativeCall>>,
    connect_result: AtomicBool,
    disconnect_result: AtomicBool,
    lock_result: AtomicBool,
}

impl RecordingNative {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            connect_result: AtomicBool::new(true),
            disconnect_result: AtomicBool::new(true),
            lock_result: AtomicBool::new(true),
        }
    }

    pub fn set_connect_result(&self, result: bool) {
        self.connect_result.store(result, Ordering::SeqCst);
    }

    pub fn set_disconnect_result(&self, result: bool) {
        self.disconnect_result.store(result, Ordering::SeqCst);
    }

    pub fn set_lock_result(&self, result: bool) {
        self.lock_result.store(result, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<NativeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn connect_count(&self, address: &PeerAddress) -> usize {
        self.count(|call| *call == NativeCall::Connect(*address))
    }

    pub fn disconnect_count(&self, address: &PeerAddress) -> usize {
        self.count(|call| *call == NativeCall::Disconnect(*address))
    }

    pub fn lock_calls(&self) -> Vec<(GroupId, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                NativeCall::GroupLockSet(group_id, lock) => Some((group_id, lock)),
                _ => None,
            })
            .collect()
    }

    fn count(&self, predicate: impl Fn(&NativeCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: NativeCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl NativeInterface for RecordingNative {
    fn connect(&self, address: &PeerAddress) -> bool {
        self.record(NativeCall::Connect(*address));
        self.connect_result.load(Ordering::SeqCst)
    }

    fn disconnect(&self, address: &PeerAddress) -> bool {
        self.record(NativeCall::Disconnect(*address));
        self.disconnect_result.load(Ordering::SeqCst)
    }

    fn group_lock_set(&self, group_id: GroupId, lock: bool) -> bool {
        self.record(NativeCall::GroupLockSet(group_id, lock));
        self.lock_result.load(Ordering::SeqCst)
    }
}
