use std::sync::atomic::Ordering;
use std::sync::Arc;

#[cfg(feature = "log")]
use log::trace;

use crate::dev::DevId;
use crate::registry::{Core, PumpId, WorkerId};
use crate::timer::TimerId;

/// Wire-visible event kind. Numeric values match the original's `IOE_*`
/// constants exactly (spec §6): applications compare against them, so
/// they are not an implementation detail.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum EventKind {
    Connected = 1,
    ConnFail = 2,
    Accept = 3,
    Read = 4,
    Write = 5,
    InvalidDev = 6,
    Timeout = 100,
    DnsRecv = 200,
    DnsClose = 201,
    User(i32),
}

impl EventKind {
    /// Base value user-defined event kinds are built from (`USER_DEFINED`
    /// in spec §6).
    pub const USER_DEFINED: i32 = 10_000;

    pub fn as_i32(self) -> i32 {
        match self {
            EventKind::Connected => 1,
            EventKind::ConnFail => 2,
            EventKind::Accept => 3,
            EventKind::Read => 4,
            EventKind::Write => 5,
            EventKind::InvalidDev => 6,
            EventKind::Timeout => 100,
            EventKind::DnsRecv => 200,
            EventKind::DnsClose => 201,
            EventKind::User(n) => n,
        }
    }
}

/// What an [`Event`] is about: a dev, a timer, or a DNS in-flight message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Dev(DevId),
    Timer(TimerId),
    DnsMessage(u16),
}

/// A value describing a readiness occurrence, queued for a pump or worker
/// to run a callback against.
///
/// `object_id` is the generation-free analogue of spec §9's "arena +
/// typed indices" guidance: on dequeue the consumer looks `target` back
/// up in the registry and compares identity; a stale event (the object
/// was closed after this was enqueued, but before it was run) is dropped
/// silently rather than ever touching freed state.
#[derive(Clone)]
pub struct Event {
    pub kind: EventKind,
    pub target: Target,
    pub target_pump: Option<PumpId>,
    pub target_worker: Option<WorkerId>,
    pub handler: Option<IoHandler>,
}

impl Event {
    pub fn new(kind: EventKind, target: Target) -> Event {
        Event {
            kind,
            target,
            target_pump: None,
            target_worker: None,
            handler: None,
        }
    }
}

/// User callback: `(para, event_kind, fd_kind_marker) -> i32`. The
/// original's `void *` callback-plus-para pair becomes a boxed closure;
/// the fixed, small set of event kinds means one signature covers every
/// call site rather than a trait per kind (spec §9).
pub type IoHandler = Arc<dyn Fn(EventKind, i32) -> i32 + Send + Sync>;
