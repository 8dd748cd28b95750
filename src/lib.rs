//! `epump-core`: a cross-platform event-driven dispatch engine.
//!
//! A small number of **pump** threads each own a readiness multiplexer
//! (epoll on Linux) and a per-pump timer wheel; any number of **worker**
//! threads pull dispatched events off a shared queue so slow handlers
//! never stall a pump's poll loop. A non-blocking DNS resolver is built
//! out of the same devices, timers and events as everything else.
//!
//! The crate is organized bottom-up:
//!
//! - [`sys`] — raw epoll/eventfd/socket syscalls.
//! - [`token`], [`ready`], [`poll_opt`], [`source`] — the small
//!   vocabulary ([`Token`], [`Ready`], [`PollOpt`], [`Source`]) every
//!   registration with a [`Poller`] is expressed in.
//! - [`poller`], [`waker`], [`queue`] — the C1/C2 substrate: the
//!   multiplexer facade, its cross-thread wake-up primitive, and the
//!   pollable MPMC queue pumps and workers hand work to each other
//!   through.
//! - [`dev`], [`timer`], [`event`] — C3/C4/C5: the device and timer
//!   registries and the domain event type dispatched out of them.
//! - [`pump`], [`worker`] — C6/C7: the two thread roles.
//! - [`registry`] — C8: [`Core`], the public entry point.
//! - [`mlisten`] — C9: multi-listen, fanning one logical listener out to
//!   a socket per pump.
//! - [`net`] — TCP/UDP/Unix device constructors built on [`Source`].
//! - [`dns`] — the non-blocking resolver.

#[macro_use]
mod sys;

mod dev;
mod dns;
mod error;
mod event;
mod mlisten;
mod net;
mod poll_opt;
mod poller;
mod pump;
mod queue;
mod ready;
mod registry;
mod source;
mod timer;
mod token;
mod waker;
mod worker;

pub use dev::{BindType, Dev, DevId, FdKind, IoState};
pub use dns::{DnsRecord, DnsStatus, RrClass, RrType};
pub use error::{Error, Result};
pub use event::{Event, EventKind, IoHandler};
pub use poll_opt::PollOpt;
pub use poller::Poller;
pub use ready::Ready;
pub use registry::{Core, CoreConfig, PumpId, WorkerId};
pub use source::Source;
pub use timer::TimerId;
pub use token::Token;
