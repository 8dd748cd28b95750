use std::{fmt, ops};

/// Options controlling how a registration with the `Poller` behaves:
/// edge- vs. level-triggered, and whether it should self-disarm after
/// firing once.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Default)]
pub struct PollOpt(usize);

const EDGE: usize = 0b0001;
const LEVEL: usize = 0b0010;
const ONESHOT: usize = 0b0100;

impl PollOpt {
    #[inline]
    pub fn empty() -> PollOpt {
        PollOpt(0)
    }

    #[inline]
    pub fn edge() -> PollOpt {
        PollOpt(EDGE)
    }

    #[inline]
    pub fn level() -> PollOpt {
        PollOpt(LEVEL)
    }

    #[inline]
    pub fn oneshot() -> PollOpt {
        PollOpt(ONESHOT)
    }

    #[inline]
    pub fn is_edge(self) -> bool {
        self.contains(PollOpt::edge())
    }

    #[inline]
    pub fn is_level(self) -> bool {
        self.contains(PollOpt::level())
    }

    #[inline]
    pub fn is_oneshot(self) -> bool {
        self.contains(PollOpt::oneshot())
    }

    #[inline]
    pub fn contains(self, other: PollOpt) -> bool {
        (self & other) == other
    }

    #[inline]
    pub fn insert(&mut self, other: PollOpt) {
        self.0 |= other.0;
    }
}

impl ops::BitOr for PollOpt {
    type Output = PollOpt;

    #[inline]
    fn bitor(self, other: PollOpt) -> PollOpt {
        PollOpt(self.0 | other.0)
    }
}

impl ops::BitAnd for PollOpt {
    type Output = PollOpt;

    #[inline]
    fn bitand(self, other: PollOpt) -> PollOpt {
        PollOpt(self.0 & other.0)
    }
}

impl fmt::Debug for PollOpt {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (PollOpt::edge(), "Edge-Triggered"),
            (PollOpt::level(), "Level-Triggered"),
            (PollOpt::oneshot(), "OneShot"),
        ];

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;
                one = true
            }
        }

        Ok(())
    }
}
