//! Small identifier newtypes shared across the crate.

use std::fmt;

/// WAL timeline identifier. Timeline 1 is the initial timeline and has no
/// `.history` file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeLineID(pub u32);

impl TimeLineID {
    pub const INITIAL: TimeLineID = TimeLineID(1);
}

impl fmt::Display for TimeLineID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for TimeLineID {
    fn from(n: u32) -> Self {
        TimeLineID(n)
    }
}

impl From<TimeLineID> for u32 {
    fn from(tli: TimeLineID) -> Self {
        tli.0
    }
}
