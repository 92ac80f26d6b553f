#[cfg(test)]
mod attr_test;

use std::fmt;

use stun::attributes::{AttrType, ATTR_ICE_CONTROLLED, ATTR_ICE_CONTROLLING, ATTR_PRIORITY, ATTR_USE_CANDIDATE};
use stun::checks::check_size;
use stun::message::{Getter, Message, Setter};

/// Role an agent plays in the nomination protocol.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Role {
    /// Not yet decided; resolved when connectivity checks start or from
    /// the first authenticated inbound check.
    Unspecified = 0,
    Controlling = 1,
    Controlled = 2,
}

impl Default for Role {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl From<u8> for Role {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Controlling,
            2 => Self::Controlled,
            _ => Self::Unspecified,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Controlling => "controlling",
            Self::Controlled => "controlled",
            Self::Unspecified => "unspecified",
        };
        write!(f, "{s}")
    }
}

const TIE_BREAKER_SIZE: usize = 8; // 64 bit
const PRIORITY_SIZE: usize = 4; // 32 bit

fn add_tie_breaker(m: &mut Message, t: AttrType, value: u64) {
    m.add(t, &value.to_be_bytes());
}

fn get_tie_breaker(m: &Message, t: AttrType) -> Result<u64, stun::Error> {
    let v = m.get(t)?;
    check_size(t, v.len(), TIE_BREAKER_SIZE)?;
    Ok(u64::from_be_bytes([
        v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7],
    ]))
}

/// ICE-CONTROLLING attribute carrying the sender's tiebreaker.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct AttrControlling(pub u64);

impl Setter for AttrControlling {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        add_tie_breaker(m, ATTR_ICE_CONTROLLING, self.0);
        Ok(())
    }
}

impl Getter for AttrControlling {
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        self.0 = get_tie_breaker(m, ATTR_ICE_CONTROLLING)?;
        Ok(())
    }
}

/// ICE-CONTROLLED attribute carrying the sender's tiebreaker.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct AttrControlled(pub u64);

impl Setter for AttrControlled {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        add_tie_breaker(m, ATTR_ICE_CONTROLLED, self.0);
        Ok(())
    }
}

impl Getter for AttrControlled {
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        self.0 = get_tie_breaker(m, ATTR_ICE_CONTROLLED)?;
        Ok(())
    }
}

/// PRIORITY attribute: the prflx priority the peer would assign to a
/// candidate learned from this check.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct PriorityAttr(pub u32);

impl Setter for PriorityAttr {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_PRIORITY, &self.0.to_be_bytes());
        Ok(())
    }
}

impl Getter for PriorityAttr {
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_PRIORITY)?;
        check_size(ATTR_PRIORITY, v.len(), PRIORITY_SIZE)?;
        self.0 = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
        Ok(())
    }
}

/// USE-CANDIDATE attribute, zero-length flag set by the controlling agent
/// to nominate the pair the check runs on.
#[derive(Default, Debug, Copy, Clone)]
pub struct UseCandidateAttr;

impl Setter for UseCandidateAttr {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_USE_CANDIDATE, &[]);
        Ok(())
    }
}

impl UseCandidateAttr {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns true if the USE-CANDIDATE attribute is present.
    #[must_use]
    pub fn is_set(m: &Message) -> bool {
        m.get(ATTR_USE_CANDIDATE).is_ok()
    }
}
