use stun::message::{Getter, Message, BINDING_REQUEST};

use super::*;
use crate::error::Result;

#[test]
fn test_controlling_round_trip() -> Result<()> {
    let mut m = Message::new();
    m.build(&[Box::new(BINDING_REQUEST), Box::new(AttrControlling(0xdead_beef_cafe_f00d))])?;

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;

    let mut attr = AttrControlling::default();
    attr.get_from(&decoded)?;
    assert_eq!(attr.0, 0xdead_beef_cafe_f00d);

    let mut wrong = AttrControlled::default();
    assert!(wrong.get_from(&decoded).is_err(), "controlled must not read controlling");

    Ok(())
}

#[test]
fn test_controlled_round_trip() -> Result<()> {
    let mut m = Message::new();
    m.build(&[Box::new(BINDING_REQUEST), Box::new(AttrControlled(42))])?;

    let mut attr = AttrControlled::default();
    attr.get_from(&m)?;
    assert_eq!(attr.0, 42);

    Ok(())
}

#[test]
fn test_tie_breaker_is_unsigned() -> Result<()> {
    // The high bit must survive the codec; a signed interpretation would
    // reorder conflict resolution.
    let mut m = Message::new();
    m.build(&[Box::new(BINDING_REQUEST), Box::new(AttrControlling(u64::MAX))])?;

    let mut attr = AttrControlling::default();
    attr.get_from(&m)?;
    assert_eq!(attr.0, u64::MAX);
    assert!(attr.0 > u64::MAX / 2);

    Ok(())
}

#[test]
fn test_priority_round_trip() -> Result<()> {
    let mut m = Message::new();
    {
        let mut p = PriorityAttr::default();
        assert!(p.get_from(&m).is_err(), "empty message has no PRIORITY");
    }

    m.build(&[Box::new(BINDING_REQUEST), Box::new(PriorityAttr(0x6e_7f00ff))])?;

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;

    let mut p = PriorityAttr::default();
    p.get_from(&decoded)?;
    assert_eq!(p.0, 0x6e_7f00ff);

    Ok(())
}

#[test]
fn test_use_candidate() -> Result<()> {
    let mut m = Message::new();
    m.build(&[Box::new(BINDING_REQUEST), Box::new(UseCandidateAttr::new())])?;

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;
    assert!(UseCandidateAttr::is_set(&decoded));

    let mut plain = Message::new();
    plain.build(&[Box::new(BINDING_REQUEST)])?;
    assert!(!UseCandidateAttr::is_set(&plain));

    Ok(())
}

#[test]
fn test_role_display_and_from() {
    assert_eq!(Role::from(1), Role::Controlling);
    assert_eq!(Role::from(2), Role::Controlled);
    assert_eq!(Role::from(0), Role::Unspecified);
    assert_eq!(Role::Controlling.to_string(), "controlling");
    assert_eq!(Role::Controlled.to_string(), "controlled");
}
