use super::*;
use crate::candidate::CandidateType;

fn sample_candidates() -> Vec<Arc<Candidate>> {
    vec![
        Arc::new(Candidate::host("192.0.2.1:2000".parse().unwrap())),
        Arc::new(Candidate::server_reflexive(
            "203.0.113.5:40000".parse().unwrap(),
            "192.0.2.1:2000".parse().unwrap(),
        )),
    ]
}

#[test]
fn test_marshal_description_shape() {
    let sdp = marshal_description(7, "EsAw", "P4sswordP4sswordP4ssw0", &sample_candidates(), true);

    assert!(sdp.starts_with("v=0\r\n"));
    assert!(sdp.contains("o=- 7 2 IN IP4 0.0.0.0\r\n"));
    assert!(sdp.contains("s=-\r\n"));
    assert!(sdp.contains("t=0 0\r\n"));
    assert!(sdp.contains("a=ice-ufrag:EsAw\r\n"));
    assert!(sdp.contains("a=ice-pwd:P4sswordP4sswordP4ssw0\r\n"));
    assert!(sdp.contains("a=ice-options:trickle\r\n"));
    assert_eq!(sdp.matches("a=candidate:").count(), 2);
    assert!(sdp.ends_with("a=end-of-candidates\r\n"));
}

#[test]
fn test_description_round_trip() -> crate::error::Result<()> {
    // What one agent emits must parse on the other into an equivalent
    // description: same credentials, same candidates.
    let candidates = sample_candidates();
    let sdp = marshal_description(1, "EsAw", "P4sswordP4sswordP4ssw0", &candidates, true);

    let parsed = parse_description(&sdp)?;
    assert_eq!(parsed.ufrag, "EsAw");
    assert_eq!(parsed.pwd, "P4sswordP4sswordP4ssw0");
    assert!(parsed.end_of_candidates);
    assert_eq!(parsed.candidates.len(), candidates.len());
    for (got, want) in parsed.candidates.iter().zip(candidates.iter()) {
        assert!(got.equal(want));
        assert_eq!(got.priority(), want.priority());
        assert_eq!(got.foundation(), want.foundation());
    }

    Ok(())
}

#[test]
fn test_parse_tolerates_reordering_and_noise() -> crate::error::Result<()> {
    // No v=/o=/s=/t= lines, attributes out of order, unknown attributes,
    // bare \n line endings.
    let sdp = "a=candidate:4234997325 1 udp 2130706431 198.51.100.7 61665 typ host\n\
               a=unknown-attribute:ignored\n\
               a=ice-pwd:f7b038Yq6CqYpAyqbxkuJq\n\
               m=application 9 UDP/DTLS/SCTP webrtc-datachannel\n\
               a=ice-ufrag:n9Dz\n";

    let parsed = parse_description(sdp)?;
    assert_eq!(parsed.ufrag, "n9Dz");
    assert_eq!(parsed.pwd, "f7b038Yq6CqYpAyqbxkuJq");
    assert_eq!(parsed.candidates.len(), 1);
    assert_eq!(parsed.candidates[0].candidate_type(), CandidateType::Host);
    assert!(!parsed.end_of_candidates);

    Ok(())
}

#[test]
fn test_parse_missing_required_attributes() {
    let no_ufrag = "a=ice-pwd:f7b038Yq6CqYpAyqbxkuJq\r\n\
                    a=candidate:1 1 udp 1 192.0.2.1 2000 typ host\r\n";
    assert_eq!(
        parse_description(no_ufrag).err(),
        Some(Error::ErrRemoteUfragEmpty)
    );

    let no_pwd = "a=ice-ufrag:n9Dz\r\n\
                  a=candidate:1 1 udp 1 192.0.2.1 2000 typ host\r\n";
    assert_eq!(parse_description(no_pwd).err(), Some(Error::ErrRemotePwdEmpty));

    let no_candidate = "a=ice-ufrag:n9Dz\r\na=ice-pwd:f7b038Yq6CqYpAyqbxkuJq\r\n";
    assert_eq!(
        parse_description(no_candidate).err(),
        Some(Error::ErrSdpMissingAttribute)
    );
}

#[test]
fn test_parse_candidate_accepts_prefixed_forms() -> crate::error::Result<()> {
    let bare = "4234997325 1 udp 2130706431 198.51.100.7 61665 typ host";

    for raw in [
        bare.to_owned(),
        format!("candidate:{bare}"),
        format!("a=candidate:{bare}"),
    ] {
        let c = parse_candidate(&raw)?;
        assert_eq!(c.addr(), "198.51.100.7:61665".parse().unwrap());
    }

    Ok(())
}
