#![cfg(feature = "crypto")]

mod common;

use {
    assert_matches::assert_matches,
    common::{init_logger, Device},
    hearth_sdk::{crypto::envelope::SenderKeyDistributionMessage, error::CryptoError},
};

const GROUP: &str = "kitchen-table";

/// Hand `dist` from `from` to `to` over their pairwise session.
fn deliver(from: &Device, to: &Device, dist: &SenderKeyDistributionMessage) {
    let ct = from.sessions.encrypt(&to.address, &dist.encode()).unwrap();
    let plain = to.sessions.decrypt(&from.address, &ct).unwrap();
    let received = SenderKeyDistributionMessage::decode(&plain).unwrap();
    assert!(to.groups.process_distribution_message(&from.address, &received).unwrap());
}

fn family() -> [Device; 3] {
    let members = [Device::new("alice"), Device::new("bob"), Device::new("carol")];
    for (i, a) in members.iter().enumerate() {
        for b in &members[i + 1..] {
            a.connect(b);
        }
    }
    for sender in &members {
        let dist = sender.groups.create_sender_key(GROUP).unwrap();
        for member in &members {
            if member.address != sender.address {
                deliver(sender, member, &dist);
            }
        }
    }
    members
}

#[test]
fn every_member_reads_every_other_member() {
    init_logger();
    let members = family();
    for sender in &members {
        let text = format!("dinner at 7, {}", sender.address);
        let ct = sender.groups.encrypt_group_message(GROUP, text.as_bytes()).unwrap();
        for member in &members {
            if member.address == sender.address {
                continue;
            }
            assert_eq!(
                member
                    .groups
                    .decrypt_group_message(GROUP, &sender.address, &ct)
                    .unwrap(),
                text.as_bytes()
            );
        }
    }
}

#[test]
fn late_and_replayed_group_messages() {
    let [alice, bob, _carol] = family();
    let sent: Vec<_> = (0..4u8)
        .map(|i| alice.groups.encrypt_group_message(GROUP, &[i]).unwrap())
        .collect();

    assert_eq!(bob.groups.decrypt_group_message(GROUP, &alice.address, &sent[3]).unwrap(), [3]);
    assert_eq!(bob.groups.decrypt_group_message(GROUP, &alice.address, &sent[1]).unwrap(), [1]);
    assert_matches!(
        bob.groups.decrypt_group_message(GROUP, &alice.address, &sent[3]),
        Err(CryptoError::DuplicateMessage { .. })
    );
    assert_eq!(bob.groups.decrypt_group_message(GROUP, &alice.address, &sent[0]).unwrap(), [0]);
}

#[test]
fn messages_are_bound_to_their_sender() {
    let [alice, bob, carol] = family();
    let ct = alice.groups.encrypt_group_message(GROUP, b"from alice").unwrap();
    // Claiming the message came from carol fails signature or key lookup.
    assert!(bob.groups.decrypt_group_message(GROUP, &carol.address, &ct).is_err());
    assert_eq!(
        bob.groups.decrypt_group_message(GROUP, &alice.address, &ct).unwrap(),
        b"from alice"
    );
}

#[test]
fn removed_member_cannot_read_after_rekey() {
    let [alice, bob, carol] = family();
    let before = alice.groups.encrypt_group_message(GROUP, b"before").unwrap();
    assert_eq!(
        carol.groups.decrypt_group_message(GROUP, &alice.address, &before).unwrap(),
        b"before"
    );

    // Carol leaves. The remaining members re-key and only tell each other.
    let alice_dist = alice.groups.on_membership_changed(GROUP).unwrap();
    let bob_dist = bob.groups.on_membership_changed(GROUP).unwrap();
    deliver(&alice, &bob, &alice_dist);
    deliver(&bob, &alice, &bob_dist);
    assert!(!alice.groups.has_sender_key(GROUP, &carol.address).unwrap());

    let after = alice.groups.encrypt_group_message(GROUP, b"after").unwrap();
    assert_eq!(bob.groups.decrypt_group_message(GROUP, &alice.address, &after).unwrap(), b"after");
    assert_matches!(
        carol.groups.decrypt_group_message(GROUP, &alice.address, &after),
        Err(CryptoError::KeyNotFound(_))
    );

    let from_bob = bob.groups.encrypt_group_message(GROUP, b"bob after").unwrap();
    assert_eq!(
        alice.groups.decrypt_group_message(GROUP, &bob.address, &from_bob).unwrap(),
        b"bob after"
    );
    assert!(carol.groups.decrypt_group_message(GROUP, &bob.address, &from_bob).is_err());

    // Old-epoch traffic is gone for the remaining members too.
    assert_matches!(
        bob.groups.decrypt_group_message(GROUP, &alice.address, &before),
        Err(CryptoError::KeyNotFound(_))
    );
}

#[test]
fn redelivered_distribution_does_not_rewind() {
    let [alice, bob, _carol] = family();
    let first = alice.groups.encrypt_group_message(GROUP, b"one").unwrap();
    bob.groups.decrypt_group_message(GROUP, &alice.address, &first).unwrap();

    let again = alice.groups.current_distribution_message(GROUP).unwrap();
    assert!(!bob.groups.process_distribution_message(&alice.address, &again).unwrap());
    assert_matches!(
        bob.groups.decrypt_group_message(GROUP, &alice.address, &first),
        Err(CryptoError::DuplicateMessage { .. })
    );
}
