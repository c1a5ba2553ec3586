//! Tests for the priority sharding policy.

use super::*;

#[test]
fn test_links_per_partition_rounds_up() {
    assert_eq!(links_per_partition(1), 1);
    assert_eq!(links_per_partition(9), 1);
    assert_eq!(links_per_partition(10), 1);
    assert_eq!(links_per_partition(11), 2);
    assert_eq!(links_per_partition(25), 3);
    assert_eq!(links_per_partition(0), 1);
}

#[test]
fn test_priority_24_of_25_lands_on_third_shard() {
    let links = links_per_partition(25);

    let assignment = assign(24, links);

    assert_eq!(links, 3);
    assert_eq!(assignment.link_index, 2);
    assert_eq!(assignment.local_priority, 4);
}

#[test]
fn test_max_priority_stays_inside_last_shard() {
    // max_priority = 10 -> one shard; priority 10 must not overflow to shard 1
    let assignment = assign(10, links_per_partition(10));
    assert_eq!(assignment.link_index, 0);
    assert_eq!(assignment.local_priority, 9);

    let assignment = assign(20, links_per_partition(20));
    assert_eq!(assignment.link_index, 1);
    assert_eq!(assignment.local_priority, 9);
}

#[test]
fn test_every_priority_fits_broker_limits() {
    for max_priority in 1..=64u32 {
        let links = links_per_partition(max_priority);
        for priority in 0..=max_priority {
            let assignment = assign(priority, links);
            assert!(
                assignment.link_index < links,
                "priority {priority} of {max_priority} mapped to link {}",
                assignment.link_index
            );
            assert!(assignment.local_priority <= 9);
        }
    }
}

#[test]
fn test_assignment_is_monotonic_in_priority() {
    let links = links_per_partition(40);
    let mut previous = assign(0, links);
    for priority in 1..=40 {
        let current = assign(priority, links);
        assert!(
            (current.link_index, current.local_priority)
                >= (previous.link_index, previous.local_priority)
        );
        previous = current;
    }
}

#[test]
fn test_single_shard_uses_legacy_names() {
    let names = LinkNames::for_shard("p1", 0, 1);

    assert_eq!(names.sender, "p1###SenderLink");
    assert_eq!(names.receiver, "p1###ReceiverLink");
    assert_eq!(names.queue, "p1###q");
}

#[test]
fn test_sharded_names_carry_index() {
    let names = LinkNames::for_partition("p1", 3);

    assert_eq!(names.len(), 3);
    assert_eq!(names[2].sender, "p1###2###SenderLink");
    assert_eq!(names[2].receiver, "p1###2###ReceiverLink");
    assert_eq!(names[2].queue, "p1###2###q");
    assert_eq!(names[0].to_string(), "p1###0###q");
}
