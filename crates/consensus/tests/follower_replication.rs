//! Follower-role append and vote behavior.

mod support;

use common::{Entry, IndexedEntry};
use consensus::role::follower;
use protocol::{AppendRequest, VoteRequest};
use support::{entry, open_context};
use tempfile::tempdir;

fn append_request(
    term: u64,
    log_index: u64,
    log_term: u64,
    entries: Vec<IndexedEntry>,
    commit_index: u64,
) -> AppendRequest {
    AppendRequest {
        term,
        leader: 2,
        log_index,
        log_term,
        entries,
        commit_index,
    }
}

#[test]
fn follower_writes_entries_past_the_commit_index() {
    let dir = tempdir().unwrap();
    let mut ctx = open_context(dir.path());

    let request = append_request(
        1,
        0,
        0,
        vec![entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")],
        1,
    );
    let (response, accepted) = follower::append(&mut ctx, &request).unwrap();

    assert!(accepted);
    assert!(response.succeeded);
    assert_eq!(response.log_index, 3);
    // Unlike a passive member, the follower holds the uncommitted tail.
    assert_eq!(ctx.log.last_index(), 3);
    assert_eq!(ctx.commit_index(), 1);
    assert_eq!(ctx.executor.last_applied(), 1);
}

#[test]
fn missing_previous_entry_is_reported() {
    let dir = tempdir().unwrap();
    let mut ctx = open_context(dir.path());

    let request = append_request(1, 5, 1, vec![entry(6, 1, b"x")], 6);
    let (response, accepted) = follower::append(&mut ctx, &request).unwrap();

    assert!(accepted);
    assert!(!response.succeeded);
    assert_eq!(response.log_index, 0);
    assert_eq!(ctx.log.last_index(), 0);
}

#[test]
fn conflicting_previous_entry_truncates_the_tail() {
    let dir = tempdir().unwrap();
    let mut ctx = open_context(dir.path());
    ctx.advance_term(2).unwrap();
    {
        let mut writer = ctx.log.writer();
        for _ in 0..4 {
            writer.append(1, Entry::noop(0)).unwrap();
        }
    }

    // The new leader's previous entry at index 4 carries term 2; our
    // term-1 entry there is a stale speculative tail.
    let request = append_request(2, 4, 2, vec![entry(5, 2, b"x")], 0);
    let (response, _) = follower::append(&mut ctx, &request).unwrap();

    assert!(!response.succeeded);
    assert_eq!(ctx.log.last_index(), 3);
    assert_eq!(response.log_index, 3);

    // The leader backs up and re-sends from index 4 in its own term.
    let request = append_request(
        2,
        3,
        1,
        vec![entry(4, 2, b"x"), entry(5, 2, b"y")],
        0,
    );
    let (response, _) = follower::append(&mut ctx, &request).unwrap();
    assert!(response.succeeded);
    assert_eq!(ctx.log.last_index(), 5);
    assert_eq!(ctx.log.get(4).unwrap().term, 2);
}

#[test]
fn vote_granted_once_per_term() {
    let dir = tempdir().unwrap();
    let mut ctx = open_context(dir.path());

    let request = VoteRequest {
        term: 1,
        candidate: 2,
        last_log_index: 0,
        last_log_term: 0,
    };
    let response = follower::vote(&mut ctx, &request).unwrap();
    assert!(response.granted);
    assert_eq!(ctx.voted_for, Some(2));

    // A competing candidate in the same term is refused.
    let competing = VoteRequest {
        term: 1,
        candidate: 3,
        last_log_index: 0,
        last_log_term: 0,
    };
    let response = follower::vote(&mut ctx, &competing).unwrap();
    assert!(!response.granted);

    // The same candidate asking again is confirmed.
    let response = follower::vote(&mut ctx, &request).unwrap();
    assert!(response.granted);
}

#[test]
fn vote_refused_to_a_stale_log() {
    let dir = tempdir().unwrap();
    let mut ctx = open_context(dir.path());
    ctx.advance_term(2).unwrap();
    {
        let mut writer = ctx.log.writer();
        for _ in 0..3 {
            writer.append(2, Entry::noop(0)).unwrap();
        }
    }

    // The candidate's log ends at (term 1, index 5): older term, no vote.
    let request = VoteRequest {
        term: 3,
        candidate: 2,
        last_log_index: 5,
        last_log_term: 1,
    };
    let response = follower::vote(&mut ctx, &request).unwrap();
    assert!(!response.granted);

    // An up-to-date candidate gets the vote.
    let request = VoteRequest {
        term: 3,
        candidate: 3,
        last_log_index: 3,
        last_log_term: 2,
    };
    let response = follower::vote(&mut ctx, &request).unwrap();
    assert!(response.granted);
}

#[test]
fn stale_term_vote_rejected() {
    let dir = tempdir().unwrap();
    let mut ctx = open_context(dir.path());
    ctx.advance_term(5).unwrap();

    let request = VoteRequest {
        term: 4,
        candidate: 2,
        last_log_index: 10,
        last_log_term: 4,
    };
    let response = follower::vote(&mut ctx, &request).unwrap();
    assert!(!response.granted);
    assert_eq!(response.term, 5);
}
