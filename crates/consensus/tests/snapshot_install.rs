//! The chunked snapshot install protocol, shared by passive and follower
//! roles.

mod support;

use consensus::role::{self, PendingSnapshotTable};
use consensus::Executor;
use protocol::{ErrorKind, InstallRequest, Status};
use snapshot::SnapshotStatus;
use support::{open_context, Journal};
use tempfile::tempdir;

fn install_request(id: u64, index: u64, offset: u32, data: &[u8], complete: bool) -> InstallRequest {
    InstallRequest {
        term: 3,
        leader: 2,
        id,
        index,
        offset,
        data: data.to_vec(),
        complete,
    }
}

/// A payload the executor can actually restore from.
fn snapshot_payload() -> Vec<u8> {
    Executor::new(Box::new(Journal::new())).snapshot().unwrap()
}

#[test]
fn chunked_install_happy_path() {
    let dir = tempdir().unwrap();
    let mut ctx = open_context(dir.path());
    let mut table = PendingSnapshotTable::new();

    let payload = snapshot_payload();
    let (head, tail) = payload.split_at(2);

    let response =
        role::install(&mut ctx, &mut table, &install_request(42, 100, 0, head, false)).unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(table.next_offset, 1);

    let response =
        role::install(&mut ctx, &mut table, &install_request(42, 100, 1, tail, true)).unwrap();
    assert_eq!(response.status, Status::Ok);

    // The snapshot is published with the concatenated bytes, the pending
    // table is empty, and the offset cursor is reset.
    let published = ctx.snapshots.get_snapshot(42).unwrap();
    assert_eq!(published.index(), 100);
    assert_eq!(published.status(), SnapshotStatus::Complete);
    assert_eq!(published.data().unwrap(), payload);
    assert!(table.is_empty());
    assert_eq!(table.next_offset, 0);

    // The server state swung onto the snapshot.
    assert_eq!(ctx.executor.last_applied(), 100);
    assert_eq!(ctx.commit_index(), 100);
    assert_eq!(ctx.log.last_index(), 100);
    assert_eq!(ctx.log.first_index(), 101);
}

#[test]
fn offset_gap_is_rejected_and_pending_kept() {
    let dir = tempdir().unwrap();
    let mut ctx = open_context(dir.path());
    let mut table = PendingSnapshotTable::new();

    let payload = snapshot_payload();
    let (head, tail) = payload.split_at(2);

    role::install(&mut ctx, &mut table, &install_request(42, 100, 0, head, false)).unwrap();

    // Chunk 2 with chunk 1 still outstanding is a protocol violation.
    let response =
        role::install(&mut ctx, &mut table, &install_request(42, 100, 2, tail, false)).unwrap();
    assert_eq!(response.status, Status::Error);
    assert_eq!(response.error, Some(ErrorKind::IllegalMemberState));

    // The pending install survives and the expected offset is unchanged,
    // so the leader can resume from chunk 1.
    assert!(table.get(42).is_some());
    assert_eq!(table.next_offset, 1);

    let response =
        role::install(&mut ctx, &mut table, &install_request(42, 100, 1, tail, true)).unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(ctx.snapshots.get_snapshot(42).unwrap().data().unwrap(), payload);
}

#[test]
fn duplicate_chunk_is_acknowledged_without_a_second_write() {
    let dir = tempdir().unwrap();
    let mut ctx = open_context(dir.path());
    let mut table = PendingSnapshotTable::new();

    let payload = snapshot_payload();
    let (head, tail) = payload.split_at(2);

    role::install(&mut ctx, &mut table, &install_request(42, 100, 0, head, false)).unwrap();
    // The transport re-delivers chunk 0.
    let response =
        role::install(&mut ctx, &mut table, &install_request(42, 100, 0, head, false)).unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(table.next_offset, 1);

    role::install(&mut ctx, &mut table, &install_request(42, 100, 1, tail, true)).unwrap();

    // Had the duplicate been written, the published bytes would not match.
    assert_eq!(ctx.snapshots.get_snapshot(42).unwrap().data().unwrap(), payload);
}

#[test]
fn duplicate_final_chunk_after_completion_is_idempotent() {
    let dir = tempdir().unwrap();
    let mut ctx = open_context(dir.path());
    let mut table = PendingSnapshotTable::new();

    let payload = snapshot_payload();
    role::install(
        &mut ctx,
        &mut table,
        &install_request(42, 100, 0, &payload, true),
    )
    .unwrap();
    assert!(table.is_empty());

    // The leader never saw our ack and re-sends the final chunk.
    let response = role::install(
        &mut ctx,
        &mut table,
        &install_request(42, 100, 0, &payload, true),
    )
    .unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(ctx.snapshots.get_snapshot(42).unwrap().data().unwrap(), payload);
}

#[test]
fn first_chunk_must_carry_offset_zero() {
    let dir = tempdir().unwrap();
    let mut ctx = open_context(dir.path());
    let mut table = PendingSnapshotTable::new();

    let response = role::install(
        &mut ctx,
        &mut table,
        &install_request(42, 100, 3, b"late", false),
    )
    .unwrap();
    assert_eq!(response.status, Status::Error);
    assert_eq!(response.error, Some(ErrorKind::IllegalMemberState));
    assert!(table.is_empty());
}

#[test]
fn mismatched_index_discards_the_stale_install() {
    let dir = tempdir().unwrap();
    let mut ctx = open_context(dir.path());
    let mut table = PendingSnapshotTable::new();

    role::install(&mut ctx, &mut table, &install_request(42, 100, 0, b"v1", false)).unwrap();
    assert_eq!(table.get(42).unwrap().index(), 100);

    // A chunk for the same id at a newer index restarts the install.
    let response =
        role::install(&mut ctx, &mut table, &install_request(42, 200, 0, b"v2", false)).unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(table.get(42).unwrap().index(), 200);
    assert_eq!(table.next_offset, 1);
}

#[test]
fn stale_term_install_is_rejected() {
    let dir = tempdir().unwrap();
    let mut ctx = open_context(dir.path());
    ctx.advance_term(5).unwrap();
    let mut table = PendingSnapshotTable::new();

    let response = role::install(
        &mut ctx,
        &mut table,
        &install_request(42, 100, 0, b"old", false),
    )
    .unwrap();
    assert_eq!(response.status, Status::Error);
    assert_eq!(response.error, Some(ErrorKind::IllegalMemberState));
    assert!(table.is_empty());
}

#[test]
fn close_discards_pending_installs() {
    let dir = tempdir().unwrap();
    let mut ctx = open_context(dir.path());
    let mut table = PendingSnapshotTable::new();

    role::install(&mut ctx, &mut table, &install_request(42, 100, 0, b"x", false)).unwrap();
    role::install(&mut ctx, &mut table, &install_request(42, 100, 1, b"y", false)).unwrap();
    assert_eq!(table.next_offset, 2);

    table.close_all();
    assert!(table.is_empty());
    assert_eq!(table.next_offset, 0);
    // Nothing was ever published.
    assert!(ctx.snapshots.get_snapshot(42).is_none());
}
