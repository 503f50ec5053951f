mod common;

use common::*;
use tupl_core::{RowRequest, Step};
use tupl_error::TuplError;
use tupl_layout::TupleFlags;
use tupl_types::{AttrValue, PageRef};

const FIRST_PAGE: PageRef = PageRef {
    file: DISK_FILE,
    page: 0,
};

#[test]
fn test_disk_part_written_at_commit() {
    let mut node = Node::new();
    let mut p = partition(documents());
    let t = txn(1);
    let loc = complete(p.execute(
        &mut node.ctx(),
        RowRequest::insert(PART, t, document(1, "intro", "hello disk", 4)),
    ))
    .locator
    .unwrap();
    assert_eq!(node.pages.record_count(), 0);
    assert!(node.space.used_words() > 0);
    assert!(node.undo.reserved() > 0);

    p.commit_transaction(&mut node.ctx(), t).unwrap();
    assert_eq!(node.pages.record_count(), 1);
    assert_eq!(node.undo.reserved(), 0);
    assert!(node.undo.written() > 0);
    assert!(p.store().get(loc).unwrap().header().flags.contains(TupleFlags::DISK_PART));

    let r = complete(p.execute(
        &mut node.ctx(),
        RowRequest::read(PART, txn(2), loc, vec![a(BODY), a(RATING), a(TITLE)]),
    ));
    assert_eq!(r.values[0].as_str(), Some("hello disk"));
    assert_eq!(r.values[1].as_u32(), Some(4));
    assert_eq!(r.values[2].as_str(), Some("intro"));
}

#[test]
fn test_undo_failure_leaves_no_slot() {
    let mut node = Node::with_undo_capacity(1);
    let mut p = partition(documents());
    let err = p
        .execute(
            &mut node.ctx(),
            RowRequest::insert(PART, txn(1), document(1, "t", "b", 1)),
        )
        .unwrap_err();
    assert!(matches!(err, TuplError::UndoLogFull { .. }));
    assert!(err.is_transient());
    assert_eq!(p.allocated_rows(), 0);
    assert_eq!(p.open_ops(), 0);
    assert_eq!(p.shadow_copies(), 0);
    assert_eq!(p.var_area().used_words(), 0);
    assert_eq!(node.space.used_words(), 0);
    assert_eq!(node.undo.reserved(), 0);
}

#[test]
fn test_tablespace_exhaustion_rolls_back_slot_and_undo() {
    let mut node = Node::new();
    node.space = tupl_core::MemoryTablespace::new(DISK_FILE, 1);
    let mut p = partition(documents());
    let err = p
        .execute(
            &mut node.ctx(),
            RowRequest::insert(PART, txn(1), document(1, "t", "b", 1)),
        )
        .unwrap_err();
    assert!(matches!(err, TuplError::DiskSlotExhausted { .. }));
    assert_eq!(p.allocated_rows(), 0);
    assert_eq!(node.undo.reserved(), 0);
}

#[test]
fn test_var_area_exhaustion_releases_slot_and_disk_slot() {
    let mut node = Node::new();
    let config = tupl_core::EngineConfig {
        var_page_words: 16,
        var_page_limit: 1,
        ..tupl_core::EngineConfig::default()
    };
    let mut p = partition_with(documents(), config);
    for id in 1..=3 {
        seed(&mut p, &mut node, txn(1), document(id, "0123456789abcdef", "b", id));
    }
    let disk_words = node.space.used_words();

    let err = p
        .execute(
            &mut node.ctx(),
            RowRequest::insert(PART, txn(2), document(4, "0123456789abcdef", "b", 4)),
        )
        .unwrap_err();
    assert!(matches!(err, TuplError::VarAreaExhausted { .. }));
    assert_eq!(p.allocated_rows(), 3);
    assert_eq!(p.open_ops(), 0);
    assert_eq!(node.space.used_words(), disk_words);
    assert_eq!(node.undo.reserved(), 0);
    p.check_consistency().unwrap();
}

#[test]
fn test_delete_commit_releases_disk_slot() {
    let mut node = Node::new();
    let mut p = partition(documents());
    let loc = seed(&mut p, &mut node, txn(1), document(1, "t", "body", 1));
    let t = txn(2);
    complete(p.execute(&mut node.ctx(), RowRequest::delete(PART, t, loc)));
    p.commit_transaction(&mut node.ctx(), t).unwrap();
    assert_eq!(node.space.used_words(), 0);
    assert_eq!(node.pages.record_count(), 0);
    assert_eq!(p.allocated_rows(), 0);
}

#[test]
fn test_memory_only_read_does_not_wait_for_disk() {
    let mut node = Node::new();
    let mut p = partition(documents());
    let loc = seed(&mut p, &mut node, txn(1), document(1, "title", "body", 1));
    node.pages.evict(FIRST_PAGE);
    let r = complete(p.execute(
        &mut node.ctx(),
        RowRequest::read(PART, txn(2), loc, vec![a(ID), a(TITLE)]),
    ));
    assert_eq!(r.values[1].as_str(), Some("title"));
    assert_eq!(node.pages.pending_fetches(), 0);
}

#[test]
fn test_read_suspends_and_resumes_on_page_fetch() {
    let mut node = Node::new();
    let mut p = partition(documents());
    let loc = seed(&mut p, &mut node, txn(1), document(1, "title", "the body", 9));
    node.pages.evict(FIRST_PAGE);

    let reader = txn(2);
    let step = p
        .execute(&mut node.ctx(), RowRequest::read(PART, reader, loc, vec![a(BODY)]))
        .unwrap();
    let Step::Suspended(ticket) = step else {
        panic!("expected suspension, got {step:?}");
    };
    assert_eq!(p.suspended_requests(), 1);
    assert_eq!(p.open_ops(), 1);
    assert_eq!(p.chain_len(loc).unwrap(), 0);
    p.check_consistency().unwrap();

    // nothing is ready yet
    assert!(p.drive_ready(&mut node.ctx()).is_empty());

    assert_eq!(node.pages.complete_fetches(), 1);
    let resumed = p.drive_ready(&mut node.ctx());
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].ticket, ticket);
    assert_eq!(resumed[0].txn, reader);
    let Ok(Step::Complete(resp)) = &resumed[0].result else {
        panic!("resume failed: {:?}", resumed[0].result);
    };
    assert_eq!(resp.values[0].as_str(), Some("the body"));
    assert!(resp.op.is_some());
    assert_eq!(p.suspended_requests(), 0);
    assert_eq!(p.stats().suspensions, 1);
    assert_eq!(p.stats().resumptions, 1);
    p.check_consistency().unwrap();
}

#[test]
fn test_update_suspends_then_applies() {
    let mut node = Node::new();
    let mut p = partition(documents());
    let loc = seed(&mut p, &mut node, txn(1), document(1, "title", "old", 1));
    node.pages.evict(FIRST_PAGE);

    let t = txn(2);
    let step = p
        .execute(
            &mut node.ctx(),
            RowRequest::update(PART, t, loc, vec![AttrValue::u32(a(RATING), 5)]),
        )
        .unwrap();
    assert!(matches!(step, Step::Suspended(_)));
    node.pages.complete_fetches();
    let resumed = p.drive_ready(&mut node.ctx());
    assert!(matches!(resumed[0].result, Ok(Step::Complete(_))));

    p.commit_transaction(&mut node.ctx(), t).unwrap();
    let row = p.read_committed(&mut node.ctx(), loc).unwrap();
    assert_eq!(row[usize::from(RATING)].as_u32(), Some(5));
    assert_eq!(row[usize::from(BODY)].as_str(), Some("old"));
}

#[test]
fn test_requests_on_one_page_share_a_fetch() {
    let mut node = Node::new();
    let mut p = partition(documents());
    let first = seed(&mut p, &mut node, txn(1), document(1, "a", "one", 1));
    let second = seed(&mut p, &mut node, txn(1), document(2, "b", "two", 2));
    node.pages.evict(FIRST_PAGE);

    let s1 = p
        .execute(&mut node.ctx(), RowRequest::read(PART, txn(2), first, vec![a(BODY)]))
        .unwrap();
    let s2 = p
        .execute(&mut node.ctx(), RowRequest::read(PART, txn(3), second, vec![a(BODY)]))
        .unwrap();
    assert_eq!(s1, s2);
    assert_eq!(node.pages.pending_fetches(), 1);
    assert_eq!(p.suspended_requests(), 2);

    node.pages.complete_fetches();
    let resumed = p.drive_ready(&mut node.ctx());
    assert_eq!(resumed.len(), 2);
    assert!(resumed.iter().all(|r| matches!(r.result, Ok(Step::Complete(_)))));
}

#[test]
fn test_abort_cancels_suspended_request() {
    let mut node = Node::new();
    let mut p = partition(documents());
    let loc = seed(&mut p, &mut node, txn(1), document(1, "t", "b", 1));
    node.pages.evict(FIRST_PAGE);
    let t = txn(2);
    let step = p
        .execute(&mut node.ctx(), RowRequest::delete(PART, t, loc))
        .unwrap();
    assert!(matches!(step, Step::Suspended(_)));
    assert_eq!(p.open_ops(), 1);

    p.abort_transaction(&mut node.ctx(), t).unwrap();
    assert_eq!(p.suspended_requests(), 0);
    assert_eq!(p.open_ops(), 0);
    node.pages.complete_fetches();
    assert!(p.drive_ready(&mut node.ctx()).is_empty());
}

#[test]
fn test_update_trigger_omits_unchanged_disk_attrs() {
    let mut node = Node::new();
    let mut p = partition(documents());
    let loc = seed(&mut p, &mut node, txn(1), document(1, "before", "body", 1));
    node.triggers.events.clear();
    complete(p.execute(
        &mut node.ctx(),
        RowRequest::update(PART, txn(2), loc, vec![AttrValue::text(a(TITLE), "after")]),
    ));
    let event = node.triggers.events.last().unwrap();
    let before = event.before.as_ref().unwrap();
    let after = event.after.as_ref().unwrap();
    let ids: Vec<_> = after.iter().map(|v| v.id).collect();
    assert_eq!(ids, vec![a(ID), a(TITLE)]);
    assert_eq!(before[1].as_str(), Some("before"));
    assert_eq!(after[1].as_str(), Some("after"));
}
