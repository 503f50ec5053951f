mod common;

use common::*;
use tupl_core::{RowPayload, RowRequest};
use tupl_error::TuplError;
use tupl_interp::{Cond, InterpretedProgram, ProgramBuilder, Reg};
use tupl_types::AttrValue;

fn program(build: impl FnOnce(&mut ProgramBuilder)) -> RowPayload {
    let mut b = ProgramBuilder::new();
    build(&mut b);
    RowPayload::Program(b.finish().unwrap())
}

#[test]
fn test_update_program_adds_to_balance() {
    let mut node = Node::new();
    let mut p = partition(accounts());
    let loc = seed(&mut p, &mut node, txn(1), account(1, 100, "ann"));
    let t = txn(2);
    let payload = program(|b| {
        b.read_attr(Reg::R0, a(BALANCE))
            .load_u32(Reg::R1, 25)
            .add(Reg::R2, Reg::R0, Reg::R1)
            .write_attr(a(BALANCE), Reg::R2)
            .exit_ok();
        b.final_read(a(BALANCE));
    });
    let resp = complete(p.execute(
        &mut node.ctx(),
        RowRequest::update(PART, t, loc, Vec::new()).with_payload(payload),
    ));
    assert_eq!(resp.values[0].as_u32(), Some(125));
    assert_eq!(resp.written_len, Some(1));
    p.commit_transaction(&mut node.ctx(), t).unwrap();
    let row = p.read_committed(&mut node.ctx(), loc).unwrap();
    assert_eq!(row[usize::from(BALANCE)].as_u32(), Some(125));
}

#[test]
fn test_final_update_region_applies() {
    let mut node = Node::new();
    let mut p = partition(accounts());
    let loc = seed(&mut p, &mut node, txn(1), account(1, 100, "ann"));
    let t = txn(2);
    let payload = program(|b| {
        b.initial_read(a(OWNER));
        b.exit_ok();
        b.final_update(AttrValue::text(a(OWNER), "anna"));
        b.final_read(a(OWNER));
    });
    let resp = complete(p.execute(
        &mut node.ctx(),
        RowRequest::update(PART, t, loc, Vec::new()).with_payload(payload),
    ));
    assert_eq!(resp.values[0].as_str(), Some("ann"));
    assert_eq!(resp.values[1].as_str(), Some("anna"));
}

#[test]
fn test_refusal_leaves_row_untouched() {
    let mut node = Node::new();
    let mut p = partition(accounts());
    let loc = seed(&mut p, &mut node, txn(1), account(1, 5, "ann"));
    let t = txn(2);
    let payload = program(|b| {
        let enough = b.new_label();
        b.read_attr(Reg::R0, a(BALANCE))
            .load_u32(Reg::R1, 10)
            .branch_cmp(Cond::Ge, Reg::R0, Reg::R1, enough)
            .exit_refuse(7)
            .resolve_label(enough)
            .load_u32(Reg::R2, 0)
            .write_attr(a(BALANCE), Reg::R2)
            .exit_ok();
    });
    let err = p
        .execute(
            &mut node.ctx(),
            RowRequest::update(PART, t, loc, Vec::new()).with_payload(payload),
        )
        .unwrap_err();
    assert_eq!(err, TuplError::InterpreterRefused { code: 7 });
    assert_eq!(p.stats().refused, 1);
    assert_eq!(p.open_ops(), 0);
    assert_eq!(p.chain_len(loc).unwrap(), 0);
    let row = p.read_committed(&mut node.ctx(), loc).unwrap();
    assert_eq!(row[usize::from(BALANCE)].as_u32(), Some(5));
}

#[test]
fn test_read_program_filters_with_collation() {
    let mut node = Node::new();
    let mut p = partition(accounts());
    let loc = seed(&mut p, &mut node, txn(1), account(1, 5, "Ann Smith"));
    let filter = |pattern: &str| {
        let pattern = pattern.as_bytes().to_vec();
        program(move |b| {
            let hit = b.new_label();
            b.branch_attr_cmp(Cond::Like, a(OWNER), &pattern, hit)
                .exit_refuse(1)
                .resolve_label(hit)
                .exit_ok_last();
            b.final_read(a(ID));
        })
    };

    let resp = complete(p.execute(
        &mut node.ctx(),
        RowRequest::read(PART, txn(2), loc, Vec::new()).with_payload(filter("ann%")),
    ));
    assert!(resp.last_row);
    assert_eq!(resp.values[0].as_u32(), Some(1));

    let err = p
        .execute(
            &mut node.ctx(),
            RowRequest::read(PART, txn(2), loc, Vec::new()).with_payload(filter("bob%")),
        )
        .unwrap_err();
    assert_eq!(err, TuplError::InterpreterRefused { code: 1 });
}

#[test]
fn test_read_and_delete_programs_may_not_write() {
    let mut node = Node::new();
    let mut p = partition(accounts());
    let loc = seed(&mut p, &mut node, txn(1), account(1, 5, "ann"));
    let writer = program(|b| {
        b.load_u32(Reg::R0, 1).write_attr(a(BALANCE), Reg::R0).exit_ok();
    });
    for req in [
        RowRequest::read(PART, txn(2), loc, Vec::new()),
        RowRequest::delete(PART, txn(2), loc),
    ] {
        let err = p.execute(&mut node.ctx(), req.with_payload(writer.clone())).unwrap_err();
        assert!(matches!(err, TuplError::InterpreterFault { .. }), "{err}");
    }
    assert_eq!(p.open_ops(), 0);
}

#[test]
fn test_delete_program_reads_before_image() {
    let mut node = Node::new();
    let mut p = partition(accounts());
    let loc = seed(&mut p, &mut node, txn(1), account(8, 5, "ann"));
    let reader = program(|b| {
        b.initial_read(a(ID));
        b.exit_ok();
    });
    let t = txn(2);
    let resp = complete(p.execute(
        &mut node.ctx(),
        RowRequest::delete(PART, t, loc).with_payload(reader),
    ));
    assert_eq!(resp.values[0].as_u32(), Some(8));
    p.commit_transaction(&mut node.ctx(), t).unwrap();
    assert_eq!(p.allocated_rows(), 0);
}

#[test]
fn test_interpreted_insert_unsupported() {
    let mut node = Node::new();
    let mut p = partition(accounts());
    let req = RowRequest::insert(PART, txn(1), Vec::new())
        .with_payload(RowPayload::Program(InterpretedProgram::default()));
    assert!(matches!(
        p.execute(&mut node.ctx(), req),
        Err(TuplError::Unsupported(_))
    ));
    assert_eq!(p.allocated_rows(), 0);
}

#[test]
fn test_runaway_program_faults() {
    let mut node = Node::new();
    let config = tupl_core::EngineConfig {
        interpreter_max_instructions: 50,
        ..tupl_core::EngineConfig::default()
    };
    let mut p = partition_with(accounts(), config);
    let loc = seed(&mut p, &mut node, txn(1), account(1, 5, "ann"));
    let spin = program(|b| {
        let top = b.new_label();
        b.resolve_label(top).branch(top);
    });
    let err = p
        .execute(
            &mut node.ctx(),
            RowRequest::read(PART, txn(2), loc, Vec::new()).with_payload(spin),
        )
        .unwrap_err();
    assert!(matches!(err, TuplError::InterpreterFault { .. }));
}

#[test]
fn test_program_roundtrips_through_wire_words() {
    let mut node = Node::new();
    let mut p = partition(accounts());
    let loc = seed(&mut p, &mut node, txn(1), account(1, 5, "ann"));
    let RowPayload::Program(prog) = program(|b| {
        b.initial_read(a(BALANCE));
        b.read_attr(Reg::R0, a(BALANCE)).exit_ok();
    }) else {
        unreachable!()
    };
    let decoded = InterpretedProgram::from_words(&prog.to_words()).unwrap();
    let resp = complete(p.execute(
        &mut node.ctx(),
        RowRequest::read(PART, txn(2), loc, Vec::new()).with_payload(RowPayload::Program(decoded)),
    ));
    assert_eq!(resp.values[0].as_u32(), Some(5));
}
