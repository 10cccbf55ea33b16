//! Structured exception handling across the full pipeline: filters,
//! finally ordering, cross-frame unwinding, and rethrow. Side-effect
//! ordering is observed through a static field that each step multiplies
//! by ten before adding its own digit.

mod common;

use common::{bump_static, catch_clause, finally_clause, Asm, Host};
use ilrun::engine::ExecError;
use ilrun::metadata::{ClauseKind, IlExceptionClause, TypeToken};

fn filter_clause(
    try_start: u32,
    try_len: u32,
    filter_start: u32,
    handler_start: u32,
    handler_len: u32,
) -> IlExceptionClause {
    IlExceptionClause {
        kind: ClauseKind::Filter,
        try_start,
        try_len,
        handler_start,
        handler_len,
        filter_start: Some(filter_start),
        catch_type: None,
    }
}

fn exception_token(host: &Host) -> TypeToken {
    host.store.well_known().unwrap().exception
}

#[test]
fn test_filter_verdict_selects_handler() {
    let mut host = Host::new();
    let i4 = host.i4;
    // try { loc0 = 1 / 0 } filter (arg0) { loc0 = 7 }; return loc0
    let code = vec![
        0x17, 0x16, 0x5B, 0x0A, // 0..=3: 1 / 0 -> loc0
        0xDE, 8, // 4-5: leave.s -> 14
        0x26, 0x02, 0xFE, 0x11, // 6..=9: filter: pop exc; ldarg.0; endfilter
        0x1D, 0x0A, // 10-11: handler: loc0 = 7
        0xDE, 0, // 12-13: leave.s -> 14
        0x06, 0x2A, // 14-15: ldloc.0; ret
    ];
    let clauses = vec![filter_clause(0, 6, 6, 10, 4)];
    let m = host.interp("Filtered", vec![i4], Some(i4), vec![i4], clauses, code);

    // Accepting filter lands in the handler.
    assert_eq!(host.run_i4(m, &[1]).unwrap(), 7);
    // Rejecting filter lets the fault escape.
    assert!(matches!(
        host.run_i4(m, &[0]).unwrap_err(),
        ExecError::Unhandled { .. }
    ));
}

#[test]
fn test_inner_finally_runs_before_outer_catch() {
    let mut host = Host::new();
    let i4 = host.i4;
    let exc = exception_token(&host);
    let f = host.static_field("Order", i4);

    // try { try { 1 / 0 } finally { f = f*10+1 } } catch { f = f*10+2 }
    let code = Asm::new()
        .ops(&[0x17, 0x16, 0x5B, 0x26]) // 0..=3: 1 / 0; pop
        .ops(&[0xDE, 33]) // 4-5: leave.s -> 39
        .ops(&bump_static(f, 1)) // 6..=20
        .op(0xDC) // 21: endfinally
        .ops(&bump_static(f, 2)) // 22..=36
        .ops(&[0xDE, 0]) // 37-38: leave.s -> 39
        .ldsfld(f) // 39..=43
        .op(0x2A) // 44: ret
        .done();
    let clauses = vec![
        finally_clause(0, 6, 6, 16),
        catch_clause(Some(exc), 0, 22, 22, 17),
    ];
    let m = host.interp("Ordered", vec![], Some(i4), vec![], clauses, code);

    assert_eq!(host.run_i4(m, &[]).unwrap(), 12);
}

#[test]
fn test_callee_finally_runs_before_caller_catch() {
    let mut host = Host::new();
    let i4 = host.i4;
    let exc = exception_token(&host);
    let f = host.static_field("Order", i4);

    // callee: try { loc0 = 1 / 0 } finally { f = f*10+1 }; return loc0
    let callee_code = Asm::new()
        .ops(&[0x17, 0x16, 0x5B, 0x0A]) // 0..=3
        .ops(&[0xDE, 16]) // 4-5: leave.s -> 22
        .ops(&bump_static(f, 1)) // 6..=20
        .op(0xDC) // 21: endfinally
        .ops(&[0x06, 0x2A]) // 22-23: ldloc.0; ret
        .done();
    let callee = host.interp(
        "Callee",
        vec![],
        Some(i4),
        vec![i4],
        vec![finally_clause(0, 6, 6, 16)],
        callee_code,
    );

    // caller: try { Callee() } catch { f = f*10+2 }; return f
    let caller_code = Asm::new()
        .call(callee) // 0..=4
        .op(0x26) // 5: pop
        .ops(&[0xDE, 17]) // 6-7: leave.s -> 25
        .ops(&bump_static(f, 2)) // 8..=22
        .ops(&[0xDE, 0]) // 23-24: leave.s -> 25
        .ldsfld(f) // 25..=29
        .op(0x2A) // 30: ret
        .done();
    let caller = host.interp(
        "Caller",
        vec![],
        Some(i4),
        vec![],
        vec![catch_clause(Some(exc), 0, 8, 8, 17)],
        caller_code,
    );

    assert_eq!(host.run_i4(caller, &[]).unwrap(), 12);
}

#[test]
fn test_rethrow_reaches_caller_handler() {
    let mut host = Host::new();
    let i4 = host.i4;
    let exc = exception_token(&host);

    // inner: try { loc0 = 1 / 0 } catch { rethrow }; return loc0
    let inner_code = vec![
        0x17, 0x16, 0x5B, 0x0A, // 0..=3
        0xDE, 2, // 4-5: leave.s -> 8
        0xFE, 0x1A, // 6-7: rethrow
        0x06, 0x2A, // 8-9: ldloc.0; ret
    ];
    let inner = host.interp(
        "Inner",
        vec![],
        Some(i4),
        vec![i4],
        vec![catch_clause(Some(exc), 0, 6, 6, 2)],
        inner_code,
    );

    // outer: try { loc0 = Inner() } catch { loc0 = -1 }; return loc0
    let outer_code = Asm::new()
        .call(inner) // 0..=4
        .op(0x0A) // 5: stloc.0
        .ops(&[0xDE, 4]) // 6-7: leave.s -> 12
        .ops(&[0x15, 0x0A, 0xDE, 0]) // 8..=11: loc0 = -1; leave.s -> 12
        .ops(&[0x06, 0x2A]) // 12-13
        .done();
    let outer = host.interp(
        "Outer",
        vec![],
        Some(i4),
        vec![i4],
        vec![catch_clause(Some(exc), 0, 8, 8, 4)],
        outer_code,
    );

    assert_eq!(host.run_i4(outer, &[]).unwrap(), -1);
}

#[test]
fn test_finally_runs_even_when_fault_escapes() {
    let mut host = Host::new();
    let i4 = host.i4;
    let f = host.static_field("Ran", i4);

    // try { 1 / 0 } finally { f = f*10+3 } — nothing catches.
    let code = Asm::new()
        .ops(&[0x17, 0x16, 0x5B, 0x26]) // 0..=3
        .ops(&[0xDE, 16]) // 4-5: leave.s -> 22
        .ops(&bump_static(f, 3)) // 6..=20
        .op(0xDC) // 21: endfinally
        .op(0x2A) // 22: ret
        .done();
    let m = host.interp(
        "Escapes",
        vec![],
        None,
        vec![],
        vec![finally_clause(0, 6, 6, 16)],
        code,
    );
    let reader = host.interp(
        "Read",
        vec![],
        Some(i4),
        vec![],
        vec![],
        Asm::new().ldsfld(f).op(0x2A).done(),
    );

    assert!(matches!(
        host.run(m, &[]).unwrap_err(),
        ExecError::Unhandled { .. }
    ));
    assert_eq!(host.run_i4(reader, &[]).unwrap(), 3);
}
