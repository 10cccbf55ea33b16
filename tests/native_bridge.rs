//! Managed-to-native calls through signature-keyed trampolines: scalar
//! round trips, HFA returns, delegate dispatch, and trap propagation.

mod common;

use std::sync::Arc;

use common::{Asm, Host};
use ilrun::bridge::{CallBuffer, NativeError};
use ilrun::engine::{ExecError, Machine};
use ilrun::metadata::{FloatWidth, MethodBody, MethodDesc, MethodKind, TypeDesc};

#[test]
fn test_managed_calls_native_scalar() {
    let mut host = Host::new();
    let i4 = host.i4;
    let add = host.native("NativeAdd", vec![i4, i4], Some(i4));
    host.trampolines.register(
        "i4i4i4",
        Arc::new(|buf: &mut CallBuffer| {
            let x = buf.args[0] as u32 as i32;
            let y = buf.args[1] as u32 as i32;
            buf.ret[0] = x.wrapping_add(y) as u32 as u64;
            Ok(())
        }),
    );

    // return NativeAdd(a, b) + 1
    let code = Asm::new()
        .ops(&[0x02, 0x03])
        .call(add)
        .ops(&[0x17, 0x58, 0x2A])
        .done();
    let m = host.interp("Bridged", vec![i4, i4], Some(i4), vec![], vec![], code);

    assert_eq!(host.run_i4(m, &[40, 1]).unwrap(), 42);
}

#[test]
fn test_native_hfa_return() {
    let mut host = Host::new();
    let r4 = host.r4;
    let vec2 = host
        .store
        .add_type(TypeDesc::value("Vec2", 8, 4).with_hfa(FloatWidth::F32, 2));
    let make = host.native("MakeVec", vec![r4, r4], Some(vec2));
    host.trampolines.register(
        "vf2r4r4",
        Arc::new(|buf: &mut CallBuffer| {
            let x = f32::from_bits(buf.args[0] as u32);
            let y = f32::from_bits(buf.args[1] as u32);
            // Two packed f32 lanes.
            buf.ret[0] = (x.to_bits() as u64) | ((y.to_bits() as u64) << 32);
            Ok(())
        }),
    );

    let code = Asm::new().ops(&[0x02, 0x03]).call(make).op(0x2A).done();
    let m = host.interp("MakesVec", vec![r4, r4], Some(vec2), vec![], vec![], code);

    let ret = host
        .run(m, &[2.5f32.to_bits() as u64, 7.25f32.to_bits() as u64])
        .unwrap();
    assert_eq!(f32::from_bits(ret[0] as u32), 2.5);
    assert_eq!(f32::from_bits((ret[0] >> 32) as u32), 7.25);
}

#[test]
fn test_native_trap_surfaces_as_error() {
    let mut host = Host::new();
    let i4 = host.i4;
    let bad = host.native("Fails", vec![i4], Some(i4));
    host.trampolines.register(
        "i4i4",
        Arc::new(|_buf: &mut CallBuffer| Err(NativeError::Trap("device lost".into()))),
    );

    let code = Asm::new().op(0x02).call(bad).op(0x2A).done();
    let m = host.interp("CallsBad", vec![i4], Some(i4), vec![], vec![], code);

    match host.run_i4(m, &[1]).unwrap_err() {
        ExecError::Native(NativeError::Trap(msg)) => assert_eq!(msg, "device lost"),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_missing_trampoline_fails_translation() {
    let mut host = Host::new();
    let r8 = host.r8;
    let sqrt = host.native("Sqrt", vec![r8], Some(r8));

    let code = Asm::new().op(0x02).call(sqrt).op(0x2A).done();
    let m = host.interp("CallsSqrt", vec![r8], Some(r8), vec![], vec![], code);

    // The call site fails to resolve during translation, not at run time.
    assert!(matches!(
        host.run(m, &[0]).unwrap_err(),
        ExecError::Emit(_)
    ));
}

#[test]
fn test_delegate_invokes_interpreted_target() {
    let mut host = Host::new();
    let i4 = host.i4;
    let object = host.store.well_known().unwrap().object;
    let action = host
        .store
        .add_type(TypeDesc::reference("IntFunc", Some(object)));

    // The delegate target: static int Double(int x) => x * 2;
    let double = host.interp(
        "Double",
        vec![i4],
        Some(i4),
        vec![],
        vec![],
        vec![0x02, 0x18, 0x5A, 0x2A], // ldarg.0; ldc.i4.2; mul; ret
    );

    let invoke = host.store.add_method(MethodDesc {
        name: "Invoke".into(),
        declaring: Some(action),
        params: vec![action, i4],
        ret: Some(i4),
        is_static: false,
        is_virtual: true,
        is_delegate_invoke: true,
        kind: MethodKind::Interpreted(MethodBody::default()),
    });

    // int Apply(IntFunc f, int x) => f(x);
    let code = Asm::new().ops(&[0x02, 0x03]).callvirt(invoke).op(0x2A).done();
    let apply = host.interp("Apply", vec![action, i4], Some(i4), vec![], vec![], code);

    let mut machine = Machine::default();
    let d = machine.new_delegate(action, double, 0);
    let ret = machine.execute(&host.ctx(), apply, &[d, 21]).unwrap();
    assert_eq!(ret[0] as u32 as i32, 42);

    // A null delegate faults instead of dispatching.
    let err = machine.execute(&host.ctx(), apply, &[0, 21]).unwrap_err();
    assert!(matches!(err, ExecError::Unhandled { .. }));
}
