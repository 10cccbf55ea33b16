//! Translation-cache behavior under parallel execution, and per-machine
//! thread-static storage.

mod common;

use common::{Asm, Host};
use ilrun::engine::Machine;
use ilrun::metadata::FieldDesc;

#[test]
fn test_parallel_machines_share_one_translation() {
    let mut host = Host::new();
    let i4 = host.i4;
    let fac_code = vec![
        0x17, 0x0A, // acc = 1
        0x02, 0x16, 0x31, 11, // while (n > 0)
        0x06, 0x02, 0x5A, 0x0A, // acc *= n
        0x02, 0x17, 0x59, 0x10, 0, // n -= 1
        0x2B, 0xF1, // loop
        0x06, 0x2A,
    ];
    let fac = host.interp("Factorial", vec![i4], Some(i4), vec![i4], vec![], fac_code);
    let add = host.interp(
        "Add",
        vec![i4, i4],
        Some(i4),
        vec![],
        vec![],
        vec![0x02, 0x03, 0x58, 0x2A],
    );

    std::thread::scope(|s| {
        for _ in 0..8 {
            let host = &host;
            s.spawn(move || {
                for _ in 0..16 {
                    assert_eq!(host.run_i4(fac, &[10]).unwrap(), 3_628_800);
                    assert_eq!(host.run_i4(add, &[20, 22]).unwrap(), 42);
                }
            });
        }
    });

    // Two methods, two translations, however many machines raced.
    assert_eq!(host.cache.stats().translations(), 2);
    assert_eq!(host.cache.len(), 2);
}

#[test]
fn test_thread_static_is_per_machine() {
    let mut host = Host::new();
    let i4 = host.i4;
    let owner = host.store.well_known().unwrap().object;
    let f = host.store.add_field(FieldDesc {
        name: "Counter".into(),
        owner,
        ty: i4,
        offset: 0,
        is_static: true,
        is_thread_static: true,
    });

    let set = host.interp(
        "Set",
        vec![i4],
        None,
        vec![],
        vec![],
        Asm::new().op(0x02).stsfld(f).op(0x2A).done(),
    );
    let get = host.interp(
        "Get",
        vec![],
        Some(i4),
        vec![],
        vec![],
        Asm::new().ldsfld(f).op(0x2A).done(),
    );

    let mut m1 = Machine::default();
    let mut m2 = Machine::default();
    m1.execute(&host.ctx(), set, &[7]).unwrap();

    // The write sticks within its machine and is invisible to another.
    assert_eq!(m1.execute(&host.ctx(), get, &[]).unwrap()[0] as u32, 7);
    assert_eq!(m2.execute(&host.ctx(), get, &[]).unwrap()[0] as u32, 0);
}
