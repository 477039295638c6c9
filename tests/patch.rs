#[macro_use]
mod common;

use std::ptr;

use common::{init_logging, interposer, FAIL_SIZE};
use zonelock::{
    interpose, Error, FailurePolicy, InstallOutcome, InterposerConfig, PatchableTable,
    SelectionPolicy, ZonePage, ZoneSet,
};

#[test]
fn every_call_reaches_the_original_exactly_once() {
    init_logging();
    counting_zone!(mod stub);

    let page = unsafe { ZonePage::new(c"Stub", 10, stub::ops()) }.unwrap();
    let interposer = interposer(InterposerConfig::default());
    for _ in 0..3 {
        page.install_instrumented(interposer).unwrap();
    }
    assert!(page.is_instrumented());

    let before = stub::calls();
    let p = page.malloc(24);
    assert!(!p.is_null());
    assert_eq!(stub::calls(), before + 1);
    unsafe { page.free_definite_size(p, 24) };
    assert_eq!(stub::calls(), before + 2);
    assert_eq!(stub::outstanding(), 0);
}

#[test]
fn install_is_reported_once_then_already_installed() {
    counting_zone!(mod stub);

    let page = unsafe { ZonePage::new(c"Stub", 8, stub::ops()) }.unwrap();
    let interposer = interposer(InterposerConfig::default());
    assert_eq!(
        page.install_instrumented(interposer).unwrap(),
        InstallOutcome::Installed
    );
    assert_eq!(
        page.install_instrumented(interposer).unwrap(),
        InstallOutcome::AlreadyInstalled
    );
}

#[test]
fn restore_brings_back_the_original_pointers() {
    counting_zone!(mod stub);

    let page = unsafe { ZonePage::new(c"Stub", 10, stub::ops()) }.unwrap();
    page.install_instrumented(interposer(InterposerConfig::default()))
        .unwrap();
    assert_ne!(page.ops(), stub::ops());
    page.restore_original().unwrap();
    assert_eq!(page.ops(), stub::ops());
    assert!(!page.is_instrumented());

    // and it can be instrumented again afterwards
    let interposer = interposer(InterposerConfig::default());
    assert_eq!(
        page.install_instrumented(interposer).unwrap(),
        InstallOutcome::Installed
    );
    let p = page.malloc(1);
    unsafe { page.free(p) };
    assert_eq!(stub::outstanding(), 0);
}

#[test]
fn unsupported_version_leaves_the_table_alone() {
    counting_zone!(mod stub);

    let page = unsafe { ZonePage::new(c"Stub", 9, stub::ops()) }.unwrap();
    let err = page
        .install_instrumented(interposer(InterposerConfig::default()))
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedVersion { found: 9 }));
    assert_eq!(err.to_string(), "unsupported zone version 9");
    assert_eq!(page.ops(), stub::ops());

    // a host that does support it can go ahead
    let config = InterposerConfig {
        supported_versions: vec![9],
        ..InterposerConfig::default()
    };
    page.install_instrumented(interposer(config)).unwrap();
    assert!(page.is_instrumented());
}

#[test]
fn default_selection_instruments_only_the_active_zone() {
    counting_zone!(mod stub);

    let set = ZoneSet::new(vec![
        unsafe { ZonePage::new(c"Scalable", 10, stub::ops()) }.unwrap(),
        unsafe { ZonePage::new(c"Nano", 10, stub::ops()) }.unwrap(),
    ])
    .with_default(1);
    let config = InterposerConfig {
        selection: SelectionPolicy::Default,
        ..InterposerConfig::default()
    };
    assert_eq!(
        interpose(&set, interposer(config)).unwrap(),
        vec![InstallOutcome::Installed]
    );
    assert!(!set.get(0).unwrap().is_instrumented());
    assert!(set.get(1).unwrap().is_instrumented());
    assert_eq!(set.get(1).unwrap().name(), c"Nano");
}

#[test]
fn propagate_policy_returns_null_to_the_caller() {
    counting_zone!(mod stub);

    let page = unsafe { ZonePage::new(c"Stub", 10, stub::ops()) }.unwrap();
    let config = InterposerConfig {
        on_allocation_failure: FailurePolicy::Propagate,
        ..InterposerConfig::default()
    };
    page.install_instrumented(interposer(config)).unwrap();
    assert_eq!(page.malloc(FAIL_SIZE), ptr::null_mut());
    assert_eq!(stub::outstanding(), 0);
}

#[test]
fn absent_slots_stay_absent() {
    counting_zone!(mod stub);

    let page = unsafe { ZonePage::new(c"Stub", 10, stub::ops()) }.unwrap();
    page.install_instrumented(interposer(InterposerConfig::default()))
        .unwrap();
    let ops = page.ops();
    assert!(ops.calloc.is_none());
    assert!(ops.realloc.is_none());
    assert!(ops.claimed_address.is_none());
    assert!(page.calloc(1, 1).is_null());
    assert_eq!(page.pressure_relief(0), 0);
}

#[test]
fn rust_allocations_through_an_instrumented_zone_take_the_lock() {
    use std::alloc::{GlobalAlloc, Layout};

    use zonelock::zone::ZoneAlloc;

    let page = ZonePage::system().unwrap();
    let interposer = interposer(InterposerConfig::default());
    page.install_instrumented(interposer).unwrap();

    let alloc = ZoneAlloc::new(&page);
    let layout = Layout::array::<u64>(32).unwrap();
    unsafe {
        let p = alloc.alloc(layout).cast::<u64>();
        assert!(!p.is_null());
        for i in 0..32 {
            p.add(i).write(i as u64);
        }
        assert_eq!(p.add(31).read(), 31);
        alloc.dealloc(p.cast(), layout);
    }
    assert_eq!(interposer.registry().stats().initialized_slots, 1);
}
