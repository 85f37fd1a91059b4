mod common;

use common::*;
use zpci_host::event::{
    EVENT_CONFIGURED_TO_STANDBY_RESERVED, EVENT_DECONFIGURE_REQUEST, EVENT_RESERVED_TO_STANDBY,
    EVENT_STANDBY_TO_RESERVED, EVENT_TO_CONFIGURED,
};
use zpci_host::{
    EventClass, FunctionHandle, FunctionState, HostBridgeConfig, PlugRequest, RegistryError,
    SclpOutcome, UnplugProgress,
};

fn drain_codes(h: &Harness) -> Vec<u16> {
    std::iter::from_fn(|| h.bridge.events().pop())
        .map(|event| event.code)
        .collect()
}

#[test]
fn cold_plug_queues_nothing() {
    let h = Harness::new();
    let (function, _) = h.plug(3);
    assert_eq!(function.state(), FunctionState::Configured);
    assert_eq!(function.fid(), 3);
    assert_eq!(function.uid(), 1);
    assert_eq!(function.handle(), FunctionHandle::for_slot(3, false));
    assert!(h.bridge.events().is_empty());
    assert_eq!(h.events.count(), 0);
}

#[test]
fn hotplug_announces_the_function() {
    let h = Harness::new();
    let (function, _) = h.plug_request(|req| req.slot(5).hotplugged(true));

    let first = h.bridge.events().pop().unwrap();
    assert_eq!(first.class, EventClass::Availability);
    assert_eq!(first.code, EVENT_RESERVED_TO_STANDBY);
    assert_eq!(first.fh, function.handle().raw());
    assert_eq!(first.fid, 5);
    assert_eq!(h.bridge.events().pop().unwrap().code, EVENT_TO_CONFIGURED);
    assert_eq!(h.events.count(), 2);
}

#[test]
fn configure_and_deconfigure() {
    let h = Harness::new();
    let (function, device) = h.plug(3);
    let fid = function.fid();

    assert_eq!(h.bridge.configure(fid), SclpOutcome::AlreadyInState);
    h.enable(&function);
    assert_eq!(h.bridge.deconfigure(fid), SclpOutcome::Done);
    assert_eq!(function.state(), FunctionState::Standby);
    assert!(!function.handle().is_enabled());
    assert_eq!(device.lock().unwrap().resets, 1);
    assert_eq!(h.bridge.deconfigure(fid), SclpOutcome::AlreadyInState);

    assert_eq!(h.bridge.configure(fid), SclpOutcome::Done);
    assert_eq!(function.state(), FunctionState::Configured);
    assert_eq!(h.bridge.configure(0x99), SclpOutcome::NoSuchFunction);
    assert_eq!(h.bridge.deconfigure(0x99), SclpOutcome::NoSuchFunction);
}

#[test]
fn unplug_of_an_enabled_function() {
    let h = Harness::new();
    let (function, _) = h.plug(3);
    let fh = h.enable(&function);
    h.register_ioat(fh).unwrap();
    h.register_irq(fh, 8, true).unwrap();

    h.bridge.unplug(function.fid()).unwrap();
    assert_eq!(function.state(), FunctionState::Reserved);
    assert_eq!(function.handle().raw(), 0);
    assert!(function.status().translation.is_none());
    assert_eq!(h.bridge.indicators().refs(SUMMARY_ADDR), 0);
    assert!(h.bridge.find_by_slot(3).is_none());

    let first = h.bridge.events().pop().unwrap();
    assert_eq!(first.code, EVENT_CONFIGURED_TO_STANDBY_RESERVED);
    assert_eq!(first.fh, fh);
    assert_eq!(drain_codes(&h), vec![EVENT_STANDBY_TO_RESERVED]);

    assert_eq!(
        h.bridge.unplug(function.fid()),
        Err(RegistryError::NoSuchFunction { fid: 3 })
    );
}

#[test]
fn unplug_request_waits_for_the_guest() {
    let h = Harness::new();
    let (function, _) = h.plug(3);
    let fid = function.fid();
    h.enable(&function);

    assert_eq!(h.bridge.request_unplug(fid), Ok(UnplugProgress::Pending));
    assert!(function.status().unplug_requested);
    assert_eq!(drain_codes(&h), vec![EVENT_DECONFIGURE_REQUEST]);
    assert!(h.bridge.find_by_fid(fid).is_some());

    // The guest deconfigures; removal completes from standby.
    assert_eq!(h.bridge.deconfigure(fid), SclpOutcome::Done);
    assert_eq!(function.state(), FunctionState::Reserved);
    assert!(h.bridge.find_by_fid(fid).is_none());
    assert_eq!(drain_codes(&h), vec![EVENT_STANDBY_TO_RESERVED]);
}

#[test]
fn unplug_request_in_standby_completes_at_once() {
    let h = Harness::new();
    let (function, _) = h.plug(3);
    h.bridge.deconfigure(function.fid());

    assert_eq!(
        h.bridge.request_unplug(function.fid()),
        Ok(UnplugProgress::Completed)
    );
    assert_eq!(drain_codes(&h), vec![EVENT_STANDBY_TO_RESERVED]);
    assert_eq!(
        h.bridge.request_unplug(function.fid()),
        Err(RegistryError::NoSuchFunction { fid: 3 })
    );
}

#[test]
fn reset_disables_functions_and_finishes_unplugs() {
    let h = Harness::new();
    let (enabled, device) = h.plug(1);
    let (leaving, _) = h.plug(2);
    let (idle, _) = h.plug(4);
    let fh = h.enable(&enabled);
    h.register_ioat(fh).unwrap();
    h.bridge.request_unplug(leaving.fid()).unwrap();
    drain_codes(&h);

    h.bridge.reset();
    assert_eq!(enabled.state(), FunctionState::Configured);
    assert!(!enabled.handle().is_enabled());
    assert!(enabled.status().translation.is_none());
    assert_eq!(device.lock().unwrap().resets, 1);
    assert_eq!(leaving.state(), FunctionState::Reserved);
    assert_eq!(idle.state(), FunctionState::Configured);
    assert_eq!(
        drain_codes(&h),
        vec![EVENT_CONFIGURED_TO_STANDBY_RESERVED, EVENT_STANDBY_TO_RESERVED]
    );
    assert_eq!(h.bridge.functions().len(), 2);
}

#[test]
fn plug_rejects_conflicts() {
    let h = Harness::new();
    h.plug_request(|req| req.slot(1).fid(0x10).uid(7));

    let attempt = |build: fn(PlugRequest) -> PlugRequest| {
        let (device, _) = TestDevice::new(true);
        h.bridge
            .plug(build(PlugRequest::new(Box::new(device))))
            .map(|_| ())
    };
    assert_eq!(
        attempt(|req| req.slot(1)),
        Err(RegistryError::SlotOccupied { slot: 1 })
    );
    assert_eq!(
        attempt(|req| req.slot(2).fid(0x10)),
        Err(RegistryError::FidInUse { fid: 0x10 })
    );
    assert_eq!(
        attempt(|req| req.slot(2).uid(7)),
        Err(RegistryError::UidInUse { uid: 7 })
    );
    assert_eq!(
        attempt(|req| req.slot(2).group(0x99)),
        Err(RegistryError::UnknownGroup { group: 0x99 })
    );
    assert_eq!(
        attempt(|req| req.slot(300)),
        Err(RegistryError::SlotOutOfRange {
            slot: 300,
            slots: 256
        })
    );

    let (plain, _) = TestDevice::new(false);
    assert_eq!(
        h.bridge
            .plug(PlugRequest::new(Box::new(plain)).slot(2))
            .map(|_| ()),
        Err(RegistryError::MissingMsix)
    );
    assert_eq!(h.bridge.functions().len(), 1);
}

#[test]
fn msix_is_optional_when_configured_so() {
    let config = HostBridgeConfig {
        require_msix: false,
        ..HostBridgeConfig::default()
    };
    let h = Harness::with(config, ScriptedHost::default());
    let (plain, _) = TestDevice::new(false);
    let function = h.bridge.plug(PlugRequest::new(Box::new(plain))).unwrap();
    assert!(function.msix().is_none());
}

#[test]
fn default_ids_skip_used_values() {
    let h = Harness::new();
    h.plug_request(|req| req.slot(0).fid(1).uid(1));
    let (second, _) = h.plug(1);
    // Fid 1 is taken, so the next free one after the slot is used.
    assert_eq!(second.fid(), 2);
    assert_eq!(second.uid(), 2);
}

#[test]
fn free_slots_are_handed_out_in_rotation() {
    let config = HostBridgeConfig {
        slots: 4,
        ..HostBridgeConfig::default()
    };
    let h = Harness::with(config, ScriptedHost::default());
    let plug_any = || {
        let (device, _) = TestDevice::new(true);
        h.bridge.plug(PlugRequest::new(Box::new(device)))
    };

    let a = plug_any().unwrap();
    let b = plug_any().unwrap();
    assert_eq!((a.slot(), b.slot()), (0, 1));

    // A freed slot is not reused while later ones are free.
    h.bridge.unplug(a.fid()).unwrap();
    assert_eq!(plug_any().unwrap().slot(), 2);
    assert_eq!(plug_any().unwrap().slot(), 3);
    assert_eq!(plug_any().unwrap().slot(), 0);
    assert_eq!(plug_any().map(|_| ()), Err(RegistryError::NoFreeSlot));
}
