//! Behavior that ends the process: guard-region faults and fatal
//! bookkeeping violations.
//!
//! Each test re-runs this test binary filtered to itself, with
//! `LINMEM_CHILD_MODE` set. The child performs the crashing operation and
//! the parent checks how it died.

#![cfg(unix)]

use std::env;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Output};
use std::sync::Arc;

use linmem_runtime::{
    init_with_config, AddressSpaceWidth, AllocationRecord, BufferAddress, HostBuffer, LinearMemoryConfig,
    MemoryTracker, PageAllocator, SharedFlag, SystemPageAllocator, WASM_PAGE_SIZE,
};
use nix::sys::signal::Signal;

const CHILD_MODE: &str = "LINMEM_CHILD_MODE";

fn child_mode() -> Option<String> {
    env::var(CHILD_MODE).ok()
}

fn run_child(test_name: &str, mode: &str) -> Output {
    Command::new(env::current_exe().unwrap())
        .args([test_name, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_MODE, mode)
        .output()
        .unwrap()
}

fn assert_killed_by(output: &Output, signals: &[Signal]) {
    let signal = output.status.signal();
    assert!(
        signals.iter().any(|s| Some(*s as i32) == signal),
        "expected one of {:?}, got {:?}\nstderr:\n{}",
        signals,
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn config_64() -> LinearMemoryConfig {
    LinearMemoryConfig::builder()
        .address_space(AddressSpaceWidth::Bits64)
        .build_unchecked()
}

/// Touch `offset` bytes past the start of a fresh one-page guarded buffer.
fn touch_guarded(offset: usize) {
    let lifecycle = init_with_config(&config_64());
    let buffer = lifecycle
        .create(WASM_PAGE_SIZE, true, SharedFlag::NotShared)
        .unwrap();
    let ptr = buffer.backing_store().as_ptr();
    unsafe {
        std::ptr::write_volatile(ptr.add(offset), 1);
    }
    // Only reached if the write did not fault.
    lifecycle.detach(&buffer, true);
}

#[test]
#[cfg(target_pointer_width = "64")]
fn access_past_buffer_faults() {
    if let Some(mode) = child_mode() {
        let offset = mode.parse().unwrap();
        touch_guarded(offset);
        return;
    }

    let allocation_length = 8usize << 30;
    for offset in [WASM_PAGE_SIZE, 2 * WASM_PAGE_SIZE + 7, allocation_length - 1] {
        let output = run_child("access_past_buffer_faults", &offset.to_string());
        assert_killed_by(&output, &[Signal::SIGSEGV, Signal::SIGBUS]);
    }
}

#[test]
#[cfg(target_pointer_width = "64")]
fn access_inside_buffer_succeeds() {
    if let Some(mode) = child_mode() {
        touch_guarded(mode.parse().unwrap());
        return;
    }

    let output = run_child("access_inside_buffer_succeeds", &(WASM_PAGE_SIZE - 1).to_string());
    assert!(output.status.success(), "{:?}", output.status);
}

#[test]
fn double_free_aborts() {
    if child_mode().is_some() {
        let lifecycle = init_with_config(&config_64());
        let buffer = lifecycle
            .create(WASM_PAGE_SIZE, false, SharedFlag::NotShared)
            .unwrap();
        let address = buffer.backing_store().address().unwrap();
        lifecycle.allocator().free_backing_store(address);
        lifecycle.allocator().free_backing_store(address);
        return;
    }

    let output = run_child("double_free_aborts", "child");
    assert_killed_by(&output, &[Signal::SIGABRT]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("release of untracked allocation"), "{}", stderr);
}

#[test]
fn double_registration_aborts() {
    if child_mode().is_some() {
        let tracker = Arc::new(MemoryTracker::with_cap(1 << 30));
        let pages = SystemPageAllocator::new();
        let first = pages.reserve(WASM_PAGE_SIZE, WASM_PAGE_SIZE).unwrap();
        let address = first.address();
        let second = unsafe { linmem_runtime::Reservation::from_raw_parts(first.base(), WASM_PAGE_SIZE) };

        assert!(tracker.reserve_address_space(2 * WASM_PAGE_SIZE));
        tracker.register_allocation(AllocationRecord::new(first, address, WASM_PAGE_SIZE, false));
        tracker.register_allocation(AllocationRecord::new(second, address, WASM_PAGE_SIZE, false));
        return;
    }

    let output = run_child("double_registration_aborts", "child");
    assert_killed_by(&output, &[Signal::SIGABRT]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("registered twice"), "{}", stderr);
}

#[test]
fn over_release_aborts() {
    if child_mode().is_some() {
        let tracker = MemoryTracker::with_cap(1 << 20);
        assert!(tracker.reserve_address_space(WASM_PAGE_SIZE));
        tracker.release_reservation(2 * WASM_PAGE_SIZE);
        return;
    }

    let output = run_child("over_release_aborts", "child");
    assert_killed_by(&output, &[Signal::SIGABRT]);
}

#[test]
fn unreserved_registration_aborts() {
    if child_mode().is_some() {
        let tracker = MemoryTracker::with_cap(1 << 20);
        let pages = SystemPageAllocator::new();
        let reservation = pages.reserve(WASM_PAGE_SIZE, WASM_PAGE_SIZE).unwrap();
        let address = reservation.address();
        tracker.register_allocation(AllocationRecord::new(reservation, address, WASM_PAGE_SIZE, false));
        return;
    }

    let output = run_child("unreserved_registration_aborts", "child");
    assert_killed_by(&output, &[Signal::SIGABRT]);
}

#[test]
fn unknown_address_release_aborts() {
    if child_mode().is_some() {
        let tracker = MemoryTracker::with_cap(1 << 20);
        let _ = tracker.release_allocation(BufferAddress::new(0x1000));
        return;
    }

    let output = run_child("unknown_address_release_aborts", "child");
    assert_killed_by(&output, &[Signal::SIGABRT]);
}
