//! Swapping a zone's entry points for the interposer's, and back.
//!
//! An install goes: check the version, snapshot the slots, publish the
//! snapshot in the binding table, open the page, overwrite every present slot,
//! seal the page. Entry points look their binding up by zone address, and the
//! binding is ready before the first slot points at them.

use std::{
    ptr::NonNull,
    sync::atomic::{fence, Ordering},
};

use crate::{
    error::{Error, Result},
    interpose::{entry, Interposer},
    zone::{Zone, ZoneHost, ZoneOps, ZonePage},
};

pub mod binding;
pub mod window;

use binding::patch_lock;
use window::WriteWindow;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The zone now points at the interposer
    Installed,
    /// The zone was already pointing at the interposer; nothing changed
    AlreadyInstalled,
}

/// `true` if any slot in `ops` is one of the interposer's entry points
pub fn is_instrumented(ops: &ZoneOps) -> bool {
    ops.addresses()
        .into_iter()
        .zip(entry::entry_points().addresses())
        .any(|(slot, ours)| slot != 0 && slot == ours)
}

/// Instrument `zone` so every call through it is serialised by
/// `interposer`.
///
/// Nothing is written if the version isn't supported. Installing twice is
/// harmless: the second call sees our entry points in the slots and returns
/// [`InstallOutcome::AlreadyInstalled`] without taking a fresh snapshot (that
/// would make the entry points call themselves).
///
/// # Safety
///
/// - `zone` must point to a live [`Zone`] that outlives every call made
///   through it, on pages that hold nothing but zones
pub unsafe fn install(
    zone: NonNull<Zone>,
    interposer: &'static Interposer,
) -> Result<InstallOutcome> {
    let guard = patch_lock();

    // SAFETY: passed to the caller
    let version = unsafe { Zone::version_of(zone) };
    if !interposer.config().supports(version) {
        return Err(Error::UnsupportedVersion { found: version });
    }

    // SAFETY: passed to the caller
    let original = unsafe { Zone::read_ops(zone) };
    if is_instrumented(&original) {
        log::debug!("zone at {:p} is already instrumented", zone);
        return Ok(InstallOutcome::AlreadyInstalled);
    }

    binding::bind(&guard, zone, &original, interposer)?;
    let instrumented = entry::instrumented_ops(&original);

    // SAFETY: passed to the caller
    let window = match unsafe { WriteWindow::open(zone) } {
        Ok(window) => window,
        Err(err) => {
            binding::unbind(zone);
            return Err(err);
        }
    };
    // SAFETY: the window is open, and every entry point we write finds the
    // binding we just published
    unsafe { Zone::write_ops(zone, &instrumented) };
    window.close()?;
    fence(Ordering::SeqCst);

    log::info!(
        "instrumented zone at {:p} (version {version}, {} entry points)",
        zone,
        original.present().count()
    );
    Ok(InstallOutcome::Installed)
}

/// Put the snapshot taken by [`install()`] back into `zone`.
///
/// The binding stays: a thread may still be inside one of our entry points
/// for this zone, and it needs the snapshot to finish its call.
///
/// # Safety
///
/// - same as [`install()`]
pub unsafe fn restore(zone: NonNull<Zone>) -> Result<()> {
    let _guard = patch_lock();

    let not_installed = || Error::NotInstalled {
        zone: zone.as_ptr() as usize,
    };
    let binding = binding::lookup(zone.as_ptr()).ok_or_else(not_installed)?;
    // SAFETY: passed to the caller
    if !is_instrumented(&unsafe { Zone::read_ops(zone) }) {
        return Err(not_installed());
    }
    let original = binding.original();

    // SAFETY: passed to the caller
    let window = unsafe { WriteWindow::open(zone)? };
    // SAFETY: the window is open, and these are the zone's own entry points
    unsafe { Zone::write_ops(zone, &original) };
    window.close()?;
    fence(Ordering::SeqCst);

    log::info!("restored zone at {:p}", zone);
    Ok(())
}

/// Release whatever binding `zone` has. For zones that are about to go away.
pub fn forget(zone: NonNull<Zone>) {
    let _guard = patch_lock();
    binding::unbind(zone);
}

/// A dispatch table we know how to patch in place
pub trait PatchableTable {
    fn install_instrumented(&self, interposer: &'static Interposer) -> Result<InstallOutcome>;

    fn restore_original(&self) -> Result<()>;
}

impl PatchableTable for ZonePage {
    fn install_instrumented(&self, interposer: &'static Interposer) -> Result<InstallOutcome> {
        // SAFETY: the page is ours, holds only the zone, and forgets its
        // binding before it is unmapped
        unsafe { install(self.as_ptr(), interposer) }
    }

    fn restore_original(&self) -> Result<()> {
        // SAFETY: as above
        unsafe { restore(self.as_ptr()) }
    }
}

/// Instrument the zones `interposer`'s selection policy picks out of `host`
pub fn interpose<H: ZoneHost>(
    host: &H,
    interposer: &'static Interposer,
) -> Result<Vec<InstallOutcome>> {
    let zones = host.select(interposer.config().selection);
    if zones.is_empty() {
        return Err(Error::NoZone);
    }
    zones
        .into_iter()
        // SAFETY: `ZoneHost`'s contract
        .map(|zone| unsafe { install(zone, interposer) })
        .collect()
}

/// [`interpose()`], but any failure is fatal. For hosts with no way to carry
/// on unprotected.
pub fn interpose_or_abort<H: ZoneHost>(
    host: &H,
    interposer: &'static Interposer,
) -> Vec<InstallOutcome> {
    interpose(host, interposer).unwrap_or_else(|err| interposer.diagnostics().fatal(&err))
}
