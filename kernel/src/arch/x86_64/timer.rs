//! Programmable interval timer (PIT channel 0).
//!
//! The tick handler owns vector 32: it bumps the 64-bit tick counter,
//! invokes the registered callback (the scheduler) with the trap frame,
//! and acknowledges the controller. Everything that needs wall-ish time
//! derives it from the tick counter.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::io::outb;
use super::pic;
use super::trap::{self, TrapFrame, TIMER_VECTOR};
use crate::sync::SyncUnsafeCell;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
/// PIT input clock in Hz.
const PIT_BASE_HZ: u32 = 1_193_182;
/// Channel 0, lobyte/hibyte access, mode 3 (square wave), binary.
const PIT_CMD_RATE: u8 = 0x36;

static TICKS: AtomicU64 = AtomicU64::new(0);
static FREQUENCY_HZ: AtomicU32 = AtomicU32::new(0);

/// Invoked on every tick, after the counter is bumped and before EOI.
///
/// SAFETY discipline: written once during scheduler init with interrupts
/// masked; read only from the tick handler.
static CALLBACK: SyncUnsafeCell<Option<fn(&mut TrapFrame)>> = SyncUnsafeCell::new(None);

/// Program the PIT for `frequency_hz` periodic ticks, install the tick
/// handler on vector 32 and unmask IRQ 0.
pub fn init(frequency_hz: u32) {
    let divisor = (PIT_BASE_HZ / frequency_hz).clamp(1, u16::MAX as u32) as u16;

    trap::register_handler(TIMER_VECTOR, tick_handler);

    // SAFETY: documented PIT programming sequence, command then the
    // divisor low/high bytes on channel 0.
    unsafe {
        outb(PIT_COMMAND, PIT_CMD_RATE);
        outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
        outb(PIT_CHANNEL0, (divisor >> 8) as u8);
    }

    FREQUENCY_HZ.store(frequency_hz, Ordering::Relaxed);
    pic::unmask_irq(0);

    log::info!(
        "PIT timer at {} Hz ({} ms per tick)",
        frequency_hz,
        1000 / frequency_hz,
    );
}

fn tick_handler(frame: &mut TrapFrame) {
    TICKS.fetch_add(1, Ordering::Relaxed);

    // SAFETY: CALLBACK is only written before the timer is unmasked.
    if let Some(callback) = unsafe { *CALLBACK.get() } {
        callback(frame);
    }

    pic::end_of_interrupt(0);
}

/// Register the per-tick callback (the scheduler). Must be called before
/// the callback is expected to run; last registration wins.
pub fn set_callback(callback: fn(&mut TrapFrame)) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        // SAFETY: interrupts masked, so the tick handler cannot observe
        // a half-written slot.
        unsafe {
            *CALLBACK.get() = Some(callback);
        }
    });
}

/// Ticks since the timer was started. Monotonic, 64-bit, wrap-free for
/// any realistic uptime.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Configured tick frequency in Hz (0 before init).
pub fn frequency_hz() -> u32 {
    FREQUENCY_HZ.load(Ordering::Relaxed)
}

/// Milliseconds since the timer was started.
pub fn uptime_ms() -> u64 {
    let hz = FREQUENCY_HZ.load(Ordering::Relaxed) as u64;
    if hz == 0 {
        return 0;
    }
    ticks() * 1000 / hz
}

/// Convert milliseconds to ticks, rounding up so a nonzero sleep never
/// returns early.
pub fn ms_to_ticks(ms: u64) -> u64 {
    let hz = FREQUENCY_HZ.load(Ordering::Relaxed) as u64;
    if hz == 0 {
        return 0;
    }
    (ms * hz).div_ceil(1000)
}

/// Busy-wait (hlt per iteration) until `ticks` more ticks have elapsed.
pub fn wait_ticks(ticks_to_wait: u64) {
    let target = ticks() + ticks_to_wait;
    while ticks() < target {
        super::hlt();
    }
}

/// Busy-wait for `ms` milliseconds. `sleep_ms(0)` returns immediately.
/// Tasks should prefer the scheduler's sleeping path; this is for early
/// bring-up code that runs before tasking.
pub fn sleep_ms(ms: u64) {
    if ms == 0 {
        return;
    }
    wait_ticks(ms_to_ticks(ms));
}
