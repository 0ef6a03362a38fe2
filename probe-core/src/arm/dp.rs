//! ADIv5 Debug Port driver (spec.md §4.2).

use std::time::{Duration, Instant};

use bitfield::bitfield;
use jep106::JEP106Code;

use crate::arm::{DapError, Protocol};
use crate::error::{Error, Result};
use crate::link::{Ack, Link};

/// DP register address: `CTRL/STAT` (bank 0) / `DPIDR` (read) / `ABORT`
/// (write), all at offset 0x0/0x4.
pub const DPIDR: u8 = 0x0;
pub const ABORT: u8 = 0x0;
pub const CTRLSTAT: u8 = 0x4;
pub const SELECT: u8 = 0x8;
pub const RDBUFF: u8 = 0xC;

/// `CFG`/`BASE`/`IDR` all live in AP bank 0xF.
pub const AP_CFG_ADDR: u8 = 0xF4;
pub const AP_BASE_ADDR: u8 = 0xF8;
pub const AP_IDR_ADDR: u8 = 0xFC;

bitfield! {
    /// `ABORT` register: write-1-to-clear sticky flags.
    #[derive(Clone, Copy)]
    pub struct Abort(u32);
    impl Debug;
    pub _, set_orunerrclr: 4;
    pub _, set_wderrclr: 3;
    pub _, set_stkerrclr: 2;
    pub _, set_stkcmpclr: 1;
    pub _, set_dapabort: 0;
}

bitfield! {
    /// `CTRL/STAT` register.
    #[derive(Clone, Copy)]
    pub struct Ctrl(u32);
    impl Debug;
    pub csyspwrupack, _: 31;
    pub csyspwrupreq, set_csyspwrupreq: 30;
    pub cdbgpwrupack, _: 29;
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    pub cdbgrstack, _: 27;
    pub cdbgrstreq, set_cdbgrstreq: 26;
    pub sticky_err, _: 5;
    pub sticky_orun, _: 1;
}

bitfield! {
    /// `SELECT` register.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Select(u32);
    impl Debug;
    pub u8, apsel, set_apsel: 31, 24;
    pub u8, apbanksel, set_apbanksel: 7, 4;
    pub u8, dpbanksel, set_dpbanksel: 3, 0;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct Dpidr(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    pub u8, part_no, _: 27, 20;
    pub u8, version, _: 15, 12;
    u8, jep_cc, _: 11, 8;
    u8, jep_id, _: 7, 1;
}

/// Sticky fault bits accumulated on a DP since the last [`DebugPort::error`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StickyFlags {
    pub fault: bool,
    pub sticky_orun: bool,
    pub sticky_err: bool,
}

/// Per-DP options (spec.md §4.2: debug-reset is "known to deadlock on some
/// silicon", gated off by default).
#[derive(Debug, Clone, Copy)]
pub struct DpOptions {
    /// Perform the CDBGRSTREQ/CDBGRSTACK sequence during `init`.
    pub allow_debug_reset: bool,
    /// Power-up poll timeout (spec.md §4.2: 250 ms).
    pub power_up_timeout: Duration,
    /// Debug-reset poll timeout, only consulted if `allow_debug_reset`.
    pub debug_reset_timeout: Duration,
    /// Cap on the number of APs `probe_aps` will record.
    pub ap_scan_limit: usize,
    /// Max consecutive WAIT acks before giving up on a transaction.
    pub wait_retries: u32,
}

impl Default for DpOptions {
    fn default() -> Self {
        Self {
            allow_debug_reset: false,
            power_up_timeout: Duration::from_millis(250),
            debug_reset_timeout: Duration::from_millis(250),
            ap_scan_limit: 64,
            wait_retries: 8,
        }
    }
}

/// One ADIv5 Debug Port reachable on a [`crate::link::Link`] (spec.md §3).
#[derive(Debug)]
pub struct DebugPort {
    /// Link-specific index, e.g. which multidrop target on the wire.
    pub index: usize,
    pub protocol: Protocol,
    pub options: DpOptions,
    /// Cached value of SELECT, or `None` if unknown (forces a write on the
    /// next access).
    select_cache: Option<Select>,
    pub sticky: StickyFlags,
    pub designer: Option<JEP106Code>,
    pub targetid: u32,
    /// Number of APs currently attached through this DP.
    ap_refcount: u32,
}

/// One discovered Access Port (identification fields only; the register
/// driver lives in [`crate::arm::ap`]).
#[derive(Debug, Clone, Copy)]
pub struct ApIdentity {
    pub apsel: u8,
    pub idr: u32,
    pub cfg: u32,
    pub base: u32,
}

impl DebugPort {
    pub fn new(index: usize, protocol: Protocol, options: DpOptions) -> Self {
        Self {
            index,
            protocol,
            options,
            select_cache: None,
            sticky: StickyFlags::default(),
            designer: None,
            targetid: 0,
            ap_refcount: 0,
        }
    }

    pub fn acquire_ap(&mut self) {
        self.ap_refcount += 1;
    }

    /// Releases one AP reference; returns `true` if this was the last one
    /// and the DP may now be torn down (spec.md §3 lifecycle).
    pub fn release_ap(&mut self) -> bool {
        self.ap_refcount = self.ap_refcount.saturating_sub(1);
        self.ap_refcount == 0
    }

    fn invalidate_select(&mut self) {
        self.select_cache = None;
    }

    /// Low-level SWD transaction with the bit-banging NACK/WAIT/FAULT retry
    /// loop (spec.md §4.2 failure semantics). Returns the raw 32-bit data
    /// phase of the transaction (or `()` on a write).
    fn swd_transact(
        &mut self,
        link: &mut dyn Link,
        apndp: bool,
        rnw: bool,
        addr: u8,
        value: u32,
    ) -> core::result::Result<u32, DapError> {
        let request = swd_request_byte(apndp, rnw, addr);
        let mut retries = 0u32;
        loop {
            let ack = if rnw {
                let (ack, data, parity) = link.swd_read(request).map_err(|_| DapError::NoAcknowledge)?;
                if ack == Ack::Ok {
                    if parity != (data.count_ones() % 2 != 0) {
                        return Err(DapError::IncorrectParity);
                    }
                    return Ok(data);
                }
                ack
            } else {
                let parity = value.count_ones() % 2 != 0;
                link.swd_write(request, value, parity)
                    .map_err(|_| DapError::NoAcknowledge)?
            };

            match ack {
                Ack::Ok => return Ok(0),
                Ack::Wait => {
                    retries += 1;
                    if retries > self.options.wait_retries {
                        return Err(DapError::WaitResponse);
                    }
                    continue;
                }
                Ack::Fault => return Err(DapError::FaultResponse),
                Ack::NoAck => return Err(DapError::NoAcknowledge),
            }
        }
    }

    /// Drive an arbitrary DPACC/APACC transaction, returning whichever
    /// value the wire transaction produced. For AP reads this is the
    /// *previous* operation's result, per the ADIv5 pipeline (spec.md §4.2).
    pub(crate) fn low_access(
        &mut self,
        link: &mut dyn Link,
        rnw: bool,
        apndp: bool,
        addr: u8,
        value: u32,
    ) -> Result<u32> {
        match self.protocol {
            Protocol::Swd => Ok(self.swd_transact(link, apndp, rnw, addr, value)?),
            Protocol::Jtag => {
                // IR is fixed to DPACC (0xA) or APACC (0xB); DR is 3-bit ack
                // + 32-bit data + 2-bit register select, all LSB-first.
                let ir = if apndp { 0xB_u8 } else { 0xA_u8 };
                let mut out = [0u8; 5];
                let a23 = (addr >> 2) & 0b11;
                out[0] = (rnw as u8) | (a23 << 1);
                out[1..5].copy_from_slice(&value.to_le_bytes());
                let mut ir_out = [ir];
                let mut ir_in = [0u8; 1];
                link.shift_dr_ir(crate::link::Register::Ir, &ir_out, &mut ir_in, 4)?;
                let _ = &mut ir_out;
                let mut in_bits = [0u8; 5];
                link.shift_dr_ir(crate::link::Register::Dr, &out, &mut in_bits, 35)?;
                let ack = Ack::from_bits(in_bits[0] & 0b111);
                match ack {
                    Ack::Ok => {
                        let data = u32::from_le_bytes([in_bits[1], in_bits[2], in_bits[3], in_bits[4]]);
                        Ok(data)
                    }
                    Ack::Wait => Err(Error::Dap(DapError::WaitResponse)),
                    Ack::Fault => Err(Error::Dap(DapError::FaultResponse)),
                    Ack::NoAck => Err(Error::Dap(DapError::NoAcknowledge)),
                }
            }
        }
    }

    /// Ensure `SELECT` on the wire matches `select`, writing only if the
    /// cache disagrees (spec.md §3 DP invariant).
    fn ensure_select(&mut self, link: &mut dyn Link, select: Select) -> Result<()> {
        if self.select_cache != Some(select) {
            self.low_access(link, false, false, SELECT, select.0)?;
            self.select_cache = Some(select);
        }
        Ok(())
    }

    /// Read a DP register (CTRLSTAT, SELECT, RDBUFF, DPIDR).
    pub fn read(&mut self, link: &mut dyn Link, reg: u8) -> Result<u32> {
        // DP register reads are not pipelined against AP reads: flush by
        // reading twice when the register isn't RDBUFF, because the wire
        // transaction for a DP register read also returns its own value
        // immediately per ADIv5 (no pipeline delay on DP-local registers).
        self.low_access(link, true, false, reg, 0)
    }

    /// Write a DP register. If writing `SELECT`, updates the cache.
    pub fn write(&mut self, link: &mut dyn Link, reg: u8, value: u32) -> Result<()> {
        if reg == SELECT {
            let select = Select(value);
            self.ensure_select(link, select)?;
            return Ok(());
        }
        self.low_access(link, false, false, reg, value)?;
        Ok(())
    }

    fn select_ap_bank(&mut self, link: &mut dyn Link, apsel: u8, bank: u8) -> Result<()> {
        let mut select = self.select_cache.unwrap_or(Select(0));
        select.set_apsel(apsel);
        select.set_apbanksel(bank);
        self.ensure_select(link, select)
    }

    /// Read an AP register, flushing the ADIv5 pipeline with a trailing
    /// RDBUFF read (spec.md §4.2: "a final RDBUFF read flushes the
    /// pipeline").
    pub fn ap_read(&mut self, link: &mut dyn Link, apsel: u8, addr: u8) -> Result<u32> {
        self.select_ap_bank(link, apsel, addr >> 4)?;
        let _discarded = self.low_access(link, true, true, addr, 0)?;
        let value = self.low_access(link, true, false, RDBUFF, 0)?;
        Ok(value)
    }

    /// Write an AP register.
    pub fn ap_write(&mut self, link: &mut dyn Link, apsel: u8, addr: u8, value: u32) -> Result<()> {
        self.select_ap_bank(link, apsel, addr >> 4)?;
        self.low_access(link, false, true, addr, value)?;
        Ok(())
    }

    /// Pipelined bulk AP read: issues `addrs.len()` reads of the same
    /// register bank and returns one value per read, using only
    /// `addrs.len() + 1` wire transactions total (spec.md §4.2, §8
    /// quantified invariant).
    pub fn ap_read_pipelined(
        &mut self,
        link: &mut dyn Link,
        apsel: u8,
        addr: u8,
        count: usize,
    ) -> Result<Vec<u32>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.select_ap_bank(link, apsel, addr >> 4)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let _ = self.low_access(link, true, true, addr, 0)?;
        }
        // The Nth issued read's value surfaces on the (N+1)th low-level
        // read; the final RDBUFF flush yields the last one.
        for _ in 0..count - 1 {
            out.push(self.low_access(link, true, true, addr, 0)?);
        }
        out.push(self.low_access(link, true, false, RDBUFF, 0)?);
        Ok(out)
    }

    /// ADIv5 DP power-up (spec.md §4.2, scenario 1).
    pub fn init(&mut self, link: &mut dyn Link) -> Result<()> {
        tracing::debug_span!("dp_init", dp = self.index).in_scope(|| tracing::debug!("powering up"));
        link.return_idle()?;
        self.invalidate_select();

        let mut ctrl = Ctrl(0);
        ctrl.set_csyspwrupreq(true);
        ctrl.set_cdbgpwrupreq(true);
        self.write(link, CTRLSTAT, ctrl.0)?;

        let deadline = Instant::now() + self.options.power_up_timeout;
        loop {
            let raw = self.read(link, CTRLSTAT)?;
            let status = Ctrl(raw);
            if status.csyspwrupack() && status.cdbgpwrupack() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::TransportTimeout("DP power-up ack"));
            }
        }

        if self.options.allow_debug_reset {
            let mut ctrl = Ctrl(self.read(link, CTRLSTAT)?);
            ctrl.set_cdbgrstreq(true);
            self.write(link, CTRLSTAT, ctrl.0)?;

            // Open question resolved (spec.md §9): unlike the source, which
            // spins forever here, this always honours a deadline.
            let deadline = Instant::now() + self.options.debug_reset_timeout;
            loop {
                let status = Ctrl(self.read(link, CTRLSTAT)?);
                if status.cdbgrstack() {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(Error::TransportTimeout("DP debug-reset ack"));
                }
            }

            let mut ctrl = Ctrl(self.read(link, CTRLSTAT)?);
            ctrl.set_cdbgrstreq(false);
            self.write(link, CTRLSTAT, ctrl.0)?;
        }

        let dpidr = Dpidr(self.read(link, DPIDR)?);
        self.designer = Some(JEP106Code::new(dpidr.jep_cc(), dpidr.jep_id()));
        tracing::debug!(dp = self.index, ?self.designer, "DP powered up");

        Ok(())
    }

    /// Scan `apsel = 0..255` for Access Ports, stopping at the first gap
    /// (spec.md §4.2, scenario 2). Capped at `options.ap_scan_limit`.
    pub fn probe_aps(&mut self, link: &mut dyn Link) -> Result<Vec<ApIdentity>> {
        let mut aps = Vec::new();
        let mut saw_nonzero = false;
        for apsel in 0u8..=255 {
            if aps.len() >= self.options.ap_scan_limit {
                break;
            }
            let idr = self.ap_read(link, apsel, AP_IDR_ADDR)?;
            if idr == 0 {
                if saw_nonzero || apsel == 0 {
                    break;
                }
                continue;
            }
            saw_nonzero = true;
            let cfg = self.ap_read(link, apsel, AP_CFG_ADDR)?;
            let base = self.ap_read(link, apsel, AP_BASE_ADDR)?;
            aps.push(ApIdentity { apsel, idr, cfg, base });
        }
        Ok(aps)
    }

    /// Read `CTRL/STAT`, clear the sticky-error bits via `ABORT`
    /// (write-1-to-clear) and return the previously-latched flags
    /// (spec.md §4.2: `error()`).
    pub fn error(&mut self, link: &mut dyn Link) -> Result<StickyFlags> {
        let raw = self.read(link, CTRLSTAT)?;
        let ctrl = Ctrl(raw);
        let flags = StickyFlags {
            fault: ctrl.sticky_err() || ctrl.sticky_orun(),
            sticky_orun: ctrl.sticky_orun(),
            sticky_err: ctrl.sticky_err(),
        };

        let mut abort = Abort(0);
        abort.set_stkerrclr(true);
        abort.set_orunerrclr(true);
        self.low_access(link, false, false, ABORT, abort.0)?;

        self.sticky = StickyFlags::default();
        Ok(flags)
    }
}

fn swd_request_byte(apndp: bool, rnw: bool, addr: u8) -> u8 {
    let a23 = (addr >> 2) & 0b11;
    let parity = (apndp as u8) ^ (rnw as u8) ^ (a23 & 1) ^ (a23 >> 1);
    let mut byte = 0x81u8; // start=1 (bit0), park=1 (bit7), stop=0 (bit6)
    byte |= (apndp as u8) << 1;
    byte |= (rnw as u8) << 2;
    byte |= a23 << 3;
    byte |= (parity & 1) << 5;
    byte
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::tests::MockLink;

    #[test]
    fn dp_power_up_within_budget() {
        let mut link = MockLink::new();
        link.expect_swd_write(0x50000000);
        link.queue_ctrlstat_acks(3, 0xF0000000);
        let mut dp = DebugPort::new(0, Protocol::Swd, DpOptions::default());
        dp.init(&mut link).expect("power-up should succeed");
    }

    #[test]
    fn ap_scan_stops_at_first_gap() {
        let mut link = MockLink::new();
        link.queue_ap_idr(0, 0x2477_0011);
        link.queue_ap_idr(1, 0x0000_0000);
        let mut dp = DebugPort::new(0, Protocol::Swd, DpOptions::default());
        let aps = dp.probe_aps(&mut link).unwrap();
        assert_eq!(aps.len(), 1);
        assert_eq!(aps[0].apsel, 0);
        assert_eq!(aps[0].idr, 0x2477_0011);
    }

    #[test]
    fn select_is_not_rewritten_when_unchanged() {
        let mut link = MockLink::new();
        link.queue_ap_idr(0, 0x1234_5678);
        let mut dp = DebugPort::new(0, Protocol::Swd, DpOptions::default());
        let _ = dp.ap_read(&mut link, 0, AP_IDR_ADDR).unwrap();
        let writes_after_first = link.select_write_count();
        let _ = dp.ap_read(&mut link, 0, AP_IDR_ADDR).unwrap();
        assert_eq!(link.select_write_count(), writes_after_first);
    }
}
