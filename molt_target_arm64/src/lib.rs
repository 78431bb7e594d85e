//! molt_target_arm64: aarch64 relocation engine.
//!
//! Branches carry a signed 26-bit word displacement (±128 MiB); ADRP/ADD
//! pairs address ±4 GiB around the current page. Beyond those ranges the
//! engine appends islands at the code tail: branches go through
//! `ldr x16, #8; br x16; .quad target`, and an out-of-range ADRP/ADD pair
//! is replaced by a branch into a MOVZ/MOVK sequence that materializes the
//! full 64-bit address and branches back past the paired ADD.
//!
//! ADRP patching must be idempotent: the original instruction bytes are
//! cached by code offset on first application and restored before any
//! re-application, so patching twice reproduces the first result.

use log::debug;

use molt_target::{Arch, Machine, Reloc, RelocCtx, RelocError, RelocKind, Site};

/// `ldr x16, #8`: loads the literal placed right after the `br`.
const LDR_X16_LIT8: u32 = 0x5800_0050;
/// `br x16`
const BR_X16: u32 = 0xd61f_0200;

/// Unconditional branch with a signed byte displacement (multiple of 4).
fn b_imm(delta: i64) -> u32 {
    0x1400_0000 | (((delta >> 2) as u32) & 0x03ff_ffff)
}

fn fits_branch26(delta: i64) -> bool {
    delta % 4 == 0 && (-(1 << 27)..(1 << 27)).contains(&delta)
}

fn fits32(v: i64) -> bool {
    (i32::MIN as i64..=i32::MAX as i64).contains(&v)
}

/// aarch64 engine.
pub struct Arm64;

impl Arch for Arm64 {
    fn name(&self) -> &'static str {
        "arm64"
    }

    fn machine(&self) -> Machine {
        Machine::Arm64
    }

    fn apply(
        &self,
        ctx: &mut RelocCtx<'_>,
        r: &Reloc,
        site: Site,
        addr: usize,
    ) -> Result<(), RelocError> {
        match r.kind {
            RelocKind::Addr | RelocKind::WeakAddr => {
                ctx.put_u64(site.in_code, r.offset, (addr as i64 + r.addend) as u64);
                Ok(())
            }
            RelocKind::AddrOff | RelocKind::WeakAddrOff | RelocKind::MethodOff => {
                let mut base = ctx.base(site.in_code);
                if r.kind == RelocKind::MethodOff && site.target_in_code {
                    base = ctx.code_base;
                }
                let off = addr as i64 - base as i64 + r.addend;
                if !fits32(off) {
                    return Err(RelocError::Overflow {
                        symbol: r.target.clone(),
                        offset: off,
                    });
                }
                ctx.put_u32(site.in_code, r.offset, off as u32);
                Ok(())
            }
            RelocKind::Call => self.apply_call(ctx, r, addr),
            RelocKind::AdrpAdd => self.apply_adrp(ctx, r, addr),
            RelocKind::TlsLe => {
                ctx.put_u32(site.in_code, r.offset, ctx.tls_offset as u32);
                Ok(())
            }
            k if k.is_inert() => Ok(()),
            RelocKind::PcRel => Err(RelocError::Unsupported {
                symbol: r.target.clone(),
                r_type: 2,
            }),
            RelocKind::Unknown(t) => Err(RelocError::Unsupported {
                symbol: r.target.clone(),
                r_type: t,
            }),
            _ => unreachable!(),
        }
    }
}

impl Arm64 {
    fn apply_call(
        &self,
        ctx: &mut RelocCtx<'_>,
        r: &Reloc,
        addr: usize,
    ) -> Result<(), RelocError> {
        let site_addr = (ctx.code_base + r.offset) as i64;
        let mut delta = addr as i64 + r.addend - site_addr;
        if !fits_branch26(delta) {
            ctx.align_code(8);
            let island = ctx.code_off;
            ctx.push_code(&r.target, &LDR_X16_LIT8.to_le_bytes())?;
            ctx.push_code(&r.target, &BR_X16.to_le_bytes())?;
            ctx.push_code(&r.target, &((addr as i64 + r.addend) as u64).to_le_bytes())?;
            delta = (ctx.code_base + island) as i64 - site_addr;
            debug!(
                "branch to {} out of range, island at code+{:#x}",
                r.target, island
            );
        }
        let old = ctx.read_u32(true, r.offset);
        let patched = (old & 0xfc00_0000) | (((delta >> 2) as u32) & 0x03ff_ffff);
        ctx.put_u32(true, r.offset, patched);
        Ok(())
    }

    fn apply_adrp(
        &self,
        ctx: &mut RelocCtx<'_>,
        r: &Reloc,
        addr: usize,
    ) -> Result<(), RelocError> {
        let orig = ctx.restore_or_snapshot(r.offset);
        let site_addr = (ctx.code_base + r.offset) as i64;
        let signed = addr as i64 + r.addend - (site_addr & !0xfff);
        if signed > (1 << 32) || signed < -(1 << 32) {
            // Too far for ADRP+ADD: branch into a sequence that builds the
            // full address in the destination register, then branch back
            // past the paired ADD.
            let target = (addr as i64 + r.addend) as u64;
            let reg = u32::from_le_bytes(orig[0..4].try_into().unwrap()) & 0x1f;
            ctx.align_code(4);
            let island = ctx.code_off;
            ctx.put_u32(true, r.offset, b_imm(island as i64 - r.offset as i64));
            let movz = 0xd280_0000 | (((target & 0xffff) as u32) << 5) | reg;
            let movk1 = 0xf2a0_0000 | ((((target >> 16) & 0xffff) as u32) << 5) | reg;
            let movk2 = 0xf2c0_0000 | ((((target >> 32) & 0xffff) as u32) << 5) | reg;
            let movk3 = 0xf2e0_0000 | ((((target >> 48) & 0xffff) as u32) << 5) | reg;
            for ins in [movz, movk1, movk2, movk3] {
                ctx.push_code(&r.target, &ins.to_le_bytes())?;
            }
            let back = r.offset as i64 + 8 - ctx.code_off as i64;
            ctx.push_code(&r.target, &b_imm(back).to_le_bytes())?;
            debug!(
                "adrp to {} out of range, island at code+{:#x}",
                r.target, island
            );
        } else {
            let adrp = u32::from_le_bytes(orig[0..4].try_into().unwrap());
            let add = u32::from_le_bytes(orig[4..8].try_into().unwrap());
            let pages = (signed as u64) >> 12;
            let imm_lo = ((pages & 3) as u32) << 29;
            let imm_hi = (((pages >> 2) & 0x7_ffff) as u32) << 5;
            ctx.put_u32(true, r.offset, adrp | imm_lo | imm_hi);
            ctx.put_u32(
                true,
                r.offset + 4,
                add | ((((signed as u64) & 0xfff) as u32) << 10),
            );
        }
        Ok(())
    }
}
