//! molt_target_x86: x86-64 relocation engine.
//!
//! PC-relative displacements are signed 32-bit. When a resolved target lies
//! outside that range the engine does not fail: calls and jumps are routed
//! through an indirect-jump trampoline appended at the code tail, and a
//! too-distant `lea reg, [rip+d]` is rewritten into `mov reg, [rip+d']`
//! reading a synthesized 8-byte address cell. Original code never moves, so
//! segment sizing stays predictable.

use log::debug;

use molt_target::{Arch, Machine, Reloc, RelocCtx, RelocError, RelocKind, Site};

/// `jmp [rip+0]`; the absolute target address follows the instruction.
const JMP_INDIRECT: [u8; 6] = [0xff, 0x25, 0x00, 0x00, 0x00, 0x00];

const LEA_OPCODE: u8 = 0x8d;
const MOV_LOAD_OPCODE: u8 = 0x8b;

fn fits32(v: i64) -> bool {
    (i32::MIN as i64..=i32::MAX as i64).contains(&v)
}

/// x86-64 engine.
pub struct Amd64;

impl Arch for Amd64 {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn machine(&self) -> Machine {
        Machine::Amd64
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
            RelocKind::Call => self.apply_call(ctx, r, site, addr),
            RelocKind::PcRel => self.apply_pcrel(ctx, r, site, addr),
            RelocKind::TlsLe => {
                ctx.put_u32(site.in_code, r.offset, ctx.tls_offset as u32);
                Ok(())
            }
            k if k.is_inert() => Ok(()),
            RelocKind::AdrpAdd => Err(RelocError::Unsupported {
                symbol: r.target.clone(),
                r_type: 0x110,
            }),
            RelocKind::Unknown(t) => Err(RelocError::Unsupported {
                symbol: r.target.clone(),
                r_type: t,
            }),
            _ => unreachable!(),
        }
    }
}

impl Amd64 {
    fn apply_call(
        &self,
        ctx: &mut RelocCtx<'_>,
        r: &Reloc,
        site: Site,
        addr: usize,
    ) -> Result<(), RelocError> {
        let pc_end = (ctx.base(site.in_code) + r.offset + r.size) as i64;
        let mut off = addr as i64 + r.addend - pc_end;
        if !fits32(off) {
            // Route the call through an indirect jump at the code tail.
            let tramp = ctx.push_code(&r.target, &JMP_INDIRECT)?;
            ctx.push_code(&r.target, &((addr as i64 + r.addend) as u64).to_le_bytes())?;
            off = (ctx.code_base + tramp) as i64 - pc_end;
            debug!(
                "call to {} out of range, trampoline at code+{:#x}",
                r.target, tramp
            );
        }
        ctx.put_u32(site.in_code, r.offset, off as u32);
        Ok(())
    }

    fn apply_pcrel(
        &self,
        ctx: &mut RelocCtx<'_>,
        r: &Reloc,
        site: Site,
        addr: usize,
    ) -> Result<(), RelocError> {
        let pc_end = (ctx.base(site.in_code) + r.offset + r.size) as i64;
        let mut off = addr as i64 + r.addend - pc_end;
        if !fits32(off) {
            if !site.in_code || r.offset < 2 {
                return Err(RelocError::Overflow {
                    symbol: r.target.clone(),
                    offset: off,
                });
            }
            let opcode = ctx.read_u8(true, r.offset - 2);
            if opcode != LEA_OPCODE {
                return Err(RelocError::UnsupportedOpcode {
                    symbol: r.target.clone(),
                    opcode,
                });
            }
            // lea reg, [rip+d] becomes mov reg, [rip+d'] where the load
            // reads an address cell appended at the code tail.
            let cell =
                ctx.push_code(&r.target, &((addr as i64 + r.addend) as u64).to_le_bytes())?;
            ctx.put_u8(true, r.offset - 2, MOV_LOAD_OPCODE);
            off = (ctx.code_base + cell) as i64 - pc_end;
            debug!(
                "pc-relative reference to {} out of range, address cell at code+{:#x}",
                r.target, cell
            );
        }
        ctx.put_u32(site.in_code, r.offset, off as u32);
        Ok(())
    }
}

#[cfg(test)]
mod tests;
