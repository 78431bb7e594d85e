//! Relocation kinds and decode tables.

use thiserror::Error;

/// Target machine of a link unit, taken from the first object's ELF header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Machine {
    Amd64,
    Arm64,
}

/// Kind of relocation, decoded from the container's `r_type`.
///
/// Standard ELF values cover the cases the system linker also knows about;
/// the Molt toolchain additionally emits private values for the runtime's
/// own offset-style and liveness relocations (see [`decode`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// Absolute pointer-sized address write.
    Addr,
    /// Like [`RelocKind::Addr`] but the target may legitimately be absent.
    WeakAddr,
    /// 32-bit offset of the target from its region base.
    AddrOff,
    /// Weak variant of [`RelocKind::AddrOff`].
    WeakAddrOff,
    /// 32-bit offset of a method implementation from the text base.
    MethodOff,
    /// PC-relative call or jump with a signed 32-bit (x86-64) or 26-bit
    /// (aarch64) displacement.
    Call,
    /// PC-relative data reference with a signed 32-bit displacement.
    PcRel,
    /// Thread-local slot reference; resolves to a fixed offset, not an
    /// address.
    TlsLe,
    /// aarch64 ADRP+ADD pair covering 8 bytes.
    AdrpAdd,
    /// Indirect call marker; carries no byte patch.
    CallInd,
    /// Liveness marker: type descriptor used.
    UseType,
    /// Liveness marker: interface used.
    UseIface,
    /// Liveness marker: interface method used.
    UseIfaceMethod,
    /// Compilation-unit offset marker.
    AddrCuOff,
    /// Keep-alive marker.
    Keep,
    /// Unrecognized `r_type`; fatal if it ever reaches an engine.
    Unknown(u32),
}

impl RelocKind {
    /// Kinds that exist only for the linker's reachability walk and never
    /// patch bytes.
    pub fn is_inert(self) -> bool {
        matches!(
            self,
            RelocKind::CallInd
                | RelocKind::UseType
                | RelocKind::UseIface
                | RelocKind::UseIfaceMethod
                | RelocKind::AddrCuOff
                | RelocKind::Keep
        )
    }
}

// Private r_type range shared by both targets.
const R_MOLT_ADDROFF: u32 = 0x100;
const R_MOLT_METHODOFF: u32 = 0x101;
const R_MOLT_USETYPE: u32 = 0x102;
const R_MOLT_USEIFACE: u32 = 0x103;
const R_MOLT_USEIFACEMETHOD: u32 = 0x104;
const R_MOLT_ADDRCUOFF: u32 = 0x105;
const R_MOLT_KEEP: u32 = 0x106;
const R_MOLT_WEAKADDR: u32 = 0x107;
const R_MOLT_WEAKADDROFF: u32 = 0x108;
const R_MOLT_CALLIND: u32 = 0x109;
const R_MOLT_ADRP_ADD: u32 = 0x110;
const R_MOLT_TLS_LE_A64: u32 = 0x111;

// The handful of standard ELF values the toolchain emits.
const R_X86_64_64: u32 = 1;
const R_X86_64_PC32: u32 = 2;
const R_X86_64_PLT32: u32 = 4;
const R_X86_64_TPOFF32: u32 = 23;
const R_AARCH64_CALL26: u32 = 283;

/// Decode an ELF `r_type` into a kind and the patched field width.
pub fn decode(machine: Machine, r_type: u32) -> (RelocKind, usize) {
    match r_type {
        R_MOLT_ADDROFF => return (RelocKind::AddrOff, 4),
        R_MOLT_METHODOFF => return (RelocKind::MethodOff, 4),
        R_MOLT_USETYPE => return (RelocKind::UseType, 0),
        R_MOLT_USEIFACE => return (RelocKind::UseIface, 0),
        R_MOLT_USEIFACEMETHOD => return (RelocKind::UseIfaceMethod, 0),
        R_MOLT_ADDRCUOFF => return (RelocKind::AddrCuOff, 0),
        R_MOLT_KEEP => return (RelocKind::Keep, 0),
        R_MOLT_WEAKADDR => return (RelocKind::WeakAddr, 8),
        R_MOLT_WEAKADDROFF => return (RelocKind::WeakAddrOff, 4),
        R_MOLT_CALLIND => return (RelocKind::CallInd, 0),
        _ => {}
    }
    match machine {
        Machine::Amd64 => match r_type {
            R_X86_64_64 => (RelocKind::Addr, 8),
            R_X86_64_PC32 => (RelocKind::PcRel, 4),
            R_X86_64_PLT32 => (RelocKind::Call, 4),
            R_X86_64_TPOFF32 => (RelocKind::TlsLe, 4),
            other => (RelocKind::Unknown(other), 0),
        },
        Machine::Arm64 => match r_type {
            R_AARCH64_CALL26 => (RelocKind::Call, 4),
            R_MOLT_ADRP_ADD => (RelocKind::AdrpAdd, 8),
            R_MOLT_TLS_LE_A64 => (RelocKind::TlsLe, 4),
            other => (RelocKind::Unknown(other), 0),
        },
    }
}

/// A relocation request against a named target symbol.
///
/// `offset` is relative to the owning symbol's bytes in the reader's output
/// and rebased to the owning segment during linking. The addend follows the
/// runtime convention: for PC-relative kinds it is relative to the end of
/// the patched field.
#[derive(Debug, Clone)]
pub struct Reloc {
    pub offset: usize,
    pub size: usize,
    pub kind: RelocKind,
    pub addend: i64,
    pub target: String,
}

/// Errors produced while applying relocations.
#[derive(Debug, Error)]
pub enum RelocError {
    #[error("relocation target for `{symbol}` overflows the 32-bit range: computed offset {offset}")]
    Overflow { symbol: String, offset: i64 },

    #[error("unsupported relocation (r_type {r_type:#x}) against `{symbol}`; toolchain/runtime version mismatch")]
    Unsupported { symbol: String, r_type: u32 },

    #[error("cannot redirect out-of-range reference to `{symbol}`: unsupported opcode {opcode:#04x}")]
    UnsupportedOpcode { symbol: String, opcode: u8 },

    #[error("code segment exhausted while synthesizing a trampoline for `{symbol}`")]
    NoTrampolineSpace { symbol: String },
}
