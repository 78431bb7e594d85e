use std::collections::HashMap;

use molt_target::{Arch, Reloc, RelocCtx, RelocError, RelocKind, Site};

use crate::Amd64;

const CODE_BASE: usize = 0x1000;
const DATA_BASE: usize = 0x2000_0000;

fn reloc(offset: usize, kind: RelocKind, target: &str) -> Reloc {
    Reloc {
        offset,
        size: 4,
        kind,
        addend: 0,
        target: target.to_string(),
    }
}

fn in_code() -> Site {
    Site {
        in_code: true,
        target_in_code: true,
    }
}

#[test]
fn near_call_gets_rel32() {
    let mut code = vec![0u8; 64];
    code[0] = 0xe8; // call rel32
    let mut data = vec![0u8; 16];
    let mut applied = HashMap::new();
    let mut ctx = RelocCtx {
        code: &mut code,
        data: &mut data,
        code_base: CODE_BASE,
        data_base: DATA_BASE,
        code_off: 32,
        tls_offset: -8,
        applied: &mut applied,
    };

    let r = reloc(1, RelocKind::Call, "f");
    Amd64.apply(&mut ctx, &r, in_code(), CODE_BASE + 0x20).unwrap();

    let disp = i32::from_le_bytes(code[1..5].try_into().unwrap());
    assert_eq!(disp, 0x20 - 5);
}

#[test]
fn far_call_goes_through_trampoline() {
    let mut code = vec![0u8; 64];
    code[0] = 0xe8;
    let mut data = vec![0u8; 16];
    let mut applied = HashMap::new();
    let mut ctx = RelocCtx {
        code: &mut code,
        data: &mut data,
        code_base: CODE_BASE,
        data_base: DATA_BASE,
        code_off: 16,
        tls_offset: -8,
        applied: &mut applied,
    };

    let target = 0x1234_5678_9000usize;
    let r = reloc(1, RelocKind::Call, "far");
    Amd64.apply(&mut ctx, &r, in_code(), target).unwrap();

    assert_eq!(ctx.code_off, 16 + 6 + 8);
    // Site now branches to the trampoline at code+16.
    let disp = i32::from_le_bytes(code[1..5].try_into().unwrap());
    assert_eq!(CODE_BASE as i64 + 5 + disp as i64, CODE_BASE as i64 + 16);
    // Trampoline is jmp [rip+0] followed by the absolute target.
    assert_eq!(&code[16..22], &[0xff, 0x25, 0, 0, 0, 0]);
    assert_eq!(
        u64::from_le_bytes(code[22..30].try_into().unwrap()),
        target as u64
    );
}

#[test]
fn far_lea_becomes_mov_through_address_cell() {
    // lea rax, [rip+0]
    let mut code = vec![0u8; 64];
    code[..7].copy_from_slice(&[0x48, 0x8d, 0x05, 0, 0, 0, 0]);
    let mut data = vec![0u8; 16];
    let mut applied = HashMap::new();
    let mut ctx = RelocCtx {
        code: &mut code,
        data: &mut data,
        code_base: CODE_BASE,
        data_base: DATA_BASE,
        code_off: 8,
        tls_offset: -8,
        applied: &mut applied,
    };

    let target = 0x7f00_0000_0000usize;
    let r = reloc(3, RelocKind::PcRel, "blob");
    Amd64.apply(&mut ctx, &r, in_code(), target).unwrap();

    assert_eq!(code[1], 0x8b, "lea must be rewritten to mov");
    let disp = i32::from_le_bytes(code[3..7].try_into().unwrap());
    let cell = (CODE_BASE + 7).wrapping_add(disp as usize);
    assert_eq!(cell, CODE_BASE + 8);
    assert_eq!(
        u64::from_le_bytes(code[8..16].try_into().unwrap()),
        target as u64
    );
}

#[test]
fn far_pcrel_through_non_lea_is_rejected() {
    // mov eax, [rip+0]: an out-of-range data load we refuse to rewrite.
    let mut code = vec![0u8; 32];
    code[..6].copy_from_slice(&[0x8b, 0x05, 0, 0, 0, 0]);
    let mut data = vec![0u8; 16];
    let mut applied = HashMap::new();
    let mut ctx = RelocCtx {
        code: &mut code,
        data: &mut data,
        code_base: CODE_BASE,
        data_base: DATA_BASE,
        code_off: 8,
        tls_offset: -8,
        applied: &mut applied,
    };

    let r = reloc(2, RelocKind::PcRel, "blob");
    let err = Amd64
        .apply(&mut ctx, &r, in_code(), 0x7f00_0000_0000)
        .unwrap_err();
    assert!(matches!(err, RelocError::UnsupportedOpcode { .. }));
}

#[test]
fn addroff_writes_region_relative_offset() {
    let mut code = vec![0u8; 16];
    let mut data = vec![0u8; 64];
    let mut applied = HashMap::new();
    let mut ctx = RelocCtx {
        code: &mut code,
        data: &mut data,
        code_base: CODE_BASE,
        data_base: DATA_BASE,
        code_off: 0,
        tls_offset: -8,
        applied: &mut applied,
    };

    let r = reloc(8, RelocKind::AddrOff, "type.demo.T");
    let site = Site {
        in_code: false,
        target_in_code: false,
    };
    Amd64.apply(&mut ctx, &r, site, DATA_BASE + 0x30).unwrap();
    assert_eq!(u32::from_le_bytes(data[8..12].try_into().unwrap()), 0x30);
}

#[test]
fn addroff_overflow_is_an_error() {
    let mut code = vec![0u8; 16];
    let mut data = vec![0u8; 64];
    let mut applied = HashMap::new();
    let mut ctx = RelocCtx {
        code: &mut code,
        data: &mut data,
        code_base: CODE_BASE,
        data_base: DATA_BASE,
        code_off: 0,
        tls_offset: -8,
        applied: &mut applied,
    };

    let r = reloc(8, RelocKind::AddrOff, "type.demo.T");
    let site = Site {
        in_code: false,
        target_in_code: false,
    };
    let err = Amd64
        .apply(&mut ctx, &r, site, DATA_BASE + (1 << 33))
        .unwrap_err();
    assert!(matches!(err, RelocError::Overflow { .. }));
}

#[test]
fn tls_writes_fixed_offset() {
    let mut code = vec![0u8; 16];
    let mut data = vec![0u8; 16];
    let mut applied = HashMap::new();
    let mut ctx = RelocCtx {
        code: &mut code,
        data: &mut data,
        code_base: CODE_BASE,
        data_base: DATA_BASE,
        code_off: 0,
        tls_offset: -8,
        applied: &mut applied,
    };

    let r = reloc(4, RelocKind::TlsLe, "rt.tls_g");
    Amd64.apply(&mut ctx, &r, in_code(), 0).unwrap();
    assert_eq!(
        i32::from_le_bytes(code[4..8].try_into().unwrap()),
        -8i32
    );
}

#[test]
fn unknown_kind_is_fatal() {
    let mut code = vec![0u8; 16];
    let mut data = vec![0u8; 16];
    let mut applied = HashMap::new();
    let mut ctx = RelocCtx {
        code: &mut code,
        data: &mut data,
        code_base: CODE_BASE,
        data_base: DATA_BASE,
        code_off: 0,
        tls_offset: -8,
        applied: &mut applied,
    };

    let r = reloc(0, RelocKind::Unknown(0xdead), "sym");
    let err = Amd64.apply(&mut ctx, &r, in_code(), 0x1000).unwrap_err();
    assert!(matches!(err, RelocError::Unsupported { r_type: 0xdead, .. }));
}
