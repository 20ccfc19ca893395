//! End-to-end planning tests over small synthetic function prologues.

use springboard::{
    build_trampoline, decode_one, BuildError, InstructionKind, Profile, RelocateError,
    RelocationFragment,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn halfwords(hws: &[u16]) -> Vec<u8> {
    hws.iter().flat_map(|hw| hw.to_le_bytes()).collect()
}

#[test]
fn exact_window_of_position_independent_code() {
    init_logs();
    let profile = Profile::x64();
    // push rbp; mov rbp, rsp; push rbx: exactly five bytes
    let code = [0x55, 0x48, 0x89, 0xE5, 0x53];
    let plan = build_trampoline(0x1000, &code, 5, &profile, 0x2000).unwrap();

    assert_eq!(plan.relocated_length(), 5);
    assert_eq!(plan.continuation_address(), 0x1005);
    assert_eq!(plan.fragments().len(), 4);
    assert!(matches!(plan.fragments()[0], RelocationFragment::Copy(_)));
    assert!(matches!(plan.fragments()[1], RelocationFragment::Copy(_)));
    assert!(matches!(plan.fragments()[2], RelocationFragment::Copy(_)));
    assert!(matches!(
        plan.fragments()[3],
        RelocationFragment::Synthesized(_)
    ));
    // Position-independent code is copied byte for byte.
    let image = plan.emit();
    assert_eq!(&image.as_bytes()[..5], &code);
}

#[test]
fn relocated_call_keeps_the_original_return_address() {
    init_logs();
    let profile = Profile::x64();
    // call .+0x10 (to 0x1010), then padding
    let code = [0xE8, 0x0B, 0x00, 0x00, 0x00, 0x90, 0x90, 0x90];
    let trampoline = 0x7000_0000_0000u64;
    let plan = build_trampoline(0x1000, &code, 5, &profile, trampoline).unwrap();

    let call = plan.fragments()[0].bytes();
    // push imm32 / mov dword [rsp+4], imm32 materializes the return address
    // of the instruction after the *original* call.
    assert_eq!(call[0], 0x68);
    assert_eq!(u32::from_le_bytes(call[1..5].try_into().unwrap()), 0x1005);
    assert_eq!(&call[5..9], &[0xC7, 0x44, 0x24, 0x04]);
    assert_eq!(u32::from_le_bytes(call[9..13].try_into().unwrap()), 0);
    // The callee is reached through an absolute jump; the target literal is
    // the original callee address, unchanged by the move.
    assert_eq!(&call[13..19], &[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(
        u64::from_le_bytes(call[19..27].try_into().unwrap()),
        0x1010
    );
}

#[test]
fn short_function_cannot_be_patched() {
    init_logs();
    let profile = Profile::x64();
    let code = [0x31, 0xC0]; // xor eax, eax and nothing else
    let err = build_trampoline(0x1000, &code, 5, &profile, 0x2000).unwrap_err();
    assert!(matches!(err, BuildError::InsufficientSpace { .. }));
}

#[test]
fn out_of_range_pc_relative_load_overflows() {
    init_logs();
    let profile = Profile::x64();
    // lea rax, [rip+0]
    let code = [0x48, 0x8D, 0x05, 0x00, 0x00, 0x00, 0x00];
    let err = build_trampoline(0x1000, &code, 5, &profile, 0x7000_0000_0000).unwrap_err();
    assert!(matches!(
        err,
        BuildError::Relocate(RelocateError::DisplacementOverflow { address: 0x1000, .. })
    ));
}

#[test]
fn unmatched_encoding_is_unsupported() {
    init_logs();
    let profile = Profile::x64();
    // 0x06 has no 64-bit encoding
    let code = [0x06, 0x90, 0x90, 0x90, 0x90];
    let err = build_trampoline(0x1000, &code, 5, &profile, 0x2000).unwrap_err();
    assert!(matches!(
        err,
        BuildError::UnsupportedInstruction { address: 0x1000 }
    ));
}

#[test]
fn relocated_branch_resolves_to_the_original_target() {
    init_logs();
    let profile = Profile::x64();
    // jmp .+0x15 then padding
    let code = [0xE9, 0x10, 0x00, 0x00, 0x00, 0x90, 0x90];
    let trampoline = 0x9000u64;
    let plan = build_trampoline(0x1000, &code, 5, &profile, trampoline).unwrap();

    let fragment = plan.fragments()[0].bytes();
    let redecoded = decode_one(fragment, 0, trampoline, &profile).unwrap();
    assert_eq!(redecoded.kind, InstructionKind::RelativeBranch);
    assert_eq!(redecoded.operands.target, 0x1015);
}

#[test]
fn consumed_length_is_a_sum_of_instruction_lengths() {
    init_logs();
    let cases: [(Profile, Vec<u8>, usize); 3] = [
        (
            Profile::x64(),
            vec![0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20, 0x53, 0xC3],
            5,
        ),
        (
            Profile::a32(),
            // push {fp, lr}; mov fp, sp; sub sp, sp, #16
            words(&[0xE92D_4800, 0xE1A0_B00D, 0xE24D_D010]),
            8,
        ),
        (
            Profile::thumb(),
            // push {r4, lr}; sub sp, #8; mov r4, r0; movs r1, #0;
            // ldr r2, [r0]; add r1, r2; bx lr
            halfwords(&[0xB510, 0xB082, 0x4604, 0x2100, 0x6802, 0x4411, 0x4770]),
            10,
        ),
    ];

    for (profile, code, min) in cases {
        let plan = build_trampoline(0x1_0000, &code, min, &profile, 0x40_0000).unwrap();
        assert!(plan.relocated_length() >= min);

        let mut offset = 0;
        while offset < plan.relocated_length() {
            let descriptor = decode_one(&code, offset, 0x1_0000, &profile).unwrap();
            offset += descriptor.length;
        }
        // The plan never stops inside an instruction.
        assert_eq!(offset, plan.relocated_length());
        assert_eq!(
            plan.continuation_address(),
            0x1_0000 + plan.relocated_length() as u64
        );
    }
}

#[test]
fn a32_prologue_with_literal_load() {
    init_logs();
    let profile = Profile::a32();
    // push {fp, lr}; ldr r0, [pc, #4]; mov fp, sp
    let code = words(&[0xE92D_4800, 0xE59F_0004, 0xE1A0_B00D]);
    let trampoline = 0x1_1000u64;
    let plan = build_trampoline(0x1_0000, &code, 8, &profile, trampoline).unwrap();
    assert_eq!(plan.relocated_length(), 8);

    // The literal load is re-encoded against the trampoline PC and still
    // addresses the original pool slot at 0x10010.
    let ldr = plan.fragments()[1].bytes();
    let word = u32::from_le_bytes(ldr.try_into().unwrap());
    assert_eq!(word & 0x0F7F_0000, 0x051F_0000);
    let redecoded = decode_one(ldr, 0, trampoline + 4, &profile).unwrap();
    assert_eq!(redecoded.operands.target, 0x1_0010);
}

#[test]
fn thumb_prologue_with_call() {
    init_logs();
    let profile = Profile::thumb();
    // push {r4, lr}; sub sp, #8; bl .+0x10; movs r0, #0; bx lr
    let code = halfwords(&[0xB510, 0xB082, 0xF000, 0xF808, 0x2000, 0x4770]);
    let trampoline = 0x2_0000u64;
    let plan = build_trampoline(0x9000, &code, 10, &profile, trampoline).unwrap();
    assert_eq!(plan.relocated_length(), 10);
    assert_eq!(plan.continuation_address(), 0x900A);

    // bl sits at trampoline offset 4, which is 4-aligned: no pad nop, and
    // the link-register literal is the Thumb-bit-tagged original return.
    let call = plan.fragments()[2].bytes();
    assert_eq!(call.len(), 16);
    assert_eq!(
        u32::from_le_bytes(call[8..12].try_into().unwrap()),
        0x9008 | 1
    );
    assert_eq!(
        u32::from_le_bytes(call[12..16].try_into().unwrap()),
        0x9018 | 1
    );
}

#[test]
fn failed_plans_commit_nothing() {
    init_logs();
    let profile = Profile::x64();
    let code = [0x31, 0xC0, 0xC3];
    assert!(build_trampoline(0x1000, &code, 5, &profile, 0x2000).is_err());
    // The same snapshot planned with a window it can satisfy succeeds; a
    // failed attempt leaves no state behind to interfere.
    let plan = build_trampoline(0x1000, &code, 3, &profile, 0x2000).unwrap();
    assert_eq!(plan.relocated_length(), 3);
}
