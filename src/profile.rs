use bitflags::bitflags;

bitflags! {
    /// Instruction-decoding capability groups.
    ///
    /// Decode-table rows carry a required capability set; a row is only
    /// eligible to match when the active profile enables every flag the row
    /// requires. This mirrors how instruction-set extensions are gated per
    /// core/mode: the flags do not change relocation semantics once a row
    /// has matched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapabilitySet: u32 {
        /// ARMv4T: BX interworking.
        const V4T = 1 << 0;
        /// ARMv5T: BLX.
        const V5T = 1 << 1;
        /// ARMv5TE: PLD and friends.
        const V5TE = 1 << 2;
        /// ARMv6T2: Thumb-2, IT blocks, CBZ/CBNZ, MOVW/MOVT, wide branches.
        const V6T2 = 1 << 3;
        /// ARMv7.
        const V7 = 1 << 4;

        /// x86 SSE.
        const SSE = 1 << 8;
        /// x86 SSE2.
        const SSE2 = 1 << 9;
    }
}

/// Instruction-set variant the decoder and relocator operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    /// x86-64: variable-length encoding with legacy/REX prefixes.
    X64,
    /// Classic 32-bit ARM: fixed-width 4-byte instructions.
    A32,
    /// Thumb/Thumb-2: mixed 16/32-bit instructions.
    Thumb,
}

/// Read-only description of the target CPU/mode.
///
/// Supplied by platform detection, consumed by the decoder. Pure data; all
/// decode and relocation functions take it by reference and never mutate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    arch: Arch,
    capabilities: CapabilitySet,
}

impl Profile {
    /// x86-64 profile with the baseline vector extensions enabled.
    pub fn x64() -> Self {
        Self {
            arch: Arch::X64,
            capabilities: CapabilitySet::SSE | CapabilitySet::SSE2,
        }
    }

    /// A32 profile for an ARMv7-class core.
    pub fn a32() -> Self {
        Self {
            arch: Arch::A32,
            capabilities: CapabilitySet::V4T
                | CapabilitySet::V5T
                | CapabilitySet::V5TE
                | CapabilitySet::V6T2
                | CapabilitySet::V7,
        }
    }

    /// Thumb profile for an ARMv7-class core (Thumb-2 enabled).
    pub fn thumb() -> Self {
        Self {
            arch: Arch::Thumb,
            capabilities: CapabilitySet::V4T
                | CapabilitySet::V5T
                | CapabilitySet::V5TE
                | CapabilitySet::V6T2
                | CapabilitySet::V7,
        }
    }

    /// Replace the enabled capability set.
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    /// Whether every capability in `required` is enabled.
    pub fn is_enabled(&self, required: CapabilitySet) -> bool {
        self.capabilities.contains(required)
    }

    /// Smallest number of original bytes the redirecting jump needs for this
    /// architecture/mode.
    ///
    /// The caller uses this to decide how many bytes the in-place patch will
    /// overwrite, and whether that write can be made atomically visible to
    /// other cores.
    pub fn min_patch_size(&self) -> usize {
        match self.arch {
            // jmp rel32
            Arch::X64 => 5,
            // ldr pc, [pc, #-4] + literal
            Arch::A32 => 8,
            // ldr.w pc, [pc, #0] + worst-case alignment pad + literal
            Arch::Thumb => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_membership() {
        let profile = Profile::a32();
        assert!(profile.is_enabled(CapabilitySet::V5T));
        assert!(profile.is_enabled(CapabilitySet::V4T | CapabilitySet::V6T2));

        let old_core = Profile::a32().with_capabilities(CapabilitySet::V4T);
        assert!(old_core.is_enabled(CapabilitySet::V4T));
        assert!(!old_core.is_enabled(CapabilitySet::V5T));
        assert!(!old_core.is_enabled(CapabilitySet::V4T | CapabilitySet::V5T));
    }

    #[test]
    fn min_patch_sizes() {
        assert_eq!(Profile::x64().min_patch_size(), 5);
        assert_eq!(Profile::a32().min_patch_size(), 8);
        assert_eq!(Profile::thumb().min_patch_size(), 10);
    }
}
