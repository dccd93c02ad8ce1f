//! Canonical frame address resolution
//!
//! Builds a frame-description lookup over the target's unwind sections,
//! preferring `.eh_frame` and falling back to `.debug_frame`, and
//! computes CFA values from sampled register files. Only offset-based
//! CFA rules are supported; expression rules and registers other than
//! rbp/rsp report "cannot compute".

use anyhow::{anyhow, Context};
use gimli::{
    BaseAddresses, CfaRule, CieOrFde, DebugFrame, EhFrame, LittleEndian, UnwindContext,
    UnwindSection,
};
use object::{Object, ObjectSection};
use std::sync::Arc;
use tracing::{debug, info};

use gimli::{EndianSlice, LittleEndian as LE};

/// DWARF register numbers for x86-64.
const REG_RBP: u16 = 6;
const REG_RSP: u16 = 7;

/// An offset-based CFA rule: `CFA = register + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRule {
    pub register: u16,
    pub offset: i64,
}

/// Apply an offset rule to sampled register values.
///
/// Pure: fixed inputs always produce the same output. Registers other
/// than rbp/rsp and results that underflow report `None`.
pub fn apply_rule(rule: FrameRule, sp: u64, bp: u64) -> Option<u64> {
    let base = match rule.register {
        REG_RBP => bp,
        REG_RSP => sp,
        _ => return None,
    };
    if base == 0 {
        return None;
    }
    base.checked_add_signed(rule.offset)
}

enum FrameSection {
    Eh(EhFrame<EndianSlice<'static, LE>>),
    Debug(DebugFrame<EndianSlice<'static, LE>>),
}

/// Frame-description lookup state for one binary.
pub struct CfaResolver {
    /// Keep leaked section data reachable.
    _section_data: Arc<[u8]>,
    section: FrameSection,
    bases: BaseAddresses,
    /// Lowest FDE start address, used for load-bias inference.
    min_fde_start: Option<u64>,
}

impl std::fmt::Debug for CfaResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CfaResolver")
            .field(
                "section",
                &match self.section {
                    FrameSection::Eh(_) => ".eh_frame",
                    FrameSection::Debug(_) => ".debug_frame",
                },
            )
            .field("min_fde_start", &self.min_fde_start)
            .finish()
    }
}

impl CfaResolver {
    /// Build the resolver from raw file data.
    ///
    /// gimli's section types want `'static` data, so the chosen section
    /// is copied once and leaked, the same trade the rest of the loading
    /// path makes for file-scoped caches.
    pub fn from_arc_data(file_data: Arc<[u8]>) -> anyhow::Result<Self> {
        let object = object::File::parse(&file_data[..]).context("failed to parse object file")?;

        let mut bases = BaseAddresses::default();
        if let Some(text) = object.section_by_name(".text") {
            bases = bases.set_text(text.address());
        }

        if let Some(section) = object.section_by_name(".eh_frame") {
            let addr = section.address();
            let data = section
                .data()
                .context(".eh_frame section data unavailable")?
                .to_vec();
            let leaked: &'static [u8] = Box::leak(data.into_boxed_slice());
            let arc: Arc<[u8]> = Arc::from(leaked);
            bases = bases.set_eh_frame(addr);
            let eh_frame = EhFrame::new(leaked, LittleEndian);
            let min = min_fde_start(&FrameSection::Eh(eh_frame.clone()), &bases);
            info!("using .eh_frame for CFA resolution");
            return Ok(CfaResolver {
                _section_data: arc,
                section: FrameSection::Eh(eh_frame),
                bases,
                min_fde_start: min,
            });
        }

        if let Some(section) = object.section_by_name(".debug_frame") {
            let data = section
                .data()
                .context(".debug_frame section data unavailable")?
                .to_vec();
            let leaked: &'static [u8] = Box::leak(data.into_boxed_slice());
            let arc: Arc<[u8]> = Arc::from(leaked);
            let debug_frame = DebugFrame::new(leaked, LittleEndian);
            let min = min_fde_start(&FrameSection::Debug(debug_frame.clone()), &bases);
            info!("no .eh_frame, falling back to .debug_frame");
            return Ok(CfaResolver {
                _section_data: arc,
                section: FrameSection::Debug(debug_frame),
                bases,
                min_fde_start: min,
            });
        }

        Err(anyhow!("binary carries neither .eh_frame nor .debug_frame"))
    }

    /// Lowest FDE start address in the table.
    pub fn min_fde_start(&self) -> Option<u64> {
        self.min_fde_start
    }

    /// Candidate load biases, in the order they should be tried: zero,
    /// the bias reported by the recorder's memory-map events (if any),
    /// and the bias inferred by aligning the lowest FDE with the lowest
    /// in-binary sample IP (if any).
    pub fn bias_candidates(&self, map_bias: Option<u64>, min_sample_ip: Option<u64>) -> Vec<u64> {
        let mut biases = vec![0u64];
        if let Some(b) = map_bias {
            if b != 0 && !biases.contains(&b) {
                biases.push(b);
            }
        }
        if let (Some(min_ip), Some(min_fde)) = (min_sample_ip, self.min_fde_start) {
            if let Some(b) = min_ip.checked_sub(min_fde) {
                if b != 0 && !biases.contains(&b) {
                    biases.push(b);
                }
            }
        }
        biases
    }

    /// Fetch the offset-based CFA rule covering `ip`, already mapped to
    /// the binary's address space.
    pub fn rule_for(&self, ip: u64) -> Option<FrameRule> {
        let mut ctx = UnwindContext::new();
        let cfa = match &self.section {
            FrameSection::Eh(eh) => eh
                .unwind_info_for_address(&self.bases, &mut ctx, ip, |section, bases, offset| {
                    section.cie_from_offset(bases, offset)
                })
                .map(|row| row.cfa().clone()),
            FrameSection::Debug(df) => df
                .unwind_info_for_address(&self.bases, &mut ctx, ip, |section, bases, offset| {
                    section.cie_from_offset(bases, offset)
                })
                .map(|row| row.cfa().clone()),
        };
        match cfa {
            Ok(CfaRule::RegisterAndOffset { register, offset }) => Some(FrameRule {
                register: register.0,
                offset,
            }),
            Ok(CfaRule::Expression(_)) => {
                debug!("expression-based CFA rule at 0x{:x}: cannot compute", ip);
                None
            }
            Err(e) => {
                debug!("no unwind info for 0x{:x}: {}", ip, e);
                None
            }
        }
    }

    /// Compute the CFA for a runtime IP and sampled registers, trying
    /// each bias candidate in order and accepting the first that yields
    /// a value.
    pub fn compute_cfa(&self, runtime_ip: u64, sp: u64, bp: u64, biases: &[u64]) -> Option<u64> {
        for &bias in biases {
            let mapped = match runtime_ip.checked_sub(bias) {
                Some(ip) => ip,
                None => continue,
            };
            if let Some(rule) = self.rule_for(mapped) {
                if let Some(cfa) = apply_rule(rule, sp, bp) {
                    return Some(cfa);
                }
            }
        }
        None
    }
}

fn min_fde_start(section: &FrameSection, bases: &BaseAddresses) -> Option<u64> {
    let mut min: Option<u64> = None;
    let mut update = |addr: u64| {
        min = Some(min.map_or(addr, |m: u64| m.min(addr)));
    };
    match section {
        FrameSection::Eh(eh) => {
            let mut entries = eh.entries(bases);
            while let Ok(Some(entry)) = entries.next() {
                if let CieOrFde::Fde(partial) = entry {
                    if let Ok(fde) =
                        partial.parse(|_, bases, offset| eh.cie_from_offset(bases, offset))
                    {
                        update(fde.initial_address());
                    }
                }
            }
        }
        FrameSection::Debug(df) => {
            let mut entries = df.entries(bases);
            while let Ok(Some(entry)) = entries.next() {
                if let CieOrFde::Fde(partial) = entry {
                    if let Ok(fde) =
                        partial.parse(|_, bases, offset| df.cie_from_offset(bases, offset))
                    {
                        update(fde.initial_address());
                    }
                }
            }
        }
    }
    min
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_register_seven_uses_stack_pointer() {
        // FDE rule (reg=7, offset=16) with sp=0x7fffA000 yields 0x7fffA010.
        let rule = FrameRule {
            register: REG_RSP,
            offset: 16,
        };
        assert_eq!(apply_rule(rule, 0x7fff_a000, 0), Some(0x7fff_a010));
    }

    #[test]
    fn rule_register_six_uses_frame_pointer() {
        let rule = FrameRule {
            register: REG_RBP,
            offset: 16,
        };
        assert_eq!(apply_rule(rule, 0, 0x7fff_b000), Some(0x7fff_b010));
    }

    #[test]
    fn unsupported_register_cannot_compute() {
        let rule = FrameRule {
            register: 12,
            offset: 8,
        };
        assert_eq!(apply_rule(rule, 0x1000, 0x2000), None);
    }

    #[test]
    fn negative_cfa_cannot_compute() {
        let rule = FrameRule {
            register: REG_RSP,
            offset: -32,
        };
        assert_eq!(apply_rule(rule, 16, 0), None);
    }

    #[test]
    fn apply_rule_is_deterministic() {
        let rule = FrameRule {
            register: REG_RSP,
            offset: 16,
        };
        let first = apply_rule(rule, 0x7fff_a000, 0x7fff_b000);
        for _ in 0..8 {
            assert_eq!(apply_rule(rule, 0x7fff_a000, 0x7fff_b000), first);
        }
    }
}
