//! The stack unwinder (C5, spec §4.5).

use crate::context::{MachineContext, StackReader};
use crate::descriptor::{
    BaseReg, CodeRangeKind, DescriptorSource, PrologueEpiloguePosition, ProcedureDescriptor,
    ResolvedDescriptor,
};
use crate::error::UnwindError;
use crate::frame::{AsInfo, Frame};
use crate::lush::LushAgents;
use crate::safety::{is_unsafe_context, SafetyTables, UnsafeContextInputs};

/// Hard backstop against a corrupted stack producing an unbounded walk.
/// Not part of the spec's own termination conditions (fence function / SP
/// past stack end); this only protects against a `BadUnwind` we failed to
/// detect any other way.
const MAX_FRAMES: usize = 8192;

/// Flags the unwinder sets on the frame it just decoded, mirroring the
/// per-thread flag bits named in spec §4.4 (`EPILOGUE_RA_RELOADED`,
/// `EPILOGUE_SP_RESET`). Returned alongside the frame list so the sampler
/// can clear them per §4.7.3 without csprof-unwind needing to know about
/// the host's thread-state struct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnwindFlags {
    pub epilogue_ra_reloaded: bool,
    pub epilogue_sp_reset: bool,
}

/// The outcome of a successful unwind: the frames, innermost first, and
/// any flags raised along the way.
#[derive(Debug, Clone, Default)]
pub struct UnwindResult {
    pub frames: Vec<Frame>,
    pub flags: UnwindFlags,
}

/// Bundles everything the unwinder needs that doesn't change sample to
/// sample: the decoder adapter, the safety tables, stack memory access,
/// and any logical-unwinder plug-ins.
pub struct Unwinder<'a> {
    descriptors: &'a dyn DescriptorSource,
    tables: &'a SafetyTables,
    reader: &'a dyn StackReader,
    lush: &'a LushAgents,
    stack_end: u64,
}

impl<'a> Unwinder<'a> {
    pub fn new(
        descriptors: &'a dyn DescriptorSource,
        tables: &'a SafetyTables,
        reader: &'a dyn StackReader,
        lush: &'a LushAgents,
        stack_end: u64,
    ) -> Self {
        Self {
            descriptors,
            tables,
            reader,
            lush,
            stack_end,
        }
    }

    /// Produce the innermost-first frame sequence from `ctx`, stopping at
    /// a fence function or at the recorded stack end (spec §4.5.1).
    pub fn unwind(
        &self,
        ctx: MachineContext,
        inputs: UnsafeContextInputs,
    ) -> Result<UnwindResult, UnwindError> {
        if is_unsafe_context(ctx.ip, self.tables, inputs) {
            return Err(UnwindError::Unsafe { ip: ctx.ip });
        }

        let mut result = UnwindResult::default();
        let mut cur_ip = ctx.ip;
        let mut cur_sp = ctx.sp;
        let mut cur_fp = ctx.fp;
        let mut cur_ra_reg = ctx.ra_reg;
        let mut depth = 0usize;

        loop {
            if self.tables.is_fence(cur_ip) || cur_sp >= self.stack_end {
                break;
            }
            if depth >= MAX_FRAMES {
                return Err(UnwindError::BadUnwind {
                    depth,
                    ip: cur_ip,
                    reason: "exceeded maximum frame count",
                });
            }

            let resolved = self.descriptors.resolve(cur_ip).ok_or(UnwindError::BadUnwind {
                depth,
                ip: cur_ip,
                reason: "unresolved instruction pointer",
            })?;
            if resolved.crd == CodeRangeKind::Data {
                return Err(UnwindError::BadUnwind {
                    depth,
                    ip: cur_ip,
                    reason: "code range classified as data",
                });
            }

            let as_info = self.associate(cur_ip, cur_sp);
            let lip = self.lush.iter().next().and_then(|a| a.step(cur_ip, cur_sp));
            result.frames.push(Frame {
                ip: cur_ip,
                sp: cur_sp,
                as_info,
                lip,
            });

            let step = self.resolve_return_address(&resolved, cur_ip, cur_sp, cur_fp, cur_ra_reg, depth)?;
            if step.epilogue_ra_reloaded {
                result.flags.epilogue_ra_reloaded = true;
                result.flags.epilogue_sp_reset = true;
            }
            if step.ra == 0 {
                return Err(UnwindError::BadUnwind {
                    depth,
                    ip: cur_ip,
                    reason: "null return address",
                });
            }

            // §4.5.2 step 5: point ip at the call site, not the return site.
            cur_ip = step.ra.saturating_sub(1);
            cur_sp = step.sp_canon;
            cur_fp = step.next_fp;
            cur_ra_reg = step.ra;
            depth += 1;
        }

        Ok(result)
    }

    fn associate(&self, ip: u64, _sp: u64) -> AsInfo {
        match self.lush.iter().next() {
            Some(agent) => agent.associate(ip),
            None => AsInfo::PHYSICAL_ONLY,
        }
    }

    /// §4.5.2 step 3: compute where the return address lives and what
    /// the canonical SP for the *current* frame is, given the PD kind and
    /// where within the prologue/epilogue the IP falls.
    fn resolve_return_address(
        &self,
        resolved: &ResolvedDescriptor,
        ip: u64,
        sp: u64,
        fp: u64,
        ra_reg: u64,
        depth: usize,
    ) -> Result<ReturnStep, UnwindError> {
        match resolved.pd {
            ProcedureDescriptor::NullFrame => Ok(ReturnStep {
                ra: ra_reg,
                sp_canon: sp,
                next_fp: fp,
                epilogue_ra_reloaded: false,
            }),
            ProcedureDescriptor::RegisterFrame { .. } => {
                // RA lives in a register the whole time; the prologue only
                // decides *which* register currently holds it, which this
                // crate's caller has already resolved into `ra_reg`.
                Ok(ReturnStep {
                    ra: ra_reg,
                    sp_canon: sp,
                    next_fp: fp,
                    epilogue_ra_reloaded: false,
                })
            }
            ProcedureDescriptor::StackFrame {
                base_reg,
                rsa_offset,
                frame_size,
                ..
            } => match resolved.position {
                PrologueEpiloguePosition::PrologueBeforeSpAdjust => Ok(ReturnStep {
                    ra: ra_reg,
                    sp_canon: sp.wrapping_sub(frame_size),
                    next_fp: fp,
                    epilogue_ra_reloaded: false,
                }),
                PrologueEpiloguePosition::PrologueBeforeRaStore => Ok(ReturnStep {
                    ra: ra_reg,
                    sp_canon: sp,
                    next_fp: fp,
                    epilogue_ra_reloaded: false,
                }),
                PrologueEpiloguePosition::Body => {
                    let base = match base_reg {
                        BaseReg::Sp => sp,
                        BaseReg::Fp => fp,
                    };
                    let ra_slot = (base as i64).wrapping_add(rsa_offset) as u64;
                    let ra = self.reader.read_u64(ra_slot).ok_or(UnwindError::BadUnwind {
                        depth,
                        ip,
                        reason: "unreadable return-address slot",
                    })?;
                    // §4.5.2 step 5: an $fp-based frame chains through a
                    // saved caller-fp slot at the base of its own frame;
                    // the caller-supplied `fp` is only valid for the
                    // innermost frame, so every frame beyond it must read
                    // its own predecessor's fp out of memory instead of
                    // reusing the one passed in.
                    let next_fp = match base_reg {
                        BaseReg::Sp => fp,
                        BaseReg::Fp => self.reader.read_u64(base).ok_or(UnwindError::BadUnwind {
                            depth,
                            ip,
                            reason: "unreadable saved frame-pointer slot",
                        })?,
                    };
                    Ok(ReturnStep {
                        ra,
                        sp_canon: sp.wrapping_add(frame_size),
                        next_fp,
                        epilogue_ra_reloaded: false,
                    })
                }
                PrologueEpiloguePosition::EpilogueRaReloaded => Ok(ReturnStep {
                    ra: ra_reg,
                    sp_canon: sp.wrapping_add(frame_size),
                    next_fp: fp,
                    epilogue_ra_reloaded: true,
                }),
            },
        }
    }
}

struct ReturnStep {
    ra: u64,
    sp_canon: u64,
    next_fp: u64,
    epilogue_ra_reloaded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SliceStackReader;
    use crate::descriptor::{CodeRangeKind, PrologueEpiloguePosition, ResolvedDescriptor};
    use crate::safety::AddressRange;

    /// A `DescriptorSource` over a fixed table of `StackFrame` procedures,
    /// all sampled mid-body, for linear-stack unwind tests.
    struct FixedTable(Vec<(u64, u64, ResolvedDescriptor)>);

    impl DescriptorSource for FixedTable {
        fn resolve(&self, ip: u64) -> Option<ResolvedDescriptor> {
            self.0
                .iter()
                .find(|(start, end, _)| ip >= *start && ip < *end)
                .map(|(_, _, d)| *d)
        }
    }

    fn stack_frame_fn(rsa_offset: i64, frame_size: u64) -> ResolvedDescriptor {
        ResolvedDescriptor {
            pd: ProcedureDescriptor::StackFrame {
                base_reg: BaseReg::Sp,
                rsa_offset,
                frame_size,
                entry_reg: 0,
            },
            crd: CodeRangeKind::Standard,
            position: PrologueEpiloguePosition::Body,
        }
    }

    #[test]
    fn linear_stack_three_frames() {
        // bar@0x400700 (leaf) -> foo@0x400600 -> main@0x400500 -> fence@0x400000
        let table = FixedTable(vec![
            (0x400000, 0x400010, stack_frame_fn(0, 0)),
            (0x400500, 0x400510, stack_frame_fn(8, 32)),
            (0x400600, 0x400610, stack_frame_fn(8, 32)),
            (0x400700, 0x400710, stack_frame_fn(8, 32)),
        ]);
        let tables = SafetyTables {
            unsafe_libc_ranges: vec![],
            trampoline_range: None,
            fence_functions: vec![AddressRange {
                start: 0x400000,
                end: 0x400010,
            }],
            program_entry_point: 0x400000,
        };

        // Stack grows down; bar's frame starts at sp=0x1000.
        // bar's ra_slot = sp(0x1000)+8 = 0x1008 -> foo@0x400600
        // foo's canonical sp = 0x1000+32 = 0x1020; ra_slot=0x1028 -> main@0x400500
        // main's canonical sp = 0x1020+32=0x1040; ra_slot=0x1048 -> fence@0x400000
        let words = [
            0u64, 0x400601, // [0x1000..0x1008..0x1010)
            0, 0,
            0, 0, 0, 0, // padding up to 0x1020
            0, 0x400501, // 0x1020..0x1028
            0, 0, 0, 0, 0, 0, // padding to 0x1040
            0, 0x400001, // 0x1040..0x1048
        ];
        let reader = SliceStackReader::new(0x1000, &words);
        let lush = LushAgents::default();
        let unwinder = Unwinder::new(&table, &tables, &reader, &lush, u64::MAX);

        let ctx = MachineContext {
            ip: 0x400705,
            sp: 0x1000,
            fp: 0,
            ra_reg: 0,
        };
        let result = unwinder
            .unwind(ctx, UnsafeContextInputs::default())
            .expect("unwind should succeed");

        let ips: Vec<u64> = result.frames.iter().map(|f| f.ip).collect();
        assert_eq!(ips, vec![0x400705, 0x400600, 0x400500]);
    }

    fn fp_frame_fn(rsa_offset: i64, frame_size: u64) -> ResolvedDescriptor {
        ResolvedDescriptor {
            pd: ProcedureDescriptor::StackFrame {
                base_reg: BaseReg::Fp,
                rsa_offset,
                frame_size,
                entry_reg: 0,
            },
            crd: CodeRangeKind::Standard,
            position: PrologueEpiloguePosition::Body,
        }
    }

    #[test]
    fn fp_chain_advances_through_more_than_one_frame() {
        // bar@0x400700 (leaf, fp=0x2000) -> foo@0x400600 (fp=0x3000) -> fence@0x400000
        let table = FixedTable(vec![
            (0x400000, 0x400010, stack_frame_fn(0, 0)),
            (0x400600, 0x400610, fp_frame_fn(8, 32)),
            (0x400700, 0x400710, fp_frame_fn(8, 32)),
        ]);
        let tables = SafetyTables {
            unsafe_libc_ranges: vec![],
            trampoline_range: None,
            fence_functions: vec![AddressRange {
                start: 0x400000,
                end: 0x400010,
            }],
            program_entry_point: 0x400000,
        };

        // bar's frame: [fp=0x2000] = foo's fp (0x3000), [0x2008] = ra into foo.
        // foo's frame: [fp=0x3000] = 0 (no further caller), [0x3008] = ra into fence.
        let mut words = vec![0u64; 0x1010 / 8];
        words[0] = 0x3000; // [0x2000]: bar's saved/caller fp
        words[1] = 0x400601; // [0x2008]: bar's return address, into foo
        words[0x1000 / 8] = 0; // [0x3000]: foo's caller fp (none further)
        words[0x1000 / 8 + 1] = 0x400001; // [0x3008]: foo's return address, into fence
        let reader = SliceStackReader::new(0x2000, &words);

        let lush = LushAgents::default();
        let unwinder = Unwinder::new(&table, &tables, &reader, &lush, u64::MAX);

        let ctx = MachineContext {
            ip: 0x400705,
            sp: 0x1000,
            fp: 0x2000,
            ra_reg: 0,
        };
        let result = unwinder
            .unwind(ctx, UnsafeContextInputs::default())
            .expect("unwind should succeed");

        let ips: Vec<u64> = result.frames.iter().map(|f| f.ip).collect();
        assert_eq!(ips, vec![0x400705, 0x400600], "stopped at the fence, having advanced through foo's own fp-chained frame");
    }

    #[test]
    fn unsafe_context_is_rejected_immediately() {
        let table = FixedTable(vec![]);
        let tables = SafetyTables {
            unsafe_libc_ranges: vec![AddressRange {
                start: 0x7000,
                end: 0x7010,
            }],
            trampoline_range: None,
            fence_functions: vec![],
            program_entry_point: 0,
        };
        let words = [0u64; 8];
        let reader = SliceStackReader::new(0, &words);
        let lush = LushAgents::default();
        let unwinder = Unwinder::new(&table, &tables, &reader, &lush, u64::MAX);
        let ctx = MachineContext {
            ip: 0x7005,
            sp: 0,
            fp: 0,
            ra_reg: 0,
        };
        let err = unwinder
            .unwind(ctx, UnsafeContextInputs::default())
            .unwrap_err();
        assert_eq!(err, UnwindError::Unsafe { ip: 0x7005 });
    }

    #[test]
    fn unreadable_return_address_is_bad_unwind() {
        let table = FixedTable(vec![(0x500000, 0x500010, stack_frame_fn(8, 16))]);
        let tables = SafetyTables::default();
        let words = [0u64; 1]; // far too short, ra_slot will be unreadable
        let reader = SliceStackReader::new(0, &words);
        let lush = LushAgents::default();
        let unwinder = Unwinder::new(&table, &tables, &reader, &lush, u64::MAX);
        let ctx = MachineContext {
            ip: 0x500005,
            sp: 0,
            fp: 0,
            ra_reg: 0,
        };
        let err = unwinder
            .unwind(ctx, UnsafeContextInputs::default())
            .unwrap_err();
        assert!(matches!(err, UnwindError::BadUnwind { .. }));
    }
}
