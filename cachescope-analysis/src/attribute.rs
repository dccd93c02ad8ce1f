//! Sample attribution: addresses back to source-level names
//!
//! Stack variables are matched through the frame: a sample with a
//! computed CFA and a known owning function is tested against that
//! function's variables at `[CFA + frame_offset, CFA + frame_offset +
//! size)`, first containing variable in declaration order wins. Globals
//! resolve by containment in the static range table; anything else falls
//! back to the replayed allocation live set.

use crate::trace::LiveSet;
use cachescope_binary::CfaResolver;
use cachescope_dwarf::DebugModel;
use cachescope_protocol::{AllocKind, Sample};
use std::fmt;

/// Where a sampled address was found to live.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribution {
    Stack {
        function: String,
        variable: String,
    },
    Global {
        name: String,
    },
    Heap {
        callsite_ip: u64,
        kind: AllocKind,
    },
}

impl fmt::Display for Attribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribution::Stack { function, variable } => {
                write!(f, "stack variable {function}::{variable}")
            }
            Attribution::Global { name } => write!(f, "global {name}"),
            Attribution::Heap { callsite_ip, kind } => {
                let what = match kind {
                    AllocKind::Heap => "heap allocation",
                    AllocKind::Mmap => "mapped region",
                };
                write!(f, "{what} from callsite 0x{callsite_ip:x}")
            }
        }
    }
}

/// Match an address against one function's stack variables.
///
/// Declaration order breaks ties: the first containing variable wins.
pub fn attribute_stack(
    model: &DebugModel,
    function: &str,
    cfa: u64,
    addr: u64,
) -> Option<Attribution> {
    for var in model.stack_variables_of(function) {
        let start = cfa.checked_add_signed(var.frame_offset)?;
        let end = start.checked_add(var.size)?;
        if addr >= start && addr < end {
            return Some(Attribution::Stack {
                function: function.to_string(),
                variable: var.name.clone(),
            });
        }
    }
    None
}

/// Match an address against the global interval table.
pub fn attribute_global(model: &DebugModel, addr: u64) -> Option<Attribution> {
    let idx = model.static_ranges.lookup(addr)?;
    Some(Attribution::Global {
        name: model.globals[idx].name.clone(),
    })
}

/// Full attribution pipeline for one sample.
pub struct Attributor<'a> {
    model: &'a DebugModel,
    resolver: Option<&'a CfaResolver>,
    biases: Vec<u64>,
    live: Option<&'a LiveSet>,
}

impl<'a> Attributor<'a> {
    pub fn new(
        model: &'a DebugModel,
        resolver: Option<&'a CfaResolver>,
        biases: Vec<u64>,
        live: Option<&'a LiveSet>,
    ) -> Self {
        Attributor {
            model,
            resolver,
            biases,
            live,
        }
    }

    pub fn attribute(&self, sample: &Sample) -> Option<Attribution> {
        if sample.addr == 0 {
            return None;
        }

        if !sample.symbol.is_empty() {
            if let Some(resolver) = self.resolver {
                if let Some(cfa) =
                    resolver.compute_cfa(sample.ip, sample.sp, sample.bp, &self.biases)
                {
                    if let Some(attr) =
                        attribute_stack(self.model, &sample.symbol, cfa, sample.addr)
                    {
                        return Some(attr);
                    }
                }
            }
        }

        if let Some(attr) = attribute_global(self.model, sample.addr) {
            return Some(attr);
        }

        if let Some(live) = self.live {
            if let Some(alloc) = live.lookup(sample.addr) {
                return Some(Attribution::Heap {
                    callsite_ip: alloc.callsite_ip,
                    kind: alloc.kind,
                });
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachescope_dwarf::{DebugModel, GlobalVariable, StackVariable};
    use cachescope_protocol::AllocEvent;

    fn model_with_variable() -> DebugModel {
        let mut model = DebugModel::default();
        model.stack_variables.push(StackVariable {
            function: "f".to_string(),
            name: "x".to_string(),
            size: 4,
            frame_offset: -32,
            type_id: None,
        });
        // A second variable overlapping x's range; declaration order
        // keeps x first.
        model.stack_variables.push(StackVariable {
            function: "f".to_string(),
            name: "shadow".to_string(),
            size: 8,
            frame_offset: -32,
            type_id: None,
        });
        model.globals.push(GlobalVariable {
            name: "counters".to_string(),
            address: 0x601000,
            size: 32,
            type_id: None,
        });
        model.rebuild_indexes();
        model
    }

    #[test]
    fn stack_variable_hit_inside_frame() {
        // CFA 0x7fffA010 (S5), x at CFA-32 sized 4: addr 0x7fff9ff0 hits.
        let model = model_with_variable();
        let attr = attribute_stack(&model, "f", 0x7fff_a010, 0x7fff_9ff0).unwrap();
        assert_eq!(
            attr,
            Attribution::Stack {
                function: "f".to_string(),
                variable: "x".to_string(),
            }
        );
    }

    #[test]
    fn stack_variable_miss_outside_frame() {
        let model = model_with_variable();
        assert!(attribute_stack(&model, "f", 0x7fff_a010, 0x7fff_9fd0).is_none());
        assert!(attribute_stack(&model, "g", 0x7fff_a010, 0x7fff_9ff0).is_none());
    }

    #[test]
    fn global_hit_via_interval_table() {
        let model = model_with_variable();
        let attr = attribute_global(&model, 0x601010).unwrap();
        assert_eq!(
            attr,
            Attribution::Global {
                name: "counters".to_string(),
            }
        );
        assert!(attribute_global(&model, 0x601020).is_none());
    }

    #[test]
    fn heap_fallback_uses_live_set() {
        let model = model_with_variable();
        let live = LiveSet::replay(&[AllocEvent {
            base: 0x7f00_0000,
            size: 4096,
            callsite_ip: 0x401234,
            ..Default::default()
        }]);
        let attributor = Attributor::new(&model, None, vec![0], Some(&live));
        let sample = Sample {
            addr: 0x7f00_0100,
            ..Default::default()
        };
        assert_eq!(
            attributor.attribute(&sample),
            Some(Attribution::Heap {
                callsite_ip: 0x401234,
                kind: AllocKind::Heap,
            })
        );
    }
}
