//! Optimization pass lists.
//!
//! The O2/O3 lists mirror `opt`'s pipelines without the vectorizers; O3
//! also drops `-loop-rotate`, since rotated loops defeat the
//! control-dependence algorithm the slicer uses. The klee list follows
//! `klee -optimize` with a lowered inline threshold so counterexample
//! traces stay readable.

use sliceprove_property::Property;

/// A named pass bundle selectable by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptPreset {
    Conservative,
    Klee,
    O2,
    O3,
}

impl OptPreset {
    /// Parse a preset name as used on the command line.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "conservative" => Some(OptPreset::Conservative),
            "klee" => Some(OptPreset::Klee),
            "O2" => Some(OptPreset::O2),
            "O3" => Some(OptPreset::O3),
            _ => None,
        }
    }

    pub fn passes(&self) -> &'static [&'static str] {
        match self {
            OptPreset::Conservative => CONSERVATIVE,
            OptPreset::Klee => KLEE,
            OptPreset::O2 => O2,
            OptPreset::O3 => O3,
        }
    }
}

const CONSERVATIVE: &[&str] = &[
    "-simplifycfg",
    "-constmerge",
    "-dce",
    "-ipconstprop",
    "-argpromotion",
    "-instcombine",
    "-deadargelim",
    "-simplifycfg",
];

const KLEE: &[&str] = &[
    "-simplifycfg",
    "-globalopt",
    "-globaldce",
    "-ipconstprop",
    "-deadargelim",
    "-instcombine",
    "-simplifycfg",
    "-prune-eh",
    "-functionattrs",
    "-inline-threshold=70",
    "-inline",
    "-argpromotion",
    "-instcombine",
    "-jump-threading",
    "-simplifycfg",
    "-gvn",
    "-scalarrepl",
    "-instcombine",
    "-tailcallelim",
    "-simplifycfg",
    "-reassociate",
    "-loop-rotate",
    "-licm",
    "-loop-unswitch",
    "-instcombine",
    "-indvars",
    "-loop-deletion",
    "-loop-unroll",
    "-instcombine",
    "-memcpyopt",
    "-sccp",
    "-instcombine",
    "-dse",
    "-adce",
    "-simplifycfg",
    "-strip-dead-prototypes",
    "-constmerge",
    "-ipsccp",
    "-deadargelim",
    "-die",
    "-instcombine",
];

const O2: &[&str] = &[
    "-tti",
    "-targetlibinfo",
    "-tbaa",
    "-scoped-noalias",
    "-assumption-cache-tracker",
    "-verify",
    "-simplifycfg",
    "-domtree",
    "-sroa",
    "-early-cse",
    "-lower-expect",
    "-targetlibinfo",
    "-tti",
    "-tbaa",
    "-scoped-noalias",
    "-assumption-cache-tracker",
    "-forceattrs",
    "-inferattrs",
    "-ipsccp",
    "-globalopt",
    "-domtree",
    "-mem2reg",
    "-deadargelim",
    "-basicaa",
    "-aa",
    "-domtree",
    "-instcombine",
    "-simplifycfg",
    "-basiccg",
    "-globals-aa",
    "-prune-eh",
    "-inline",
    "-functionattrs",
    "-domtree",
    "-sroa",
    "-early-cse",
    "-lazy-value-info",
    "-jump-threading",
    "-correlated-propagation",
    "-simplifycfg",
    "-basicaa",
    "-aa",
    "-domtree",
    "-instcombine",
    "-tailcallelim",
    "-simplifycfg",
    "-reassociate",
    "-domtree",
    "-loops",
    "-loop-simplify",
    "-lcssa",
    "-loop-rotate",
    "-basicaa",
    "-aa",
    "-licm",
    "-loop-unswitch",
    "-simplifycfg",
    "-basicaa",
    "-aa",
    "-domtree",
    "-instcombine",
    "-loops",
    "-scalar-evolution",
    "-loop-simplify",
    "-lcssa",
    "-indvars",
    "-aa",
    "-loop-idiom",
    "-loop-deletion",
    "-loop-unroll",
    "-basicaa",
    "-aa",
    "-mldst-motion",
    "-aa",
    "-memdep",
    "-gvn",
    "-basicaa",
    "-aa",
    "-memdep",
    "-memcpyopt",
    "-sccp",
    "-domtree",
    "-demanded-bits",
    "-bdce",
    "-basicaa",
    "-aa",
    "-instcombine",
    "-lazy-value-info",
    "-jump-threading",
    "-correlated-propagation",
    "-domtree",
    "-basicaa",
    "-aa",
    "-memdep",
    "-dse",
    "-loops",
    "-loop-simplify",
    "-lcssa",
    "-aa",
    "-licm",
    "-adce",
    "-simplifycfg",
    "-basicaa",
    "-aa",
    "-domtree",
    "-instcombine",
    "-barrier",
    "-basiccg",
    "-rpo-functionattrs",
    "-elim-avail-extern",
    "-basiccg",
    "-globals-aa",
    "-float2int",
    "-domtree",
    "-loops",
    "-loop-simplify",
    "-lcssa",
    "-loop-rotate",
    "-branch-prob",
    "-block-freq",
    "-scalar-evolution",
    "-basicaa",
    "-aa",
    "-loop-accesses",
    "-demanded-bits",
    "-instcombine",
    "-scalar-evolution",
    "-aa",
    "-simplifycfg",
    "-basicaa",
    "-aa",
    "-domtree",
    "-instcombine",
    "-loops",
    "-loop-simplify",
    "-lcssa",
    "-scalar-evolution",
    "-loop-unroll",
    "-basicaa",
    "-aa",
    "-instcombine",
    "-loop-simplify",
    "-lcssa",
    "-aa",
    "-licm",
    "-scalar-evolution",
    "-alignment-from-assumptions",
    "-strip-dead-prototypes",
    "-globaldce",
    "-constmerge",
    "-verify",
];

const O3: &[&str] = &[
    "-tti",
    "-targetlibinfo",
    "-tbaa",
    "-scoped-noalias",
    "-assumption-cache-tracker",
    "-verify",
    "-simplifycfg",
    "-domtree",
    "-sroa",
    "-early-cse",
    "-lower-expect",
    "-targetlibinfo",
    "-tti",
    "-tbaa",
    "-scoped-noalias",
    "-assumption-cache-tracker",
    "-forceattrs",
    "-inferattrs",
    "-ipsccp",
    "-globalopt",
    "-domtree",
    "-mem2reg",
    "-deadargelim",
    "-basicaa",
    "-aa",
    "-domtree",
    "-instcombine",
    "-simplifycfg",
    "-basiccg",
    "-globals-aa",
    "-prune-eh",
    "-inline-threshold=70",
    "-inline",
    "-functionattrs",
    "-argpromotion",
    "-domtree",
    "-sroa",
    "-early-cse",
    "-lazy-value-info",
    "-jump-threading",
    "-correlated-propagation",
    "-simplifycfg",
    "-basicaa",
    "-aa",
    "-domtree",
    "-instcombine",
    "-tailcallelim",
    "-simplifycfg",
    "-reassociate",
    "-domtree",
    "-loops",
    "-loop-simplify",
    "-lcssa",
    "-basicaa",
    "-aa",
    "-licm",
    "-loop-unswitch",
    "-simplifycfg",
    "-basicaa",
    "-aa",
    "-domtree",
    "-instcombine",
    "-loops",
    "-scalar-evolution",
    "-loop-simplify",
    "-lcssa",
    "-indvars",
    "-aa",
    "-loop-idiom",
    "-loop-deletion",
    "-loop-unroll",
    "-basicaa",
    "-aa",
    "-mldst-motion",
    "-aa",
    "-memdep",
    "-gvn",
    "-basicaa",
    "-aa",
    "-memdep",
    "-memcpyopt",
    "-sccp",
    "-domtree",
    "-demanded-bits",
    "-bdce",
    "-basicaa",
    "-aa",
    "-instcombine",
    "-lazy-value-info",
    "-jump-threading",
    "-correlated-propagation",
    "-domtree",
    "-basicaa",
    "-aa",
    "-memdep",
    "-dse",
    "-loops",
    "-loop-simplify",
    "-lcssa",
    "-aa",
    "-licm",
    "-adce",
    "-simplifycfg",
    "-basicaa",
    "-aa",
    "-domtree",
    "-instcombine",
    "-barrier",
    "-basiccg",
    "-rpo-functionattrs",
    "-elim-avail-extern",
    "-basiccg",
    "-globals-aa",
    "-float2int",
    "-domtree",
    "-loops",
    "-loop-simplify",
    "-lcssa",
    "-branch-prob",
    "-block-freq",
    "-scalar-evolution",
    "-basicaa",
    "-aa",
    "-loop-accesses",
    "-demanded-bits",
    "-instcombine",
    "-scalar-evolution",
    "-aa",
    "-simplifycfg",
    "-basicaa",
    "-aa",
    "-domtree",
    "-instcombine",
    "-loops",
    "-loop-simplify",
    "-lcssa",
    "-scalar-evolution",
    "-loop-unroll",
    "-basicaa",
    "-aa",
    "-instcombine",
    "-loop-simplify",
    "-lcssa",
    "-aa",
    "-licm",
    "-scalar-evolution",
    "-alignment-from-assumptions",
    "-strip-dead-prototypes",
    "-globaldce",
    "-constmerge",
    "-verify",
];

/// Passes that must not run for the given property.
///
/// Termination analysis needs calls and loop structure intact; the
/// memsafety passes rely on scope markers that `-licm`/`-gvn`/`-early-cse`
/// rewrite; `-instcombine` folds the overflow checks away.
pub fn disabled_for(property: &Property) -> Vec<&'static str> {
    let mut disabled = Vec::new();
    if property.termination() {
        disabled.push("-functionattrs");
        disabled.push("-instcombine");
    }
    if property.overflow() {
        disabled.push("-instcombine");
    }
    if property.memsafety().any() {
        disabled.push("-licm");
        disabled.push("-gvn");
        disabled.push("-early-cse");
    }
    disabled
}

/// Drop every disabled pass from a pass list.
pub fn filter_passes(passes: &[String], disabled: &[&str]) -> Vec<String> {
    passes
        .iter()
        .filter(|pass| !disabled.contains(&pass.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn klee_preset_limits_inlining() {
        assert!(OptPreset::Klee.passes().contains(&"-inline-threshold=70"));
    }

    #[test]
    fn o_presets_avoid_loop_rotation_before_slicing() {
        // O3 feeds the slicer; rotated loops break its control dependencies
        assert!(!OptPreset::O3.passes().contains(&"-loop-rotate"));
        assert!(!OptPreset::O3.passes().contains(&"-loop-vectorize"));
        assert!(!OptPreset::O2.passes().contains(&"-loop-vectorize"));
    }

    #[test]
    fn termination_disables_function_attribute_inference() {
        let property = Property::parse("termination").unwrap();
        let disabled = disabled_for(&property);
        assert!(disabled.contains(&"-functionattrs"));
        assert!(disabled.contains(&"-instcombine"));
    }

    #[test]
    fn memsafety_disables_scope_hostile_passes() {
        let property = Property::parse("memsafety").unwrap();
        let disabled = disabled_for(&property);
        assert_eq!(disabled, ["-licm", "-gvn", "-early-cse"]);
    }

    #[test]
    fn filtering_removes_only_disabled_passes() {
        let passes: Vec<String> = ["-licm", "-simplifycfg", "-gvn"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            filter_passes(&passes, &["-licm", "-gvn"]),
            ["-simplifycfg"]
        );
    }

    #[test]
    fn preset_names_round_trip() {
        for name in ["conservative", "klee", "O2", "O3"] {
            assert!(OptPreset::from_name(name).is_some());
        }
        assert!(OptPreset::from_name("O4").is_none());
    }
}
