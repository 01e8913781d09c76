//! Verification tool adapters.
//!
//! The [`ToolAdapter`] trait is the seam between the generic preparation
//! pipeline and each concrete backend. Adapters for KLEE, CBMC and Nidhugg
//! live here; [`adapter_by_name`] builds one from its registry name.

pub mod cbmc;
pub mod klee;
pub mod nidhugg;
pub mod traits;

use std::sync::Arc;

use sliceprove_property::Property;

pub use cbmc::{CbmcAdapter, CbmcConfig, UNWIND_BOUNDS};
pub use klee::{KleeAdapter, KleeConfig};
pub use nidhugg::{NidhuggAdapter, NidhuggConfig};
pub use traits::{
    default_instrumentation_plan, default_slicing_criterion, AdapterError, HookError,
    InstrumentationPlan, LinkCategory, PipelineOps, PortfolioStep, ResourceLimits,
    SlicingCriterion, ToolAdapter, DEFAULT_LINK_CATEGORIES,
};

/// Names of the built-in adapters, in the order `adapter_by_name` knows them.
pub const ADAPTER_NAMES: [&str; 3] = ["klee", "cbmc", "nidhugg"];

/// Build a built-in adapter by name, or `None` for an unknown tool.
pub fn adapter_by_name(name: &str, property: Arc<Property>) -> Option<Arc<dyn ToolAdapter>> {
    match name {
        "klee" => Some(Arc::new(KleeAdapter::new(property))),
        "cbmc" => Some(Arc::new(CbmcAdapter::new(property))),
        "nidhugg" => Some(Arc::new(NidhuggAdapter::new(property))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_knows_every_registered_name() {
        let property = Arc::new(Property::default_assertions());
        for name in ADAPTER_NAMES {
            let adapter = adapter_by_name(name, Arc::clone(&property))
                .unwrap_or_else(|| panic!("no adapter for {name}"));
            assert_eq!(adapter.name(), name);
        }
        assert!(adapter_by_name("divine", property).is_none());
    }
}
