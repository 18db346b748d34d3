use std::rc::Rc;

use crate::backend::Backend;
use crate::network::{BuilderConfig, NetworkDefinition};
use crate::reference::{RefEngine, ReferenceBackend};
use crate::shape::OptimizationProfile;

pub fn demo_profile() -> OptimizationProfile {
    OptimizationProfile::new("inputT0", [1, 1, 1], [3, 4, 5], [6, 8, 10])
}

pub fn demo_network() -> NetworkDefinition {
    NetworkDefinition::identity("inputT0", "outputT0", 3)
}

pub fn demo_builder_config() -> BuilderConfig {
    let mut config = BuilderConfig::default();
    config.add_optimization_profile(demo_profile());
    config
}

/// Identity engine over the demo profile, built and deserialized in memory.
pub fn demo_engine(backend: &ReferenceBackend) -> Rc<RefEngine> {
    let blob = backend
        .build_serialized_network(&demo_network(), &demo_builder_config())
        .unwrap()
        .expect("reference builder accepts the demo network");
    backend
        .deserialize_engine(&blob)
        .unwrap()
        .expect("reference runtime loads its own plan")
}
