//! Process-wide suite registry. Suites are registered from `main` before the
//! harness entry point dispatches; afterwards the mapping is only read.

use crate::worker::suite::Suite;
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

static SUITES: Lazy<RwLock<BTreeMap<String, Arc<dyn Suite>>>> = Lazy::new(Default::default);

/// Registers `suite` under `name`. Registering the same name twice keeps the
/// latest instance.
pub fn register(name: impl Into<String>, suite: impl Suite) {
    let name = name.into();
    let previous = SUITES.write().unwrap().insert(name.clone(), Arc::new(suite));
    if previous.is_some() {
        warn!("suite {name} registered twice, keeping the latest");
    }
}

pub fn lookup(name: &str) -> Option<Arc<dyn Suite>> {
    SUITES.read().unwrap().get(name).cloned()
}

/// Registered suite names in sorted order, stable for one process.
pub fn names() -> Vec<String> {
    SUITES.read().unwrap().keys().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::suite::Capabilities;

    struct Nop;
    impl Suite for Nop {}

    #[test]
    fn test_register_and_lookup() {
        register("registry-nop", Nop);

        let suite = lookup("registry-nop").expect("registered suite not found");
        assert_eq!(suite.capabilities(), Capabilities::empty());
        assert!(lookup("registry-missing").is_none());
        assert!(names().contains(&"registry-nop".to_string()));
    }
}
