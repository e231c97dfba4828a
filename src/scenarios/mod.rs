//! Built-in scenario kinds.

pub mod echo;

use crate::scenario::{ScenarioProvider, ScenarioRegistry};
use std::sync::Arc;

pub use echo::{EchoProvider, EchoScenario, ECHO_KIND};

/// Registers every built-in kind.
pub fn register_builtin(registry: &mut ScenarioRegistry) {
    registry.register(ECHO_KIND, |params: &std::collections::HashMap<String, String>| {
        Ok(Arc::new(EchoProvider::from_parameters(params)) as Arc<dyn ScenarioProvider>)
    });
}
