//! Variable snapshot collaborator seam.
//!
//! Templating and precedence resolution are external concerns; the core only
//! needs an opaque mapping to hand to execution contexts and to evaluate tag
//! filters against.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::inventory::Host;
use crate::playbook::Play;

/// An opaque variable mapping, ordered for reproducible serialization.
pub type Variables = IndexMap<String, serde_json::Value>;

/// Variable collaborator: supplies the snapshot used when a play is copied
/// for a run and the per-host view handed to each execution context.
pub trait VarProvider: Send + Sync {
    /// Variables in scope for the play as a whole.
    fn play_vars(&self, play: &Play) -> Variables;

    /// Variables in scope for one host within the play.
    fn host_vars(&self, play: &Play, host: &Host) -> Variables;
}

/// A fixed variable source backed by a single map.
#[derive(Debug, Clone, Default)]
pub struct StaticVars {
    vars: Arc<Variables>,
}

impl StaticVars {
    /// Creates an empty variable source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source that serves `vars` for every scope.
    pub fn with_vars(vars: Variables) -> Self {
        Self {
            vars: Arc::new(vars),
        }
    }
}

impl VarProvider for StaticVars {
    fn play_vars(&self, _play: &Play) -> Variables {
        (*self.vars).clone()
    }

    fn host_vars(&self, _play: &Play, _host: &Host) -> Variables {
        (*self.vars).clone()
    }
}
