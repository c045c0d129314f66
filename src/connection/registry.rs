use super::config::DbOptions;
use super::state::State;
use crate::core::Result;
use crate::facade::Session;
use crate::storage::Substrate;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{Level, event};

pub(crate) type StateMap = Mutex<HashMap<String, Arc<State>>>;

/// Process-wide table of open locations.
///
/// Every root session for the same location shares one [`State`]; a State
/// removes itself from the table when it closes.
#[derive(Clone)]
pub struct ConnectionRegistry {
    substrate: Arc<dyn Substrate>,
    states: Arc<StateMap>,
}

impl ConnectionRegistry {
    pub fn new(substrate: Arc<dyn Substrate>) -> Self {
        Self {
            substrate,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a root session for `location`.
    ///
    /// The first session for a location fixes its options; later sessions
    /// reuse the existing State and their options are ignored.
    pub fn session(&self, location: &str, options: DbOptions) -> Result<Session> {
        options.validate()?;
        let state = {
            let mut states = self.lock();
            match states.get(location) {
                Some(state) => {
                    if state.options() != &options {
                        event!(
                            Level::DEBUG,
                            location,
                            "reusing open location; new options ignored"
                        );
                    }
                    Arc::clone(state)
                }
                None => {
                    let state = Arc::new(State::new(
                        location,
                        options,
                        Arc::clone(&self.substrate),
                        Arc::downgrade(&self.states),
                    ));
                    event!(Level::DEBUG, location, instance = %state.instance(), "state created");
                    states.insert(location.to_string(), Arc::clone(&state));
                    state
                }
            }
        };
        Session::root(state)
    }

    /// Create a root session from a `kvsession://` URL.
    pub fn from_url(&self, url: &str) -> Result<Session> {
        let (location, options) = DbOptions::from_url(url)?;
        self.session(&location, options)
    }

    pub fn state(&self, location: &str) -> Option<Arc<State>> {
        self.lock().get(location).cloned()
    }

    pub fn contains(&self, location: &str) -> bool {
        self.lock().contains_key(location)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<State>>> {
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("locations", &self.len())
            .finish()
    }
}
