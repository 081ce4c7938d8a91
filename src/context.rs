use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::prompt::Prompter;
use crate::store::{SafeRunner, StoreClient, TargetRegistry};

/// Everything that used to be process-wide state, passed explicitly: the
/// target registry, the selected store session, and the prompt sink.
/// Dropping the context is the teardown; tests build a fresh one per case.
pub struct Context {
    pub root: PathBuf,
    pub registry: TargetRegistry,
    pub store: StoreClient,
    pub prompter: Box<dyn Prompter>,
    pub safe_runner: Arc<dyn SafeRunner>,
}

impl Context {
    /// Build a context rooted at `root`. With an explicit `target` it is
    /// resolved against the registry; otherwise a single known target is
    /// used as-is and several trigger the interactive picker.
    pub fn new(
        root: &Path,
        safe_runner: Arc<dyn SafeRunner>,
        target: Option<&str>,
        prompter: Box<dyn Prompter>,
    ) -> Result<Self> {
        let registry = TargetRegistry::load(&safe_runner)?;
        let selected = match target {
            Some(wanted) => registry.resolve(wanted)?.clone(),
            None => match registry.all() {
                [only] => only.clone(),
                _ => registry.pick(prompter.as_ref())?.clone(),
            },
        };
        let store = StoreClient::new(selected, safe_runner.clone());
        Ok(Self {
            root: root.to_path_buf(),
            registry,
            store,
            prompter,
            safe_runner,
        })
    }

    /// Context over an already selected target; the constructor for tests
    /// and for callers that manage their own registry.
    pub fn with_store(
        root: &Path,
        registry: TargetRegistry,
        store: StoreClient,
        prompter: Box<dyn Prompter>,
        safe_runner: Arc<dyn SafeRunner>,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            registry,
            store,
            prompter,
            safe_runner,
        }
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join(".genesis").join("manifests")
    }
}
