//! Session factories selected by adapter type

use std::collections::HashMap;
use std::sync::Arc;

use crate::dap::connection::DapConnection;
use crate::dap::DebugConfiguration;

use super::session::{DebugSession, SessionOptions};

/// Builds the session object for a freshly opened connection
pub trait DebugSessionFactory: Send + Sync {
    fn create(
        &self,
        id: &str,
        configuration: DebugConfiguration,
        connection: Arc<DapConnection>,
        options: SessionOptions,
    ) -> Arc<DebugSession>;
}

/// Factory used for adapter types nobody contributed a factory for
#[derive(Debug, Default)]
pub struct DefaultSessionFactory;

impl DebugSessionFactory for DefaultSessionFactory {
    fn create(
        &self,
        id: &str,
        configuration: DebugConfiguration,
        connection: Arc<DapConnection>,
        options: SessionOptions,
    ) -> Arc<DebugSession> {
        DebugSession::new(id, configuration, connection, options)
    }
}

/// A factory registered for one adapter type
pub struct DebugSessionContribution {
    pub debug_type: String,
    pub factory: Arc<dyn DebugSessionFactory>,
}

impl DebugSessionContribution {
    pub fn new(debug_type: &str, factory: Arc<dyn DebugSessionFactory>) -> Self {
        Self {
            debug_type: debug_type.to_string(),
            factory,
        }
    }
}

/// Lookup table from adapter type to session factory
pub struct ContributionRegistry {
    factories: HashMap<String, Arc<dyn DebugSessionFactory>>,
    default: Arc<dyn DebugSessionFactory>,
}

impl ContributionRegistry {
    /// Build the table; a later contribution for the same type wins
    pub fn new(contributions: Vec<DebugSessionContribution>) -> Self {
        let mut factories = HashMap::new();
        for contribution in contributions {
            if factories
                .insert(contribution.debug_type.clone(), contribution.factory)
                .is_some()
            {
                tracing::warn!(
                    debug_type = %contribution.debug_type,
                    "Duplicate session contribution, keeping the last one"
                );
            }
        }
        Self {
            factories,
            default: Arc::new(DefaultSessionFactory),
        }
    }

    pub fn factory(&self, debug_type: &str) -> Arc<dyn DebugSessionFactory> {
        self.factories
            .get(debug_type)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn contributes(&self, debug_type: &str) -> bool {
        self.factories.contains_key(debug_type)
    }
}

impl Default for ContributionRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::services::{Terminal, TerminalOptions, TerminalService};
    use crate::testing::MockAdapter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoTerminals;

    #[async_trait]
    impl TerminalService for NoTerminals {
        async fn new_terminal(&self, _options: TerminalOptions) -> crate::Result<Arc<dyn Terminal>> {
            Err(crate::Error::TerminalFailed("unsupported".to_string()))
        }

        fn activate(&self, _terminal: &Arc<dyn Terminal>) {}
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
    }

    impl DebugSessionFactory for CountingFactory {
        fn create(
            &self,
            id: &str,
            configuration: DebugConfiguration,
            connection: Arc<DapConnection>,
            options: SessionOptions,
        ) -> Arc<DebugSession> {
            self.created.fetch_add(1, Ordering::SeqCst);
            DebugSession::new(id, configuration, connection, options)
        }
    }

    #[tokio::test]
    async fn test_contributed_factory_is_selected_by_type() {
        let counting = Arc::new(CountingFactory::default());
        let registry = ContributionRegistry::new(vec![DebugSessionContribution::new(
            "python",
            counting.clone(),
        )]);
        assert!(registry.contributes("python"));
        assert!(!registry.contributes("lldb"));

        let adapter = MockAdapter::start();
        let options = SessionOptions::new(Arc::new(NoTerminals));
        registry.factory("python").create(
            "a",
            DebugConfiguration::new("python", "launch", "py"),
            adapter.connection(),
            options.clone(),
        );
        registry.factory("lldb").create(
            "b",
            DebugConfiguration::new("lldb", "launch", "native"),
            adapter.connection(),
            options,
        );
        assert_eq!(counting.created.load(Ordering::SeqCst), 1);
    }
}
