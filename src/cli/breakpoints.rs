//! Breakpoints declared in a launch file

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::common::config::LaunchBreakpoint;
use crate::common::Result;
use crate::dap::{SetBreakpointsArguments, SetBreakpointsResponseBody, Source, SourceBreakpoint};
use crate::session::{BreakpointApplier, DebugSession};

/// Sends one `setBreakpoints` per source file
pub struct LaunchFileBreakpoints {
    by_source: BTreeMap<String, Vec<SourceBreakpoint>>,
}

impl LaunchFileBreakpoints {
    pub fn new(breakpoints: &[LaunchBreakpoint]) -> Self {
        let mut by_source: BTreeMap<String, Vec<SourceBreakpoint>> = BTreeMap::new();
        for bp in breakpoints {
            by_source
                .entry(absolute(&bp.path))
                .or_default()
                .push(SourceBreakpoint {
                    line: bp.line,
                    column: None,
                    condition: bp.condition.clone(),
                });
        }
        Self { by_source }
    }
}

fn absolute(path: &str) -> String {
    std::path::Path::new(path)
        .canonicalize()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| path.to_string())
}

#[async_trait]
impl BreakpointApplier for LaunchFileBreakpoints {
    async fn apply_session_breakpoints(&self, session: &Arc<DebugSession>) -> Result<()> {
        for (path, breakpoints) in &self.by_source {
            let args = SetBreakpointsArguments {
                source: Source {
                    name: std::path::Path::new(path)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned()),
                    path: Some(path.clone()),
                    source_reference: None,
                },
                breakpoints: breakpoints.clone(),
            };
            let body: SetBreakpointsResponseBody = session
                .request("setBreakpoints", Some(serde_json::to_value(args)?))
                .await?;

            for bp in &body.breakpoints {
                if bp.verified {
                    tracing::info!(path = %path, line = ?bp.line, "Breakpoint verified");
                } else {
                    tracing::warn!(
                        path = %path,
                        line = ?bp.line,
                        message = ?bp.message,
                        "Breakpoint not verified"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;
    use crate::dap::DebugConfiguration;
    use crate::session::{SessionOptions, Terminal, TerminalOptions, TerminalService};
    use crate::testing::MockAdapter;

    struct NoTerminals;

    #[async_trait]
    impl TerminalService for NoTerminals {
        async fn new_terminal(&self, _options: TerminalOptions) -> Result<Arc<dyn Terminal>> {
            Err(Error::TerminalFailed("unsupported".to_string()))
        }

        fn activate(&self, _terminal: &Arc<dyn Terminal>) {}
    }

    #[tokio::test]
    async fn test_one_request_per_source() {
        let adapter = MockAdapter::start();
        let session = DebugSession::new(
            "s1",
            DebugConfiguration::new("mock", "launch", "app"),
            adapter.connection(),
            SessionOptions::new(Arc::new(NoTerminals)),
        );
        let applier = LaunchFileBreakpoints::new(&[
            LaunchBreakpoint {
                path: "/no/such/dir/main.rs".to_string(),
                line: 10,
                condition: None,
            },
            LaunchBreakpoint {
                path: "/no/such/dir/lib.rs".to_string(),
                line: 3,
                condition: Some("x > 1".to_string()),
            },
            LaunchBreakpoint {
                path: "/no/such/dir/main.rs".to_string(),
                line: 20,
                condition: None,
            },
        ]);

        applier.apply_session_breakpoints(&session).await.unwrap();

        let requests = adapter.requests();
        assert_eq!(requests.len(), 2);
        let lib = requests[0].arguments.clone().unwrap();
        assert_eq!(lib["source"]["path"], "/no/such/dir/lib.rs");
        assert_eq!(lib["breakpoints"][0]["condition"], "x > 1");
        let main = requests[1].arguments.clone().unwrap();
        assert_eq!(main["source"]["name"], "main.rs");
        assert_eq!(main["breakpoints"].as_array().unwrap().len(), 2);
    }
}
