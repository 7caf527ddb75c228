// Tester registry: which executable serves each tester kind on this worker.
// Built once at startup; the set of kinds is closed (TesterType).

use anyhow::{anyhow, bail, Result};
use autotest_common::config::{AutotestConfig, EnvStrategy};
use autotest_common::types::TesterType;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TesterAdapter {
    pub kind: TesterType,
    pub runner: CommandSpec,
    pub env_strategy: EnvStrategy,
}

#[derive(Debug, Clone, Default)]
pub struct TesterRegistry {
    adapters: BTreeMap<TesterType, TesterAdapter>,
}

impl TesterRegistry {
    pub fn from_config(config: &AutotestConfig) -> Result<Self> {
        let mut adapters = BTreeMap::new();
        for (kind, tester) in &config.testers {
            if tester.command.as_os_str().is_empty() {
                bail!("Tester '{}' has an empty command", kind);
            }
            let env_strategy = tester.env_strategy.unwrap_or(if kind.uses_python_env() {
                EnvStrategy::PythonVenv
            } else {
                EnvStrategy::Default
            });
            adapters.insert(
                *kind,
                TesterAdapter {
                    kind: *kind,
                    runner: CommandSpec {
                        program: tester.command.clone(),
                        args: tester.args.clone(),
                    },
                    env_strategy,
                },
            );
        }
        Ok(Self { adapters })
    }

    pub fn resolve(&self, kind: TesterType) -> Result<&TesterAdapter> {
        self.adapters
            .get(&kind)
            .ok_or_else(|| anyhow!("Tester '{}' is not installed on this worker", kind))
    }

    pub fn kinds(&self) -> Vec<TesterType> {
        self.adapters.keys().copied().collect()
    }

    #[cfg(test)]
    pub fn with_adapter(mut self, adapter: TesterAdapter) -> Self {
        self.adapters.insert(adapter.kind, adapter);
        self
    }
}
