//! Execution strategies: a spawn cache in front of a runner, and the
//! registry choosing a strategy per action mnemonic.

use crate::smallmap::SmallMap;
use crate::spawn::{
    ExecError, NoCache, ProgressStatus, Spawn, SpawnCache, SpawnContext, SpawnResult, SpawnRunner,
};
use std::sync::Arc;

pub struct SpawnStrategy {
    name: String,
    cache: Arc<dyn SpawnCache>,
    runner: Arc<dyn SpawnRunner>,
}

impl SpawnStrategy {
    pub fn new(name: &str, cache: Arc<dyn SpawnCache>, runner: Arc<dyn SpawnRunner>) -> Self {
        SpawnStrategy {
            name: name.to_string(),
            cache,
            runner,
        }
    }

    /// A strategy that always runs the command.
    pub fn uncached(name: &str, runner: Arc<dyn SpawnRunner>) -> Self {
        Self::new(name, Arc::new(NoCache), runner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Satisfies the spawn from the cache if possible, otherwise runs it and
    /// offers a successful result back to the cache.  Any non-success result
    /// comes back as ExecError::SpawnFailed.
    pub fn exec(&self, spawn: &Spawn, ctx: &SpawnContext) -> Result<SpawnResult, ExecError> {
        let cache: &dyn SpawnCache = if spawn.may_cache() {
            &*self.cache
        } else {
            &NoCache
        };
        let mut handle = cache.lookup(spawn, ctx)?;
        if handle.has_result() {
            if let Some(mut result) = handle.result() {
                if result.status.is_success() {
                    ctx.report(ProgressStatus::CacheHit);
                    result.cache_hit = true;
                    return Ok(result);
                }
            }
        }

        let result = self.runner.exec(spawn, ctx)?;
        if !result.status.is_success() {
            let message = format!(
                "{} {} failed: {}",
                spawn.mnemonic,
                spawn.owner,
                result.describe_failure()
            );
            return Err(ExecError::SpawnFailed {
                result: Box::new(result),
                message,
            });
        }
        if handle.will_store() {
            // A cache that can't be written to is not a reason to fail the action.
            if let Err(err) = handle.store(&result) {
                log::warn!("failed to store {} in spawn cache: {}", spawn.owner, err);
            }
        }
        Ok(result)
    }
}

/// Maps action mnemonics to strategies.
pub struct StrategyRegistry {
    by_mnemonic: SmallMap<String, Arc<SpawnStrategy>>,
    default: Arc<SpawnStrategy>,
}

impl StrategyRegistry {
    pub fn new(default: SpawnStrategy) -> Self {
        StrategyRegistry {
            by_mnemonic: SmallMap::default(),
            default: Arc::new(default),
        }
    }

    pub fn register(&mut self, mnemonic: &str, strategy: SpawnStrategy) {
        self.by_mnemonic
            .insert(mnemonic.to_string(), Arc::new(strategy));
    }

    pub fn strategy_for(&self, mnemonic: &str) -> &SpawnStrategy {
        self.by_mnemonic.get(mnemonic).unwrap_or(&self.default)
    }
}
