//! A build session: the evaluator, caches and execution machinery kept
//! alive across builds of one workspace.
//!
//! Each build configures the requested targets, lays their actions out in a
//! fresh action graph and hands that to `Work`.  Everything the evaluator
//! computed stays valid until the caller reports modified files.

use crate::action_cache::ActionCache;
use crate::analysis::{BuildFunctions, BuildKey, BuildValue, ConfiguredTarget, DEFAULT_MANIFEST};
use crate::evaluator::{EvaluationOptions, Evaluator, Stats};
use crate::fs::{FileState, FileSystem, RealFileSystem};
use crate::graph::{ActionGraph, FrozenActionGraph, Label};
use crate::local::{LocalExecutionOptions, LocalSpawnRunner};
use crate::progress::Progress;
use crate::resources::{ResourceManager, ResourceSet};
use crate::signal::Interrupt;
use crate::spawn::{NoCache, SpawnCache};
use crate::spawn_cache::DiskSpawnCache;
use crate::strategy::{SpawnStrategy, StrategyRegistry};
use crate::trace;
use crate::work::{BuildOptions, BuildSummary, Work};
use anyhow::{anyhow, bail, Context};
use std::collections::{BTreeSet, HashSet};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

/// Files changed since the previous build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModifiedFileSet {
    /// Nothing is known; every file is checked again.
    Everything,
    Paths(BTreeSet<String>),
}

impl ModifiedFileSet {
    pub fn is_empty(&self) -> bool {
        matches!(self, ModifiedFileSet::Paths(paths) if paths.is_empty())
    }
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub exec_root: PathBuf,
    pub manifest_name: String,
    /// Where the action cache persists; None keeps it in memory.
    pub action_cache: Option<PathBuf>,
    /// Directory of a spawn cache shared between workspaces.
    pub disk_cache: Option<PathBuf>,
    pub local: LocalExecutionOptions,
    pub resources: ResourceSet,
}

impl SessionOptions {
    pub fn new(exec_root: impl Into<PathBuf>) -> Self {
        let exec_root = exec_root.into();
        SessionOptions {
            action_cache: Some(exec_root.join(".kiln").join("action_cache")),
            exec_root,
            manifest_name: DEFAULT_MANIFEST.to_string(),
            disk_cache: None,
            local: LocalExecutionOptions::default(),
            resources: ResourceSet::local_machine(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BuildRequest {
    /// Targets to build; empty means the root manifest's defaults.
    pub targets: Vec<Label>,
    pub options: BuildOptions,
}

#[derive(Debug)]
pub struct BuildResult {
    pub summary: BuildSummary,
    /// Targets that failed to configure, with the reason.
    pub analysis_failures: Vec<(Label, String)>,
    pub analysis_stats: Stats,
}

impl BuildResult {
    pub fn success(&self) -> bool {
        self.analysis_failures.is_empty() && self.summary.success()
    }

    /// "N of M targets built", counting targets that failed to configure.
    pub fn report_line(&self) -> String {
        format!(
            "{} of {} targets built",
            self.summary.targets_built(),
            self.summary.targets.len() + self.analysis_failures.len()
        )
    }
}

pub struct Session {
    exec_root: PathBuf,
    fs: Arc<RealFileSystem>,
    evaluator: Evaluator<BuildFunctions>,
    action_cache: ActionCache,
    registry: StrategyRegistry,
    resources: Arc<ResourceManager>,
    /// Changes reported but not yet applied to the evaluator.
    modified: ModifiedFileSet,
}

impl Session {
    pub fn new(options: SessionOptions) -> anyhow::Result<Self> {
        let fs = Arc::new(RealFileSystem::new(&options.exec_root));
        let evaluator = Evaluator::new(BuildFunctions::new(fs.clone(), &options.manifest_name));
        let action_cache = match &options.action_cache {
            Some(path) => ActionCache::load(path),
            None => ActionCache::in_memory(),
        };
        let resources = Arc::new(ResourceManager::new(options.resources.clone()));
        let cache: Arc<dyn SpawnCache> = match &options.disk_cache {
            Some(dir) => Arc::new(
                DiskSpawnCache::new(dir)
                    .with_context(|| format!("opening disk cache {}", dir.display()))?,
            ),
            None => Arc::new(NoCache),
        };
        let runner = Arc::new(LocalSpawnRunner::new(resources.clone(), options.local.clone()));
        let registry = StrategyRegistry::new(SpawnStrategy::new("local", cache, runner));
        Ok(Session {
            exec_root: options.exec_root,
            fs,
            evaluator,
            action_cache,
            registry,
            resources,
            modified: ModifiedFileSet::Everything,
        })
    }

    pub fn registry_mut(&mut self) -> &mut StrategyRegistry {
        &mut self.registry
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn action_cache(&self) -> &ActionCache {
        &self.action_cache
    }

    pub fn evaluator(&self) -> &Evaluator<BuildFunctions> {
        &self.evaluator
    }

    /// Reports files changed since the last build.  Takes effect at the
    /// start of the next build.
    pub fn invalidate(&mut self, modified: ModifiedFileSet) {
        self.modified = match (std::mem::replace(&mut self.modified, ModifiedFileSet::Everything), modified) {
            (ModifiedFileSet::Paths(mut a), ModifiedFileSet::Paths(b)) => {
                a.extend(b);
                ModifiedFileSet::Paths(a)
            }
            _ => ModifiedFileSet::Everything,
        };
    }

    fn apply_modified(&mut self) {
        let modified = std::mem::replace(&mut self.modified, ModifiedFileSet::Paths(BTreeSet::new()));
        match modified {
            ModifiedFileSet::Everything => self
                .evaluator
                .invalidate_matching(|key| matches!(key, BuildKey::File(_))),
            ModifiedFileSet::Paths(paths) => {
                if !paths.is_empty() {
                    log::debug!("{} modified files", paths.len());
                    self.evaluator.invalidate(paths.into_iter().map(BuildKey::File));
                }
            }
        }
    }

    /// The root manifest's default targets.
    fn default_targets(&self, opts: &EvaluationOptions) -> anyhow::Result<Vec<Label>> {
        let key = BuildKey::Manifest(self.evaluator.functions().manifest_path(""));
        let result = self.evaluator.evaluate(&[key.clone()], opts);
        match result.get(&key) {
            Some(Ok(BuildValue::Manifest(manifest))) => {
                if manifest.defaults.is_empty() {
                    bail!("no targets requested and no defaults in {}", key);
                }
                Ok(manifest.defaults.clone())
            }
            Some(Err(err)) => Err(anyhow!("{}", err)),
            _ => Err(anyhow!("{}: not evaluated", key)),
        }
    }

    /// Configures the targets and collects their actions into a graph.
    fn analyze(
        &self,
        targets: &[Label],
        opts: &EvaluationOptions,
    ) -> anyhow::Result<(FrozenActionGraph, Vec<(Label, String)>, Stats)> {
        let keys: Vec<BuildKey> = targets
            .iter()
            .map(|l| BuildKey::ConfiguredTarget(l.clone()))
            .collect();
        let result = trace::scope("analysis", || self.evaluator.evaluate(&keys, opts));
        if opts.interrupt.is_set() {
            bail!("interrupted");
        }

        let mut failures = Vec::new();
        let mut configured: Vec<Arc<ConfiguredTarget>> = Vec::new();
        for (label, key) in targets.iter().zip(&keys) {
            match result.get(key) {
                Some(Ok(value)) => {
                    if let Some(target) = value.configured_target() {
                        configured.push(target.clone());
                    }
                }
                Some(Err(err)) => failures.push((label.clone(), err.to_string())),
                None => failures.push((label.clone(), "not evaluated".to_string())),
            }
        }
        if !opts.keep_going {
            if let Some(err) = &result.catalyst {
                bail!("analysis failed: {}", err);
            }
            if let Some((label, msg)) = failures.first() {
                bail!("analysis of {} failed: {}", label, msg);
            }
        }

        let mut graph = ActionGraph::new();
        let mut seen = HashSet::new();
        for root in &configured {
            for target in root.transitive() {
                if !seen.insert(target.label.clone()) {
                    continue;
                }
                graph.register_target(
                    target.label.clone(),
                    target.deps.iter().map(|d| d.label.clone()).collect(),
                );
                for spec in &target.actions {
                    graph.register_action(&target.label, spec.clone())?;
                }
            }
        }
        let graph = graph.freeze()?;
        log::debug!(
            "{} targets configured into {} actions",
            seen.len(),
            graph.action_count()
        );
        Ok((graph, failures, result.stats))
    }

    /// Runs one build.  Action failures are reported in the result; an
    /// error means the build could not be set up or finished at all.
    pub fn build(
        &mut self,
        request: &BuildRequest,
        progress: &mut dyn Progress,
        interrupt: &Interrupt,
    ) -> anyhow::Result<BuildResult> {
        self.apply_modified();
        let opts = EvaluationOptions {
            keep_going: request.options.keep_going,
            parallelism: NonZeroUsize::new(request.options.jobs).unwrap_or(NonZeroUsize::MIN),
            interrupt: interrupt.clone(),
        };

        let targets = if request.targets.is_empty() {
            self.default_targets(&opts)?
        } else {
            request.targets.clone()
        };
        let (graph, analysis_failures, analysis_stats) = self.analyze(&targets, &opts)?;
        let failed: HashSet<&Label> = analysis_failures.iter().map(|(l, _)| l).collect();

        let fs: &dyn FileSystem = &*self.fs;
        let mut work = Work::new(
            &graph,
            fs,
            &self.exec_root,
            &self.action_cache,
            &self.registry,
            progress,
            &request.options,
            interrupt.clone(),
        );
        for label in targets.iter().filter(|l| !failed.contains(l)) {
            work.want_target(label)?;
        }

        // Source digests go through the evaluator, so unchanged sources are
        // never read twice within a session.
        let sources = work.wanted_sources();
        let keys: Vec<BuildKey> = sources
            .iter()
            .map(|&id| BuildKey::File(graph.artifact(id).path.clone()))
            .collect();
        let digested = trace::scope("digest sources", || {
            self.evaluator.evaluate(
                &keys,
                &EvaluationOptions {
                    keep_going: true,
                    ..opts.clone()
                },
            )
        });
        for (&id, key) in sources.iter().zip(&keys) {
            let state = match digested.get(key) {
                Some(Ok(value)) => value.file_state().unwrap_or(FileState::Missing),
                Some(Err(err)) => {
                    log::warn!("{}", err);
                    FileState::Missing
                }
                None => FileState::Missing,
            };
            work.set_source_state(id, state);
        }

        let summary = trace::scope("execution", || work.run())?;
        drop(work);

        self.action_cache.apply(summary.cache_deltas.iter().cloned());
        if let Err(err) = self.action_cache.save() {
            log::error!("failed to save action cache: {}", err);
        }

        Ok(BuildResult {
            summary,
            analysis_failures,
            analysis_stats,
        })
    }
}
