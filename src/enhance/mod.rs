//! The enhancement pipeline.
//!
//! Three strictly ordered stages: context research over the corpus, code
//! research over a fresh checkout, then synthesis. Each stage runs under its
//! own timeout and any failure aborts the run with the stage attached.

pub mod code;
pub mod context;
pub mod markers;
pub mod synthesis;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::discovery::DiscoveryCache;
use crate::errors::{DiscoveryError, PipelineError, Stage};
use crate::store::DbHandle;
use crate::tracker::Issue;

pub use code::{CodeWorkspace, GitCheckout};
pub use context::ContextHit;
pub use synthesis::{ClaudeCli, EnhancedIssue, Synthesizer, resolve_model};

/// Keywords from the issue that make up a discovery query.
const DISCOVERY_KEYWORDS: usize = 8;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub default_model: String,
    pub context_timeout: Duration,
    pub code_timeout: Duration,
    pub synthesis_timeout: Duration,
    pub max_context_records: usize,
    pub max_code_excerpts: usize,
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            default_model: config.default_model.clone(),
            context_timeout: Duration::from_secs(config.context_timeout_secs),
            code_timeout: Duration::from_secs(config.code_timeout_secs),
            synthesis_timeout: Duration::from_secs(config.synthesis_timeout_secs),
            max_context_records: config.max_context_records,
            max_code_excerpts: config.max_code_excerpts,
        }
    }
}

/// Parameters for a single run. Overrides replace the configured defaults
/// for that run only; nothing is merged back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunParams {
    pub model: String,
    pub repo: Option<String>,
    pub max_context_records: usize,
}

impl RunParams {
    pub fn defaults(settings: &PipelineSettings) -> Self {
        Self {
            model: resolve_model(&settings.default_model),
            repo: None,
            max_context_records: settings.max_context_records,
        }
    }

    /// Apply `[key=value]` overrides. Unknown keys and unparseable values
    /// are ignored with a warning.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, String>) -> Self {
        for (key, value) in overrides {
            match key.as_str() {
                "model" => self.model = resolve_model(value),
                "repo" => self.repo = Some(value.clone()),
                "records" => match value.parse() {
                    Ok(n) => self.max_context_records = n,
                    Err(_) => tracing::warn!(value = %value, "Ignoring non-numeric records override"),
                },
                other => tracing::warn!(key = %other, "Ignoring unknown override"),
            }
        }
        self
    }
}

/// Why a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Create,
    Enhance,
    Retry,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Enhance => "enhance",
            Self::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnhanceRequest {
    pub issue: Issue,
    pub trigger: Trigger,
    /// What the author wrote, before any enhancement.
    pub notes: String,
    /// The previous generated description, for retries.
    pub previous: Option<String>,
    pub feedback: Option<String>,
    pub params: RunParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enhancement {
    pub issue: EnhancedIssue,
    pub context_hits: usize,
    pub repo: Option<String>,
}

struct Research {
    context: String,
    context_hits: usize,
    code: String,
    repo: Option<String>,
}

async fn staged<T, F>(stage: Stage, limit: Duration, fut: F) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::StageTimeout {
            stage,
            timeout: limit,
        }),
    }
}

pub struct EnhancementPipeline {
    corpus: DbHandle,
    discovery: Arc<DiscoveryCache>,
    workspace: Arc<dyn CodeWorkspace>,
    synthesizer: Arc<dyn Synthesizer>,
    settings: PipelineSettings,
}

impl EnhancementPipeline {
    pub fn new(
        corpus: DbHandle,
        discovery: Arc<DiscoveryCache>,
        workspace: Arc<dyn CodeWorkspace>,
        synthesizer: Arc<dyn Synthesizer>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            corpus,
            discovery,
            workspace,
            synthesizer,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn default_params(&self) -> RunParams {
        RunParams::defaults(&self.settings)
    }

    pub async fn run(&self, request: &EnhanceRequest) -> Result<Enhancement, PipelineError> {
        let issue = &request.issue;
        let query = format!(
            "{} {} {}",
            issue.title,
            request.notes,
            request.feedback.as_deref().unwrap_or("")
        );
        tracing::info!(
            issue_id = %issue.id,
            trigger = request.trigger.as_str(),
            model = %request.params.model,
            "Starting enhancement"
        );

        let research = self.research(&query, &request.params).await?;

        let prompt = match request.trigger {
            Trigger::Retry => synthesis::retry_prompt(
                &issue.title,
                &request.notes,
                request.previous.as_deref().unwrap_or(""),
                request.feedback.as_deref().unwrap_or(""),
                &research.context,
                &research.code,
            ),
            Trigger::Create | Trigger::Enhance => synthesis::enhance_prompt(
                &issue.title,
                &request.notes,
                &research.context,
                &research.code,
            ),
        };
        let output = self.synthesize(&request.params.model, &prompt).await?;
        let enhanced = EnhancedIssue::parse(&output, &issue.title)?;

        tracing::info!(
            issue_id = %issue.id,
            context_hits = research.context_hits,
            repo = research.repo.as_deref().unwrap_or("-"),
            "Enhancement complete"
        );
        Ok(Enhancement {
            issue: enhanced,
            context_hits: research.context_hits,
            repo: research.repo,
        })
    }

    /// Research `question` against the issue and return a markdown answer.
    pub async fn answer(
        &self,
        issue: &Issue,
        question: &str,
        params: &RunParams,
    ) -> Result<String, PipelineError> {
        let query = format!("{} {} {}", issue.title, markers::strip_markers(issue.description_text()), question);
        let research = self.research(&query, params).await?;
        let prompt = synthesis::ask_prompt(
            &issue.title,
            markers::strip_markers(issue.description_text()),
            question,
            &research.context,
            &research.code,
        );
        let output = self.synthesize(&params.model, &prompt).await?;
        let answer = output.trim();
        if answer.is_empty() {
            return Err(PipelineError::EmptyOutput {
                stage: Stage::Synthesis,
                reason: "model returned no answer".into(),
            });
        }
        Ok(answer.to_string())
    }

    async fn research(&self, query: &str, params: &RunParams) -> Result<Research, PipelineError> {
        let hits = staged(Stage::ContextResearch, self.settings.context_timeout, async {
            context::research(&self.corpus, query, params.max_context_records)
                .await
                .map_err(|e| PipelineError::failed(Stage::ContextResearch, e))
        })
        .await?;

        let (code, repo) = staged(
            Stage::CodeResearch,
            self.settings.code_timeout,
            self.code_research(query, params),
        )
        .await?;

        Ok(Research {
            context: context::render(&hits),
            context_hits: hits.len(),
            code,
            repo,
        })
    }

    async fn code_research(
        &self,
        query: &str,
        params: &RunParams,
    ) -> Result<(String, Option<String>), PipelineError> {
        let fail = |e: anyhow::Error| PipelineError::failed(Stage::CodeResearch, e);

        let named = match &params.repo {
            Some(reference) => Some(code::explicit_repo(reference).ok_or_else(|| {
                fail(anyhow::anyhow!("'{}' is not a repository reference", reference))
            })?),
            None => code::repo_mentioned_in(query),
        };

        let repo = match named {
            // A named repository is cloned even when discovery does not know it.
            Some(full_name) => match self.discovery.lookup(&full_name).await {
                Ok(meta) if meta.full_name.eq_ignore_ascii_case(&full_name) => meta,
                Ok(_) | Err(_) => code::bare_repo(&full_name),
            },
            None => {
                let keywords = context::keywords(query);
                let discovery_query = keywords
                    .iter()
                    .take(DISCOVERY_KEYWORDS)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" ");
                match self.discovery.lookup(&discovery_query).await {
                    Ok(meta) => meta,
                    Err(DiscoveryError::NoMatch(_)) => {
                        tracing::debug!(query = %discovery_query, "No repository matched");
                        return Ok(("No related repository was found.".to_string(), None));
                    }
                    Err(e) => return Err(fail(e.into())),
                }
            }
        };

        let checkout = self.workspace.checkout(&repo).await.map_err(fail)?;
        let root = checkout.path().to_path_buf();
        let keywords = context::keywords(query);
        let limit = self.settings.max_code_excerpts;
        let excerpts = tokio::task::spawn_blocking(move || {
            code::extract_excerpts(&root, &keywords, limit)
        })
        .await
        .map_err(|e| fail(e.into()))?
        .map_err(fail)?;

        // The working copy is removed when `checkout` drops.
        Ok((code::render(&checkout.repo, &excerpts), Some(repo.full_name)))
    }

    async fn synthesize(&self, model: &str, prompt: &str) -> Result<String, PipelineError> {
        staged(Stage::Synthesis, self.settings.synthesis_timeout, async {
            self.synthesizer
                .complete(model, prompt)
                .await
                .map_err(|e| PipelineError::failed(Stage::Synthesis, e))
        })
        .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory fakes shared by pipeline and router tests.

    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;
    use enhancer_common::RepoMetadata;

    use super::code::{Checkout, CodeWorkspace};
    use super::synthesis::Synthesizer;

    /// Checks out a fixed set of files regardless of repository.
    pub struct FixtureWorkspace {
        pub files: Vec<(&'static str, &'static str)>,
        pub checkouts: AtomicUsize,
    }

    impl FixtureWorkspace {
        pub fn new(files: Vec<(&'static str, &'static str)>) -> Self {
            Self {
                files,
                checkouts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CodeWorkspace for FixtureWorkspace {
        async fn checkout(&self, repo: &RepoMetadata) -> Result<Checkout> {
            self.checkouts.fetch_add(1, Ordering::SeqCst);
            let dir = tempfile::tempdir()?;
            let root = dir.path().join(repo.short_name());
            for (rel, content) in &self.files {
                let path = root.join(rel);
                std::fs::create_dir_all(path.parent().unwrap_or(Path::new(".")))?;
                std::fs::write(path, content)?;
            }
            std::fs::create_dir_all(&root)?;
            Ok(Checkout::new(dir, root, repo.clone()))
        }
    }

    /// Returns a canned reply and records every prompt it saw.
    pub struct ScriptedSynthesizer {
        pub reply: Result<String, String>,
        pub prompts: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedSynthesizer {
        pub fn replying(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                reply: Err(message.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn prompts(&self) -> Vec<(String, String)> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Synthesizer for ScriptedSynthesizer {
        async fn complete(&self, model: &str, prompt: &str) -> Result<String> {
            self.prompts
                .lock()
                .unwrap()
                .push((model.to_string(), prompt.to_string()));
            self.reply.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }
}
