//! Turns webhook events into enhancement runs.
//!
//! Every issue is either idle (absent from the registry) or has exactly one
//! run in flight. While a run is in flight a `/retry` waits in a single
//! pending slot; a newer retry takes the slot from an older one that has not
//! started. When a run finishes, the pending retry starts, or the issue goes
//! back to idle. Runs execute on their own task so a panic inside one is
//! reported as a failure and never leaves the issue stuck.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use super::directive::{self, Command, Directive};
use super::events::{CommentCreated, IssueCreated, LinearEvent};
use crate::config::PipelineConfig;
use crate::enhance::markers;
use crate::enhance::{EnhanceRequest, Enhancement, EnhancementPipeline, RunParams, Trigger};
use crate::sync::SyncOrchestrator;
use crate::tracker::{Issue, IssueTracker};

#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Descriptions longer than this are left alone on create.
    pub minimal_description_chars: usize,
    pub create_dedupe: Duration,
}

impl From<&PipelineConfig> for RouterSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            minimal_description_chars: config.minimal_description_chars,
            create_dedupe: Duration::from_secs(config.create_dedupe_minutes * 60),
        }
    }
}

/// What the router did with an event. Serialized as the webhook response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Disposition {
    Queued { action: &'static str, issue_id: String },
    Completed { action: &'static str, issue_id: String },
    Skipped { issue_id: String, reason: String },
    Ignored { reason: String },
}

#[derive(Debug, Clone)]
enum Job {
    Create,
    Enhance {
        params: RunParams,
        reply_to: Option<String>,
    },
    Retry {
        params: RunParams,
        feedback: String,
        reply_to: Option<String>,
    },
}

impl Job {
    fn trigger(&self) -> Trigger {
        match self {
            Self::Create => Trigger::Create,
            Self::Enhance { .. } => Trigger::Enhance,
            Self::Retry { .. } => Trigger::Retry,
        }
    }

    fn reply_to(&self) -> Option<&str> {
        match self {
            Self::Create => None,
            Self::Enhance { reply_to, .. } | Self::Retry { reply_to, .. } => reply_to.as_deref(),
        }
    }
}

struct InFlight {
    run_id: Uuid,
    trigger: Trigger,
    started_at: Instant,
    pending: Option<Job>,
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, InFlight>,
    recent_creates: HashMap<String, Instant>,
}

/// A point-in-time view of one in-flight issue.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    pub issue_id: String,
    pub run_id: String,
    pub trigger: &'static str,
    pub running_secs: u64,
    pub retry_pending: bool,
}

pub struct EventRouter {
    tracker: Arc<dyn IssueTracker>,
    pipeline: Arc<EnhancementPipeline>,
    sync: Option<Arc<SyncOrchestrator>>,
    settings: RouterSettings,
    registry: Mutex<Registry>,
}

impl EventRouter {
    pub fn new(
        tracker: Arc<dyn IssueTracker>,
        pipeline: Arc<EnhancementPipeline>,
        sync: Option<Arc<SyncOrchestrator>>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            tracker,
            pipeline,
            sync,
            settings,
            registry: Mutex::new(Registry::default()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_busy(&self, issue_id: &str) -> bool {
        self.registry().active.contains_key(issue_id)
    }

    pub fn active_runs(&self) -> Vec<ActiveRun> {
        let registry = self.registry();
        let mut runs: Vec<_> = registry
            .active
            .iter()
            .map(|(id, run)| ActiveRun {
                issue_id: id.clone(),
                run_id: run.run_id.to_string(),
                trigger: run.trigger.as_str(),
                running_secs: run.started_at.elapsed().as_secs(),
                retry_pending: run.pending.is_some(),
            })
            .collect();
        runs.sort_by(|a, b| a.issue_id.cmp(&b.issue_id));
        runs
    }

    /// Wait until no issue has a run in flight. Returns `false` on timeout.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.registry().active.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn handle(self: &Arc<Self>, event: LinearEvent) -> Disposition {
        match event {
            LinearEvent::IssueCreated(created) => self.on_issue_created(created),
            LinearEvent::CommentCreated(comment) => self.on_comment(comment).await,
            LinearEvent::Ignored(kind) => Disposition::Ignored {
                reason: format!("unhandled event {}", kind),
            },
        }
    }

    fn on_issue_created(self: &Arc<Self>, created: IssueCreated) -> Disposition {
        let issue_id = created.issue_id;
        let skip = |reason: &str| {
            tracing::info!(issue_id = %issue_id, reason, "Skipping created issue");
            Disposition::Skipped {
                issue_id: issue_id.clone(),
                reason: reason.to_string(),
            }
        };

        if markers::is_enhanced(&created.description) {
            return skip("already enhanced");
        }
        if created.description.chars().count() > self.settings.minimal_description_chars {
            return skip("issue already has a substantial description");
        }

        {
            let mut registry = self.registry();
            let window = self.settings.create_dedupe;
            registry
                .recent_creates
                .retain(|_, seen| seen.elapsed() < window);
            if registry.recent_creates.contains_key(&issue_id) {
                return skip("recently processed");
            }
            if registry.active.contains_key(&issue_id) {
                return skip("enhancement already in progress");
            }
            registry
                .recent_creates
                .insert(issue_id.clone(), Instant::now());
            registry.active.insert(issue_id.clone(), in_flight(Trigger::Create));
        }

        tracing::info!(issue_id = %issue_id, identifier = %created.identifier, "Queuing enhancement for new issue");
        self.start(issue_id.clone(), Job::Create);
        Disposition::Queued {
            action: "enhance",
            issue_id,
        }
    }

    async fn on_comment(self: &Arc<Self>, comment: CommentCreated) -> Disposition {
        let Some(directive) = directive::parse_directive(&comment.body) else {
            return Disposition::Ignored {
                reason: "comment is not a command".to_string(),
            };
        };
        let issue_id = comment.issue_id.clone();
        let reply_to = comment.reply_target().map(str::to_string);
        tracing::info!(
            issue_id = %issue_id,
            command = directive.command.name(),
            author = %comment.author,
            "Command received"
        );

        match directive.command {
            Command::Help => {
                if let Err(e) = self
                    .tracker
                    .post_comment(&issue_id, &directive::help_text(), reply_to.as_deref())
                    .await
                {
                    tracing::warn!(issue_id = %issue_id, error = %format!("{:#}", e), "Failed to post help");
                }
                Disposition::Completed {
                    action: "help",
                    issue_id,
                }
            }
            Command::Ask => {
                let router = Arc::clone(self);
                let params = self.params_for(&directive);
                let author = comment.author.clone();
                tokio::spawn(async move {
                    router
                        .answer(&issue_id, &directive.text, &author, &params, reply_to.as_deref())
                        .await;
                });
                Disposition::Queued {
                    action: "ask",
                    issue_id: comment.issue_id,
                }
            }
            Command::Enhance => {
                let job = Job::Enhance {
                    params: self.params_for(&directive),
                    reply_to,
                };
                {
                    let mut registry = self.registry();
                    if registry.active.contains_key(&issue_id) {
                        return Disposition::Skipped {
                            issue_id,
                            reason: "enhancement already in progress".to_string(),
                        };
                    }
                    registry.active.insert(issue_id.clone(), in_flight(Trigger::Enhance));
                }
                self.start(issue_id.clone(), job);
                Disposition::Queued {
                    action: "enhance",
                    issue_id,
                }
            }
            Command::Retry => {
                let job = Job::Retry {
                    params: self.params_for(&directive),
                    feedback: directive.text.clone(),
                    reply_to,
                };
                let start_now = {
                    let mut registry = self.registry();
                    match registry.active.get_mut(&issue_id) {
                        Some(run) => {
                            if run.pending.replace(job.clone()).is_some() {
                                tracing::info!(issue_id = %issue_id, "Newer retry replaced a pending one");
                            } else {
                                tracing::info!(issue_id = %issue_id, "Retry queued behind running enhancement");
                            }
                            false
                        }
                        None => {
                            registry.active.insert(issue_id.clone(), in_flight(Trigger::Retry));
                            true
                        }
                    }
                };
                if start_now {
                    self.start(issue_id.clone(), job);
                }
                Disposition::Queued {
                    action: "retry",
                    issue_id,
                }
            }
        }
    }

    fn params_for(&self, directive: &Directive) -> RunParams {
        if directive.dropped_block {
            tracing::warn!("Ignoring malformed override block");
        }
        let overrides: &BTreeMap<String, String> = &directive.overrides;
        self.pipeline.default_params().with_overrides(overrides)
    }

    /// Drive `job` and any retries queued behind it. The caller has already
    /// marked the issue in flight.
    fn start(self: &Arc<Self>, issue_id: String, job: Job) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut job = job;
            loop {
                let runner = Arc::clone(&router);
                let id = issue_id.clone();
                let current = job.clone();
                let run_id = router
                    .registry()
                    .active
                    .get(&issue_id)
                    .map(|run| run.run_id.to_string())
                    .unwrap_or_default();
                let span = tracing::info_span!(
                    "enhancement",
                    issue_id = %issue_id,
                    run_id = %run_id,
                    trigger = current.trigger().as_str()
                );
                let task = async move { runner.run_job(&id, current).await }.instrument(span);
                if let Err(e) = tokio::spawn(task).await {
                    tracing::error!(issue_id = %issue_id, error = %e, "Enhancement task aborted");
                    router
                        .notify(&issue_id, "_Enhancement failed unexpectedly. Please check server logs._", job.reply_to())
                        .await;
                }

                let next = {
                    let mut registry = router.registry();
                    match registry.active.get_mut(&issue_id) {
                        Some(run) => match run.pending.take() {
                            Some(next) => {
                                run.run_id = Uuid::new_v4();
                                run.trigger = next.trigger();
                                run.started_at = Instant::now();
                                Some(next)
                            }
                            None => {
                                registry.active.remove(&issue_id);
                                None
                            }
                        },
                        None => None,
                    }
                };
                match next {
                    Some(next) => {
                        tracing::info!(issue_id = %issue_id, "Starting queued retry");
                        job = next;
                    }
                    None => break,
                }
            }
        });
    }

    async fn refresh_corpus(&self) {
        if let Some(sync) = &self.sync {
            if let Some(report) = sync.sync_if_stale().await {
                tracing::info!(written = report.total_written(), "Refreshed corpus before enhancement");
            }
        }
    }

    async fn run_job(&self, issue_id: &str, job: Job) {
        let reply_to = job.reply_to().map(str::to_string);
        let reply_to = reply_to.as_deref();

        if let Job::Retry { .. } = job {
            self.notify(issue_id, "_Retrying enhancement with your feedback..._", reply_to)
                .await;
        }

        let issue = match self.tracker.get_issue(issue_id).await {
            Ok(issue) => issue,
            Err(e) => {
                tracing::error!(issue_id, error = %format!("{:#}", e), "Failed to fetch issue");
                self.notify(issue_id, &format!("_Could not fetch issue data: {}_", e), reply_to)
                    .await;
                return;
            }
        };
        let current = issue.description_text().to_string();

        let request = match job {
            Job::Create | Job::Enhance { .. } if markers::is_enhanced(&current) => {
                tracing::info!(issue_id, "Issue is already enhanced");
                if let Job::Enhance { .. } = job {
                    self.notify(
                        issue_id,
                        "_This issue has already been enhanced. Use `/retry` to re-enhance with feedback._",
                        reply_to,
                    )
                    .await;
                }
                return;
            }
            Job::Create => self.request(issue, Trigger::Create, current, None, None, None),
            Job::Enhance { params, .. } => {
                self.request(issue, Trigger::Enhance, current, None, None, Some(params))
            }
            Job::Retry {
                params, feedback, ..
            } => {
                let notes = markers::extract_original(&current).unwrap_or_else(|| {
                    if markers::is_enhanced(&current) {
                        String::new()
                    } else {
                        current.clone()
                    }
                });
                let previous = markers::is_enhanced(&current)
                    .then(|| markers::strip_markers(&current).to_string());
                let feedback = (!feedback.is_empty()).then_some(feedback);
                self.request(issue, Trigger::Retry, notes, previous, feedback, Some(params))
            }
        };

        self.refresh_corpus().await;

        match self.pipeline.run(&request).await {
            Ok(enhancement) => self.write_back(&request, enhancement, reply_to).await,
            Err(e) => {
                tracing::error!(issue_id, stage = %e.stage(), error = %e, "Enhancement failed");
                self.notify(
                    issue_id,
                    &format!("_Enhancement failed during {}. Please check server logs for details._", e.stage()),
                    reply_to,
                )
                .await;
            }
        }
    }

    fn request(
        &self,
        issue: Issue,
        trigger: Trigger,
        notes: String,
        previous: Option<String>,
        feedback: Option<String>,
        params: Option<RunParams>,
    ) -> EnhanceRequest {
        EnhanceRequest {
            issue,
            trigger,
            notes,
            previous,
            feedback,
            params: params.unwrap_or_else(|| self.pipeline.default_params()),
        }
    }

    async fn write_back(&self, request: &EnhanceRequest, enhancement: Enhancement, reply_to: Option<&str>) {
        let issue_id = request.issue.id.as_str();
        let body = markers::with_markers(&enhancement.issue.description, &request.notes);
        if let Err(e) = self.tracker.update_description(issue_id, &body).await {
            tracing::error!(issue_id, error = %format!("{:#}", e), "Failed to update description");
            self.notify(issue_id, "_Enhancement finished but the description could not be updated._", reply_to)
                .await;
            return;
        }
        tracing::info!(issue_id, trigger = request.trigger.as_str(), "Description updated");

        let mut note = match request.trigger {
            Trigger::Retry => "_Enhancement updated based on your feedback._".to_string(),
            Trigger::Create | Trigger::Enhance => {
                "_This issue was automatically enhanced with context from chat, documents, email and code._"
                    .to_string()
            }
        };
        if let Some(repo) = &enhancement.repo {
            note.push_str(&format!("\n\nRepository: `{}`", repo));
        }
        if enhancement.issue.title != request.issue.title {
            note.push_str(&format!("\n\nSuggested title: **{}**", enhancement.issue.title));
        }
        self.notify(issue_id, &note, reply_to).await;
    }

    async fn answer(
        &self,
        issue_id: &str,
        question: &str,
        author: &str,
        params: &RunParams,
        reply_to: Option<&str>,
    ) {
        if question.trim().is_empty() {
            self.notify(issue_id, "_Usage: `/ask <question>`_", reply_to).await;
            return;
        }
        self.notify(issue_id, "_Researching your question..._", reply_to).await;
        let issue = match self.tracker.get_issue(issue_id).await {
            Ok(issue) => issue,
            Err(e) => {
                tracing::error!(issue_id, error = %format!("{:#}", e), "Failed to fetch issue");
                self.notify(issue_id, "_Failed to fetch issue data._", reply_to).await;
                return;
            }
        };
        self.refresh_corpus().await;
        match self.pipeline.answer(&issue, question, params).await {
            Ok(answer) => {
                let body = if author.is_empty() {
                    answer
                } else {
                    format!("@{}\n\n{}", author, answer)
                };
                self.notify(issue_id, &body, reply_to).await;
            }
            Err(e) => {
                tracing::error!(issue_id, stage = %e.stage(), error = %e, "Answer failed");
                self.notify(issue_id, "_Failed to answer question. Please check server logs for details._", reply_to)
                    .await;
            }
        }
    }

    /// Post a comment; failures are logged, never propagated.
    async fn notify(&self, issue_id: &str, text: &str, reply_to: Option<&str>) {
        if let Err(e) = self.tracker.post_comment(issue_id, text, reply_to).await {
            tracing::warn!(issue_id, error = %format!("{:#}", e), "Failed to post comment");
        }
    }
}

fn in_flight(trigger: Trigger) -> InFlight {
    InFlight {
        run_id: Uuid::new_v4(),
        trigger,
        started_at: Instant::now(),
        pending: None,
    }
}
