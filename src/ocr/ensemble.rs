//! Multi-engine OCR ensemble.
//!
//! All configured engines run concurrently on a page. Their candidates are
//! grouped by overlap and each group is merged into one [`TextBlock`] by a
//! pluggable [`MergePolicy`]. Engines that fail or time out are excluded
//! for that page only; a page where every engine failed yields no blocks
//! and a page-level degradation instead of a job failure.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::RwLock;

use crate::config::{MergePolicyKind, OcrConfig};
use crate::models::{BoundingBox, Degradation, EngineContribution, Page, TextBlock};

use super::backend::{clamp_confidence, Candidate, EngineResult, OcrEngine, OcrError};

/// Tunables for reconciliation.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    pub iou_threshold: f32,
    pub agreement_bonus: f32,
}

impl From<&OcrConfig> for ReconcileSettings {
    fn from(config: &OcrConfig) -> Self {
        Self {
            iou_threshold: config.iou_threshold,
            agreement_bonus: config.agreement_bonus,
        }
    }
}

/// One candidate inside an overlap group.
#[derive(Debug, Clone, Copy)]
pub struct GroupMember<'a> {
    pub engine: &'a str,
    pub rank: usize,
    pub candidate: &'a Candidate,
}

/// Inputs a policy may consult besides the group itself.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    /// Historical agreement rate per engine name.
    pub agreement_rates: &'a HashMap<String, f32>,
    pub agreement_bonus: f32,
}

impl MergeContext<'_> {
    fn rate(&self, engine: &str) -> f32 {
        self.agreement_rates
            .get(engine)
            .copied()
            .unwrap_or(AgreementTracker::PRIOR)
    }
}

/// Output of merging one group.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedBlock {
    pub bbox: BoundingBox,
    pub text: String,
    pub confidence: f32,
    pub contributions: Vec<EngineContribution>,
}

/// Strategy for turning a group of overlapping candidates into one block.
pub trait MergePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `group` is never empty and holds at most one candidate per engine.
    fn merge(&self, group: &[GroupMember<'_>], ctx: &MergeContext<'_>) -> MergedBlock;
}

/// Build the configured merge policy.
pub fn policy_for(kind: MergePolicyKind) -> Arc<dyn MergePolicy> {
    match kind {
        MergePolicyKind::WeightedVote => Arc::new(WeightedVotePolicy),
        MergePolicyKind::HighestConfidence => Arc::new(HighestConfidencePolicy),
    }
}

/// Collapse runs of whitespace so "INVOICE  #123" and "INVOICE #123" vote together.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Confidence-weighted plurality vote.
///
/// Each distinct (normalized) text collects the confidence of the engines
/// that read it; the heaviest text wins. Ties go to the text backed by the
/// engine with the best agreement history, then to the earliest configured
/// engine. When two or more engines agree, the merged confidence is lifted
/// above the most confident agreeing engine.
pub struct WeightedVotePolicy;

impl MergePolicy for WeightedVotePolicy {
    fn name(&self) -> &'static str {
        "weighted_vote"
    }

    fn merge(&self, group: &[GroupMember<'_>], ctx: &MergeContext<'_>) -> MergedBlock {
        struct Tally {
            text: String,
            weight: f32,
            best_rate: f32,
            best_rank: usize,
        }

        let normalized: Vec<String> = group
            .iter()
            .map(|m| normalize_text(&m.candidate.text))
            .collect();

        let mut tallies: Vec<Tally> = Vec::new();
        for (member, text) in group.iter().zip(&normalized) {
            let rate = ctx.rate(member.engine);
            match tallies.iter_mut().find(|t| &t.text == text) {
                Some(tally) => {
                    tally.weight += member.candidate.confidence;
                    tally.best_rate = tally.best_rate.max(rate);
                    tally.best_rank = tally.best_rank.min(member.rank);
                }
                None => tallies.push(Tally {
                    text: text.clone(),
                    weight: member.candidate.confidence,
                    best_rate: rate,
                    best_rank: member.rank,
                }),
            }
        }

        let winner = tallies
            .iter()
            .max_by(|a, b| {
                weight_cmp(a.weight, b.weight)
                    .then_with(|| a.best_rate.total_cmp(&b.best_rate))
                    .then_with(|| b.best_rank.cmp(&a.best_rank))
            })
            .map(|t| t.text.clone())
            .unwrap_or_default();

        let agreeing: Vec<&GroupMember<'_>> = group
            .iter()
            .zip(&normalized)
            .filter(|(_, text)| **text == winner)
            .map(|(m, _)| m)
            .collect();

        let mean = weighted_mean_confidence(group.iter().map(|m| m.candidate.confidence));
        let confidence = if agreeing.len() >= 2 {
            let max_agree = agreeing
                .iter()
                .map(|m| m.candidate.confidence)
                .fold(0.0f32, f32::max);
            let bonus = ctx.agreement_bonus.max(0.0);
            let boosted = mean + bonus * (agreeing.len() - 1) as f32;
            let floor = max_agree + (1.0 - max_agree) * bonus;
            boosted.max(floor).min(1.0)
        } else {
            mean
        };

        MergedBlock {
            bbox: weighted_bbox(agreeing.iter().map(|m| (m.candidate.bbox, m.candidate.confidence))),
            text: winner.clone(),
            confidence,
            contributions: contributions(group, &normalized, &winner),
        }
    }
}

/// Keep the single most confident candidate of each group.
pub struct HighestConfidencePolicy;

impl MergePolicy for HighestConfidencePolicy {
    fn name(&self) -> &'static str {
        "highest_confidence"
    }

    fn merge(&self, group: &[GroupMember<'_>], ctx: &MergeContext<'_>) -> MergedBlock {
        let normalized: Vec<String> = group
            .iter()
            .map(|m| normalize_text(&m.candidate.text))
            .collect();
        let best = group
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                weight_cmp(a.candidate.confidence, b.candidate.confidence)
                    .then_with(|| ctx.rate(a.engine).total_cmp(&ctx.rate(b.engine)))
                    .then_with(|| b.rank.cmp(&a.rank))
            })
            .map(|(i, m)| (i, *m));

        match best {
            Some((index, member)) => {
                let text = normalized[index].clone();
                MergedBlock {
                    bbox: member.candidate.bbox,
                    text: text.clone(),
                    confidence: member.candidate.confidence,
                    contributions: contributions(group, &normalized, &text),
                }
            }
            None => MergedBlock {
                bbox: BoundingBox::new(0.0, 0.0, 0.0, 0.0),
                text: String::new(),
                confidence: 0.0,
                contributions: Vec::new(),
            },
        }
    }
}

/// Compare weights treating near-equal sums as ties.
fn weight_cmp(a: f32, b: f32) -> std::cmp::Ordering {
    if (a - b).abs() <= 1e-6 {
        std::cmp::Ordering::Equal
    } else {
        a.total_cmp(&b)
    }
}

/// Confidence-weighted mean of confidences: sum(c^2) / sum(c).
fn weighted_mean_confidence(confidences: impl Iterator<Item = f32>) -> f32 {
    let (sq, sum) = confidences.fold((0.0f32, 0.0f32), |(sq, sum), c| (sq + c * c, sum + c));
    if sum <= 0.0 {
        0.0
    } else {
        sq / sum
    }
}

fn weighted_bbox(boxes: impl Iterator<Item = (BoundingBox, f32)>) -> BoundingBox {
    let items: Vec<(BoundingBox, f32)> = boxes.collect();
    let total: f32 = items.iter().map(|(_, c)| *c).sum();
    let count = items.len().max(1) as f32;
    let weight = |c: f32| if total > 0.0 { c / total } else { 1.0 / count };
    let mut acc = [0.0f32; 4];
    for (b, c) in &items {
        let w = weight(*c);
        acc[0] += b.x * w;
        acc[1] += b.y * w;
        acc[2] += b.width * w;
        acc[3] += b.height * w;
    }
    BoundingBox::new(acc[0], acc[1], acc[2], acc[3])
}

fn contributions(
    group: &[GroupMember<'_>],
    normalized: &[String],
    chosen: &str,
) -> Vec<EngineContribution> {
    group
        .iter()
        .zip(normalized)
        .map(|(m, text)| EngineContribution {
            engine: m.engine.to_string(),
            text: m.candidate.text.clone(),
            confidence: m.candidate.confidence,
            agreed: text == chosen,
        })
        .collect()
}

/// Merge all engines' candidates for one page into text blocks.
///
/// Pure: the same inputs always give the same blocks. Candidates are
/// visited most-confident first; each unvisited candidate seeds a group and
/// pulls in, from every other engine, the unvisited candidate with the
/// highest IoU at or above the threshold. Candidates that overlap nothing
/// pass through alone. Blocks come back in reading order with `id` unset
/// (zero); the caller numbers them across the document.
pub fn reconcile(
    page: usize,
    results: &[EngineResult],
    policy: &dyn MergePolicy,
    settings: &ReconcileSettings,
    agreement_rates: &HashMap<String, f32>,
) -> Vec<TextBlock> {
    // Candidate fields are public, so an engine may hand back any float.
    let sanitized: Vec<(&EngineResult, Vec<Candidate>)> = results
        .iter()
        .map(|r| {
            let candidates = r
                .candidates
                .iter()
                .filter(|c| !c.text.trim().is_empty())
                .map(|c| Candidate {
                    confidence: clamp_confidence(c.confidence),
                    ..c.clone()
                })
                .collect();
            (r, candidates)
        })
        .collect();
    let mut members: Vec<GroupMember<'_>> = sanitized
        .iter()
        .flat_map(|(r, candidates)| {
            candidates.iter().map(move |c| GroupMember {
                engine: r.engine.as_str(),
                rank: r.rank,
                candidate: c,
            })
        })
        .collect();
    // Stable sort keeps engine order, then candidate order, among equals.
    members.sort_by(|a, b| b.candidate.confidence.total_cmp(&a.candidate.confidence));

    let ctx = MergeContext {
        agreement_rates,
        agreement_bonus: settings.agreement_bonus,
    };

    let mut used = vec![false; members.len()];
    let mut blocks = Vec::new();
    for seed in 0..members.len() {
        if used[seed] {
            continue;
        }
        used[seed] = true;
        let mut group = vec![members[seed]];
        let seed_box = members[seed].candidate.bbox;

        let mut partners: HashMap<&str, (usize, f32)> = HashMap::new();
        for (i, other) in members.iter().enumerate() {
            if used[i] || other.engine == members[seed].engine {
                continue;
            }
            let iou = seed_box.iou(&other.candidate.bbox);
            if iou < settings.iou_threshold || iou <= 0.0 {
                continue;
            }
            let best = partners.entry(other.engine).or_insert((i, iou));
            if iou > best.1 {
                *best = (i, iou);
            }
        }
        let mut picked: Vec<usize> = partners.into_values().map(|(i, _)| i).collect();
        picked.sort_by_key(|&i| members[i].rank);
        for i in picked {
            used[i] = true;
            group.push(members[i]);
        }
        group.sort_by_key(|m| m.rank);

        let merged = policy.merge(&group, &ctx);
        if merged.text.is_empty() {
            continue;
        }
        blocks.push(TextBlock {
            id: 0,
            page,
            bbox: merged.bbox,
            text: merged.text,
            ocr_confidence: merged.confidence,
            contributions: merged.contributions,
        });
    }

    blocks.sort_by(|a, b| {
        a.bbox
            .y
            .total_cmp(&b.bbox.y)
            .then_with(|| a.bbox.x.total_cmp(&b.bbox.x))
    });
    blocks
}

/// Per-engine agreement history, used to break voting ties.
///
/// Only groups read by two or more engines count: an engine "agrees" when
/// its text matched the chosen text.
#[derive(Debug, Default)]
pub struct AgreementTracker {
    counts: RwLock<HashMap<String, (u64, u64)>>,
}

impl AgreementTracker {
    /// Rate assumed for an engine with no history.
    pub const PRIOR: f32 = 0.5;

    pub fn new() -> Self {
        Self::default()
    }

    /// Smoothed agreement rate per engine.
    pub async fn snapshot(&self) -> HashMap<String, f32> {
        let counts = self.counts.read().await;
        counts
            .iter()
            .map(|(engine, (agreed, total))| {
                (
                    engine.clone(),
                    (*agreed as f32 + 1.0) / (*total as f32 + 2.0),
                )
            })
            .collect()
    }

    pub async fn observe(&self, blocks: &[TextBlock]) {
        let mut counts = self.counts.write().await;
        for block in blocks.iter().filter(|b| b.contributions.len() >= 2) {
            for contribution in &block.contributions {
                let entry = counts.entry(contribution.engine.clone()).or_insert((0, 0));
                entry.1 += 1;
                if contribution.agreed {
                    entry.0 += 1;
                }
            }
        }
    }
}

/// An engine plus the per-page time it is allowed.
#[derive(Clone)]
pub struct EnsembleMember {
    pub engine: Arc<dyn OcrEngine>,
    pub timeout: Duration,
}

/// What the engines produced for one page.
#[derive(Debug, Default)]
pub struct PageRecognition {
    pub results: Vec<EngineResult>,
    pub degradations: Vec<Degradation>,
}

/// Run every engine on `page` concurrently, each under its own timeout.
pub async fn run_engines_on_page(page: &Page, members: &[EnsembleMember]) -> PageRecognition {
    let runs = members.iter().enumerate().map(|(rank, member)| async move {
        let name = member.engine.name().to_string();
        let outcome = match tokio::time::timeout(member.timeout, member.engine.recognize(page)).await
        {
            Ok(result) => result,
            Err(_) => Err(OcrError::Timeout {
                engine: name.clone(),
                secs: member.timeout.as_secs(),
            }),
        };
        (rank, name, outcome)
    });

    let mut recognition = PageRecognition::default();
    let mut failed = Vec::new();
    for (rank, engine, outcome) in join_all(runs).await {
        match outcome {
            Ok(candidates) => recognition.results.push(EngineResult {
                engine,
                rank,
                candidates,
            }),
            Err(e) => {
                tracing::warn!(page = page.index, engine = %engine, "OCR engine failed: {}", e);
                recognition.degradations.push(Degradation::EngineUnavailable {
                    page: page.index,
                    engine: engine.clone(),
                    reason: e.to_string(),
                });
                failed.push(engine);
            }
        }
    }

    if recognition.results.is_empty() && !members.is_empty() {
        recognition.degradations.push(Degradation::AllEnginesFailed {
            page: page.index,
            engines: failed,
        });
    }
    recognition
}

/// Configured engines, merge policy and shared agreement history.
pub struct OcrEnsemble {
    members: Vec<EnsembleMember>,
    policy: Arc<dyn MergePolicy>,
    settings: ReconcileSettings,
    tracker: AgreementTracker,
}

impl OcrEnsemble {
    pub fn new(
        members: Vec<EnsembleMember>,
        policy: Arc<dyn MergePolicy>,
        settings: ReconcileSettings,
    ) -> Self {
        let mut seen = HashSet::new();
        let members = members
            .into_iter()
            .filter(|m| {
                let fresh = seen.insert(m.engine.name().to_string());
                if !fresh {
                    tracing::warn!("Ignoring duplicate OCR engine '{}'", m.engine.name());
                }
                fresh
            })
            .collect();
        Self {
            members,
            policy,
            settings,
            tracker: AgreementTracker::new(),
        }
    }

    /// Pair engines with their timeouts from configuration.
    ///
    /// Engines with no matching entry get the default engine timeout.
    pub fn from_config(engines: Vec<Arc<dyn OcrEngine>>, config: &OcrConfig) -> Self {
        let members = engines
            .into_iter()
            .map(|engine| {
                let timeout = config
                    .engines
                    .iter()
                    .find(|e| e.name == engine.name())
                    .map(|e| config.engine_timeout(e))
                    .unwrap_or(Duration::from_secs(config.engine_timeout_secs));
                EnsembleMember { engine, timeout }
            })
            .collect();
        Self::new(members, policy_for(config.merge_policy), config.into())
    }

    pub fn members(&self) -> &[EnsembleMember] {
        &self.members
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn tracker(&self) -> &AgreementTracker {
        &self.tracker
    }

    /// Recognize and reconcile one page.
    pub async fn process_page(&self, page: &Page) -> (Vec<TextBlock>, Vec<Degradation>) {
        let recognition = run_engines_on_page(page, &self.members).await;
        let rates = self.tracker.snapshot().await;
        let blocks = reconcile(
            page.index,
            &recognition.results,
            self.policy.as_ref(),
            &self.settings,
            &rates,
        );
        self.tracker.observe(&blocks).await;
        (blocks, recognition.degradations)
    }
}
