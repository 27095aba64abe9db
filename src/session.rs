use crate::config::Config;
use crate::extractor::{ContentExtractor, ExtractLimits, HeaderMap};
use crate::policy::PolicyEvaluator;
use crate::scanner::{ScanClient, ScanFinding, Scanner};
use anyhow::Context as _;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Process-wide, read-only context shared by every session.
pub struct Gateway {
    scanner: Arc<dyn Scanner>,
    policy: PolicyEvaluator,
    max_message_size: usize,
    active_mode: bool,
    limits: ExtractLimits,
    quarantine_reason: String,
}

impl Gateway {
    /// Build the HTTP scan client and compile the policy. Fails if the
    /// expression does not compile or does not yield a bool.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let policy = PolicyEvaluator::compile(&config.quarantine_expression)
            .with_context(|| format!("invalid quarantine_expression '{}'", config.quarantine_expression))?;
        let scanner = ScanClient::from_config(config)?;
        Ok(Self::new(Arc::new(scanner), policy, config))
    }

    pub fn new(scanner: Arc<dyn Scanner>, policy: PolicyEvaluator, config: &Config) -> Self {
        Gateway {
            scanner,
            policy,
            max_message_size: config.max_message_size,
            active_mode: config.active_mode,
            limits: ExtractLimits {
                max_depth: config.max_nesting_depth,
                max_parts: config.max_parts,
            },
            quarantine_reason: config.quarantine_reason.clone(),
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn active_mode(&self) -> bool {
        self.active_mode
    }
}

/// The transport's side-effecting quarantine action.
#[async_trait]
pub trait QuarantineSink: Send + Sync {
    async fn quarantine(&self, reason: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Accumulating,
    Extracting,
    Scanning,
    Deciding,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Continue,
    SizeExceeded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QuarantineVerdict {
    pub should_quarantine: bool,
    pub findings_count: usize,
    pub quarantine_applied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Body grew past the size guard; passed through unscanned.
    SizeExceeded,
    /// Extraction hit a fatal error; passed through unscanned.
    ExtractionFailed(String),
    Scanned(QuarantineVerdict),
}

#[derive(Debug)]
struct SessionState {
    from: String,
    rcpt_to: Vec<String>,
    raw: Vec<u8>,
    headers: HeaderMap,
    size_exceeded: bool,
    phase: Phase,
}

/// Per-message state. All mutation goes through one async mutex, held for
/// the whole end-of-body sequence.
pub struct Session {
    trace_id: String,
    started: Instant,
    state: Mutex<SessionState>,
}

#[derive(Serialize)]
struct FindingAudit<'a> {
    trace_id: &'a str,
    from: &'a str,
    rcpt_to: String,
    unit: &'a str,
    filename: &'a str,
    level: &'a str,
    module: &'a str,
    message: &'a str,
    score: i64,
    subscores: Vec<i64>,
    policy_match: bool,
    finding: &'a ScanFinding,
}

#[derive(Serialize)]
struct MessageAudit<'a> {
    trace_id: &'a str,
    from: &'a str,
    rcpt_to: String,
    outcome: &'static str,
    duration_ms: u128,
    size: usize,
    unit_count: usize,
    findings_count: usize,
    quarantine: bool,
    quarantined: bool,
}

fn to_json<T: Serialize>(record: &T) -> String {
    serde_json::to_string(record).unwrap_or_else(|e| format!("{{\"audit_error\":\"{e}\"}}"))
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::with_trace_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_trace_id(trace_id: String) -> Self {
        Session {
            trace_id,
            started: Instant::now(),
            state: Mutex::new(SessionState {
                from: String::new(),
                rcpt_to: Vec::new(),
                raw: Vec::new(),
                headers: HeaderMap::new(),
                size_exceeded: false,
                phase: Phase::Idle,
            }),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    pub async fn set_from(&self, from: &str) {
        if from.is_empty() {
            log::warn!("[{}] Empty 'from'", self.trace_id);
            return;
        }
        log::debug!("[{}] MailFrom: {}", self.trace_id, from);
        self.state.lock().await.from = from.to_string();
    }

    pub async fn add_recipient(&self, rcpt: &str) {
        let mut state = self.state.lock().await;
        if rcpt.is_empty() {
            log::warn!("[{}] Empty 'rcptTo' (from {})", self.trace_id, state.from);
            return;
        }
        log::debug!("[{}] RcptTo: {}", self.trace_id, rcpt);
        state.rcpt_to.push(rcpt.to_string());
    }

    pub async fn add_header(&self, name: &str, value: &str) {
        log::debug!("[{}] header: {}: {}", self.trace_id, name, value);
        self.state
            .lock()
            .await
            .headers
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
    }

    /// Append a body chunk unless that would push the body past `max_size`.
    /// Once the guard trips it stays tripped for this message.
    pub async fn append_body(&self, chunk: &[u8], max_size: usize) -> ChunkStatus {
        let mut state = self.state.lock().await;
        if state.size_exceeded {
            return ChunkStatus::SizeExceeded;
        }
        if state.phase == Phase::Idle {
            state.phase = Phase::Accumulating;
        }
        if state.raw.len() + chunk.len() > max_size {
            state.size_exceeded = true;
            log::warn!(
                "[{}] filesize limit ({}) was exceeded - skip (from {}, rcptTo {})",
                self.trace_id,
                max_size,
                state.from,
                state.rcpt_to.join(",")
            );
            return ChunkStatus::SizeExceeded;
        }
        state.raw.extend_from_slice(chunk);
        ChunkStatus::Continue
    }

    pub async fn size_exceeded(&self) -> bool {
        self.state.lock().await.size_exceeded
    }

    pub async fn body_len(&self) -> usize {
        self.state.lock().await.raw.len()
    }

    /// End of body: extract, scan, decide, report.
    pub async fn finish(&self, gateway: &Gateway, sink: &dyn QuarantineSink) -> Outcome {
        let mut state = self.state.lock().await;
        let rcpt_to = state.rcpt_to.join(",");

        if state.size_exceeded {
            state.phase = Phase::Done;
            self.audit_message(&state, &rcpt_to, "size_exceeded", 0, QuarantineVerdict::default());
            return Outcome::SizeExceeded;
        }

        state.phase = Phase::Extracting;
        let extraction = ContentExtractor::new(&self.trace_id, gateway.limits)
            .extract(&state.headers, &state.raw);
        if let Some(error) = extraction.fatal_error() {
            log::error!(
                "[{}] error parsing mail (from {}, rcptTo {}): {}",
                self.trace_id,
                state.from,
                rcpt_to,
                error
            );
            state.phase = Phase::Done;
            self.audit_message(
                &state,
                &rcpt_to,
                "extraction_failed",
                extraction.len(),
                QuarantineVerdict::default(),
            );
            return Outcome::ExtractionFailed(error.to_string());
        }

        log::debug!("[{}] Got {} files", self.trace_id, extraction.len());
        for unit in &extraction.units {
            log::debug!("[{}] {} {}", self.trace_id, unit.name, unit.bytes.len());
        }

        state.phase = Phase::Scanning;
        let mut findings: Vec<(&str, ScanFinding)> = Vec::new();
        for unit in &extraction.units {
            match gateway.scanner.scan(&unit.name, &unit.bytes).await {
                Ok(unit_findings) => {
                    findings.extend(unit_findings.into_iter().map(|f| (unit.name.as_str(), f)));
                }
                Err(e) => {
                    log::error!(
                        "[{}] error scanning '{}' (from {}, rcptTo {}): {}",
                        self.trace_id,
                        unit.name,
                        state.from,
                        rcpt_to,
                        e
                    );
                }
            }
        }

        state.phase = Phase::Deciding;
        let mut verdict = QuarantineVerdict {
            findings_count: findings.len(),
            ..Default::default()
        };
        for (unit, finding) in &findings {
            let policy_match = match gateway.policy.matches_finding(finding) {
                Ok(hit) => hit,
                Err(e) => {
                    log::error!(
                        "[{}] failed to run expression on finding in '{}': {}",
                        self.trace_id,
                        unit,
                        e
                    );
                    false
                }
            };
            verdict.should_quarantine |= policy_match;

            let record = FindingAudit {
                trace_id: &self.trace_id,
                from: &state.from,
                rcpt_to: rcpt_to.clone(),
                unit,
                filename: &finding.context.file,
                level: &finding.level,
                module: &finding.module,
                message: &finding.message,
                score: finding.score,
                subscores: finding.sub_matches.iter().map(|m| m.subscore).collect(),
                policy_match,
                finding,
            };
            log::warn!(target: "audit", "Finding {}", to_json(&record));
        }

        if verdict.should_quarantine {
            if gateway.active_mode {
                match sink.quarantine(&gateway.quarantine_reason).await {
                    Ok(()) => verdict.quarantine_applied = true,
                    Err(e) => log::error!(
                        "[{}] failed to quarantine email (from {}, rcptTo {}): {}",
                        self.trace_id,
                        state.from,
                        rcpt_to,
                        e
                    ),
                }
            } else {
                log::info!(
                    "[{}] this mail would have been quarantined (use active mode)",
                    self.trace_id
                );
            }
        }

        state.phase = Phase::Done;
        self.audit_message(&state, &rcpt_to, "scanned", extraction.len(), verdict);
        Outcome::Scanned(verdict)
    }

    fn audit_message(
        &self,
        state: &SessionState,
        rcpt_to: &str,
        outcome: &'static str,
        unit_count: usize,
        verdict: QuarantineVerdict,
    ) {
        let record = MessageAudit {
            trace_id: &self.trace_id,
            from: &state.from,
            rcpt_to: rcpt_to.to_string(),
            outcome,
            duration_ms: self.started.elapsed().as_millis(),
            size: state.raw.len(),
            unit_count,
            findings_count: verdict.findings_count,
            quarantine: verdict.should_quarantine,
            quarantined: verdict.quarantine_applied,
        };
        if verdict.quarantine_applied {
            log::warn!(target: "audit", "Quarantined email {}", to_json(&record));
        } else {
            log::info!(target: "audit", "Scanned email {}", to_json(&record));
        }
    }
}
