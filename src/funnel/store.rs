//! SessionStore — in-memory holder for one visit's funnel state and data.

use tracing::warn;
use uuid::Uuid;

use super::model::{AnalysisResult, ChatMessage, ChatTranscript, FunnelView, SalaryExtraction};
use super::state::{Facets, FunnelState, Intent};

/// Sole owner of the session's state and entities.
///
/// Invariants: an analysis exists only alongside an extraction, and the
/// transcript only grows while an analysis exists.
#[derive(Debug, Clone)]
pub struct SessionStore {
    session_id: Uuid,
    state: FunnelState,
    /// Bumped on every document submission; results tagged with an older
    /// epoch are stale.
    epoch: u64,
    extraction: Option<SalaryExtraction>,
    analysis: Option<AnalysisResult>,
    transcript: ChatTranscript,
    pre_approval_open: bool,
    pre_approval_presented: bool,
    in_flight: Option<Intent>,
    last_error: Option<String>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            state: FunnelState::Idle,
            epoch: 0,
            extraction: None,
            analysis: None,
            transcript: ChatTranscript::default(),
            pre_approval_open: false,
            pre_approval_presented: false,
            in_flight: None,
            last_error: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> FunnelState {
        self.state
    }

    pub fn set_state(&mut self, state: FunnelState) {
        self.state = state;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Start a new document epoch and return it.
    pub fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    pub fn extraction(&self) -> Option<&SalaryExtraction> {
        self.extraction.as_ref()
    }

    pub fn set_extraction(&mut self, extraction: SalaryExtraction) {
        self.extraction = Some(extraction);
    }

    pub fn analysis(&self) -> Option<&AnalysisResult> {
        self.analysis.as_ref()
    }

    /// Store an analysis result. Refused when no extraction exists.
    #[must_use]
    pub fn set_analysis(&mut self, analysis: AnalysisResult) -> bool {
        if self.extraction.is_none() {
            warn!(session_id = %self.session_id, "Refusing analysis without an extraction");
            return false;
        }
        self.analysis = Some(analysis);
        true
    }

    pub fn transcript(&self) -> &ChatTranscript {
        &self.transcript
    }

    /// Append to the transcript. Refused when no analysis exists.
    #[must_use]
    pub fn append_message(&mut self, message: ChatMessage) -> bool {
        if self.analysis.is_none() {
            warn!(session_id = %self.session_id, "Refusing chat message without an analysis");
            return false;
        }
        self.transcript.push(message);
        true
    }

    pub fn set_pre_approval_open(&mut self, open: bool) {
        self.pre_approval_open = open;
        if open {
            self.pre_approval_presented = true;
        }
    }

    pub fn in_flight(&self) -> Option<Intent> {
        self.in_flight
    }

    pub fn set_in_flight(&mut self, intent: Option<Intent>) {
        self.in_flight = intent;
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn set_last_error(&mut self, error: Option<String>) {
        self.last_error = error;
    }

    /// Atomically clear everything derived from the uploaded document: the
    /// extraction, analysis, transcript and offer flags.
    pub fn reset_downstream_of_document(&mut self) {
        self.extraction = None;
        self.analysis = None;
        self.transcript = ChatTranscript::default();
        self.pre_approval_open = false;
        self.pre_approval_presented = false;
    }

    pub fn facets(&self) -> Facets {
        Facets {
            conversation_active: self.state.has_analysis() && !self.transcript.is_empty(),
            pre_approval_open: self.pre_approval_open,
            pre_approval_presented: self.pre_approval_presented,
            busy: self.in_flight.is_some(),
        }
    }

    /// Whether `intent` is currently allowed.
    pub fn allows(&self, intent: Intent) -> bool {
        self.state.transition(intent).is_some() && self.facets().permits(intent)
    }

    pub fn allowed_intents(&self) -> Vec<Intent> {
        Intent::ALL
            .into_iter()
            .filter(|intent| self.allows(*intent))
            .collect()
    }

    /// Snapshot for rendering.
    pub fn view(&self) -> FunnelView {
        FunnelView {
            session_id: self.session_id,
            state: self.state,
            facets: self.facets(),
            allowed: self.allowed_intents(),
            extraction: self.extraction.clone(),
            analysis: self.analysis.clone(),
            transcript: self.transcript.messages().to_vec(),
            last_error: self.last_error.clone(),
        }
    }
}
