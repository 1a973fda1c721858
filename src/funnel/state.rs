//! Funnel state machine — where a session stands and which intents it accepts.

use serde::{Deserialize, Serialize};

/// The stages of the funnel.
///
/// Progresses: Idle → DocumentPending → DocumentExtracted → AnalysisReady →
/// LeadCaptured. Conversation and the pre-approval offer are facets of
/// `AnalysisReady` (see [`Facets`]), not stages of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FunnelState {
    #[default]
    Idle,
    DocumentPending,
    DocumentExtracted,
    AnalysisReady,
    LeadCaptured,
}

/// A user intent issued by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    SubmitDocument,
    RunAnalysis,
    SendChatTurn,
    OpenPreApproval,
    DismissPreApproval,
    CaptureLead,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::SubmitDocument,
        Intent::RunAnalysis,
        Intent::SendChatTurn,
        Intent::OpenPreApproval,
        Intent::DismissPreApproval,
        Intent::CaptureLead,
    ];

    /// Whether this intent performs a remote call.
    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::OpenPreApproval | Self::DismissPreApproval)
    }
}

impl FunnelState {
    /// The transition table: the state `intent` leads to from `self`, or
    /// `None` if the intent is not allowed here.
    ///
    /// Facet conditions (offer presented, call in flight) are checked by
    /// [`Facets::permits`] on top of this.
    pub fn transition(&self, intent: Intent) -> Option<FunnelState> {
        use FunnelState::*;
        use Intent::*;
        match (self, intent) {
            (_, SubmitDocument) => Some(DocumentPending),
            (DocumentExtracted | AnalysisReady, RunAnalysis) => Some(AnalysisReady),
            (AnalysisReady, SendChatTurn | OpenPreApproval | DismissPreApproval) => {
                Some(AnalysisReady)
            }
            (AnalysisReady, CaptureLead) => Some(LeadCaptured),
            _ => None,
        }
    }

    /// Whether the session is finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LeadCaptured)
    }

    /// Whether an analysis result is available in this state.
    pub fn has_analysis(&self) -> bool {
        matches!(self, Self::AnalysisReady | Self::LeadCaptured)
    }
}

impl std::fmt::Display for FunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::DocumentPending => "document_pending",
            Self::DocumentExtracted => "document_extracted",
            Self::AnalysisReady => "analysis_ready",
            Self::LeadCaptured => "lead_captured",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SubmitDocument => "submit_document",
            Self::RunAnalysis => "run_analysis",
            Self::SendChatTurn => "send_chat_turn",
            Self::OpenPreApproval => "open_pre_approval",
            Self::DismissPreApproval => "dismiss_pre_approval",
            Self::CaptureLead => "capture_lead",
        };
        write!(f, "{s}")
    }
}

/// Independently toggleable facets of an analysed session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facets {
    /// At least one assistant message is in the transcript.
    pub conversation_active: bool,
    /// The pre-approval offer is currently shown.
    pub pre_approval_open: bool,
    /// The offer has been shown at least once since the last document was
    /// submitted. Re-running the analysis does not clear it.
    pub pre_approval_presented: bool,
    /// A mutating remote call is outstanding.
    pub busy: bool,
}

impl Facets {
    /// Facet-level gate applied after the transition table.
    pub fn permits(&self, intent: Intent) -> bool {
        match intent {
            // Re-upload supersedes whatever is in flight.
            Intent::SubmitDocument => true,
            _ if self.busy => false,
            Intent::OpenPreApproval => !self.pre_approval_open,
            Intent::DismissPreApproval => self.pre_approval_open,
            Intent::CaptureLead => self.pre_approval_presented,
            Intent::RunAnalysis | Intent::SendChatTurn => true,
        }
    }
}
