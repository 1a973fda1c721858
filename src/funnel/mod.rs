//! The conversion funnel — upload, extraction, analysis, conversation and
//! the soft-close lead capture.
//!
//! `FunnelController` is the only mutator of the `SessionStore`; the
//! presentation layer reads `FunnelView`s and issues intents.

pub mod controller;
pub mod model;
pub mod state;
pub mod store;

pub use controller::{FunnelController, LeadSubmission};
pub use model::{
    AnalysisRequest, AnalysisResult, ChatMessage, ChatRole, ChatTranscript, FunnelView,
    LeadCaptureRequest, SalaryExtraction,
};
pub use state::{Facets, FunnelState, Intent};
pub use store::SessionStore;
