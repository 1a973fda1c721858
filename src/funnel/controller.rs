//! FunnelController — sequences the funnel steps against the remote service.
//!
//! Every intent follows the same shape: check the transition table, mark the
//! session busy and publish, await the remote call without holding the store
//! lock, then apply the result only if the document epoch is unchanged.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::model::{AnalysisRequest, FunnelView, LeadCaptureRequest};
use super::state::{FunnelState, Intent};
use super::store::SessionStore;
use crate::config::AnalysisPolicy;
use crate::document::Document;
use crate::error::{FunnelError, ServiceError};
use crate::safety::PiiScrubber;
use crate::service::{ConverseRequest, LeadAck, ServiceClient, operation};

/// Broadcast capacity for view updates.
const VIEW_BROADCAST_CAPACITY: usize = 64;

/// Handle to a lead submission running in the background.
///
/// The session is already `LeadCaptured` when this is returned; awaiting
/// [`LeadSubmission::outcome`] is optional.
#[derive(Debug)]
pub struct LeadSubmission {
    handle: JoinHandle<Result<LeadAck, FunnelError>>,
}

impl LeadSubmission {
    /// Wait for the remote request to finish.
    pub async fn outcome(self) -> Result<LeadAck, FunnelError> {
        self.handle.await.unwrap_or_else(|e| {
            Err(FunnelError::LeadCapture(ServiceError::unavailable(
                operation::CAPTURE_LEAD,
                format!("submission task failed: {e}"),
            )))
        })
    }
}

/// Clears the in-flight marker when an intent's future is dropped before its
/// remote call returns, so a cancelled call never leaves the session busy.
struct InFlightGuard {
    store: Arc<RwLock<SessionStore>>,
    tx: broadcast::Sender<FunnelView>,
    epoch: u64,
    intent: Intent,
    armed: bool,
}

impl InFlightGuard {
    fn disarm(mut self) {
        self.armed = false;
    }

    fn abandon(
        store: &mut SessionStore,
        tx: &broadcast::Sender<FunnelView>,
        epoch: u64,
        intent: Intent,
    ) {
        if !store.is_current(epoch) || store.in_flight() != Some(intent) {
            return;
        }
        store.set_in_flight(None);
        if intent == Intent::SubmitDocument && store.state() == FunnelState::DocumentPending {
            store.set_state(FunnelState::Idle);
        }
        warn!(
            session_id = %store.session_id(),
            %intent,
            "Intent cancelled before the service answered"
        );
        let _ = tx.send(store.view());
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (epoch, intent) = (self.epoch, self.intent);
        match self.store.try_write() {
            Ok(mut store) => Self::abandon(&mut store, &self.tx, epoch, intent),
            Err(_) => {
                let Ok(handle) = tokio::runtime::Handle::try_current() else {
                    return;
                };
                let store = Arc::clone(&self.store);
                let tx = self.tx.clone();
                handle.spawn(async move {
                    Self::abandon(&mut *store.write().await, &tx, epoch, intent);
                });
            }
        }
    }
}

/// The funnel state machine for one session.
pub struct FunnelController {
    client: Arc<dyn ServiceClient>,
    store: Arc<RwLock<SessionStore>>,
    policy: AnalysisPolicy,
    scrubber: PiiScrubber,
    tx: broadcast::Sender<FunnelView>,
}

impl FunnelController {
    /// Create a controller with a fresh session.
    pub fn new(client: Arc<dyn ServiceClient>, policy: AnalysisPolicy) -> Arc<Self> {
        Self::with_scrubber(client, policy, PiiScrubber::default_rules())
    }

    pub fn with_scrubber(
        client: Arc<dyn ServiceClient>,
        policy: AnalysisPolicy,
        scrubber: PiiScrubber,
    ) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(VIEW_BROADCAST_CAPACITY);
        Arc::new(Self {
            client,
            store: Arc::new(RwLock::new(SessionStore::new())),
            policy,
            scrubber,
            tx,
        })
    }

    /// Subscribe to view updates, one per processed intent.
    pub fn subscribe(&self) -> broadcast::Receiver<FunnelView> {
        self.tx.subscribe()
    }

    pub async fn view(&self) -> FunnelView {
        self.store.read().await.view()
    }

    pub async fn state(&self) -> FunnelState {
        self.store.read().await.state()
    }

    pub async fn allowed_intents(&self) -> Vec<Intent> {
        self.store.read().await.allowed_intents()
    }

    /// Check `intent` against the current state.
    pub async fn check(&self, intent: Intent) -> Result<(), FunnelError> {
        Self::precondition(&*self.store.read().await, intent)
    }

    fn precondition(store: &SessionStore, intent: Intent) -> Result<(), FunnelError> {
        if store.allows(intent) {
            Ok(())
        } else {
            Err(FunnelError::PreconditionViolation {
                intent,
                state: store.state(),
            })
        }
    }

    fn publish(&self, store: &SessionStore) {
        // Ok if nobody is rendering yet.
        let _ = self.tx.send(store.view());
    }

    fn in_flight_guard(&self, epoch: u64, intent: Intent) -> InFlightGuard {
        InFlightGuard {
            store: Arc::clone(&self.store),
            tx: self.tx.clone(),
            epoch,
            intent,
            armed: true,
        }
    }

    /// Upload a document for extraction.
    ///
    /// Always allowed. Invalidates everything derived from a previous
    /// document and supersedes any call still in flight. Dropping the future
    /// before the service answers returns the session to `Idle`.
    pub async fn submit_document(&self, document: &Document) -> Result<FunnelState, FunnelError> {
        let epoch = {
            let mut store = self.store.write().await;
            let epoch = store.next_epoch();
            store.reset_downstream_of_document();
            store.set_state(FunnelState::DocumentPending);
            store.set_in_flight(Some(Intent::SubmitDocument));
            store.set_last_error(None);
            info!(
                session_id = %store.session_id(),
                epoch,
                file = document.file_name(),
                "Document submitted"
            );
            self.publish(&store);
            epoch
        };

        let guard = self.in_flight_guard(epoch, Intent::SubmitDocument);
        let result = self.client.extract(document).await;

        let mut store = self.store.write().await;
        guard.disarm();
        if !store.is_current(epoch) {
            debug!(epoch, current = store.epoch(), "Discarding superseded extraction");
            return Ok(store.state());
        }
        store.set_in_flight(None);

        match result {
            Ok(extraction) => {
                let extraction = self.scrubber.scrub_extraction(extraction);
                info!(
                    session_id = %store.session_id(),
                    has_income = extraction.monthly_income().is_some(),
                    "Salary data extracted"
                );
                store.set_extraction(extraction);
                store.set_state(FunnelState::DocumentExtracted);
                self.publish(&store);
                Ok(FunnelState::DocumentExtracted)
            }
            Err(e) => {
                warn!(session_id = %store.session_id(), error = %e, "Extraction failed");
                store.set_state(FunnelState::Idle);
                Err(self.fail(&mut store, FunnelError::Extraction(e)))
            }
        }
    }

    /// Run the analysis with the policy's default rent.
    pub async fn run_analysis(&self) -> Result<FunnelState, FunnelError> {
        self.run_analysis_with_rent(None).await
    }

    /// Run the analysis, optionally overriding the annual rent.
    ///
    /// A no-op returning the current state unless an extraction exists.
    pub async fn run_analysis_with_rent(
        &self,
        annual_rent: Option<Decimal>,
    ) -> Result<FunnelState, FunnelError> {
        let (epoch, request) = {
            let mut store = self.store.write().await;
            if let Err(e) = Self::precondition(&store, Intent::RunAnalysis) {
                debug!(error = %e, "Ignoring intent");
                return Ok(store.state());
            }
            let Some(extraction) = store.extraction() else {
                return Ok(store.state());
            };
            let request = AnalysisRequest::build(extraction, &self.policy, annual_rent);
            store.set_in_flight(Some(Intent::RunAnalysis));
            store.set_last_error(None);
            info!(
                session_id = %store.session_id(),
                monthly_income = %request.monthly_income,
                annual_rent = %request.annual_rent,
                "Running analysis"
            );
            self.publish(&store);
            (store.epoch(), request)
        };

        let guard = self.in_flight_guard(epoch, Intent::RunAnalysis);
        let result = self.client.analyze(&request).await;

        let mut store = self.store.write().await;
        guard.disarm();
        if !store.is_current(epoch) {
            debug!(epoch, "Discarding analysis for a replaced document");
            return Ok(store.state());
        }
        store.set_in_flight(None);

        match result {
            Ok(analysis) => {
                if !store.set_analysis(analysis) {
                    self.publish(&store);
                    return Ok(store.state());
                }
                store.set_state(FunnelState::AnalysisReady);
                info!(session_id = %store.session_id(), "Analysis ready");
                self.publish(&store);
                Ok(FunnelState::AnalysisReady)
            }
            Err(e) => {
                warn!(session_id = %store.session_id(), error = %e, "Analysis failed");
                Err(self.fail(&mut store, FunnelError::Analysis(e)))
            }
        }
    }

    /// Ask the assistant for one more message about the current analysis.
    ///
    /// Never changes the funnel state; appends to the transcript only on
    /// success.
    pub async fn send_chat_turn(&self) -> Result<FunnelState, FunnelError> {
        let (epoch, request) = {
            let mut store = self.store.write().await;
            if let Err(e) = Self::precondition(&store, Intent::SendChatTurn) {
                debug!(error = %e, "Ignoring intent");
                return Ok(store.state());
            }
            let Some(analysis) = store.analysis().cloned() else {
                return Ok(store.state());
            };
            let request = ConverseRequest {
                analysis,
                convinced: store.facets().pre_approval_presented,
            };
            store.set_in_flight(Some(Intent::SendChatTurn));
            store.set_last_error(None);
            self.publish(&store);
            (store.epoch(), request)
        };

        let guard = self.in_flight_guard(epoch, Intent::SendChatTurn);
        let result = self.client.converse(&request).await;

        let mut store = self.store.write().await;
        guard.disarm();
        if !store.is_current(epoch) {
            debug!(epoch, "Discarding chat reply for a replaced document");
            return Ok(store.state());
        }
        store.set_in_flight(None);

        match result {
            Ok(message) => {
                if !store.append_message(message) {
                    self.publish(&store);
                    return Ok(store.state());
                }
                debug!(
                    session_id = %store.session_id(),
                    transcript_len = store.transcript().len(),
                    "Assistant replied"
                );
                self.publish(&store);
                Ok(store.state())
            }
            Err(e) => {
                warn!(session_id = %store.session_id(), error = %e, "Conversation turn failed");
                Err(self.fail(&mut store, FunnelError::Conversation(e)))
            }
        }
    }

    /// Show the pre-approval offer.
    pub async fn open_pre_approval(&self) -> FunnelState {
        self.toggle_pre_approval(Intent::OpenPreApproval, true).await
    }

    /// Hide the pre-approval offer.
    pub async fn dismiss_pre_approval(&self) -> FunnelState {
        self.toggle_pre_approval(Intent::DismissPreApproval, false).await
    }

    async fn toggle_pre_approval(&self, intent: Intent, open: bool) -> FunnelState {
        let mut store = self.store.write().await;
        if let Err(e) = Self::precondition(&store, intent) {
            debug!(error = %e, "Ignoring intent");
            return store.state();
        }
        store.set_pre_approval_open(open);
        info!(session_id = %store.session_id(), open, "Pre-approval offer toggled");
        self.publish(&store);
        store.state()
    }

    /// Accept the soft-close offer.
    ///
    /// Moves the session to `LeadCaptured` immediately and submits the lead
    /// snapshot in the background. Returns `None` (and sends nothing) unless
    /// the offer has been presented after an analysis.
    pub async fn capture_lead(&self) -> Option<LeadSubmission> {
        let (epoch, request) = {
            let mut store = self.store.write().await;
            if let Err(e) = Self::precondition(&store, Intent::CaptureLead) {
                debug!(error = %e, "Ignoring intent");
                return None;
            }
            let (Some(extraction), Some(analysis)) =
                (store.extraction().cloned(), store.analysis().cloned())
            else {
                return None;
            };
            let request = LeadCaptureRequest {
                session_id: store.session_id(),
                extraction,
                analysis,
                captured_at: Utc::now(),
            };
            store.set_pre_approval_open(false);
            store.set_state(FunnelState::LeadCaptured);
            store.set_last_error(None);
            info!(session_id = %store.session_id(), "Lead captured");
            self.publish(&store);
            (store.epoch(), request)
        };

        let client = Arc::clone(&self.client);
        let store = Arc::clone(&self.store);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            match client.capture_lead(&request).await {
                Ok(ack) => {
                    info!(session_id = %request.session_id, status = ?ack.status, "Lead acknowledged");
                    Ok(ack)
                }
                Err(e) => {
                    warn!(session_id = %request.session_id, error = %e, "Lead submission failed");
                    let err = FunnelError::LeadCapture(e);
                    let mut store = store.write().await;
                    if store.is_current(epoch) {
                        store.set_last_error(Some(err.to_string()));
                        let _ = tx.send(store.view());
                    }
                    Err(err)
                }
            }
        });

        Some(LeadSubmission { handle })
    }

    /// Record a step failure, publish it and hand it back.
    fn fail(&self, store: &mut SessionStore, err: FunnelError) -> FunnelError {
        store.set_last_error(Some(err.to_string()));
        self.publish(store);
        err
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use serde_json::{Map, Value, json};
    use tokio::sync::Notify;

    use super::*;
    use crate::funnel::model::{AnalysisResult, ChatMessage, SalaryExtraction};

    fn extraction(value: Value) -> SalaryExtraction {
        match value {
            Value::Object(map) => SalaryExtraction::from_fields(map),
            _ => panic!("expected object"),
        }
    }

    fn analysis(value: Value) -> AnalysisResult {
        serde_json::from_value(value).unwrap()
    }

    fn document() -> Document {
        Document::from_bytes("slip.pdf", b"%PDF-1.4".to_vec(), 1024).unwrap()
    }

    fn unavailable(op: &str) -> ServiceError {
        ServiceError::unavailable(op, "connection refused")
    }

    /// Holds the first call that passes through it until opened.
    #[derive(Default)]
    struct Gate {
        notify: Notify,
        used: AtomicBool,
    }

    impl Gate {
        async fn pass(&self) {
            if !self.used.swap(true, Ordering::SeqCst) {
                self.notify.notified().await;
            }
        }

        fn open(&self) {
            self.notify.notify_one();
        }
    }

    async fn pass(gate: &Option<Arc<Gate>>) {
        if let Some(gate) = gate {
            gate.pass().await;
        }
    }

    /// Scripted service: pops queued results per operation and records
    /// every request it receives. Empty queues answer with a success.
    #[derive(Default)]
    struct StubClient {
        extract_results: Mutex<VecDeque<Result<SalaryExtraction, ServiceError>>>,
        analyze_results: Mutex<VecDeque<Result<AnalysisResult, ServiceError>>>,
        converse_results: Mutex<VecDeque<Result<ChatMessage, ServiceError>>>,
        lead_results: Mutex<VecDeque<Result<LeadAck, ServiceError>>>,
        analyze_requests: Mutex<Vec<AnalysisRequest>>,
        converse_requests: Mutex<Vec<ConverseRequest>>,
        lead_requests: Mutex<Vec<LeadCaptureRequest>>,
        extract_calls: AtomicUsize,
        extract_gate: Option<Arc<Gate>>,
        analyze_gate: Option<Arc<Gate>>,
        converse_gate: Option<Arc<Gate>>,
        lead_gate: Option<Arc<Gate>>,
    }

    impl StubClient {
        fn queue_extract(&self, r: Result<SalaryExtraction, ServiceError>) {
            self.extract_results.lock().unwrap().push_back(r);
        }
        fn queue_analyze(&self, r: Result<AnalysisResult, ServiceError>) {
            self.analyze_results.lock().unwrap().push_back(r);
        }
        fn queue_converse(&self, r: Result<ChatMessage, ServiceError>) {
            self.converse_results.lock().unwrap().push_back(r);
        }
        fn queue_lead(&self, r: Result<LeadAck, ServiceError>) {
            self.lead_results.lock().unwrap().push_back(r);
        }
    }

    #[async_trait]
    impl ServiceClient for StubClient {
        async fn probe(&self) -> Result<(), ServiceError> {
            Ok(())
        }

        async fn extract(&self, _document: &Document) -> Result<SalaryExtraction, ServiceError> {
            self.extract_calls.fetch_add(1, Ordering::SeqCst);
            let result = self
                .extract_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(extraction(json!({"monthly_income": 30000}))));
            pass(&self.extract_gate).await;
            result
        }

        async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, ServiceError> {
            self.analyze_requests.lock().unwrap().push(*request);
            pass(&self.analyze_gate).await;
            self.analyze_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(analysis(json!({"total_rent_paid": 700000}))))
        }

        async fn converse(&self, request: &ConverseRequest) -> Result<ChatMessage, ServiceError> {
            self.converse_requests.lock().unwrap().push(request.clone());
            pass(&self.converse_gate).await;
            self.converse_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ChatMessage::assistant("Renting builds zero equity.")))
        }

        async fn capture_lead(&self, request: &LeadCaptureRequest) -> Result<LeadAck, ServiceError> {
            self.lead_requests.lock().unwrap().push(request.clone());
            pass(&self.lead_gate).await;
            self.lead_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(LeadAck {
                        status: Some("lead_captured".into()),
                    })
                })
        }
    }

    fn controller(stub: &Arc<StubClient>) -> Arc<FunnelController> {
        let client: Arc<dyn ServiceClient> = stub.clone();
        FunnelController::new(client, AnalysisPolicy::default())
    }

    async fn analysed(stub: &Arc<StubClient>) -> Arc<FunnelController> {
        let funnel = controller(stub);
        funnel.submit_document(&document()).await.unwrap();
        funnel.run_analysis().await.unwrap();
        funnel
    }

    #[tokio::test]
    async fn happy_path_reaches_lead_captured() {
        let stub = Arc::new(StubClient::default());
        let funnel = controller(&stub);

        assert_eq!(funnel.state().await, FunnelState::Idle);
        assert_eq!(
            funnel.submit_document(&document()).await.unwrap(),
            FunnelState::DocumentExtracted
        );
        assert_eq!(funnel.run_analysis().await.unwrap(), FunnelState::AnalysisReady);
        assert_eq!(funnel.send_chat_turn().await.unwrap(), FunnelState::AnalysisReady);
        assert_eq!(funnel.open_pre_approval().await, FunnelState::AnalysisReady);

        let submission = funnel.capture_lead().await.expect("lead should be submitted");
        assert_eq!(funnel.state().await, FunnelState::LeadCaptured);
        let ack = submission.outcome().await.unwrap();
        assert_eq!(ack.status.as_deref(), Some("lead_captured"));
        assert_eq!(stub.lead_requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn analysis_before_extraction_is_noop() {
        let stub = Arc::new(StubClient::default());
        let funnel = controller(&stub);

        assert_eq!(funnel.run_analysis().await.unwrap(), FunnelState::Idle);
        assert!(stub.analyze_requests.lock().unwrap().is_empty());
        assert!(matches!(
            funnel.check(Intent::RunAnalysis).await,
            Err(FunnelError::PreconditionViolation {
                intent: Intent::RunAnalysis,
                state: FunnelState::Idle
            })
        ));
    }

    #[tokio::test]
    async fn analysis_request_uses_extracted_income() {
        let stub = Arc::new(StubClient::default());
        stub.queue_extract(Ok(extraction(json!({"monthly_income": 30000}))));
        let _funnel = analysed(&stub).await;

        let requests = stub.analyze_requests.lock().unwrap();
        assert_eq!(
            requests.as_slice(),
            &[AnalysisRequest {
                monthly_income: dec!(30000),
                annual_rent: dec!(140000),
            }]
        );
    }

    #[tokio::test]
    async fn analysis_request_defaults_missing_income() {
        let stub = Arc::new(StubClient::default());
        stub.queue_extract(Ok(extraction(json!({"employer": "ACME"}))));
        let _funnel = analysed(&stub).await;

        let requests = stub.analyze_requests.lock().unwrap();
        assert_eq!(requests[0].monthly_income, dec!(25000));
        assert_eq!(requests[0].annual_rent, dec!(140000));
    }

    #[tokio::test]
    async fn rent_override_and_custom_policy() {
        let stub = Arc::new(StubClient::default());
        stub.queue_extract(Ok(extraction(json!({}))));
        let client: Arc<dyn ServiceClient> = stub.clone();
        let funnel = FunnelController::new(
            client,
            AnalysisPolicy {
                default_monthly_income: dec!(18000),
                default_annual_rent: dec!(100000),
            },
        );
        funnel.submit_document(&document()).await.unwrap();
        funnel.run_analysis_with_rent(Some(dec!(95000))).await.unwrap();

        let requests = stub.analyze_requests.lock().unwrap();
        assert_eq!(requests[0].monthly_income, dec!(18000));
        assert_eq!(requests[0].annual_rent, dec!(95000));
    }

    #[tokio::test]
    async fn failed_extraction_returns_to_idle() {
        let stub = Arc::new(StubClient::default());
        stub.queue_extract(Err(unavailable(operation::EXTRACT)));
        let funnel = controller(&stub);

        let err = funnel.submit_document(&document()).await.unwrap_err();
        assert!(matches!(err, FunnelError::Extraction(ref e) if e.is_unavailable()));

        let view = funnel.view().await;
        assert_eq!(view.state, FunnelState::Idle);
        assert!(view.extraction.is_none());
        assert!(view.last_error.is_some());
        assert!(!view.facets.busy);
    }

    #[tokio::test]
    async fn failed_analysis_does_not_advance() {
        let stub = Arc::new(StubClient::default());
        stub.queue_analyze(Err(ServiceError::rejected(operation::ANALYZE, 500, "boom")));
        let funnel = controller(&stub);
        funnel.submit_document(&document()).await.unwrap();

        let err = funnel.run_analysis().await.unwrap_err();
        assert!(matches!(err, FunnelError::Analysis(ServiceError::Rejected { status: 500, .. })));
        assert_eq!(funnel.state().await, FunnelState::DocumentExtracted);
        assert!(funnel.view().await.analysis.is_none());

        // The step can be retried.
        assert_eq!(funnel.run_analysis().await.unwrap(), FunnelState::AnalysisReady);
    }

    #[tokio::test]
    async fn reupload_invalidates_downstream() {
        let stub = Arc::new(StubClient::default());
        let funnel = analysed(&stub).await;
        funnel.send_chat_turn().await.unwrap();
        funnel.open_pre_approval().await;

        stub.queue_extract(Err(unavailable(operation::EXTRACT)));
        let mut rx = funnel.subscribe();
        let _ = funnel.submit_document(&document()).await;

        // First published view is the pending one, with everything cleared.
        let pending = rx.recv().await.unwrap();
        assert_eq!(pending.state, FunnelState::DocumentPending);
        assert!(pending.extraction.is_none());
        assert!(pending.analysis.is_none());
        assert!(pending.transcript.is_empty());
        assert!(!pending.facets.pre_approval_open);
        assert!(!pending.allows(Intent::CaptureLead));
    }

    #[tokio::test]
    async fn reupload_after_analysis_requires_new_analysis() {
        let stub = Arc::new(StubClient::default());
        let funnel = analysed(&stub).await;
        funnel.send_chat_turn().await.unwrap();

        assert_eq!(
            funnel.submit_document(&document()).await.unwrap(),
            FunnelState::DocumentExtracted
        );
        let view = funnel.view().await;
        assert!(view.analysis.is_none());
        assert!(view.transcript.is_empty());
        assert_eq!(funnel.send_chat_turn().await.unwrap(), FunnelState::DocumentExtracted);
        assert_eq!(stub.converse_requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn chat_appends_without_changing_state() {
        let stub = Arc::new(StubClient::default());
        stub.queue_converse(Ok(ChatMessage::assistant("one")));
        stub.queue_converse(Ok(ChatMessage::assistant("two")));
        let funnel = analysed(&stub).await;

        funnel.send_chat_turn().await.unwrap();
        let after_one = funnel.view().await.transcript;
        funnel.send_chat_turn().await.unwrap();
        let after_two = funnel.view().await.transcript;

        assert_eq!(funnel.state().await, FunnelState::AnalysisReady);
        assert_eq!(after_two.len(), 2);
        assert_eq!(&after_two[..1], after_one.as_slice());
        assert_eq!(after_two[1].content, "two");
        assert!(funnel.view().await.facets.conversation_active);
    }

    #[tokio::test]
    async fn failed_chat_leaves_transcript_untouched() {
        let stub = Arc::new(StubClient::default());
        stub.queue_converse(Ok(ChatMessage::assistant("kept")));
        stub.queue_converse(Err(unavailable(operation::CONVERSE)));
        let funnel = analysed(&stub).await;

        funnel.send_chat_turn().await.unwrap();
        let err = funnel.send_chat_turn().await.unwrap_err();
        assert!(matches!(err, FunnelError::Conversation(_)));

        let view = funnel.view().await;
        assert_eq!(view.state, FunnelState::AnalysisReady);
        assert_eq!(view.transcript.len(), 1);
        assert_eq!(view.transcript[0].content, "kept");
    }

    #[tokio::test]
    async fn chat_marks_convinced_after_offer() {
        let stub = Arc::new(StubClient::default());
        let funnel = analysed(&stub).await;

        funnel.send_chat_turn().await.unwrap();
        funnel.open_pre_approval().await;
        funnel.dismiss_pre_approval().await;
        funnel.send_chat_turn().await.unwrap();

        let requests = stub.converse_requests.lock().unwrap();
        assert!(!requests[0].convinced);
        assert!(requests[1].convinced);
        assert_eq!(
            requests[0].analysis.metric("total_rent_paid"),
            Some(&json!(700000))
        );
    }

    #[tokio::test]
    async fn pre_approval_toggles_locally() {
        let stub = Arc::new(StubClient::default());
        let funnel = analysed(&stub).await;

        funnel.open_pre_approval().await;
        assert!(funnel.view().await.facets.pre_approval_open);
        funnel.dismiss_pre_approval().await;
        let view = funnel.view().await;
        assert!(!view.facets.pre_approval_open);
        assert!(view.facets.pre_approval_presented);
        assert_eq!(view.state, FunnelState::AnalysisReady);
    }

    #[tokio::test]
    async fn pre_approval_needs_analysis() {
        let stub = Arc::new(StubClient::default());
        let funnel = controller(&stub);
        funnel.open_pre_approval().await;
        assert!(!funnel.view().await.facets.pre_approval_open);
    }

    #[tokio::test]
    async fn capture_lead_without_analysis_is_noop() {
        let stub = Arc::new(StubClient::default());
        let funnel = controller(&stub);
        funnel.submit_document(&document()).await.unwrap();

        assert!(funnel.capture_lead().await.is_none());
        assert!(stub.lead_requests.lock().unwrap().is_empty());
        assert_eq!(funnel.state().await, FunnelState::DocumentExtracted);
    }

    #[tokio::test]
    async fn capture_lead_requires_presented_offer() {
        let stub = Arc::new(StubClient::default());
        let funnel = analysed(&stub).await;

        assert!(funnel.capture_lead().await.is_none());
        assert!(stub.lead_requests.lock().unwrap().is_empty());
        assert_eq!(funnel.state().await, FunnelState::AnalysisReady);
    }

    #[tokio::test]
    async fn lead_failure_does_not_block_soft_close() {
        let stub = Arc::new(StubClient::default());
        stub.queue_lead(Err(ServiceError::rejected(operation::CAPTURE_LEAD, 503, "down")));
        let funnel = analysed(&stub).await;
        funnel.open_pre_approval().await;

        let submission = funnel.capture_lead().await.unwrap();
        assert_eq!(funnel.state().await, FunnelState::LeadCaptured);

        let err = submission.outcome().await.unwrap_err();
        assert!(matches!(err, FunnelError::LeadCapture(_)));
        let view = funnel.view().await;
        assert_eq!(view.state, FunnelState::LeadCaptured);
        assert!(view.last_error.unwrap().contains("Lead capture failed"));
        assert_eq!(stub.lead_requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lead_snapshot_carries_session_data() {
        let stub = Arc::new(StubClient::default());
        stub.queue_extract(Ok(extraction(json!({"monthly_income": 30000, "currency": "AED"}))));
        let funnel = analysed(&stub).await;
        funnel.open_pre_approval().await;
        funnel.capture_lead().await.unwrap().outcome().await.unwrap();

        let requests = stub.lead_requests.lock().unwrap();
        let lead = &requests[0];
        assert_eq!(lead.session_id, funnel.view().await.session_id);
        assert_eq!(lead.extraction.fields()["currency"], "AED");
        assert_eq!(lead.analysis.metric("total_rent_paid"), Some(&json!(700000)));
    }

    #[tokio::test]
    async fn terminal_state_ignores_funnel_intents() {
        let stub = Arc::new(StubClient::default());
        let funnel = analysed(&stub).await;
        funnel.open_pre_approval().await;
        funnel.capture_lead().await.unwrap();

        assert_eq!(funnel.send_chat_turn().await.unwrap(), FunnelState::LeadCaptured);
        assert_eq!(funnel.run_analysis().await.unwrap(), FunnelState::LeadCaptured);
        assert!(funnel.capture_lead().await.is_none());
        assert_eq!(funnel.allowed_intents().await, vec![Intent::SubmitDocument]);
    }

    #[tokio::test]
    async fn extracted_pii_is_scrubbed() {
        let stub = Arc::new(StubClient::default());
        stub.queue_extract(Ok(extraction(
            json!({"monthly_income": 30000, "employee": "John Smith"}),
        )));
        let funnel = controller(&stub);
        funnel.submit_document(&document()).await.unwrap();

        let view = funnel.view().await;
        let fields = view.extraction.unwrap();
        assert_eq!(fields.fields()["employee"], "[REDACTED_NAME]");
        assert_eq!(fields.monthly_income(), Some(dec!(30000)));
    }

    #[tokio::test]
    async fn second_upload_supersedes_pending_one() {
        let gate = Arc::new(Gate::default());
        let stub = Arc::new(StubClient {
            extract_gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        stub.queue_extract(Ok(extraction(json!({"monthly_income": 11111}))));
        stub.queue_extract(Ok(extraction(json!({"monthly_income": 22222}))));
        let funnel = controller(&stub);

        let first = {
            let funnel = Arc::clone(&funnel);
            tokio::spawn(async move { funnel.submit_document(&document()).await })
        };
        while stub.extract_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second = funnel.submit_document(&document()).await.unwrap();
        assert_eq!(second, FunnelState::DocumentExtracted);

        gate.open();
        first.await.unwrap().unwrap();

        let view = funnel.view().await;
        assert_eq!(view.state, FunnelState::DocumentExtracted);
        assert_eq!(view.extraction.unwrap().monthly_income(), Some(dec!(22222)));
    }

    #[tokio::test]
    async fn analysis_for_replaced_document_is_discarded() {
        let gate = Arc::new(Gate::default());
        let stub = Arc::new(StubClient {
            analyze_gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        stub.queue_extract(Ok(extraction(json!({"monthly_income": 11111}))));
        stub.queue_extract(Ok(extraction(json!({"monthly_income": 22222}))));
        let funnel = controller(&stub);
        funnel.submit_document(&document()).await.unwrap();

        let stale = {
            let funnel = Arc::clone(&funnel);
            tokio::spawn(async move { funnel.run_analysis().await })
        };
        while stub.analyze_requests.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        // Busy: further intents are ignored without reaching the service.
        assert_eq!(
            funnel.run_analysis().await.unwrap(),
            FunnelState::DocumentExtracted
        );
        assert_eq!(
            funnel.send_chat_turn().await.unwrap(),
            FunnelState::DocumentExtracted
        );
        assert_eq!(stub.analyze_requests.lock().unwrap().len(), 1);
        assert!(stub.converse_requests.lock().unwrap().is_empty());

        funnel.submit_document(&document()).await.unwrap();
        gate.open();
        assert_eq!(stale.await.unwrap().unwrap(), FunnelState::DocumentExtracted);

        let view = funnel.view().await;
        assert_eq!(view.state, FunnelState::DocumentExtracted);
        assert!(view.analysis.is_none());
        assert!(view.transcript.is_empty());
        assert!(!view.facets.busy);

        funnel.run_analysis().await.unwrap();
        let requests = stub.analyze_requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].monthly_income, dec!(22222));
    }

    #[tokio::test]
    async fn chat_reply_for_replaced_document_is_discarded() {
        let gate = Arc::new(Gate::default());
        let stub = Arc::new(StubClient {
            converse_gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let funnel = analysed(&stub).await;

        let stale = {
            let funnel = Arc::clone(&funnel);
            tokio::spawn(async move { funnel.send_chat_turn().await })
        };
        while stub.converse_requests.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        assert_eq!(funnel.send_chat_turn().await.unwrap(), FunnelState::AnalysisReady);
        assert_eq!(funnel.run_analysis().await.unwrap(), FunnelState::AnalysisReady);
        assert_eq!(stub.converse_requests.lock().unwrap().len(), 1);
        assert_eq!(stub.analyze_requests.lock().unwrap().len(), 1);

        funnel.submit_document(&document()).await.unwrap();
        gate.open();
        assert_eq!(stale.await.unwrap().unwrap(), FunnelState::DocumentExtracted);

        let view = funnel.view().await;
        assert_eq!(view.state, FunnelState::DocumentExtracted);
        assert!(view.analysis.is_none());
        assert!(view.transcript.is_empty());
        assert!(!view.facets.busy);
    }

    #[tokio::test]
    async fn lead_failure_for_replaced_document_is_not_reported() {
        let gate = Arc::new(Gate::default());
        let stub = Arc::new(StubClient {
            lead_gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        stub.queue_lead(Err(unavailable(operation::CAPTURE_LEAD)));
        let funnel = analysed(&stub).await;
        funnel.open_pre_approval().await;

        let submission = funnel.capture_lead().await.unwrap();
        while stub.lead_requests.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        funnel.submit_document(&document()).await.unwrap();
        gate.open();
        assert!(matches!(
            submission.outcome().await,
            Err(FunnelError::LeadCapture(_))
        ));

        let view = funnel.view().await;
        assert_eq!(view.state, FunnelState::DocumentExtracted);
        assert!(view.last_error.is_none());
    }

    #[tokio::test]
    async fn cancelled_upload_does_not_leave_session_busy() {
        let gate = Arc::new(Gate::default());
        let stub = Arc::new(StubClient {
            extract_gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let funnel = controller(&stub);

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), funnel.submit_document(&document()))
                .await;
        assert!(cancelled.is_err());

        let view = funnel.view().await;
        assert_eq!(view.state, FunnelState::Idle);
        assert!(!view.facets.busy);
        assert!(view.extraction.is_none());

        assert_eq!(
            funnel.submit_document(&document()).await.unwrap(),
            FunnelState::DocumentExtracted
        );
    }

    #[tokio::test]
    async fn cancelled_analysis_can_be_retried() {
        let gate = Arc::new(Gate::default());
        let stub = Arc::new(StubClient {
            analyze_gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let funnel = controller(&stub);
        funnel.submit_document(&document()).await.unwrap();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), funnel.run_analysis()).await;
        assert!(cancelled.is_err());

        let view = funnel.view().await;
        assert_eq!(view.state, FunnelState::DocumentExtracted);
        assert!(!view.facets.busy);
        assert!(view.allows(Intent::RunAnalysis));

        assert_eq!(funnel.run_analysis().await.unwrap(), FunnelState::AnalysisReady);
        assert_eq!(stub.analyze_requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn presented_offer_survives_reanalysis() {
        let stub = Arc::new(StubClient::default());
        let funnel = analysed(&stub).await;
        funnel.open_pre_approval().await;
        funnel.dismiss_pre_approval().await;

        funnel.run_analysis().await.unwrap();

        let view = funnel.view().await;
        assert!(view.facets.pre_approval_presented);
        assert!(view.allows(Intent::CaptureLead));
    }

    #[tokio::test]
    async fn views_are_published_per_intent() {
        let stub = Arc::new(StubClient::default());
        let funnel = controller(&stub);
        let mut rx = funnel.subscribe();

        funnel.submit_document(&document()).await.unwrap();

        let pending = rx.recv().await.unwrap();
        assert_eq!(pending.state, FunnelState::DocumentPending);
        assert!(pending.facets.busy);
        assert!(!pending.allows(Intent::RunAnalysis));

        let done = rx.recv().await.unwrap();
        assert_eq!(done.state, FunnelState::DocumentExtracted);
        assert!(done.allows(Intent::RunAnalysis));
        assert!(!done.allows(Intent::SendChatTurn));
    }

    #[test]
    fn empty_map_extraction_has_no_income() {
        assert!(SalaryExtraction::from_fields(Map::new()).monthly_income().is_none());
    }
}
