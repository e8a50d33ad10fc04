//! The provisioning loop.
//!
//! ```text
//!   poll ──► stable token ──► technology set == required? ──no──► Wrong
//!                                     │yes
//!                           number in window, UIDs unregistered
//!                                     │
//!                       write each programmable transponder
//!                                     │
//!                        read every written transponder back
//!                                     │
//!                     create ERP record ──► increment ──► Correct
//! ```
//!
//! Link and protocol failures, as well as commands a tag refused, send the
//! loop back to searching without judging the token: the key was most
//! likely lifted. Any other failure marks the token's UIDs wrong for the rest
//! of the session and is returned to the caller as a
//! [`TokenOutcome::Rejected`].

use crate::allocator::NumberAllocator;
use crate::context::{SessionContext, Verdict};
use crate::coordination::Coordination;
use crate::state_machine::{SessionState, StateMachine};
use keycreator_core::{
    Error, Result, SerialNumber, SessionConfig, TagDetection, Technology, TechnologySet,
    TransponderConfiguration, Uid,
};
use keycreator_erp::{ErpClient, ErpError, NewTransponder};
use keycreator_hardware::Twn4Reader;
use keycreator_rfid::{DesfireDriver, Feedback, HitagDriver, MifareClassicDriver, TagSearch};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What happened to one token.
#[derive(Debug)]
pub enum TokenOutcome {
    Provisioned {
        number: SerialNumber,
        tags: Vec<TagDetection>,
    },
    Rejected {
        tags: Vec<TagDetection>,
        error: Error,
    },
}

#[derive(Debug)]
struct Shared {
    generation: AtomicU64,
    cancelled: AtomicBool,
    coordination: Coordination,
    forget: mpsc::UnboundedSender<Uid>,
}

/// Cloneable control surface of a running loop.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Live session id. Zero before the first session.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Ask the loop to stop before its next poll.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Invalidate the live session id. A loop still running under it aborts
    /// with `Error::StaleSession` at its next iteration.
    pub fn stop(&self) -> u64 {
        let next = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation = next, "Session invalidated");
        next
    }

    pub fn coordination(&self) -> &Coordination {
        &self.shared.coordination
    }

    /// Let the loop judge `uid` afresh, typically after it was formatted.
    pub fn forget(&self, uid: &Uid) {
        if self.shared.forget.send(uid.clone()).is_err() {
            debug!(uid = %uid, "Session loop gone, nothing to forget");
        }
    }
}

#[derive(Debug)]
struct ActiveSession {
    config: TransponderConfiguration,
    allocator: NumberAllocator,
    context: SessionContext,
}

/// Owns the provisioning loop and everything it touches.
///
/// The ERP client is a type parameter because [`ErpClient`] uses native
/// async trait methods.
pub struct SessionCoordinator<E> {
    search: TagSearch,
    hitag: HitagDriver,
    classic: MifareClassicDriver,
    desfire: DesfireDriver,
    feedback: Feedback,
    erp: E,
    settings: SessionConfig,
    handle: SessionHandle,
    forgotten: mpsc::UnboundedReceiver<Uid>,
    machine: StateMachine,
    session: Option<ActiveSession>,
}

impl<E: ErpClient> SessionCoordinator<E> {
    pub fn new(reader: Twn4Reader, erp: E, settings: SessionConfig) -> Self {
        Self::with_coordination(reader, erp, settings, Coordination::new())
    }

    pub fn with_coordination(
        reader: Twn4Reader,
        erp: E,
        settings: SessionConfig,
        coordination: Coordination,
    ) -> Self {
        let (forget, forgotten) = mpsc::unbounded_channel();
        Self {
            search: TagSearch::with_threshold(reader.clone(), settings.stability_threshold),
            hitag: HitagDriver::new(reader.clone()),
            classic: MifareClassicDriver::new(reader.clone()),
            desfire: DesfireDriver::new(reader.clone()),
            feedback: Feedback::new(reader),
            erp,
            settings,
            handle: SessionHandle {
                shared: Arc::new(Shared {
                    generation: AtomicU64::new(0),
                    cancelled: AtomicBool::new(false),
                    coordination,
                    forget,
                }),
            },
            forgotten,
            machine: StateMachine::new(),
            session: None,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn erp(&self) -> &E {
        &self.erp
    }

    pub fn state(&self) -> SessionState {
        *self.machine.current_state()
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    pub fn context(&self) -> Option<&SessionContext> {
        self.session.as_ref().map(|s| &s.context)
    }

    pub fn current_number(&self) -> Option<SerialNumber> {
        self.session.as_ref().and_then(|s| s.allocator.current())
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.feedback.set_muted(muted);
    }

    /// Begin a session for `config` and return its id.
    ///
    /// `start_number` defaults to the bottom of the configuration's number
    /// window.
    ///
    /// # Errors
    ///
    /// `Error::Config` when the configuration requires nothing,
    /// `Error::InvalidNumber` or `Error::NumberOutOfRange` for a bad start
    /// number.
    pub fn start_session(
        &mut self,
        config: TransponderConfiguration,
        start_number: Option<&str>,
    ) -> Result<u64> {
        let required = config.required_technologies();
        if required.is_empty() {
            return Err(Error::Config(format!(
                "Configuration {} requires no technology",
                config.name
            )));
        }

        let mut allocator = NumberAllocator::new(&required);
        let number = match start_number {
            Some(input) => allocator.set_number(input)?,
            None => allocator.current_or_default()?,
        };

        let id = self.handle.stop();
        self.handle.shared.cancelled.store(false, Ordering::SeqCst);
        while self.forgotten.try_recv().is_ok() {}
        self.search.reset();
        self.machine.reset();
        self.machine.transition_to(SessionState::Searching)?;

        info!(
            session = id,
            config = %config.name,
            customer = %config.customer,
            required = %required,
            number = %number,
            "Session started"
        );
        self.session = Some(ActiveSession {
            context: SessionContext::new(id, required),
            config,
            allocator,
        });
        Ok(id)
    }

    /// End the session and invalidate its id.
    pub fn stop_session(&mut self) {
        self.handle.stop();
        self.machine.reset();
        if let Some(session) = self.session.take() {
            info!(
                session = session.context.session_id(),
                provisioned = session.context.provisioned(),
                rejected = session.context.rejected(),
                "Session stopped"
            );
        }
    }

    /// Poll until cancelled.
    ///
    /// # Errors
    ///
    /// `Error::StaleSession` once a newer session id is live, and any error
    /// the loop cannot recover from.
    pub async fn run(&mut self) -> Result<()> {
        if let Err(err) = self.feedback.init_leds().await {
            warn!(error = %err, "LED init failed");
        }
        loop {
            if self.handle.is_cancelled() {
                info!("Session cancelled");
                self.machine.reset();
                return Ok(());
            }
            match self.tick().await? {
                Some(TokenOutcome::Provisioned { number, tags }) => {
                    info!(number = %number, tags = tags.len(), "Key done");
                }
                Some(TokenOutcome::Rejected { error, .. }) => {
                    warn!(error = %error, "Key rejected");
                }
                None => {}
            }
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
    }

    /// One iteration of the loop.
    ///
    /// # Errors
    ///
    /// `Error::StaleSession` when the live id moved on,
    /// `Error::InvalidStateTransition` without a started session.
    pub async fn tick(&mut self) -> Result<Option<TokenOutcome>> {
        self.ensure_current()?;

        if !self.handle.coordination().is_idle() {
            self.pause().await?;
            return Ok(None);
        }
        self.apply_forgotten();

        let Some(session) = self.session.as_ref() else {
            return Err(Error::InvalidStateTransition {
                from: self.machine.current_state().to_string(),
                to: SessionState::Searching.to_string(),
            });
        };
        let context = &session.context;
        let polled = self.search.poll(|uid| context.is_judged(uid)).await;

        match polled {
            Ok(None) => Ok(None),
            Ok(Some(token)) => self.process(token).await,
            Err(err) if err.is_recoverable() => {
                warn!(error = %err, "Search failed, searching again");
                self.search.reset();
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn ensure_current(&self) -> Result<()> {
        let captured = self
            .session
            .as_ref()
            .map(|s| s.context.session_id())
            .unwrap_or_default();
        let current = self.handle.generation();
        if captured != current {
            warn!(captured, current, "Stale session");
            return Err(Error::StaleSession { captured, current });
        }
        Ok(())
    }

    fn apply_forgotten(&mut self) {
        while let Ok(uid) = self.forgotten.try_recv() {
            if let Some(session) = self.session.as_mut()
                && session.context.clear(&uid)
            {
                debug!(uid = %uid, "UID cleared from session");
            }
        }
    }

    async fn pause(&mut self) -> Result<()> {
        let coordination = self.handle.coordination().clone();
        info!(holder = %coordination.current(), "Pausing for maintenance");
        self.machine.transition_to(SessionState::Paused)?;

        while !self.handle.is_cancelled() {
            if coordination
                .wait_idle_for(self.settings.poll_interval())
                .await?
            {
                break;
            }
        }

        self.apply_forgotten();
        self.search.reset();
        self.machine.transition_to(SessionState::Searching)?;
        info!("Resuming after maintenance");
        Ok(())
    }

    async fn process(&mut self, token: Vec<TagDetection>) -> Result<Option<TokenOutcome>> {
        self.machine.transition_to(SessionState::Detecting)?;

        match self.provision(&token).await {
            Ok(number) => {
                if let Some(session) = self.session.as_mut() {
                    session.context.judge(&token, Verdict::Correct);
                }
                self.play(true).await;
                self.machine.back_to_searching();
                Ok(Some(TokenOutcome::Provisioned {
                    number,
                    tags: token,
                }))
            }
            Err(err) if err.is_recoverable() => {
                warn!(error = %err, state = %self.state(), "Token lost, searching again");
                self.search.reset();
                self.machine.back_to_searching();
                Ok(None)
            }
            Err(err) => {
                error!(error = %err, state = %self.state(), "Token rejected");
                if let Some(session) = self.session.as_mut() {
                    session.context.judge(&token, Verdict::Wrong);
                }
                self.play(false).await;
                self.machine.back_to_searching();
                Ok(Some(TokenOutcome::Rejected { tags: token, error: err }))
            }
        }
    }

    async fn provision(&mut self, token: &[TagDetection]) -> Result<SerialNumber> {
        let Some(session) = self.session.as_mut() else {
            return Err(Error::Cancelled);
        };
        let config = session.config.clone();

        let detected: TechnologySet = token.iter().map(|d| d.technology).collect();
        let required = config.required_technologies();
        if detected != required {
            warn!(detected = %detected, required = %required, "Technology set mismatch");
            return Err(Error::ConfigurationMismatch { detected, required });
        }

        self.machine.transition_to(SessionState::ValidatingNumber)?;
        let number = session.allocator.current_or_default()?;
        self.ensure_unregistered(token).await?;

        self.machine.transition_to(SessionState::Writing)?;
        let mut written = Vec::new();
        for detection in token {
            if self.write(&config, detection, number).await? {
                written.push(detection);
            }
        }

        self.machine
            .transition_to(SessionState::VerifyingWriteback)?;
        for detection in written {
            self.verify(&config, detection, number).await?;
        }

        self.machine.transition_to(SessionState::Reporting)?;
        let transponder = NewTransponder {
            customer: config.customer.clone(),
            number,
            uids: token
                .iter()
                .map(|d| (d.technology, d.uid.clone()))
                .collect(),
            test_key: self.settings.test_key,
        };
        self.erp.create_transponder(&transponder).await?;

        if let Some(session) = self.session.as_mut()
            && let Err(err) = session.allocator.increment()
        {
            error!(error = %err, "Number window exhausted, ending session");
            self.handle.cancel();
        }
        info!(number = %number, "Key provisioned");
        Ok(number)
    }

    async fn ensure_unregistered(&self, token: &[TagDetection]) -> Result<()> {
        let mut registered = Vec::new();
        for detection in token {
            if let Some(record) = self
                .erp
                .get_transponder_by_uid(detection.technology, &detection.uid)
                .await?
            {
                warn!(uid = %detection.uid, code = %record.code, "UID already registered");
                registered.push(format!("{} {}", detection.technology, detection.uid));
            }
        }
        if registered.is_empty() {
            return Ok(());
        }
        Err(ErpError::AlreadyExists { uids: registered }.into())
    }

    /// Put the reader back on `detection`'s tag before talking to it.
    async fn select(&self, detection: &TagDetection) -> Result<()> {
        match self.search.detect(detection.technology).await? {
            Some(found) if found.uid == detection.uid => Ok(()),
            _ => Err(Error::rejected(format!("select {}", detection))),
        }
    }

    /// Returns whether anything was written.
    async fn write(
        &self,
        config: &TransponderConfiguration,
        detection: &TagDetection,
        number: SerialNumber,
    ) -> Result<bool> {
        match detection.technology {
            Technology::Hitag1S => match &config.hitag {
                Some(params) if params.feig_coding => {
                    self.select(detection).await?;
                    self.hitag.write_number(&detection.uid, number).await?;
                    Ok(true)
                }
                _ => {
                    debug!(uid = %detection.uid, "HITAG without Feig coding, nothing to write");
                    Ok(false)
                }
            },
            Technology::MifareClassic => {
                let params = required_params(config.mifare_classic.as_ref(), detection)?;
                self.select(detection).await?;
                self.classic.program(params, number).await?;
                Ok(true)
            }
            Technology::MifareDesfire => {
                let params = required_params(config.mifare_desfire.as_ref(), detection)?;
                self.select(detection).await?;
                self.desfire.provision(params, number).await?;
                Ok(true)
            }
            Technology::Deister | Technology::Em => {
                debug!(tag = %detection, "Fixed ID, nothing to write");
                Ok(false)
            }
        }
    }

    async fn verify(
        &self,
        config: &TransponderConfiguration,
        detection: &TagDetection,
        number: SerialNumber,
    ) -> Result<()> {
        self.select(detection).await?;
        let actual = match detection.technology {
            Technology::Hitag1S => self.hitag.read_number(&detection.uid).await?,
            Technology::MifareClassic => {
                let params = required_params(config.mifare_classic.as_ref(), detection)?;
                format!("{:06}", self.classic.inspect(params).await?.value)
            }
            Technology::MifareDesfire => {
                let params = required_params(config.mifare_desfire.as_ref(), detection)?;
                format!("{:06}", self.desfire.read_number(params).await?)
            }
            Technology::Deister | Technology::Em => return Ok(()),
        };
        let expected = number.to_padded();
        if actual != expected {
            return Err(Error::verification(expected, actual));
        }
        debug!(tag = %detection, number = %number, "Writeback verified");
        Ok(())
    }

    async fn play(&self, ok: bool) {
        let result = if ok {
            self.feedback.beep_ok().await
        } else {
            self.feedback.beep_error().await
        };
        if let Err(err) = result {
            warn!(error = %err, "Feedback failed");
        }
    }
}

fn required_params<'a, T>(params: Option<&'a T>, detection: &TagDetection) -> Result<&'a T> {
    params.ok_or_else(|| {
        Error::Config(format!(
            "No {} parameters in configuration",
            detection.technology
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keycreator_core::{ClassicKey, HitagParams, MifareClassicParams};
    use keycreator_erp::{InMemoryErp, TransponderRecord};
    use keycreator_hardware::mock::VirtualTag;
    use keycreator_hardware::{AnyLink, ChannelOptions, CommandChannel, MockLink, VirtualReader};
    use keycreator_protocol::Opcode;

    const HITAG_UID: [u8; 4] = [0x04, 0x4A, 0x3C, 0x91];
    const CLASSIC_UID: [u8; 4] = [0x9F, 0x3C, 0x11, 0x02];

    fn reader(sim: &VirtualReader) -> Twn4Reader {
        let (link, _handle) = MockLink::with_responder(sim.clone());
        let (channel, _worker) =
            CommandChannel::spawn(AnyLink::Mock(link), ChannelOptions::default());
        Twn4Reader::new(channel)
    }

    fn settings() -> SessionConfig {
        SessionConfig {
            poll_interval_ms: 0,
            maintenance_grace_ms: 0,
            ..SessionConfig::default()
        }
    }

    fn classic_params() -> MifareClassicParams {
        MifareClassicParams {
            key_a: ClassicKey::from_hex("A1B2C3D4E5F6").unwrap(),
            key_b: None,
            sector: 1,
            skip_bytes: 0,
            read_bytes: 4,
        }
    }

    fn hitag_and_classic() -> TransponderConfiguration {
        TransponderConfiguration::new("TC-1", "CUST-1")
            .with_hitag(HitagParams { feig_coding: true })
            .with_mifare_classic(classic_params())
    }

    fn coordinator(sim: &VirtualReader, erp: InMemoryErp) -> SessionCoordinator<InMemoryErp> {
        let mut coordinator = SessionCoordinator::new(reader(sim), erp, settings());
        coordinator.set_muted(true);
        coordinator
    }

    async fn tick_until_outcome(coordinator: &mut SessionCoordinator<InMemoryErp>) -> TokenOutcome {
        for _ in 0..10 {
            if let Some(outcome) = coordinator.tick().await.unwrap() {
                return outcome;
            }
        }
        panic!("no token outcome after 10 ticks");
    }

    #[tokio::test]
    async fn test_provisions_hitag_and_classic_key() {
        let sim = VirtualReader::new();
        sim.place(VirtualTag::hitag(HITAG_UID));
        sim.place(VirtualTag::classic(CLASSIC_UID));
        let erp = InMemoryErp::new();
        let mut coordinator = coordinator(&sim, erp.clone());
        coordinator
            .start_session(hitag_and_classic(), Some("200017"))
            .unwrap();

        let outcome = tick_until_outcome(&mut coordinator).await;
        let TokenOutcome::Provisioned { number, tags } = outcome else {
            panic!("expected provisioned, got {outcome:?}");
        };
        assert_eq!(number.to_padded(), "200017");
        assert_eq!(tags.len(), 2);

        let records = erp.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].code, "200017");
        assert_eq!(records[0].hitag_uid.as_deref(), Some("044A3C91"));
        assert_eq!(records[0].mfcl_uid.as_deref(), Some("9F3C1102"));

        assert_eq!(coordinator.current_number().unwrap().to_padded(), "200018");
        assert_eq!(coordinator.state(), SessionState::Searching);
        assert!(coordinator.machine().has_visited(SessionState::Reporting));

        let context = coordinator.context().unwrap();
        assert_eq!(
            context.verdict(&Uid::new(HITAG_UID.to_vec())),
            Some(Verdict::Correct)
        );
    }

    #[tokio::test]
    async fn test_subset_token_never_reaches_writing() {
        let sim = VirtualReader::new();
        sim.place(VirtualTag::hitag(HITAG_UID));
        let erp = InMemoryErp::new();
        let mut coordinator = coordinator(&sim, erp.clone());
        coordinator.start_session(hitag_and_classic(), None).unwrap();

        let outcome = tick_until_outcome(&mut coordinator).await;
        let TokenOutcome::Rejected { error, .. } = outcome else {
            panic!("expected rejection, got {outcome:?}");
        };
        let Error::ConfigurationMismatch { detected, required } = error else {
            panic!("expected mismatch, got {error}");
        };
        assert_eq!(detected.len(), 1);
        assert_eq!(required.len(), 2);

        assert!(!coordinator.machine().has_visited(SessionState::Writing));
        assert_eq!(sim.count(Opcode::HitagWriteBlock), 0);
        assert!(erp.records().is_empty());
        assert_eq!(coordinator.state(), SessionState::Searching);
    }

    #[tokio::test]
    async fn test_judged_token_is_not_reevaluated() {
        let sim = VirtualReader::new();
        sim.place(VirtualTag::hitag(HITAG_UID));
        let mut coordinator = coordinator(&sim, InMemoryErp::new());
        coordinator.start_session(hitag_and_classic(), None).unwrap();

        tick_until_outcome(&mut coordinator).await;
        for _ in 0..5 {
            assert!(coordinator.tick().await.unwrap().is_none());
        }
        assert_eq!(coordinator.context().unwrap().rejected(), 1);

        coordinator.handle().forget(&Uid::new(HITAG_UID.to_vec()));
        let outcome = tick_until_outcome(&mut coordinator).await;
        assert!(matches!(outcome, TokenOutcome::Rejected { .. }));
        assert_eq!(coordinator.context().unwrap().rejected(), 2);
    }

    #[tokio::test]
    async fn test_hitag_without_feig_coding_is_registered_unwritten() {
        let sim = VirtualReader::new();
        sim.place(VirtualTag::hitag(HITAG_UID));
        let erp = InMemoryErp::new();
        let mut coordinator = coordinator(&sim, erp.clone());
        let config = TransponderConfiguration::new("TC-2", "CUST-2")
            .with_hitag(HitagParams { feig_coding: false });
        coordinator.start_session(config, Some("100000")).unwrap();

        let outcome = tick_until_outcome(&mut coordinator).await;
        assert!(matches!(outcome, TokenOutcome::Provisioned { .. }));
        assert_eq!(sim.count(Opcode::HitagWriteBlock), 0);
        assert_eq!(erp.records()[0].code, "100000");
    }

    #[tokio::test]
    async fn test_registered_uid_is_refused_before_writing() {
        let sim = VirtualReader::new();
        sim.place(VirtualTag::hitag(HITAG_UID));
        let erp = InMemoryErp::new();
        erp.insert_record(TransponderRecord {
            code: "100500".into(),
            hitag_uid: Some("044A3C91".into()),
            ..TransponderRecord::default()
        });
        let mut coordinator = coordinator(&sim, erp.clone());
        let config = TransponderConfiguration::new("TC-3", "CUST-3")
            .with_hitag(HitagParams { feig_coding: true });
        coordinator.start_session(config, None).unwrap();

        let outcome = tick_until_outcome(&mut coordinator).await;
        assert!(matches!(
            outcome,
            TokenOutcome::Rejected { error: Error::Erp(_), .. }
        ));
        assert_eq!(sim.count(Opcode::HitagWriteBlock), 0);
        assert_eq!(coordinator.current_number().unwrap().to_padded(), "100000");
    }

    #[tokio::test]
    async fn test_stopped_session_is_stale() {
        let sim = VirtualReader::new();
        let mut coordinator = coordinator(&sim, InMemoryErp::new());
        let id = coordinator.start_session(hitag_and_classic(), None).unwrap();

        coordinator.handle().stop();
        let err = coordinator.tick().await.unwrap_err();
        assert!(matches!(err, Error::StaleSession { captured, .. } if captured == id));

        let next = coordinator.start_session(hitag_and_classic(), None).unwrap();
        assert!(next > id);
        assert!(coordinator.tick().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_ends_run() {
        let sim = VirtualReader::new();
        let mut coordinator = coordinator(&sim, InMemoryErp::new());
        coordinator.start_session(hitag_and_classic(), None).unwrap();
        coordinator.handle().cancel();

        coordinator.run().await.unwrap();
        assert_eq!(coordinator.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_configuration_without_technologies_is_refused() {
        let sim = VirtualReader::new();
        let mut coordinator = coordinator(&sim, InMemoryErp::new());
        let result = coordinator.start_session(TransponderConfiguration::new("TC-0", "CUST-0"), None);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
