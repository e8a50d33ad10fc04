//! Format and inspect routines.
//!
//! Both claim the reader through [`Coordination`](crate::Coordination) for
//! their whole run, so the provisioning loop parks in `Paused` until they
//! return. Tags are located with a bounded detection budget rather than the
//! loop's stability filter: the operator is holding the key to the reader
//! and expects an answer.

use crate::coordination::Activity;
use crate::coordinator::SessionHandle;
use keycreator_core::constants::{MAINTENANCE_DETECT_ATTEMPTS, MAINTENANCE_DETECT_INTERVAL_MS};
use keycreator_core::{Error, Result, TagDetection, Technology, TransponderConfiguration};
use keycreator_erp::{ErpClient, ErpError, TransponderRecord};
use keycreator_hardware::Twn4Reader;
use keycreator_rfid::{
    ClassicReadout, DesfireDriver, Feedback, HitagDriver, MifareClassicDriver, ResetOutcome,
    TagSearch,
};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Result of one format run.
#[derive(Debug, Default)]
pub struct FormatReport {
    pub formatted: Vec<TagDetection>,
    /// Tags without an ERP record. Left untouched.
    pub skipped: Vec<TagDetection>,
    pub failed: Vec<(TagDetection, Error)>,
    /// Record codes removed from the ERP.
    pub deleted: Vec<String>,
}

impl FormatReport {
    /// Every detected tag was formatted.
    pub fn is_complete(&self) -> bool {
        !self.formatted.is_empty() && self.skipped.is_empty() && self.failed.is_empty()
    }
}

/// Payload found on a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reading {
    /// Decoded number block as hex digits.
    Hitag(String),
    Classic(ClassicReadout),
    Desfire(u32),
    /// Deister and EM carry nothing but their ID.
    FixedId,
}

/// One tag as seen by [`Maintenance::inspect`].
#[derive(Debug)]
pub struct TagInspection {
    pub detection: TagDetection,
    pub record: Option<TransponderRecord>,
    pub reading: Result<Reading>,
}

/// Maintenance routines sharing the reader with a provisioning loop.
pub struct Maintenance<E> {
    search: TagSearch,
    hitag: HitagDriver,
    classic: MifareClassicDriver,
    desfire: DesfireDriver,
    feedback: Feedback,
    erp: E,
    handle: SessionHandle,
    grace: Duration,
    attempts: u32,
    interval: Duration,
}

impl<E: ErpClient> Maintenance<E> {
    /// `handle` belongs to the loop that has to make way; `grace` is how long
    /// it gets to finish its current command.
    pub fn new(reader: Twn4Reader, erp: E, handle: SessionHandle, grace: Duration) -> Self {
        Self {
            search: TagSearch::new(reader.clone()),
            hitag: HitagDriver::new(reader.clone()),
            classic: MifareClassicDriver::new(reader.clone()),
            desfire: DesfireDriver::new(reader.clone()),
            feedback: Feedback::new(reader),
            erp,
            handle,
            grace,
            attempts: MAINTENANCE_DETECT_ATTEMPTS,
            interval: Duration::from_millis(MAINTENANCE_DETECT_INTERVAL_MS),
        }
    }

    /// Override the detection budget.
    pub fn with_detection(mut self, attempts: u32, interval: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.interval = interval;
        self
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.feedback.set_muted(muted);
    }

    /// Search until something answers or the budget runs out.
    ///
    /// Returns an empty list when nothing was found.
    pub async fn detect(&self) -> Result<Vec<TagDetection>> {
        for attempt in 1..=self.attempts {
            match self.search.detect_all().await {
                Ok(found) if !found.is_empty() => {
                    debug!(attempt, tags = found.len(), "Tags found for maintenance");
                    return Ok(found);
                }
                Ok(_) => {}
                Err(err) if err.is_recoverable() => {
                    debug!(attempt, error = %err, "Maintenance search failed");
                }
                Err(err) => return Err(err),
            }
            tokio::time::sleep(self.interval).await;
        }
        info!(attempts = self.attempts, "No tag found");
        Ok(Vec::new())
    }

    /// Wipe every registered tag on the reader and remove its ERP record.
    ///
    /// Records are only deleted when every detected tag was formatted.
    /// Formatted UIDs are cleared from the running session so the key can be
    /// provisioned again.
    ///
    /// # Errors
    ///
    /// Link failures during detection and ERP failures while deleting.
    /// Per tag failures are collected in the report.
    pub async fn format(&self) -> Result<FormatReport> {
        let _guard = self
            .handle
            .coordination()
            .acquire(Activity::Formatting, self.grace)
            .await?;

        let mut report = FormatReport::default();
        let mut codes: Vec<String> = Vec::new();

        for detection in self.detect().await? {
            let record = match self
                .erp
                .get_transponder_by_uid(detection.technology, &detection.uid)
                .await
            {
                Ok(Some(record)) => record,
                Ok(None) => {
                    warn!(tag = %detection, "No ERP record, tag skipped");
                    report.skipped.push(detection);
                    continue;
                }
                Err(err) => {
                    report.failed.push((detection, err.into()));
                    continue;
                }
            };

            match self.format_tag(&detection, &record).await {
                Ok(()) => {
                    self.handle.forget(&detection.uid);
                    if !codes.contains(&record.code) {
                        codes.push(record.code.clone());
                    }
                    report.formatted.push(detection);
                }
                Err(err) => {
                    error!(tag = %detection, error = %err, "Format failed");
                    report.failed.push((detection, err));
                }
            }
        }

        if report.is_complete() {
            for code in codes {
                self.erp.delete_transponder(&code).await?;
                info!(code = %code, "Transponder record deleted");
                report.deleted.push(code);
            }
        } else if !codes.is_empty() {
            warn!(
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "Format incomplete, records kept"
            );
        }

        self.play(report.is_complete()).await;
        Ok(report)
    }

    async fn format_tag(&self, detection: &TagDetection, record: &TransponderRecord) -> Result<()> {
        let config = self.configuration_of(record).await?;
        self.select(detection).await?;

        match detection.technology {
            Technology::Hitag1S => self.hitag.reset(&detection.uid).await,
            Technology::MifareClassic => self.classic.format(config.mifare_classic.as_ref()).await,
            Technology::MifareDesfire => {
                let master_key = config.mifare_desfire.as_ref().map(|p| &p.master_key);
                match self.desfire.reset_to_default(master_key).await? {
                    ResetOutcome::AlreadyDefault => debug!(tag = %detection, "DESFire already blank"),
                    ResetOutcome::Formatted => {}
                }
                Ok(())
            }
            Technology::Deister | Technology::Em => Ok(()),
        }
    }

    /// Read what every tag on the reader carries, using the keys of the
    /// configuration its ERP record points to.
    pub async fn inspect(&self) -> Result<Vec<TagInspection>> {
        let _guard = self
            .handle
            .coordination()
            .acquire(Activity::Reading, self.grace)
            .await?;

        let mut inspections = Vec::new();
        for detection in self.detect().await? {
            let record = self
                .erp
                .get_transponder_by_uid(detection.technology, &detection.uid)
                .await?;
            let reading = self.read_tag(&detection, record.as_ref()).await;
            match &reading {
                Ok(reading) => info!(tag = %detection, ?reading, "Tag read"),
                Err(err) => warn!(tag = %detection, error = %err, "Tag read failed"),
            }
            inspections.push(TagInspection {
                detection,
                record,
                reading,
            });
        }

        self.play(inspections.iter().all(|i| i.reading.is_ok())).await;
        Ok(inspections)
    }

    async fn read_tag(
        &self,
        detection: &TagDetection,
        record: Option<&TransponderRecord>,
    ) -> Result<Reading> {
        if matches!(detection.technology, Technology::Deister | Technology::Em) {
            return Ok(Reading::FixedId);
        }
        let config = match record {
            Some(record) => Some(self.configuration_of(record).await?),
            None => None,
        };
        self.select(detection).await?;

        match detection.technology {
            Technology::Hitag1S => Ok(Reading::Hitag(self.hitag.read_number(&detection.uid).await?)),
            Technology::MifareClassic => {
                let params = config
                    .as_ref()
                    .and_then(|c| c.mifare_classic.as_ref())
                    .ok_or_else(|| missing_params(detection))?;
                Ok(Reading::Classic(self.classic.inspect(params).await?))
            }
            Technology::MifareDesfire => {
                let params = config
                    .as_ref()
                    .and_then(|c| c.mifare_desfire.as_ref())
                    .ok_or_else(|| missing_params(detection))?;
                Ok(Reading::Desfire(self.desfire.read_number(params).await?))
            }
            Technology::Deister | Technology::Em => Ok(Reading::FixedId),
        }
    }

    async fn configuration_of(&self, record: &TransponderRecord) -> Result<TransponderConfiguration> {
        let customer = record
            .customer
            .as_deref()
            .ok_or_else(|| ErpError::InvalidRequest(format!("record {} has no customer", record.code)))?;
        Ok(self.erp.get_configuration(customer).await?)
    }

    async fn select(&self, detection: &TagDetection) -> Result<()> {
        match self.search.detect(detection.technology).await? {
            Some(found) if found.uid == detection.uid => Ok(()),
            _ => Err(Error::rejected(format!("select {}", detection))),
        }
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

fn missing_params(detection: &TagDetection) -> Error {
    Error::Config(format!("No {} parameters for {}", detection.technology, detection.uid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{SessionCoordinator, TokenOutcome};
    use keycreator_core::{ClassicKey, HitagParams, MifareClassicParams, SessionConfig, Uid};
    use keycreator_erp::InMemoryErp;
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

    fn config() -> TransponderConfiguration {
        TransponderConfiguration::new("TC-1", "CUST-1")
            .with_hitag(HitagParams { feig_coding: true })
            .with_mifare_classic(MifareClassicParams {
                key_a: ClassicKey::from_hex("A1B2C3D4E5F6").unwrap(),
                key_b: None,
                sector: 1,
                skip_bytes: 0,
                read_bytes: 4,
            })
    }

    /// Coordinator with one provisioned key on the reader.
    async fn provisioned(sim: &VirtualReader, erp: &InMemoryErp) -> SessionCoordinator<InMemoryErp> {
        sim.place(VirtualTag::hitag(HITAG_UID));
        sim.place(VirtualTag::classic(CLASSIC_UID));
        let settings = SessionConfig {
            poll_interval_ms: 0,
            maintenance_grace_ms: 0,
            ..SessionConfig::default()
        };
        let mut coordinator = SessionCoordinator::new(reader(sim), erp.clone(), settings);
        coordinator.set_muted(true);
        coordinator.start_session(config(), Some("200017")).unwrap();
        for _ in 0..10 {
            if let Some(outcome) = coordinator.tick().await.unwrap() {
                assert!(matches!(outcome, TokenOutcome::Provisioned { .. }));
                return coordinator;
            }
        }
        panic!("key was not provisioned");
    }

    fn maintenance(
        sim: &VirtualReader,
        erp: &InMemoryErp,
        handle: SessionHandle,
    ) -> Maintenance<InMemoryErp> {
        let mut maintenance = Maintenance::new(reader(sim), erp.clone(), handle, Duration::ZERO)
            .with_detection(3, Duration::from_millis(1));
        maintenance.set_muted(true);
        maintenance
    }

    #[tokio::test]
    async fn test_format_wipes_key_and_deletes_record() {
        let sim = VirtualReader::new();
        let erp = InMemoryErp::new().with_configuration(config());
        let mut coordinator = provisioned(&sim, &erp).await;
        let maintenance = maintenance(&sim, &erp, coordinator.handle());

        let report = maintenance.format().await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.formatted.len(), 2);
        assert_eq!(report.deleted, vec!["200017".to_string()]);
        assert!(erp.records().is_empty());

        let hitag = sim.tag(&HITAG_UID).unwrap();
        assert_eq!(hitag.block(0x1C), Some([0; 16]));
        let classic = sim.tag(&CLASSIC_UID).unwrap();
        assert_eq!(classic.block(4), Some([0; 16]));
        assert_eq!(classic.block(7).unwrap()[..6], [0xFF; 6]);

        assert!(coordinator.handle().coordination().is_idle());
        coordinator.tick().await.unwrap();
        let context = coordinator.context().unwrap();
        assert!(!context.is_judged(&Uid::new(HITAG_UID.to_vec())));
        assert!(!context.is_judged(&Uid::new(CLASSIC_UID.to_vec())));
    }

    #[tokio::test]
    async fn test_unregistered_tag_is_skipped() {
        let sim = VirtualReader::new();
        sim.place(VirtualTag::hitag(HITAG_UID));
        let erp = InMemoryErp::new().with_configuration(config());
        let coordinator = SessionCoordinator::new(reader(&sim), erp.clone(), SessionConfig::default());
        let maintenance = maintenance(&sim, &erp, coordinator.handle());

        let report = maintenance.format().await.unwrap();
        assert_eq!(report.skipped.len(), 1);
        assert!(report.formatted.is_empty());
        assert!(report.deleted.is_empty());
        assert!(!report.is_complete());
        assert_eq!(sim.count(Opcode::HitagWriteBlock), 0);
    }

    #[tokio::test]
    async fn test_partial_format_keeps_record() {
        let sim = VirtualReader::new();
        let erp = InMemoryErp::new().with_configuration(config());
        let coordinator = provisioned(&sim, &erp).await;
        sim.force_status(Opcode::ClassicWriteBlock, 0x04);
        let maintenance = maintenance(&sim, &erp, coordinator.handle());

        let report = maintenance.format().await.unwrap();
        assert_eq!(report.formatted.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0.technology, Technology::MifareClassic);
        assert!(report.deleted.is_empty());
        assert_eq!(erp.records().len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_on_reader() {
        let sim = VirtualReader::new();
        let erp = InMemoryErp::new();
        let coordinator = SessionCoordinator::new(reader(&sim), erp.clone(), SessionConfig::default());
        let maintenance = maintenance(&sim, &erp, coordinator.handle());

        assert!(maintenance.detect().await.unwrap().is_empty());
        let report = maintenance.format().await.unwrap();
        assert!(report.formatted.is_empty() && report.skipped.is_empty());
        assert!(erp.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_inspect_reads_provisioned_key() {
        let sim = VirtualReader::new();
        let erp = InMemoryErp::new().with_configuration(config());
        let coordinator = provisioned(&sim, &erp).await;
        let maintenance = maintenance(&sim, &erp, coordinator.handle());

        let inspections = maintenance.inspect().await.unwrap();
        assert_eq!(inspections.len(), 2);
        for inspection in &inspections {
            assert_eq!(inspection.record.as_ref().unwrap().code, "200017");
            match inspection.reading.as_ref().unwrap() {
                Reading::Hitag(value) => assert_eq!(value, "200017"),
                Reading::Classic(readout) => {
                    assert_eq!(readout.value, 200_017);
                    assert!(!readout.default_key);
                }
                other => panic!("unexpected reading {other:?}"),
            }
        }
        assert!(coordinator.handle().coordination().is_idle());
    }

    #[tokio::test]
    async fn test_inspect_without_record_needs_configuration() {
        let sim = VirtualReader::new();
        sim.place(VirtualTag::classic(CLASSIC_UID));
        let erp = InMemoryErp::new();
        let coordinator = SessionCoordinator::new(reader(&sim), erp.clone(), SessionConfig::default());
        let maintenance = maintenance(&sim, &erp, coordinator.handle());

        let inspections = maintenance.inspect().await.unwrap();
        assert_eq!(inspections.len(), 1);
        assert!(inspections[0].record.is_none());
        assert!(matches!(inspections[0].reading, Err(Error::Config(_))));
    }
}
