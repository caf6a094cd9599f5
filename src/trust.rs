//! The trust core: governor, DNAuth store and QRNet registry wired to one
//! audit log.
//!
//! Build one with [`TrustCore::builder`]. Every collaborator has a default:
//! the system clock, OS entropy, no approver, and an audit sink chosen from
//! the config (file when `audit.path` is set, memory otherwise).

use std::sync::Arc;

use tracing::{info, warn};

use crate::advisory::{self, Advisory};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::crypto::Digest;
use crate::dnauth::DnaStore;
use crate::entropy::{EntropySource, OsEntropy};
use crate::error::CoreError;
use crate::geology::{AuditLog, AuditSink};
use crate::governor::approval::Approver;
use crate::governor::classifier::Classifier;
use crate::governor::patterns::PatternTable;
use crate::governor::{Governor, PolicyVersion};
use crate::qrnet::QrNet;

/// Builder for [`TrustCore`].
#[derive(Default)]
pub struct TrustCoreBuilder {
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    entropy: Option<Arc<dyn EntropySource>>,
    approver: Option<Arc<dyn Approver>>,
    sink: Option<Box<dyn AuditSink>>,
    classifier: Option<Classifier>,
    secret: Option<Digest>,
}

impl std::fmt::Debug for TrustCoreBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustCoreBuilder")
            .field("config", &self.config)
            .field("clock", &self.clock.is_some())
            .field("entropy", &self.entropy.is_some())
            .field("approver", &self.approver.is_some())
            .field("sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

impl TrustCoreBuilder {
    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use `clock` for every tick.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `entropy` for salts, nonces, secrets and evolution.
    pub fn entropy(mut self, entropy: Arc<dyn EntropySource>) -> Self {
        self.entropy = Some(entropy);
        self
    }

    /// Ask `approver` in interactive mode.
    pub fn approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = Some(approver);
        self
    }

    /// Write audit events to `sink`, overriding `audit.path`.
    pub fn sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use `classifier` instead of the configured table.
    pub fn classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Fix the DNAuth secret, so identity keys survive a restart.
    pub fn secret(mut self, secret: Digest) -> Self {
        self.secret = Some(secret);
        self
    }

    /// Wire everything together.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidInput`] for a bad pattern table.
    /// - [`CoreError::AuditFailure`] if the audit file or content directory
    ///   cannot be opened, or an existing audit file fails its chain check.
    pub fn build(self) -> Result<TrustCore, CoreError> {
        let config = self.config;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        let entropy = self
            .entropy
            .unwrap_or_else(|| Arc::new(OsEntropy) as Arc<dyn EntropySource>);

        let audit = Arc::new(match (self.sink, &config.audit.path) {
            (Some(sink), _) => AuditLog::with_sink(Arc::clone(&clock), sink, config.audit.durable),
            (None, Some(path)) => AuditLog::open(path, Arc::clone(&clock), config.audit.durable)?,
            (None, None) => AuditLog::in_memory(Arc::clone(&clock)),
        });

        let classifier = match (self.classifier, &config.classifier.table) {
            (Some(c), _) => c,
            (None, Some(path)) => Classifier::new(PatternTable::load(path)?)?,
            (None, None) => Classifier::builtin()?,
        };

        let mut governor = Governor::new(
            config.governor.clone(),
            classifier,
            Arc::clone(&audit),
            Arc::clone(&clock),
        );
        if let Some(approver) = self.approver {
            governor = governor.with_approver(approver);
        }
        let governor = Arc::new(governor);

        let mut dnauth = DnaStore::new(
            config.dnauth.clone(),
            Arc::clone(&audit),
            Arc::clone(&clock),
            Arc::clone(&entropy),
        );
        if let Some(secret) = self.secret {
            dnauth = dnauth.with_secret(secret);
        }
        let dnauth = Arc::new(dnauth);

        let qrnet = QrNet::new(
            config.qrnet.clone(),
            Arc::clone(&audit),
            Arc::clone(&clock),
            entropy,
            Arc::clone(&dnauth),
            Arc::clone(&governor) as Arc<dyn PolicyVersion>,
        )?;

        info!(
            audit_events = audit.len(),
            file_sink = config.audit.path.is_some(),
            "trust core ready"
        );
        Ok(TrustCore {
            config,
            audit,
            governor,
            dnauth,
            qrnet,
        })
    }
}

/// Governor, DNAuth and QRNet sharing one audit log.
#[derive(Debug)]
pub struct TrustCore {
    config: Config,
    audit: Arc<AuditLog>,
    governor: Arc<Governor>,
    dnauth: Arc<DnaStore>,
    qrnet: QrNet,
}

impl TrustCore {
    /// Start building a core.
    pub fn builder() -> TrustCoreBuilder {
        TrustCoreBuilder::default()
    }

    /// Settings in force.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Policy engine.
    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    /// Credential store.
    pub fn dnauth(&self) -> &DnaStore {
        &self.dnauth
    }

    /// Code registry.
    pub fn qrnet(&self) -> &QrNet {
        &self.qrnet
    }

    /// Shared audit log.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Revoke `user`'s DNAuth key. Codes they signed stop verifying with
    /// `DNAUTH_INVALID`; the codes themselves are left as they are.
    ///
    /// # Errors
    ///
    /// As [`DnaStore::revoke`].
    pub fn revoke_dnauth(&self, user: &str, reason: &str) -> Result<u64, CoreError> {
        let seq_no = self.dnauth.revoke(user, reason)?;
        warn!(user, reason, audit_seq = seq_no, "dnauth revoked through trust core");
        Ok(seq_no)
    }

    /// Trend, health and recommendation from the current counters and the
    /// audit tail.
    pub fn advisory(&self) -> Advisory {
        let tail = self.audit.tail(self.config.audit.tail_window);
        advisory::snapshot(
            &self.governor.stats(),
            &tail,
            self.config.audit.trend_window,
        )
    }

    /// Flush pending audit events to the sink.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AuditFailure`] if the sink cannot be flushed.
    pub fn flush(&self) -> Result<(), CoreError> {
        self.audit.flush_all()
    }
}
