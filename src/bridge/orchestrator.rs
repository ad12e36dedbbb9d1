//! Bridge coordinator.
//!
//! Drivers hand every inbound message to [`Coordinator::ingest`]. The
//! coordinator resolves targets, renders per target, runs the leak guard and
//! queues one delivery job per target. Jobs for the same (source, target)
//! pair run in submission order; everything else runs concurrently under a
//! process-wide cap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, info, warn};

use crate::bridge::driver::{AttachmentMode, Driver, OutboundMessage};
use crate::bridge::formatter::{MessageFormatter, RichHeader};
use crate::bridge::guard::CredentialRegistry;
use crate::bridge::queue::{PairKey, PairQueues};
use crate::bridge::relay::{RelayOutput, RelaySession};
use crate::bridge::router::{ResolvedTarget, RuleEngine};
use crate::common::error::SendError;
use crate::common::{ChannelAddress, NormalizedMessage};
use crate::config::types::{BridgeSettings, MsgConfig};
use crate::media::MediaFetcher;

/// Outbound concurrency and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub max_concurrent_sends: usize,
    pub send_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&BridgeSettings::default())
    }
}

impl From<&BridgeSettings> for DispatchSettings {
    fn from(settings: &BridgeSettings) -> Self {
        Self {
            max_concurrent_sends: settings.max_concurrent_sends.max(1),
            send_timeout: settings.send_timeout(),
        }
    }
}

/// What happened to one target of an ingested message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The leak guard found a configured secret in the outbound message.
    Blocked,
    /// No driver is registered for the target instance.
    NoDriver,
    /// Nothing left to send (empty text and no attachments).
    Skipped,
    Failed(String),
}

impl DeliveryOutcome {
    #[cfg(test)]
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

/// Outcome for one resolved target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    pub instance_id: String,
    pub address: ChannelAddress,
    pub outcome: DeliveryOutcome,
}

enum Pending {
    Ready(DeliveryOutcome),
    Waiting(oneshot::Receiver<DeliveryOutcome>),
}

/// Handle returned by [`Coordinator::ingest`].
///
/// Dropping it does not cancel anything; deliveries continue in the
/// background.
pub struct Dispatch {
    targets: Vec<(String, ChannelAddress, Pending)>,
}

impl Dispatch {
    fn empty() -> Self {
        Self {
            targets: Vec::new(),
        }
    }

    /// Number of resolved targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Wait for every target to finish, in resolution order.
    #[allow(dead_code)]
    pub async fn outcomes(self) -> Vec<TargetOutcome> {
        let mut outcomes = Vec::with_capacity(self.targets.len());
        for (instance_id, address, pending) in self.targets {
            let outcome = match pending {
                Pending::Ready(outcome) => outcome,
                Pending::Waiting(rx) => rx
                    .await
                    .unwrap_or_else(|_| DeliveryOutcome::Failed("delivery task dropped".to_string())),
            };
            outcomes.push(TargetOutcome {
                instance_id,
                address,
                outcome,
            });
        }
        outcomes
    }
}

/// Builder collecting drivers before the coordinator starts.
pub struct CoordinatorBuilder {
    rules: RuleEngine,
    credentials: CredentialRegistry,
    fetcher: MediaFetcher,
    settings: DispatchSettings,
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl CoordinatorBuilder {
    pub fn new(rules: RuleEngine, credentials: CredentialRegistry) -> Self {
        Self {
            rules,
            credentials,
            fetcher: MediaFetcher::default(),
            settings: DispatchSettings::default(),
            drivers: HashMap::new(),
        }
    }

    pub fn with_fetcher(mut self, fetcher: MediaFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Register the send capability of one instance.
    pub fn register(mut self, instance_id: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        let instance_id = instance_id.into();
        info!(
            instance = %instance_id,
            platform = driver.platform(),
            "Registered driver"
        );
        if self.drivers.insert(instance_id.clone(), driver).is_some() {
            warn!(instance = %instance_id, "Driver registered twice, keeping the last one");
        }
        self
    }

    pub fn build(self) -> Arc<Coordinator> {
        Arc::new(Coordinator {
            rules: self.rules,
            credentials: Arc::new(self.credentials),
            formatter: MessageFormatter::new(),
            fetcher: Arc::new(self.fetcher),
            drivers: self.drivers,
            queues: PairQueues::default(),
            permits: Arc::new(Semaphore::new(self.settings.max_concurrent_sends.max(1))),
            send_timeout: self.settings.send_timeout,
        })
    }
}

/// Routes normalized messages to target drivers.
///
/// All fields are read-only after [`CoordinatorBuilder::build`] except the
/// pair queues.
pub struct Coordinator {
    rules: RuleEngine,
    credentials: Arc<CredentialRegistry>,
    formatter: MessageFormatter,
    fetcher: Arc<MediaFetcher>,
    drivers: HashMap<String, Arc<dyn Driver>>,
    queues: PairQueues,
    permits: Arc<Semaphore>,
    send_timeout: Duration,
}

impl Coordinator {
    /// Registered instance ids.
    pub fn instances(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }

    /// Accept one inbound message and queue its deliveries.
    ///
    /// Never blocks on network I/O and never fails: per-target problems are
    /// logged and reported through the returned [`Dispatch`].
    pub fn ingest(&self, message: NormalizedMessage) -> Dispatch {
        let targets = self
            .rules
            .resolve(&message.instance_id, &message.source_address);
        if targets.is_empty() {
            return Dispatch::empty();
        }

        debug!(
            source_instance = %message.instance_id,
            source_address = %message.source_address,
            targets = targets.len(),
            attachments = message.attachments.len(),
            created_at = %message.timestamp,
            "Dispatching message"
        );

        let session = self.relay_session(&message, &targets);
        let mut dispatch = Dispatch {
            targets: Vec::with_capacity(targets.len()),
        };

        for target in targets {
            let pending = self.dispatch_target(&message, &target, session.as_ref());
            dispatch
                .targets
                .push((target.instance_id, target.address, pending));
        }
        dispatch
    }

    /// Shared fetch state, sized for the largest upload target.
    fn relay_session(
        &self,
        message: &NormalizedMessage,
        targets: &[ResolvedTarget],
    ) -> Option<Arc<RelaySession>> {
        if message.attachments.is_empty() {
            return None;
        }
        let fetch_limit = targets
            .iter()
            .filter_map(|t| self.drivers.get(&t.instance_id))
            .filter(|d| d.attachment_mode() == AttachmentMode::Upload)
            .map(|d| d.max_file_size())
            .max()
            .unwrap_or(0);

        Some(Arc::new(RelaySession::new(
            Arc::clone(&self.fetcher),
            message.attachments.clone(),
            fetch_limit,
        )))
    }

    fn dispatch_target(
        &self,
        message: &NormalizedMessage,
        target: &ResolvedTarget,
        session: Option<&Arc<RelaySession>>,
    ) -> Pending {
        let instance_id = target.instance_id.as_str();
        let address = &target.address;
        let Some(driver) = self.drivers.get(instance_id) else {
            warn!(
                target_instance = instance_id,
                "No driver registered for target instance, skipping"
            );
            return Pending::Ready(DeliveryOutcome::NoDriver);
        };

        debug!(
            target_instance = instance_id,
            target_address = %address,
            rule = target.rule_index,
            "Resolved target"
        );
        let rendered = self.formatter.render(message, &target.msg_config);
        let (text, rich_header) = match rendered.rich_header {
            Some(header) if !driver.supports_rich_header() => {
                (header.fold_into(&rendered.text), None)
            }
            header => (rendered.text, header),
        };

        if self.leaks(&text, rich_header.as_ref(), &rendered.msg_config) {
            warn!(
                source_instance = %message.instance_id,
                target_instance = instance_id,
                "Message blocked: outbound text contains a configured secret"
            );
            return Pending::Ready(DeliveryOutcome::Blocked);
        }

        let (tx, rx) = oneshot::channel();
        let job = Delivery {
            target_instance: instance_id.to_string(),
            address: address.clone(),
            driver: Arc::clone(driver),
            text,
            rich_header,
            msg_config: rendered.msg_config,
            session: session.cloned(),
            credentials: Arc::clone(&self.credentials),
            permits: Arc::clone(&self.permits),
            send_timeout: self.send_timeout,
        };

        self.queues.submit(
            PairKey {
                source_instance: message.instance_id.clone(),
                source_address: message.source_address.clone(),
                target_instance: instance_id.to_string(),
                target_address: address.clone(),
            },
            async move {
                let _ = tx.send(job.run().await);
            }
            .boxed(),
        );
        Pending::Waiting(rx)
    }

    fn leaks(&self, text: &str, header: Option<&RichHeader>, extras: &MsgConfig) -> bool {
        scan_outbound(&self.credentials, text, header, extras)
    }
}

fn scan_outbound(
    credentials: &CredentialRegistry,
    text: &str,
    header: Option<&RichHeader>,
    extras: &MsgConfig,
) -> bool {
    if credentials.scan(text) {
        return true;
    }
    if let Some(header) = header {
        let avatar = header.avatar.as_deref().unwrap_or("");
        if [header.title.as_str(), header.content.as_str(), avatar]
            .iter()
            .any(|field| credentials.scan(field))
        {
            return true;
        }
    }
    extras
        .extras()
        .filter_map(|(_, value)| value.as_str())
        .any(|value| credentials.scan(value))
}

/// Everything one queued delivery needs, owned.
struct Delivery {
    target_instance: String,
    address: ChannelAddress,
    driver: Arc<dyn Driver>,
    text: String,
    rich_header: Option<RichHeader>,
    msg_config: MsgConfig,
    session: Option<Arc<RelaySession>>,
    credentials: Arc<CredentialRegistry>,
    permits: Arc<Semaphore>,
    send_timeout: Duration,
}

impl Delivery {
    async fn run(self) -> DeliveryOutcome {
        let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return DeliveryOutcome::Failed("dispatch closed".to_string());
        };

        let relayed = match &self.session {
            None => RelayOutput::default(),
            Some(session) => {
                let limit = self.driver.max_file_size();
                match self.driver.attachment_mode() {
                    AttachmentMode::Upload => session.prepare(limit).await,
                    AttachmentMode::Reference => session.references(limit),
                }
            }
        };
        // Session bytes stay alive until every target's job has dropped it
        let text = relayed.append_fallbacks(&self.text);

        // Fallback labels carry URLs that were not part of the first scan
        if !relayed.fallbacks.is_empty() && self.credentials.scan(&text) {
            warn!(
                target_instance = %self.target_instance,
                "Message blocked: attachment label contains a configured secret"
            );
            return DeliveryOutcome::Blocked;
        }

        // Attachment links and names reach the target verbatim
        let leaked = relayed.attachments.iter().any(|a| {
            self.credentials.scan(&a.name)
                || a.url.as_deref().is_some_and(|url| self.credentials.scan(url))
        });
        if leaked {
            warn!(
                target_instance = %self.target_instance,
                "Message blocked: attachment link contains a configured secret"
            );
            return DeliveryOutcome::Blocked;
        }

        if text.trim().is_empty() && relayed.attachments.is_empty() && self.rich_header.is_none() {
            debug!(target_instance = %self.target_instance, "Nothing to send");
            return DeliveryOutcome::Skipped;
        }

        let outbound = OutboundMessage {
            text,
            rich_header: self.rich_header,
            attachments: relayed.attachments,
            msg_config: self.msg_config,
        };

        let result = tokio::time::timeout(self.send_timeout, self.driver.send(&self.address, outbound))
            .await
            .unwrap_or(Err(SendError::Timeout));

        match result {
            Ok(()) => {
                debug!(
                    target_instance = %self.target_instance,
                    address = %self.address,
                    "Delivered"
                );
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                let reason = self.credentials.redact(&e.to_string());
                error!(
                    target_instance = %self.target_instance,
                    address = %self.address,
                    "Send failed: {}",
                    reason
                );
                DeliveryOutcome::Failed(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::SendResult;
    use crate::common::messages::AttachmentFetcher;
    use crate::common::{AttachmentKind, AttachmentRef, SenderInfo};
    use crate::common::error::FetchResult;
    use crate::config::types::{ChannelEntry, ConnectRule, Rule};
    use crate::media::FetchedMedia;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records every send; optionally fails or stalls.
    struct RecordingDriver {
        sent: Mutex<Vec<(ChannelAddress, OutboundMessage)>>,
        fail: bool,
        rich: bool,
        max_file_size: u64,
        mode: AttachmentMode,
        /// Per-call delays, consumed in order.
        delays: Mutex<Vec<Duration>>,
    }

    impl RecordingDriver {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail: false,
                rich: false,
                max_file_size: 1_000_000,
                mode: AttachmentMode::Upload,
                delays: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }

        fn texts(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(_, m)| m.text.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Driver for RecordingDriver {
        fn platform(&self) -> &str {
            "test"
        }

        fn max_file_size(&self) -> u64 {
            self.max_file_size
        }

        fn supports_rich_header(&self) -> bool {
            self.rich
        }

        fn attachment_mode(&self) -> AttachmentMode {
            self.mode
        }

        async fn send(&self, address: &ChannelAddress, message: OutboundMessage) -> SendResult<()> {
            let delay = {
                let mut delays = self.delays.lock().unwrap();
                if delays.is_empty() {
                    None
                } else {
                    Some(delays.remove(0))
                }
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(SendError::Platform {
                    message: "unreachable".to_string(),
                });
            }
            self.sent.lock().unwrap().push((address.clone(), message));
            Ok(())
        }
    }

    struct CountingFetcher(AtomicUsize);

    #[async_trait]
    impl AttachmentFetcher for CountingFetcher {
        async fn fetch(&self, _limit: u64) -> FetchResult<FetchedMedia> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(FetchedMedia::new(Bytes::from_static(b"png!"), "image/png"))
        }
    }

    fn addr(id: &str) -> ChannelAddress {
        ChannelAddress::new().with("id", id)
    }

    fn connect(members: &[&str], msg: MsgConfig) -> RuleEngine {
        RuleEngine::new(vec![Rule::Connect(ConnectRule {
            channels: members
                .iter()
                .map(|id| {
                    (
                        id.to_string(),
                        ChannelEntry {
                            address: addr(id),
                            msg: None,
                        },
                    )
                })
                .collect(),
            msg,
        })])
    }

    fn message(text: &str) -> NormalizedMessage {
        NormalizedMessage::new("test", "a", addr("a"), SenderInfo::new("Alice", "1"), text)
    }

    #[tokio::test]
    async fn test_fan_out_isolation() {
        let b = Arc::new(RecordingDriver::failing());
        let c = Arc::new(RecordingDriver::new());
        let coordinator = CoordinatorBuilder::new(
            connect(&["a", "b", "c"], MsgConfig::new()),
            CredentialRegistry::default(),
        )
        .register("b", b.clone())
        .register("c", c.clone())
        .build();

        let outcomes = coordinator.ingest(message("hello")).outcomes().await;
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0].outcome, DeliveryOutcome::Failed(_)));
        assert_eq!(outcomes[1].outcome, DeliveryOutcome::Delivered);
        assert_eq!(c.texts(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_driver_does_not_stop_others() {
        let c = Arc::new(RecordingDriver::new());
        let coordinator = CoordinatorBuilder::new(
            connect(&["a", "b", "c"], MsgConfig::new()),
            CredentialRegistry::default(),
        )
        .register("c", c.clone())
        .build();

        let outcomes = coordinator.ingest(message("hi")).outcomes().await;
        assert_eq!(outcomes[0].outcome, DeliveryOutcome::NoDriver);
        assert_eq!(outcomes[1].outcome, DeliveryOutcome::Delivered);
    }

    #[tokio::test]
    async fn test_unmatched_message_is_dropped() {
        let coordinator = CoordinatorBuilder::new(
            connect(&["a", "b"], MsgConfig::new()),
            CredentialRegistry::default(),
        )
        .build();
        let msg =
            NormalizedMessage::new("test", "a", addr("other"), SenderInfo::new("A", "1"), "x");
        assert!(coordinator.ingest(msg).is_empty());
    }

    #[tokio::test]
    async fn test_pair_ordering_survives_slow_first_send() {
        let b = Arc::new(RecordingDriver::new());
        *b.delays.lock().unwrap() = vec![Duration::from_millis(50), Duration::ZERO];
        let coordinator = CoordinatorBuilder::new(
            connect(&["a", "b"], MsgConfig::new()),
            CredentialRegistry::default(),
        )
        .register("b", b.clone())
        .build();

        let first = coordinator.ingest(message("first"));
        let second = coordinator.ingest(message("second"));
        first.outcomes().await;
        second.outcomes().await;

        assert_eq!(b.texts(), vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn test_leak_guard_blocks_only_that_target() {
        let b = Arc::new(RecordingDriver::new());
        let c = Arc::new(RecordingDriver::new());
        let rules = RuleEngine::new(vec![Rule::Connect(ConnectRule {
            channels: vec![
                ("a".to_string(), ChannelEntry { address: addr("a"), msg: None }),
                (
                    "b".to_string(),
                    ChannelEntry {
                        address: addr("b"),
                        msg: Some(MsgConfig::new().with("msg_format", "{msg}")),
                    },
                ),
                (
                    "c".to_string(),
                    ChannelEntry {
                        address: addr("c"),
                        msg: Some(MsgConfig::new().with("msg_format", "[{username}] said something")),
                    },
                ),
            ],
            msg: MsgConfig::new(),
        })]);
        let coordinator = CoordinatorBuilder::new(
            rules,
            CredentialRegistry::from_secrets(["sk_live_abcdef123456", "ok"]),
        )
        .register("b", b.clone())
        .register("c", c.clone())
        .build();

        let outcomes = coordinator
            .ingest(message("my key is sk_live_abcdef123456"))
            .outcomes()
            .await;
        assert_eq!(outcomes[0].outcome, DeliveryOutcome::Blocked);
        assert_eq!(outcomes[1].outcome, DeliveryOutcome::Delivered);
        assert!(b.texts().is_empty());

        // Clean text and short config values pass
        let outcomes = coordinator.ingest(message("ok then")).outcomes().await;
        assert!(outcomes.iter().all(|o| o.outcome.is_delivered()));
    }

    #[tokio::test]
    async fn test_leak_guard_checks_extension_fields() {
        let b = Arc::new(RecordingDriver::new());
        let coordinator = CoordinatorBuilder::new(
            connect(
                &["a", "b"],
                MsgConfig::new().with("webhook_title", "{username}"),
            ),
            CredentialRegistry::from_secrets(["SuperSecretName"]),
        )
        .register("b", b.clone())
        .build();

        let msg = NormalizedMessage::new(
            "test",
            "a",
            addr("a"),
            SenderInfo::new("SuperSecretName", "1"),
            "hi",
        );
        let outcomes = coordinator.ingest(msg).outcomes().await;
        assert_eq!(outcomes[0].outcome, DeliveryOutcome::Blocked);
    }

    #[tokio::test]
    async fn test_rich_header_folded_or_passed() {
        let plain = Arc::new(RecordingDriver::new());
        let rich = Arc::new(RecordingDriver {
            rich: true,
            ..RecordingDriver::new()
        });
        let coordinator = CoordinatorBuilder::new(
            connect(
                &["a", "plain", "rich"],
                MsgConfig::new().with(
                    "msg_format",
                    r#"<richheader title="{username}" content="id: {user_id}"/> {msg}"#,
                ),
            ),
            CredentialRegistry::default(),
        )
        .register("plain", plain.clone())
        .register("rich", rich.clone())
        .build();

        coordinator.ingest(message("hi")).outcomes().await;

        assert_eq!(plain.texts(), vec!["[Alice · id: 1] hi".to_string()]);
        let sent = rich.sent.lock().unwrap();
        assert_eq!(sent[0].1.text, "hi");
        assert_eq!(sent[0].1.rich_header.as_ref().unwrap().title, "Alice");
    }

    #[tokio::test]
    async fn test_oversized_attachment_falls_back_without_fetch() {
        let fetcher = Arc::new(CountingFetcher(AtomicUsize::new(0)));
        let b = Arc::new(RecordingDriver::new());
        let coordinator = CoordinatorBuilder::new(
            connect(&["a", "b"], MsgConfig::new()),
            CredentialRegistry::default(),
        )
        .register("b", b.clone())
        .build();

        let attachment = AttachmentRef::with_fetcher(AttachmentKind::Video, "big.mp4", fetcher.clone())
            .with_size(10_000_000);
        let msg = message("look").with_attachments(vec![attachment]);
        let outcomes = coordinator.ingest(msg).outcomes().await;

        assert_eq!(outcomes[0].outcome, DeliveryOutcome::Delivered);
        assert_eq!(b.texts(), vec!["look\n[Video: big.mp4]".to_string()]);
        assert_eq!(fetcher.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_attachment_fetched_once_for_all_targets() {
        let fetcher = Arc::new(CountingFetcher(AtomicUsize::new(0)));
        let b = Arc::new(RecordingDriver::new());
        let c = Arc::new(RecordingDriver::new());
        let coordinator = CoordinatorBuilder::new(
            connect(&["a", "b", "c"], MsgConfig::new()),
            CredentialRegistry::default(),
        )
        .register("b", b.clone())
        .register("c", c.clone())
        .build();

        let attachment = AttachmentRef::with_fetcher(AttachmentKind::Image, "pic", fetcher.clone());
        let msg = message("").with_attachments(vec![attachment]);
        let outcomes = coordinator.ingest(msg).outcomes().await;

        assert!(outcomes.iter().all(|o| o.outcome.is_delivered()));
        assert_eq!(fetcher.0.load(Ordering::SeqCst), 1);
        for driver in [&b, &c] {
            let sent = driver.sent.lock().unwrap();
            let attachment = &sent[0].1.attachments[0];
            assert_eq!(attachment.data.as_deref(), Some(&b"png!"[..]));
        }
    }

    #[tokio::test]
    async fn test_empty_message_is_skipped() {
        let b = Arc::new(RecordingDriver::new());
        let coordinator = CoordinatorBuilder::new(
            connect(&["a", "b"], MsgConfig::new()),
            CredentialRegistry::default(),
        )
        .register("b", b.clone())
        .build();

        let outcomes = coordinator.ingest(message("   ")).outcomes().await;
        assert_eq!(outcomes[0].outcome, DeliveryOutcome::Skipped);
        assert!(b.texts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_is_failure() {
        let b = Arc::new(RecordingDriver::new());
        *b.delays.lock().unwrap() = vec![Duration::from_secs(120)];
        let coordinator = CoordinatorBuilder::new(
            connect(&["a", "b"], MsgConfig::new()),
            CredentialRegistry::default(),
        )
        .with_settings(DispatchSettings {
            max_concurrent_sends: 1,
            send_timeout: Duration::from_secs(5),
        })
        .register("b", b.clone())
        .build();

        let outcomes = coordinator.ingest(message("slow")).outcomes().await;
        assert_eq!(
            outcomes[0].outcome,
            DeliveryOutcome::Failed("send timed out".to_string())
        );
    }

    const BOT_FILE_URL: &str =
        "https://api.telegram.org/file/bot123456:SECRET_BOT_TOKEN/photos/1.jpg";

    #[tokio::test]
    async fn test_leak_guard_checks_reference_links() {
        let b = Arc::new(RecordingDriver {
            mode: AttachmentMode::Reference,
            ..RecordingDriver::new()
        });
        let coordinator = CoordinatorBuilder::new(
            connect(&["a", "b"], MsgConfig::new()),
            CredentialRegistry::from_secrets(["123456:SECRET_BOT_TOKEN"]),
        )
        .register("b", b.clone())
        .build();

        let attachment = AttachmentRef::remote(AttachmentKind::Image, BOT_FILE_URL)
            .unwrap()
            .with_name("1.jpg");
        let msg = message("photo").with_attachments(vec![attachment]);
        let outcomes = coordinator.ingest(msg).outcomes().await;

        assert_eq!(outcomes[0].outcome, DeliveryOutcome::Blocked);
        assert!(b.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leak_guard_checks_fallback_labels() {
        let b = Arc::new(RecordingDriver::new());
        let coordinator = CoordinatorBuilder::new(
            connect(&["a", "b"], MsgConfig::new()),
            CredentialRegistry::from_secrets(["123456:SECRET_BOT_TOKEN"]),
        )
        .register("b", b.clone())
        .build();

        // Known size over the target limit: sent as a label carrying the URL
        let attachment = AttachmentRef::remote(AttachmentKind::Image, BOT_FILE_URL)
            .unwrap()
            .with_name("1.jpg")
            .with_size(10_000_000);
        let msg = message("photo").with_attachments(vec![attachment]);
        let outcomes = coordinator.ingest(msg).outcomes().await;

        assert_eq!(outcomes[0].outcome, DeliveryOutcome::Blocked);
        assert!(b.texts().is_empty());
    }

    #[tokio::test]
    async fn test_reference_links_without_secrets_are_sent() {
        let b = Arc::new(RecordingDriver {
            mode: AttachmentMode::Reference,
            ..RecordingDriver::new()
        });
        let coordinator = CoordinatorBuilder::new(
            connect(&["a", "b"], MsgConfig::new()),
            CredentialRegistry::from_secrets(["123456:SECRET_BOT_TOKEN"]),
        )
        .register("b", b.clone())
        .build();

        let attachment = AttachmentRef::remote(AttachmentKind::Image, "https://cdn.example/1.jpg")
            .unwrap()
            .with_name("1.jpg");
        let msg = message("photo").with_attachments(vec![attachment]);
        let outcomes = coordinator.ingest(msg).outcomes().await;

        assert_eq!(outcomes[0].outcome, DeliveryOutcome::Delivered);
        let sent = b.sent.lock().unwrap();
        assert_eq!(
            sent[0].1.attachments[0].url.as_deref(),
            Some("https://cdn.example/1.jpg")
        );
    }
}
